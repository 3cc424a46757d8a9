//! PollingScheduler - per-camera cadences
//!
//! ## Responsibilities
//!
//! - Health check: reconnect + discovery when down, liveness probe when up
//! - High-priority poll: snapshot and primary alarm endpoints
//! - Low-priority poll: one secondary endpoint per tick, round-robin
//! - Event stream reader for vendors that push over long-lived HTTP
//!
//! Every cadence is its own task on the shared runtime holding only a weak
//! reference to the session; a dropped session ends them on the next tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::camera_session::CameraSession;
use crate::vendor_adapter::EventStream;

/// Wait before an event stream is reopened
pub const EVENT_STREAM_BACKOFF: Duration = Duration::from_secs(5);

/// Secondary endpoints visited one per tick
#[derive(Debug, Clone, Default)]
pub struct RoundRobin {
    paths: Vec<String>,
    cursor: usize,
}

impl RoundRobin {
    pub fn new(paths: Vec<String>) -> Self {
        Self { paths, cursor: 0 }
    }

    pub fn next(&mut self) -> Option<String> {
        if self.paths.is_empty() {
            return None;
        }
        if self.cursor >= self.paths.len() {
            self.cursor = 0;
        }
        let path = self.paths[self.cursor].clone();
        self.cursor += 1;
        Some(path)
    }

    /// Drop `path` for good. Returns false if it was not listed.
    pub fn remove(&mut self, path: &str) -> bool {
        let Some(idx) = self.paths.iter().position(|p| p == path) else {
            return false;
        };
        self.paths.remove(idx);
        if idx < self.cursor {
            self.cursor -= 1;
        }
        true
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Running cadences of one camera
pub struct PollingScheduler {
    camera_id: String,
    tasks: Vec<JoinHandle<()>>,
}

impl PollingScheduler {
    pub fn start(session: &Arc<CameraSession>) -> Self {
        let config = session.config();
        let mut tasks = vec![
            spawn_cadence(
                session,
                Duration::from_millis(config.health_interval_ms),
                "health",
                |s| async move { s.health_check().await },
            ),
            spawn_cadence(
                session,
                Duration::from_millis(config.poll_interval_ms),
                "high_priority",
                |s| async move { s.poll_high_priority().await },
            ),
            spawn_cadence(
                session,
                Duration::from_millis(config.low_priority_interval_ms),
                "low_priority",
                |s| async move { s.poll_low_priority().await },
            ),
        ];

        if let Some(stream) = session.event_stream() {
            tasks.push(spawn_event_stream(session, stream));
        }

        tracing::info!(
            camera_id = %config.camera_id,
            brand = %config.brand,
            poll_interval_ms = config.poll_interval_ms,
            low_priority_interval_ms = config.low_priority_interval_ms,
            health_interval_ms = config.health_interval_ms,
            "Polling scheduler started"
        );

        Self {
            camera_id: config.camera_id,
            tasks,
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!(camera_id = %self.camera_id, "Polling scheduler stopped");
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_cadence<F, Fut>(
    session: &Arc<CameraSession>,
    period: Duration,
    cadence: &'static str,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<CameraSession>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak = Arc::downgrade(session);
    let camera_id = session.id().to_string();

    tokio::spawn(async move {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let Some(session) = weak.upgrade() else {
                break;
            };
            tick(session).await;
        }

        tracing::debug!(camera_id = %camera_id, cadence, "Cadence ended");
    })
}

fn spawn_event_stream(session: &Arc<CameraSession>, stream: EventStream) -> JoinHandle<()> {
    let weak = Arc::downgrade(session);
    let camera_id = session.id().to_string();

    tokio::spawn(async move {
        loop {
            let Some(session) = weak.upgrade() else {
                break;
            };
            if session.status().is_online() {
                match session.read_event_stream(&stream).await {
                    Ok(()) => {
                        tracing::debug!(camera_id = %camera_id, path = %stream.path, "Event stream closed by camera")
                    }
                    Err(e) => {
                        tracing::warn!(camera_id = %camera_id, path = %stream.path, error = %e, "Event stream failed")
                    }
                }
            }
            drop(session);
            tokio::time::sleep(EVENT_STREAM_BACKOFF).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rr(paths: &[&str]) -> RoundRobin {
        RoundRobin::new(paths.iter().map(|p| p.to_string()).collect())
    }

    #[test]
    fn test_round_robin_cycles() {
        let mut r = rr(&["/a", "/b", "/c"]);
        let seen: Vec<_> = (0..5).filter_map(|_| r.next()).collect();
        assert_eq!(seen, vec!["/a", "/b", "/c", "/a", "/b"]);
    }

    #[test]
    fn test_remove_keeps_position() {
        let mut r = rr(&["/a", "/b", "/c"]);
        assert_eq!(r.next().as_deref(), Some("/a"));
        assert_eq!(r.next().as_deref(), Some("/b"));
        assert!(r.remove("/a"));
        assert_eq!(r.next().as_deref(), Some("/c"));
        assert_eq!(r.next().as_deref(), Some("/b"));
        assert!(!r.remove("/missing"));
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_empty_after_removals() {
        let mut r = rr(&["/only"]);
        assert!(r.remove("/only"));
        assert!(r.is_empty());
        assert_eq!(r.next(), None);
    }
}
