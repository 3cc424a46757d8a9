//! MediaFanout - snapshot cache and MJPEG broadcast groups
//!
//! ## Responsibilities
//!
//! - Cache the latest snapshot (replaced whole, never mutated)
//! - Allow-list checks for every media request
//! - Broadcast groups: continuous MJPEG, snapshot stream, auto-fps stream
//! - Listener removal on disconnect, failed write or write-idle timeout
//!
//! Each listener has its own small queue. A full queue drops the frame for
//! that listener only; a closed queue removes the listener, and so does a
//! queue that has stayed full for longer than the idle timeout (a viewer that
//! stopped reading is never polled, so its own timeout cannot fire). One slow
//! or dead viewer never blocks the others.

pub mod allow_list;
pub mod mjpeg;

pub use allow_list::AllowList;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Frames smaller than this are partial or corrupt and never broadcast
pub const MIN_FRAME_BYTES: usize = 1000;

/// Write-idle bound before a listener is dropped
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames queued per listener
const LISTENER_QUEUE: usize = 4;

/// Sending side of one listener
struct Member {
    tx: mpsc::Sender<Bytes>,
    last_delivered: Instant,
}

/// Broadcast group a listener joins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamGroup {
    /// `/ipcamera.mjpeg`, fed by a continuous frame source
    Mjpeg,
    /// `/snapshots.mjpeg`, fed by each new snapshot
    Snapshots,
    /// `/autofps.mjpeg`, snapshots plus a resend of the cache when idle
    AutoFps,
}

/// Listener counts per group
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanoutStats {
    pub mjpeg: usize,
    pub snapshots: usize,
    pub autofps: usize,
    pub has_snapshot: bool,
}

/// Per-camera media fan-out
pub struct MediaFanout {
    camera_id: String,
    allow_list: RwLock<AllowList>,
    snapshot: RwLock<Option<Bytes>>,
    groups: Mutex<HashMap<StreamGroup, HashMap<u64, Member>>>,
    next_id: AtomicU64,
    idle_timeout: Duration,
}

impl MediaFanout {
    pub fn new(camera_id: impl Into<String>, allow_list: AllowList) -> Self {
        Self::with_idle_timeout(camera_id, allow_list, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        camera_id: impl Into<String>,
        allow_list: AllowList,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            allow_list: RwLock::new(allow_list),
            snapshot: RwLock::new(None),
            groups: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            idle_timeout,
        }
    }

    pub fn set_allow_list(&self, allow_list: AllowList) {
        *self.allow_list.write() = allow_list;
    }

    pub fn check_peer(&self, peer: IpAddr) -> Result<()> {
        if self.allow_list.read().permits(peer) {
            Ok(())
        } else {
            tracing::warn!(camera_id = %self.camera_id, peer = %peer, "Media request from peer not on allow-list");
            Err(Error::Forbidden(format!("{} is not on the allow-list", peer)))
        }
    }

    /// Latest cached snapshot
    pub fn snapshot(&self) -> Option<Bytes> {
        self.snapshot.read().clone()
    }

    /// Replace the cached snapshot and feed the snapshot-driven groups.
    /// Returns false when the buffer was too small to be a real image.
    pub fn store_snapshot(&self, jpeg: Bytes) -> bool {
        if jpeg.len() < MIN_FRAME_BYTES {
            tracing::trace!(camera_id = %self.camera_id, bytes = jpeg.len(), "Discarding undersized snapshot");
            return false;
        }
        *self.snapshot.write() = Some(jpeg.clone());
        self.broadcast(StreamGroup::Snapshots, &jpeg);
        self.broadcast(StreamGroup::AutoFps, &jpeg);
        true
    }

    /// Broadcast one frame of the continuous stream
    pub fn publish_frame(&self, jpeg: Bytes) -> bool {
        if jpeg.len() < MIN_FRAME_BYTES {
            tracing::trace!(camera_id = %self.camera_id, bytes = jpeg.len(), "Discarding undersized frame");
            return false;
        }
        self.broadcast(StreamGroup::Mjpeg, &jpeg);
        true
    }

    fn broadcast(&self, group: StreamGroup, jpeg: &Bytes) {
        let mut groups = self.groups.lock();
        let Some(members) = groups.get_mut(&group) else {
            return;
        };
        let idle_timeout = self.idle_timeout;
        members.retain(|id, member| match member.tx.try_send(jpeg.clone()) {
            Ok(()) => {
                member.last_delivered = Instant::now();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if member.last_delivered.elapsed() >= idle_timeout {
                    tracing::debug!(listener = id, group = ?group, "Evicting stalled listener");
                    return false;
                }
                tracing::trace!(listener = id, "Listener behind, frame dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(listener = id, group = ?group, "Removing closed listener");
                false
            }
        });
    }

    /// Join `group` as `peer`
    pub fn subscribe(self: &Arc<Self>, group: StreamGroup, peer: IpAddr) -> Result<Listener> {
        self.check_peer(peer)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE);

        // Auto-fps and snapshot streams start with the cached image
        if group != StreamGroup::Mjpeg {
            if let Some(jpeg) = self.snapshot() {
                let _ = tx.try_send(jpeg);
            }
        }

        let member = Member {
            tx,
            last_delivered: Instant::now(),
        };
        self.groups.lock().entry(group).or_default().insert(id, member);
        tracing::info!(camera_id = %self.camera_id, listener = id, group = ?group, peer = %peer, "Stream listener added");

        Ok(Listener {
            id,
            group,
            rx,
            fanout: self.clone(),
        })
    }

    fn unsubscribe(&self, group: StreamGroup, id: u64) {
        let mut groups = self.groups.lock();
        if let Some(members) = groups.get_mut(&group) {
            if members.remove(&id).is_some() {
                tracing::info!(camera_id = %self.camera_id, listener = id, group = ?group, "Stream listener removed");
            }
        }
    }

    pub fn listener_count(&self, group: StreamGroup) -> usize {
        self.groups.lock().get(&group).map(HashMap::len).unwrap_or(0)
    }

    pub fn has_listeners(&self, group: StreamGroup) -> bool {
        self.listener_count(group) > 0
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            mjpeg: self.listener_count(StreamGroup::Mjpeg),
            snapshots: self.listener_count(StreamGroup::Snapshots),
            autofps: self.listener_count(StreamGroup::AutoFps),
            has_snapshot: self.snapshot.read().is_some(),
        }
    }

    /// Drop every listener (session stop)
    pub fn close_all(&self) {
        self.groups.lock().clear();
    }
}

/// A registered viewer. Dropping it leaves the group.
pub struct Listener {
    id: u64,
    group: StreamGroup,
    rx: mpsc::Receiver<Bytes>,
    fanout: Arc<MediaFanout>,
}

impl Listener {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next JPEG for this viewer. `None` ends the stream: the group was
    /// closed or nothing arrived within the idle timeout. Auto-fps viewers
    /// get the cached snapshot again instead of timing out.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        match tokio::time::timeout(self.fanout.idle_timeout, self.rx.recv()).await {
            Ok(frame) => frame,
            Err(_) if self.group == StreamGroup::AutoFps => self.fanout.snapshot(),
            Err(_) => {
                tracing::debug!(listener = self.id, group = ?self.group, "Listener idle timeout");
                None
            }
        }
    }

    /// Multipart body stream; ends (and unregisters) with the listener
    pub fn into_multipart(self) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send {
        futures::stream::unfold(self, |mut listener| async move {
            let frame = listener.next_frame().await?;
            Some((Ok(mjpeg::frame_part(&frame)), listener))
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.fanout.unsubscribe(self.group, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fill: u8) -> Bytes {
        Bytes::from(vec![fill; MIN_FRAME_BYTES + 10])
    }

    fn local() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_frames_reach_every_listener() {
        let fanout = Arc::new(MediaFanout::new("cam", AllowList::default()));
        let mut a = fanout.subscribe(StreamGroup::Mjpeg, local()).unwrap();
        let mut b = fanout.subscribe(StreamGroup::Mjpeg, local()).unwrap();

        assert!(fanout.publish_frame(frame(1)));
        assert_eq!(a.next_frame().await.unwrap(), frame(1));
        assert_eq!(b.next_frame().await.unwrap(), frame(1));
    }

    #[tokio::test]
    async fn test_undersized_frames_discarded() {
        let fanout = Arc::new(MediaFanout::new("cam", AllowList::default()));
        let _a = fanout.subscribe(StreamGroup::Mjpeg, local()).unwrap();
        assert!(!fanout.publish_frame(Bytes::from_static(b"\xFF\xD8tiny\xFF\xD9")));
        assert!(!fanout.store_snapshot(Bytes::from_static(b"tiny")));
        assert!(fanout.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let fanout = Arc::new(MediaFanout::new("cam", AllowList::default()));
        let a = fanout.subscribe(StreamGroup::Snapshots, local()).unwrap();
        assert_eq!(fanout.listener_count(StreamGroup::Snapshots), 1);
        drop(a);
        assert_eq!(fanout.listener_count(StreamGroup::Snapshots), 0);
    }

    #[tokio::test]
    async fn test_closed_listener_does_not_affect_others() {
        let fanout = Arc::new(MediaFanout::new("cam", AllowList::default()));
        let mut healthy = fanout.subscribe(StreamGroup::Mjpeg, local()).unwrap();

        // Simulate a viewer whose connection went away without the guard running yet
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let member = Member {
            tx,
            last_delivered: Instant::now(),
        };
        fanout.groups.lock().entry(StreamGroup::Mjpeg).or_default().insert(999, member);
        assert_eq!(fanout.listener_count(StreamGroup::Mjpeg), 2);

        fanout.publish_frame(frame(7));
        assert_eq!(fanout.listener_count(StreamGroup::Mjpeg), 1);
        assert_eq!(healthy.next_frame().await.unwrap(), frame(7));
    }

    #[tokio::test]
    async fn test_idle_listener_times_out() {
        let fanout = Arc::new(MediaFanout::with_idle_timeout(
            "cam",
            AllowList::default(),
            Duration::from_millis(50),
        ));
        let mut idle = fanout.subscribe(StreamGroup::Mjpeg, local()).unwrap();
        assert!(idle.next_frame().await.is_none());
        drop(idle);
        assert_eq!(fanout.listener_count(StreamGroup::Mjpeg), 0);
    }

    #[tokio::test]
    async fn test_stalled_listener_is_evicted() {
        let fanout = Arc::new(MediaFanout::with_idle_timeout(
            "cam",
            AllowList::default(),
            Duration::from_millis(50),
        ));
        // Never read, like a viewer whose socket buffer filled up
        let stalled = fanout.subscribe(StreamGroup::Mjpeg, local()).unwrap();
        for i in 0..LISTENER_QUEUE {
            fanout.publish_frame(frame(i as u8));
        }
        fanout.publish_frame(frame(9));
        assert!(fanout.has_listeners(StreamGroup::Mjpeg));

        tokio::time::sleep(Duration::from_millis(80)).await;
        fanout.publish_frame(frame(10));
        assert!(!fanout.has_listeners(StreamGroup::Mjpeg));
        drop(stalled);
        assert_eq!(fanout.listener_count(StreamGroup::Mjpeg), 0);
    }

    #[tokio::test]
    async fn test_autofps_resends_cache_when_idle() {
        let fanout = Arc::new(MediaFanout::with_idle_timeout(
            "cam",
            AllowList::default(),
            Duration::from_millis(50),
        ));
        fanout.store_snapshot(frame(3));
        let mut viewer = fanout.subscribe(StreamGroup::AutoFps, local()).unwrap();
        assert_eq!(viewer.next_frame().await.unwrap(), frame(3));
        // Nothing new: the cache is sent again
        assert_eq!(viewer.next_frame().await.unwrap(), frame(3));
    }

    #[test]
    fn test_allow_list_rejects() {
        let fanout = Arc::new(MediaFanout::new("cam", AllowList::parse("(10.0.0.1)")));
        assert!(matches!(
            fanout.subscribe(StreamGroup::Mjpeg, local()),
            Err(Error::Forbidden(_))
        ));
        assert_eq!(fanout.listener_count(StreamGroup::Mjpeg), 0);
    }
}
