//! Transcoder - external ffmpeg process per output format
//!
//! ## Responsibilities
//!
//! - Start ffmpeg for HLS, DASH or MJPEG output of the camera's stream
//! - Report liveness and keep a keep-alive budget counted in health ticks
//! - Stop gracefully (`q` on stdin), then kill after a bounded wait
//!
//! HLS/DASH write into the camera's media directory; MJPEG is read from
//! stdout, cut into frames and broadcast to the `/ipcamera.mjpeg` group.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::media_fanout::mjpeg::JpegSplitter;
use crate::media_fanout::MediaFanout;

/// Wait after `q` before the process is killed
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Health ticks a transcoder survives without a viewer request
pub const KEEP_ALIVE_TICKS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeFormat {
    Hls,
    Dash,
    Mjpeg,
}

impl TranscodeFormat {
    /// File a viewer asks for, relative to the media directory
    pub fn manifest(&self) -> Option<&'static str> {
        match self {
            TranscodeFormat::Hls => Some("ipcamera.m3u8"),
            TranscodeFormat::Dash => Some("ipcamera.mpd"),
            TranscodeFormat::Mjpeg => None,
        }
    }
}

/// Everything needed to launch ffmpeg for one camera
#[derive(Debug, Clone)]
pub struct TranscoderSettings {
    pub ffmpeg_path: String,
    /// Input URI with credentials already embedded
    pub input_uri: String,
    pub input_options: String,
    pub hls_output_options: String,
    pub dash_output_options: String,
    pub mjpeg_output_options: String,
    pub output_dir: PathBuf,
}

impl TranscoderSettings {
    /// ffmpeg arguments for `format`
    pub fn args(&self, format: TranscodeFormat) -> Vec<String> {
        let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), "error".into()];
        args.extend(self.input_options.split_whitespace().map(String::from));
        args.push("-i".into());
        args.push(self.input_uri.clone());

        let (options, output) = match format {
            TranscodeFormat::Hls => (
                &self.hls_output_options,
                self.output_dir.join("ipcamera.m3u8").display().to_string(),
            ),
            TranscodeFormat::Dash => (
                &self.dash_output_options,
                self.output_dir.join("ipcamera.mpd").display().to_string(),
            ),
            TranscodeFormat::Mjpeg => (&self.mjpeg_output_options, "-".to_string()),
        };
        args.extend(options.split_whitespace().map(String::from));
        if format == TranscodeFormat::Mjpeg {
            args.extend(["-f".into(), "mjpeg".into()]);
        }
        args.push(output);
        args
    }
}

/// Put `user:pass@` into an rtsp/http URI that has no userinfo yet
pub fn embed_credentials(uri: &str, username: &str, password: &str) -> String {
    if username.is_empty() {
        return uri.to_string();
    }
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.contains('@') {
        return uri.to_string();
    }
    format!(
        "{}://{}:{}@{}",
        scheme,
        urlencoding::encode(username),
        urlencoding::encode(password),
        rest
    )
}

/// One running ffmpeg
pub struct Transcoder {
    format: TranscodeFormat,
    child: Child,
    keep_alive: u32,
    reader: Option<JoinHandle<()>>,
}

impl Transcoder {
    pub fn start(
        format: TranscodeFormat,
        settings: &TranscoderSettings,
        fanout: Arc<MediaFanout>,
    ) -> Result<Self> {
        let mut cmd = Command::new(&settings.ffmpeg_path);
        cmd.args(settings.args(format))
            .stdin(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if format == TranscodeFormat::Mjpeg {
            cmd.stdout(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transcoder(format!("{} spawn failed: {}", settings.ffmpeg_path, e)))?;

        let reader = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut splitter = JpegSplitter::new();
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            for frame in splitter.push(&buf[..n]) {
                                fanout.publish_frame(frame);
                            }
                        }
                    }
                }
            })
        });

        tracing::info!(format = ?format, pid = ?child.id(), "Transcoder started");

        Ok(Self {
            format,
            child,
            keep_alive: KEEP_ALIVE_TICKS,
            reader,
        })
    }

    pub fn format(&self) -> TranscodeFormat {
        self.format
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// A viewer asked for output; refill the budget
    pub fn keep_alive(&mut self) {
        self.keep_alive = KEEP_ALIVE_TICKS;
    }

    /// Health tick. Returns true once the budget is spent.
    pub fn tick(&mut self) -> bool {
        self.keep_alive = self.keep_alive.saturating_sub(1);
        self.keep_alive == 0
    }

    /// `q` on stdin, then kill after `grace`
    pub async fn stop(mut self, grace: Duration) {
        if let Some(mut stdin) = self.child.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => tracing::info!(format = ?self.format, "Transcoder stopped"),
            Err(_) => {
                tracing::warn!(format = ?self.format, grace_ms = grace.as_millis() as u64, "Transcoder ignored quit, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(format = ?self.format, error = %e, "Failed to kill transcoder");
                }
            }
        }

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Transcoders of one camera, at most one per format
pub struct TranscoderPool {
    running: Mutex<HashMap<TranscodeFormat, Transcoder>>,
}

impl Default for TranscoderPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscoderPool {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Start `format` unless it is running; either way extend its budget
    pub async fn ensure(
        &self,
        format: TranscodeFormat,
        settings: &TranscoderSettings,
        fanout: Arc<MediaFanout>,
    ) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(existing) = running.get_mut(&format) {
            if existing.is_running() {
                existing.keep_alive();
                return Ok(());
            }
            tracing::warn!(format = ?format, "Transcoder exited unexpectedly, restarting");
            running.remove(&format);
        }

        tokio::fs::create_dir_all(&settings.output_dir).await?;
        let transcoder = Transcoder::start(format, settings, fanout)?;
        running.insert(format, transcoder);
        Ok(())
    }

    /// Health tick: drop dead processes and stop idle ones
    pub async fn tick(&self) {
        let expired: Vec<Transcoder> = {
            let mut running = self.running.lock().await;
            let formats: Vec<TranscodeFormat> = running.keys().copied().collect();
            let mut expired = Vec::new();
            for format in formats {
                let Some(t) = running.get_mut(&format) else {
                    continue;
                };
                if !t.is_running() {
                    tracing::warn!(format = ?format, "Transcoder exited unexpectedly");
                    running.remove(&format);
                } else if t.tick() {
                    if let Some(t) = running.remove(&format) {
                        expired.push(t);
                    }
                }
            }
            expired
        };

        for transcoder in expired {
            tracing::debug!(format = ?transcoder.format(), "Transcoder keep-alive spent");
            tokio::spawn(transcoder.stop(STOP_GRACE));
        }
    }

    /// Extend the budget of a running transcoder without starting one
    pub async fn keep_alive(&self, format: TranscodeFormat) -> bool {
        let mut running = self.running.lock().await;
        let Some(t) = running.get_mut(&format) else {
            return false;
        };
        if !t.is_running() {
            return false;
        }
        t.keep_alive();
        true
    }

    pub async fn is_running(&self, format: TranscodeFormat) -> bool {
        match self.running.lock().await.get_mut(&format) {
            Some(t) => t.is_running(),
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let all: Vec<Transcoder> = self.running.lock().await.drain().map(|(_, t)| t).collect();
        for transcoder in all {
            transcoder.stop(STOP_GRACE).await;
        }
    }
}

/// `Err(Transcoder)` until `path` exists, so viewers see "not yet available"
pub async fn require_output(path: &Path) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(()),
        Err(_) => Err(Error::Transcoder(format!(
            "{} not yet available",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("output")
        ))),
    }
}
