//! CameraSession - one camera's connection and state
//!
//! ## Responsibilities
//!
//! - Authenticated HTTP exchange with the camera (401 challenge, one resend)
//! - Request/reply correlation through the ReplyStore
//! - Feeding replies, event-stream parts and pushes to the vendor adapter
//! - Canonical channel state and status transitions, broadcast on change
//! - Snapshot refresh, MJPEG relay and transcoder requests for the media server
//! - Reconfigure (new connection and auth context) and stop
//!
//! All locks are per session and never held across an await.

mod discovery;
mod status;

pub use discovery::{
    discover, ws_security_header, Capabilities, MediaProfile, OnvifDiscovery, SoapDiscovery,
    VendorDefaults,
};
pub use status::{LivenessTracker, OfflineReason, SessionStatus, OFFLINE_AFTER_FAILURES};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};

use crate::auth_negotiator::{AuthError, AuthNegotiator, AuthScheme};
use crate::config_store::CameraConfig;
use crate::error::{Error, Result};
use crate::media_fanout::mjpeg::JpegSplitter;
use crate::media_fanout::{AllowList, FanoutStats, MediaFanout, StreamGroup};
use crate::polling_scheduler::{PollingScheduler, RoundRobin};
use crate::realtime_hub::{
    ChannelUpdateMessage, HubMessage, RealtimeHub, SnapshotUpdatedMessage, StatusChangedMessage,
};
use crate::reply_store::ReplyStore;
use crate::transcoder::{embed_credentials, TranscodeFormat, TranscoderPool, TranscoderSettings};
use crate::vendor_adapter::{
    create_adapter, AlarmEvent, CameraBrand, CameraRequest, Channel, ChannelValue, EventStream,
    ParseOutcome, VendorAdapter,
};

/// Event-stream bytes held without a delimiter before the buffer is dropped
pub const EVENT_BUFFER_LIMIT: usize = 64 * 1024;

/// Process-wide settings every session shares
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ffmpeg_path: String,
    pub media_dir: PathBuf,
    pub request_timeout: Duration,
    /// Silence tolerated on an event stream or MJPEG relay before reattaching
    pub stream_idle_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            media_dir: std::env::temp_dir().join("ipcam-engine"),
            request_timeout: Duration::from_secs(5),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// A camera reply, read leniently
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpReply {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Control-API view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub camera_id: String,
    pub brand: CameraBrand,
    pub status: SessionStatus,
    pub state: BTreeMap<Channel, ChannelValue>,
    pub capabilities: Option<Capabilities>,
    pub auth_scheme: Option<AuthScheme>,
    pub low_priority_paths: Vec<String>,
    pub media: FanoutStats,
}

pub struct CameraSession {
    camera_id: String,
    settings: SessionSettings,
    config: RwLock<CameraConfig>,
    client: RwLock<reqwest::Client>,
    auth: Mutex<AuthNegotiator>,
    replies: ReplyStore,
    adapter: Mutex<Box<dyn VendorAdapter>>,
    state: RwLock<BTreeMap<Channel, ChannelValue>>,
    liveness: Mutex<LivenessTracker>,
    discovery: RwLock<Arc<dyn OnvifDiscovery>>,
    capabilities: RwLock<Option<Capabilities>>,
    low_priority: Mutex<RoundRobin>,
    snapshot_in_flight: AtomicBool,
    stopped: AtomicBool,
    fanout: Arc<MediaFanout>,
    hub: Arc<RealtimeHub>,
    transcoders: TranscoderPool,
    scheduler: Mutex<Option<PollingScheduler>>,
    /// High-priority requests and snapshot refreshes spawned by the cadence
    poll_tasks: Mutex<JoinSet<()>>,
    mjpeg_relay: Mutex<Option<JoinHandle<()>>>,
}

fn build_client(settings: &SessionSettings) -> Result<reqwest::Client> {
    // No overall timeout: event streams and MJPEG relays stay open
    Ok(reqwest::Client::builder()
        .connect_timeout(settings.request_timeout)
        .tcp_keepalive(settings.stream_idle_timeout)
        .build()?)
}

fn build_discovery(
    config: &CameraConfig,
    settings: &SessionSettings,
) -> Result<Arc<dyn OnvifDiscovery>> {
    Ok(match config.onvif_port {
        Some(port) => Arc::new(SoapDiscovery::new(
            &config.address,
            port,
            config.username.clone(),
            config.password.clone(),
            settings.request_timeout,
        )?),
        None => Arc::new(VendorDefaults::for_camera(config)),
    })
}

fn build_auth(config: &CameraConfig) -> AuthNegotiator {
    AuthNegotiator::new(config.username.clone(), config.password.clone())
        .with_nonce_reuse(config.reuse_digest_nonce)
}

/// Path plus query, as signed by digest auth
fn request_uri(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(u) => match u.query() {
            Some(q) => format!("{}?{}", u.path(), q),
            None => u.path().to_string(),
        },
        Err(_) => url.to_string(),
    }
}

/// Prefer a Digest challenge when the camera offers several
fn select_challenge(headers: &HeaderMap) -> Option<String> {
    let offered: Vec<&str> = headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    offered
        .iter()
        .find(|h| h.trim_start().to_ascii_lowercase().starts_with("digest"))
        .or_else(|| offered.first())
        .map(|h| h.to_string())
}

/// Complete parts (delimiter included) at the front of `pending`. Bytes are
/// decoded only once a part is whole, so characters split across chunks survive.
fn take_parts(pending: &mut BytesMut, delimiter: &str) -> Vec<String> {
    let delimiter = delimiter.as_bytes();
    let mut parts = Vec::new();
    if delimiter.is_empty() {
        return parts;
    }
    while let Some(idx) = pending
        .windows(delimiter.len())
        .position(|w| w == delimiter)
    {
        let part = pending.split_to(idx + delimiter.len());
        parts.push(String::from_utf8_lossy(&part).into_owned());
    }
    parts
}

/// Read the whole body, keeping what arrived if the camera cuts it short
async fn read_body(mut response: reqwest::Response) -> Result<Bytes> {
    let mut body = BytesMut::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) if !body.is_empty() => {
                tracing::trace!(error = %e, received = body.len(), "Reply cut short, keeping partial body");
                break;
            }
            Err(e) => return Err(Error::Connectivity(e.to_string())),
        }
    }
    Ok(body.freeze())
}

impl CameraSession {
    pub fn new(
        config: CameraConfig,
        settings: SessionSettings,
        hub: Arc<RealtimeHub>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let client = build_client(&settings)?;
        let discovery = build_discovery(&config, &settings)?;
        let adapter = create_adapter(config.brand, config.adapter_context());
        let low_priority = RoundRobin::new(adapter.low_priority_paths());
        let fanout = Arc::new(MediaFanout::new(
            config.camera_id.clone(),
            AllowList::parse(&config.ip_whitelist),
        ));

        Ok(Arc::new(Self {
            camera_id: config.camera_id.clone(),
            settings,
            auth: Mutex::new(build_auth(&config)),
            config: RwLock::new(config),
            client: RwLock::new(client),
            replies: ReplyStore::new(),
            adapter: Mutex::new(adapter),
            state: RwLock::new(BTreeMap::new()),
            liveness: Mutex::new(LivenessTracker::new()),
            discovery: RwLock::new(discovery),
            capabilities: RwLock::new(None),
            low_priority: Mutex::new(low_priority),
            snapshot_in_flight: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            fanout,
            hub,
            transcoders: TranscoderPool::new(),
            scheduler: Mutex::new(None),
            poll_tasks: Mutex::new(JoinSet::new()),
            mjpeg_relay: Mutex::new(None),
        }))
    }

    /// Start the cadences
    pub fn start(self: &Arc<Self>) {
        let scheduler = PollingScheduler::start(self);
        *self.scheduler.lock() = Some(scheduler);
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.lock().is_some()
    }

    pub fn id(&self) -> &str {
        &self.camera_id
    }

    pub fn config(&self) -> CameraConfig {
        self.config.read().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.liveness.lock().status().clone()
    }

    pub fn channel_state(&self) -> BTreeMap<Channel, ChannelValue> {
        self.state.read().clone()
    }

    pub fn channel_value(&self, channel: Channel) -> Option<ChannelValue> {
        self.state.read().get(&channel).cloned()
    }

    pub fn replies(&self) -> &ReplyStore {
        &self.replies
    }

    pub fn fanout(&self) -> &Arc<MediaFanout> {
        &self.fanout
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities.read().clone()
    }

    pub fn low_priority_paths(&self) -> Vec<String> {
        self.low_priority.lock().paths().to_vec()
    }

    pub fn event_stream(&self) -> Option<EventStream> {
        self.adapter.lock().event_stream()
    }

    /// Swap the discovery collaborator
    pub fn set_discovery(&self, discovery: Arc<dyn OnvifDiscovery>) {
        *self.discovery.write() = discovery;
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            camera_id: self.camera_id.clone(),
            brand: self.config.read().brand,
            status: self.status(),
            state: self.channel_state(),
            capabilities: self.capabilities(),
            auth_scheme: self.auth.lock().context().scheme,
            low_priority_paths: self.low_priority_paths(),
            media: self.fanout.stats(),
        }
    }

    /// Snapshot source: configured URL, then discovery, then the vendor path
    pub fn snapshot_uri(&self) -> Option<String> {
        let configured = self.config.read().snapshot_url.clone();
        configured
            .or_else(|| {
                self.capabilities
                    .read()
                    .as_ref()
                    .and_then(|c| c.snapshot_uri.clone())
            })
            .or_else(|| self.adapter.lock().snapshot_path())
    }

    pub fn stream_uri(&self) -> Option<String> {
        let configured = self.config.read().stream_url.clone();
        configured.or_else(|| {
            self.capabilities
                .read()
                .as_ref()
                .and_then(|c| c.stream_uri.clone())
        })
    }

    pub fn media_dir(&self) -> PathBuf {
        self.settings.media_dir.join(&self.camera_id)
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.config.read().base_url();
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    async fn dispatch(
        &self,
        method: &Method,
        url: &str,
        body: Option<&str>,
        authorization: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let client = self.client.read().clone();
        let mut request = client.request(method.clone(), url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        if let Some(body) = body {
            request = request.body(body.to_string());
        }
        request
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("{}: {}", url, e)))
    }

    /// Send with the held credentials; on 401 absorb the challenge and resend once
    async fn open(
        &self,
        method: &Method,
        path: &str,
        body: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let url = self.url_for(path);
        let uri = request_uri(&url);

        let authorization = self.auth.lock().authorization_for(method.as_str(), &uri);
        let response = self
            .dispatch(method, &url, body, authorization.as_deref(), timeout)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = select_challenge(response.headers()).ok_or_else(|| {
            AuthError::Unavailable(format!("{} answered 401 without a challenge", path))
        })?;
        let auth = self
            .auth
            .lock()
            .process_auth(Some(&challenge), method.as_str(), &uri, true)?;
        if !auth.resend {
            return Ok(response);
        }

        tracing::debug!(camera_id = %self.camera_id, path = %path, "Resending with new credentials");
        let response = self
            .dispatch(method, &url, body, Some(&auth.value), timeout)
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(AuthError::Unavailable(format!("credentials rejected for {}", path)).into());
        }
        Ok(response)
    }

    /// One request/reply exchange; the outcome feeds liveness
    pub async fn fetch(&self, request: &CameraRequest) -> Result<HttpReply> {
        let result = self.exchange(request).await;
        self.note_result(&result).await;
        result
    }

    async fn exchange(&self, request: &CameraRequest) -> Result<HttpReply> {
        let response = self
            .open(
                &request.method,
                &request.path,
                request.body.as_deref(),
                Some(self.settings.request_timeout),
            )
            .await?;
        let status = response.status();
        let body = read_body(response).await?;
        Ok(HttpReply { status, body })
    }

    async fn note_result<T>(&self, result: &Result<T>) {
        let transition = match result {
            Ok(_) => self.liveness.lock().record_success(),
            Err(Error::Auth(e)) => {
                tracing::warn!(camera_id = %self.camera_id, error = %e, "Authentication failed");
                self.liveness.lock().configuration_error(e.to_string())
            }
            Err(e) if e.is_connectivity() => self.liveness.lock().record_failure(e.to_string()),
            Err(_) => None,
        };
        self.publish_status(transition).await;
    }

    async fn publish_status(&self, transition: Option<SessionStatus>) {
        let Some(status) = transition else {
            return;
        };
        tracing::info!(camera_id = %self.camera_id, status = ?status, "Session status changed");
        let offline = status.is_offline();
        self.hub
            .broadcast(HubMessage::StatusChanged(StatusChangedMessage {
                camera_id: self.camera_id.clone(),
                status,
                timestamp: Utc::now().to_rfc3339(),
            }))
            .await;

        // No evidence arrives while offline, so held alarms would never count down
        if offline {
            let released = self.adapter.lock().release_alarms();
            for event in released {
                self.set_channel(event).await;
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Next body chunk, failing once the camera has been silent too long
    async fn next_chunk(&self, response: &mut reqwest::Response) -> Result<Option<Bytes>> {
        let idle = self.settings.stream_idle_timeout;
        match tokio::time::timeout(idle, response.chunk()).await {
            Ok(chunk) => chunk.map_err(|e| Error::Connectivity(e.to_string())),
            Err(_) => Err(Error::Connectivity(format!(
                "no data for {} ms",
                idle.as_millis()
            ))),
        }
    }

    /// Poll `path` unless a request for it is already outstanding
    pub async fn poll_path(&self, path: &str) -> Result<()> {
        if !self.replies.begin_request(path) {
            tracing::trace!(camera_id = %self.camera_id, path = %path, "Request outstanding, skipping");
            return Ok(());
        }

        let reply = match self.fetch(&CameraRequest::get(path)).await {
            Ok(reply) => reply,
            Err(e) => {
                self.replies.abandon(path);
                return Err(e);
            }
        };

        if self.is_stopped() {
            self.replies.abandon(path);
            return Ok(());
        }

        let body = reply.text();
        self.replies.store_reply(path, body.clone());
        let outcome = self.adapter.lock().parse(path, &body);
        self.apply(outcome).await;
        Ok(())
    }

    async fn apply(&self, outcome: ParseOutcome) {
        if self.is_stopped() {
            return;
        }
        for path in &outcome.unsupported {
            let removed = self.low_priority.lock().remove(path);
            if removed {
                tracing::info!(camera_id = %self.camera_id, path = %path, "Camera reports endpoint unsupported, no longer polling it");
            }
        }

        let fresh_motion = outcome
            .events
            .iter()
            .any(|e| e.fresh && e.channel.is_motion_class());

        for event in outcome.events {
            self.set_channel(event).await;
        }

        if fresh_motion {
            if let Err(e) = self.refresh_snapshot().await {
                tracing::debug!(camera_id = %self.camera_id, error = %e, "Alarm snapshot failed");
            }
        }
    }

    async fn set_channel(&self, event: AlarmEvent) {
        if self.is_stopped() {
            return;
        }
        let changed = {
            let mut state = self.state.write();
            state.insert(event.channel, event.value.clone()).as_ref() != Some(&event.value)
        };
        if !changed {
            return;
        }

        tracing::debug!(
            camera_id = %self.camera_id,
            channel = %event.channel,
            value = ?event.value,
            ttl = event.ttl,
            "Channel updated"
        );
        self.hub
            .broadcast(HubMessage::ChannelUpdate(ChannelUpdateMessage {
                camera_id: self.camera_id.clone(),
                channel: event.channel,
                value: event.value,
                vendor: event.vendor,
                timestamp: Utc::now().to_rfc3339(),
            }))
            .await;
    }

    /// Camera-initiated data arriving on the media server
    pub async fn handle_push(&self, uri: &str, body: &str) {
        let outcome = self.adapter.lock().push(uri, body);
        self.apply(outcome).await;
    }

    /// Write `value` to `channel`, then re-read the settings it touched
    pub async fn handle_command(&self, channel: Channel, value: ChannelValue) -> Result<()> {
        let request = self.adapter.lock().command(channel, &value, &self.replies)?;
        tracing::info!(
            camera_id = %self.camera_id,
            channel = %channel,
            value = ?value,
            path = %request.path,
            "Sending command"
        );

        let reply = self.fetch(&request).await?;
        if !reply.status.is_success() {
            return Err(Error::UnsupportedFeature(format!(
                "{} answered {}",
                request.path, reply.status
            )));
        }

        if let Some(refresh) = &request.refresh {
            self.poll_path(refresh).await?;
        }
        Ok(())
    }

    /// Fetch a new snapshot into the cache. Ok(false) when there is no
    /// source, a fetch is already running or the image was too small.
    pub async fn refresh_snapshot(&self) -> Result<bool> {
        let Some(uri) = self.snapshot_uri() else {
            return Ok(false);
        };
        if self.snapshot_in_flight.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let result = self.fetch(&CameraRequest::get(uri.clone())).await;
        self.snapshot_in_flight.store(false, Ordering::Release);

        let reply = result?;
        if self.is_stopped() {
            return Ok(false);
        }
        if !reply.status.is_success() {
            return Err(Error::UnsupportedFeature(format!(
                "snapshot {} answered {}",
                uri, reply.status
            )));
        }
        Ok(self.store_snapshot(reply.body).await)
    }

    /// Replace the cached snapshot (fetched or uploaded by the camera)
    pub async fn store_snapshot(&self, jpeg: Bytes) -> bool {
        let bytes = jpeg.len();
        if !self.fanout.store_snapshot(jpeg) {
            return false;
        }
        self.hub
            .broadcast(HubMessage::SnapshotUpdated(SnapshotUpdatedMessage {
                camera_id: self.camera_id.clone(),
                bytes,
                timestamp: Utc::now().to_rfc3339(),
            }))
            .await;
        true
    }

    /// Health cadence
    pub async fn health_check(&self) {
        self.transcoders.tick().await;
        if self.fanout.has_listeners(StreamGroup::Mjpeg) {
            self.transcoders.keep_alive(TranscodeFormat::Mjpeg).await;
        }

        match self.status() {
            SessionStatus::Offline {
                reason: OfflineReason::ConfigurationError | OfflineReason::Gone,
                ..
            } => {}
            SessionStatus::Online => {
                if let Err(e) = self.probe().await {
                    tracing::debug!(camera_id = %self.camera_id, error = %e, "Liveness probe failed");
                }
            }
            _ => {
                let transition = self.liveness.lock().reconnecting();
                self.publish_status(transition).await;
                self.connect().await;
            }
        }
    }

    /// Capability discovery followed by a liveness probe
    async fn connect(&self) {
        let discovery = self.discovery.read().clone();
        let profile = self.config.read().onvif_profile;

        match discover(discovery.as_ref(), profile).await {
            Ok(caps) => {
                tracing::info!(
                    camera_id = %self.camera_id,
                    profiles = caps.profiles.len(),
                    snapshot_uri = ?caps.snapshot_uri,
                    ptz = caps.ptz_supported,
                    "Capabilities discovered"
                );
                *self.capabilities.write() = Some(caps);
            }
            Err(e) => {
                tracing::warn!(camera_id = %self.camera_id, error = %e, "Capability discovery failed");
                self.note_result::<()>(&Err(e)).await;
                return;
            }
        }

        if let Err(e) = self.probe().await {
            tracing::debug!(camera_id = %self.camera_id, error = %e, "Connect probe failed");
        }
    }

    /// Any HTTP answer counts as alive
    async fn probe(&self) -> Result<()> {
        let path = self
            .snapshot_uri()
            .or_else(|| self.adapter.lock().high_priority_paths().into_iter().next())
            .unwrap_or_else(|| "/".to_string());
        self.fetch(&CameraRequest::get(path)).await.map(|_| ())
    }

    /// High-priority cadence: countdowns, snapshot, primary endpoints, ONVIF pull
    pub async fn poll_high_priority(self: Arc<Self>) {
        if !self.status().is_online() {
            return;
        }

        let expired = self.adapter.lock().tick();
        if !expired.is_empty() {
            self.apply(ParseOutcome {
                events: expired,
                unsupported: Vec::new(),
            })
            .await;
        }

        let (snapshot_polling, brand) = {
            let config = self.config.read();
            (config.snapshot_polling, config.brand)
        };

        let paths = self.adapter.lock().high_priority_paths();
        let snapshot_viewers = self.fanout.has_listeners(StreamGroup::Snapshots)
            || self.fanout.has_listeners(StreamGroup::AutoFps);
        {
            let mut tasks = self.poll_tasks.lock();
            while tasks.try_join_next().is_some() {}

            for path in paths {
                let session = self.clone();
                tasks.spawn(async move {
                    if let Err(e) = session.poll_path(&path).await {
                        tracing::debug!(camera_id = %session.camera_id, path = %path, error = %e, "Poll failed");
                    }
                });
            }

            if snapshot_polling || snapshot_viewers {
                let session = self.clone();
                tasks.spawn(async move {
                    if let Err(e) = session.refresh_snapshot().await {
                        tracing::debug!(camera_id = %session.camera_id, error = %e, "Snapshot refresh failed");
                    }
                });
            }
        }

        if brand == CameraBrand::Onvif {
            let discovery = self.discovery.read().clone();
            match discovery.pull_events().await {
                Ok(Some(xml)) => self.handle_push("/OnvifEvent", &xml).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(camera_id = %self.camera_id, error = %e, "ONVIF event pull failed")
                }
            }
        }
    }

    /// Low-priority cadence: next secondary endpoint
    pub async fn poll_low_priority(&self) {
        if !self.status().is_online() {
            return;
        }
        let next = self.low_priority.lock().next();
        let Some(path) = next else {
            return;
        };
        if let Err(e) = self.poll_path(&path).await {
            tracing::debug!(camera_id = %self.camera_id, path = %path, error = %e, "Low-priority poll failed");
        }
    }

    /// Hold a long-lived event stream open until it ends or fails
    pub async fn read_event_stream(&self, stream: &EventStream) -> Result<()> {
        let mut response = self.open(&Method::GET, &stream.path, None, None).await?;
        if !response.status().is_success() {
            return Err(Error::UnsupportedFeature(format!(
                "{} answered {}",
                stream.path,
                response.status()
            )));
        }
        tracing::info!(camera_id = %self.camera_id, path = %stream.path, "Event stream attached");

        let mut pending = BytesMut::new();
        while let Some(chunk) = self.next_chunk(&mut response).await? {
            if self.is_stopped() {
                break;
            }
            pending.extend_from_slice(&chunk);
            for part in take_parts(&mut pending, stream.delimiter) {
                let outcome = self.adapter.lock().parse(&stream.path, &part);
                self.apply(outcome).await;
            }
            if pending.len() > EVENT_BUFFER_LIMIT {
                tracing::debug!(camera_id = %self.camera_id, pending = pending.len(), "Event buffer overflow, discarding");
                pending.clear();
            }
        }
        Ok(())
    }

    fn transcoder_settings(&self) -> Result<TranscoderSettings> {
        let input = self.stream_uri().ok_or_else(|| {
            Error::Transcoder(format!("camera {} has no stream URI", self.camera_id))
        })?;
        let output_dir = self.media_dir();
        let config = self.config.read();
        Ok(TranscoderSettings {
            ffmpeg_path: self.settings.ffmpeg_path.clone(),
            input_uri: embed_credentials(&input, &config.username, &config.password),
            input_options: config.ffmpeg_input_options.clone(),
            hls_output_options: config.hls_output_options.clone(),
            dash_output_options: config.dash_output_options.clone(),
            mjpeg_output_options: config.mjpeg_output_options.clone(),
            output_dir,
        })
    }

    /// Start (or keep alive) the transcoder for `format`; returns its output dir
    pub async fn request_transcode(&self, format: TranscodeFormat) -> Result<PathBuf> {
        let settings = self.transcoder_settings()?;
        self.transcoders
            .ensure(format, &settings, self.fanout.clone())
            .await?;
        Ok(settings.output_dir)
    }

    /// Make sure something feeds the `/ipcamera.mjpeg` group
    pub async fn request_mjpeg(self: &Arc<Self>) -> Result<()> {
        let configured = self.config.read().mjpeg_url.clone();
        let native = configured.or_else(|| self.adapter.lock().mjpeg_path());
        match native {
            Some(path) => {
                self.start_mjpeg_relay(path);
                Ok(())
            }
            None => self.request_transcode(TranscodeFormat::Mjpeg).await.map(|_| ()),
        }
    }

    fn start_mjpeg_relay(self: &Arc<Self>, path: String) {
        let mut relay = self.mjpeg_relay.lock();
        if relay.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let session = self.clone();
        *relay = Some(tokio::spawn(async move { session.relay_mjpeg(path).await }));
    }

    /// Copy the camera's own MJPEG stream into the fan-out while viewers remain
    async fn relay_mjpeg(self: Arc<Self>, path: String) {
        let mut response = match self.open(&Method::GET, &path, None, None).await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!(camera_id = %self.camera_id, path = %path, status = %r.status(), "MJPEG source refused");
                return;
            }
            Err(e) => {
                tracing::warn!(camera_id = %self.camera_id, path = %path, error = %e, "MJPEG source unavailable");
                return;
            }
        };

        tracing::info!(camera_id = %self.camera_id, "MJPEG relay started");
        let mut splitter = JpegSplitter::new();
        loop {
            let chunk = match self.next_chunk(&mut response).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(camera_id = %self.camera_id, error = %e, "MJPEG source stalled");
                    break;
                }
            };
            for frame in splitter.push(&chunk) {
                self.fanout.publish_frame(frame);
            }
            if !self.fanout.has_listeners(StreamGroup::Mjpeg) {
                break;
            }
        }
        tracing::info!(camera_id = %self.camera_id, "MJPEG relay ended");
    }

    /// Apply a new configuration. Connection changes rebuild the client,
    /// auth context, adapter and discovery; the cadences always restart.
    pub async fn reconfigure(self: &Arc<Self>, config: CameraConfig) -> Result<()> {
        config.validate()?;
        if config.camera_id != self.camera_id {
            return Err(Error::Validation(format!(
                "camera_id cannot change ({} -> {})",
                self.camera_id, config.camera_id
            )));
        }

        let scheduler = self.scheduler.lock().take();
        drop(scheduler);

        let (connection_changed, auth_changed) = {
            let current = self.config.read();
            let changed = current.connection_changed(&config);
            (
                changed,
                changed || current.reuse_digest_nonce != config.reuse_digest_nonce,
            )
        };

        self.fanout.set_allow_list(AllowList::parse(&config.ip_whitelist));

        if connection_changed {
            let discovery = build_discovery(&config, &self.settings)?;
            *self.client.write() = build_client(&self.settings)?;
            let adapter = create_adapter(config.brand, config.adapter_context());
            *self.low_priority.lock() = RoundRobin::new(adapter.low_priority_paths());
            *self.adapter.lock() = adapter;
            *self.discovery.write() = discovery;
            *self.capabilities.write() = None;
            self.replies.clear();
            self.state.write().clear();

            let relay = self.mjpeg_relay.lock().take();
            if let Some(relay) = relay {
                relay.abort();
            }
            self.transcoders.stop_all().await;
        }
        if auth_changed {
            *self.auth.lock() = build_auth(&config);
        }

        let was_misconfigured = matches!(
            self.status(),
            SessionStatus::Offline {
                reason: OfflineReason::ConfigurationError,
                ..
            }
        );
        *self.config.write() = config;

        let transition = if connection_changed || was_misconfigured {
            self.liveness.lock().reset()
        } else {
            None
        };
        self.publish_status(transition).await;

        tracing::info!(camera_id = %self.camera_id, connection_changed, "Camera reconfigured");
        self.start();
        Ok(())
    }

    /// Cancel the cadences, stop transcoders and drop every viewer
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let scheduler = self.scheduler.lock().take();
        drop(scheduler);
        self.poll_tasks.lock().abort_all();

        let relay = self.mjpeg_relay.lock().take();
        if let Some(relay) = relay {
            relay.abort();
        }

        self.transcoders.stop_all().await;
        self.fanout.close_all();

        let transition = self.liveness.lock().stopped();
        self.publish_status(transition).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_camera(brand: CameraBrand) -> CameraConfig {
        // Port 9 on loopback refuses connections
        let mut config = CameraConfig::new("test-cam", brand, "127.0.0.1");
        config.port = 9;
        config
    }

    fn session(config: CameraConfig) -> (Arc<CameraSession>, Arc<RealtimeHub>) {
        let hub = Arc::new(RealtimeHub::new());
        let settings = SessionSettings {
            request_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        (CameraSession::new(config, settings, hub.clone()).unwrap(), hub)
    }

    #[test]
    fn test_request_uri_keeps_query() {
        assert_eq!(
            request_uri("http://10.0.0.2:80/cgi-bin/configManager.cgi?action=getConfig&name=MotionDetect"),
            "/cgi-bin/configManager.cgi?action=getConfig&name=MotionDetect"
        );
        assert_eq!(request_uri("http://10.0.0.2/ISAPI/System/IO/inputs/1"), "/ISAPI/System/IO/inputs/1");
    }

    #[test]
    fn test_select_challenge_prefers_digest() {
        let mut headers = HeaderMap::new();
        headers.append(WWW_AUTHENTICATE, "Basic realm=\"cam\"".parse().unwrap());
        headers.append(WWW_AUTHENTICATE, "Digest realm=\"cam\", nonce=\"n\"".parse().unwrap());
        assert!(select_challenge(&headers).unwrap().starts_with("Digest"));

        let mut basic = HeaderMap::new();
        basic.append(WWW_AUTHENTICATE, "Basic realm=\"cam\"".parse().unwrap());
        assert!(select_challenge(&basic).unwrap().starts_with("Basic"));
        assert!(select_challenge(&HeaderMap::new()).is_none());
    }

    #[tokio::test]
    async fn test_snapshot_uri_precedence() {
        let mut config = unreachable_camera(CameraBrand::Instar);
        let (s, _hub) = session(config.clone());
        assert_eq!(s.snapshot_uri().as_deref(), Some("/tmpfs/snap.jpg"));

        *s.capabilities.write() = Some(Capabilities {
            snapshot_uri: Some("http://127.0.0.1/onvif/snap".to_string()),
            ..Default::default()
        });
        assert_eq!(s.snapshot_uri().as_deref(), Some("http://127.0.0.1/onvif/snap"));

        config.snapshot_url = Some("/custom.jpg".to_string());
        let (s, _hub) = session(config);
        assert_eq!(s.snapshot_uri().as_deref(), Some("/custom.jpg"));
    }

    #[tokio::test]
    async fn test_three_failures_take_camera_offline() {
        let (s, hub) = session(unreachable_camera(CameraBrand::Hikvision));
        let (_id, mut rx) = hub.register().await;

        let path = "/ISAPI/System/IO/inputs/1/status";
        for _ in 0..OFFLINE_AFTER_FAILURES - 1 {
            assert!(s.poll_path(path).await.is_err());
            assert_eq!(s.status(), SessionStatus::Connecting);
        }
        assert!(s.poll_path(path).await.is_err());
        assert!(matches!(
            s.status(),
            SessionStatus::Offline { reason: OfflineReason::CommunicationError, .. }
        ));
        // Failed requests release the slot
        assert!(!s.replies().is_in_flight(path));

        let json: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["data"]["status"]["status"], "OFFLINE");
    }

    #[tokio::test]
    async fn test_push_updates_state_and_broadcasts() {
        let (s, hub) = session(unreachable_camera(CameraBrand::Instar));
        let (_id, mut rx) = hub.register().await;

        s.handle_push("/instar?&active=5&object=0", "").await;
        assert_eq!(s.channel_value(Channel::PirAlarm), Some(ChannelValue::Switch(true)));

        let json: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(json["type"], "channel_update");
        assert_eq!(json["data"]["channel"], "pir_alarm");

        // Same value again is not re-broadcast
        s.handle_push("/instar?&active=5&object=0", "").await;
        let mut channels = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let json: serde_json::Value = serde_json::from_str(&msg).unwrap();
            if json["type"] == "channel_update" {
                channels.push(json["data"]["channel"].as_str().unwrap_or_default().to_string());
            }
        }
        assert!(!channels.contains(&"pir_alarm".to_string()));
    }

    #[tokio::test]
    async fn test_uploaded_snapshot_reaches_cache() {
        let (s, _hub) = session(unreachable_camera(CameraBrand::Onvif));
        assert!(!s.store_snapshot(Bytes::from_static(b"tiny")).await);
        assert!(s.store_snapshot(Bytes::from(vec![0xAB; 4096])).await);
        assert_eq!(s.fanout().snapshot().map(|b| b.len()), Some(4096));
    }

    #[tokio::test]
    async fn test_transcode_without_stream_uri() {
        let (s, _hub) = session(unreachable_camera(CameraBrand::Onvif));
        assert!(matches!(
            s.request_transcode(TranscodeFormat::Hls).await,
            Err(Error::Transcoder(_))
        ));
    }

    #[tokio::test]
    async fn test_reconfigure_rebuilds_adapter_and_restarts() {
        let (s, _hub) = session(unreachable_camera(CameraBrand::Instar));
        s.handle_push("/instar?&active=1", "").await;
        assert!(!s.channel_state().is_empty());

        let mut next = unreachable_camera(CameraBrand::Hikvision);
        next.poll_interval_ms = 60_000;
        next.health_interval_ms = 60_000;
        next.low_priority_interval_ms = 60_000;
        s.reconfigure(next).await.unwrap();

        assert!(s.is_running());
        assert!(s.channel_state().is_empty());
        assert_eq!(s.config().brand, CameraBrand::Hikvision);
        assert!(s.low_priority_paths().iter().any(|p| p.starts_with("/ISAPI")));

        let mut renamed = s.config();
        renamed.camera_id = "other".to_string();
        assert!(matches!(s.reconfigure(renamed).await, Err(Error::Validation(_))));

        s.stop().await;
        assert!(!s.is_running());
        assert!(matches!(
            s.status(),
            SessionStatus::Offline { reason: OfflineReason::Gone, .. }
        ));
    }

    mod fake_camera {
        use std::net::SocketAddr;

        use axum::Router;
        use tokio::net::TcpListener;

        pub async fn serve(app: Router) -> SocketAddr {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            addr
        }
    }

    fn local_camera(brand: CameraBrand, port: u16) -> CameraConfig {
        let mut config = CameraConfig::new("test-cam", brand, "127.0.0.1");
        config.port = port;
        config.snapshot_polling = false;
        config
    }

    fn session_with_idle(
        config: CameraConfig,
        stream_idle_timeout: Duration,
    ) -> (Arc<CameraSession>, Arc<RealtimeHub>) {
        let hub = Arc::new(RealtimeHub::new());
        let settings = SessionSettings {
            request_timeout: Duration::from_millis(500),
            stream_idle_timeout,
            ..Default::default()
        };
        (CameraSession::new(config, settings, hub.clone()).unwrap(), hub)
    }

    fn chunked_body(chunks: Vec<Vec<u8>>, gap: Duration) -> axum::body::Body {
        use futures::StreamExt;
        let stream = futures::stream::iter(chunks).then(move |chunk| async move {
            tokio::time::sleep(gap).await;
            Ok::<_, std::convert::Infallible>(Bytes::from(chunk))
        });
        axum::body::Body::from_stream(stream)
    }

    #[test]
    fn test_take_parts_keeps_split_characters() {
        let mut pending = BytesMut::new();
        pending.extend_from_slice(b"caf\xC3");
        assert!(take_parts(&mut pending, "--b").is_empty());

        pending.extend_from_slice(b"\xA9--bnext");
        assert_eq!(take_parts(&mut pending, "--b"), vec!["café--b".to_string()]);
        assert_eq!(&pending[..], b"next");
    }

    #[tokio::test]
    async fn test_event_stream_parts_across_chunks_and_overflow() {
        use axum::routing::get;

        let mut garbage = b"Code=VideoBlind;action=Start;index=0\r\n".to_vec();
        garbage.extend(std::iter::repeat(b'x').take(EVENT_BUFFER_LIMIT + 4096));
        let chunks = vec![
            b"--myboundary\r\nContent-Type: text/plain\r\n\r\nCode=VideoMo".to_vec(),
            b"tion;action=Start;index=0\r\n\r\n--myboundary\r\n".to_vec(),
            garbage,
            b"\r\nCode=AudioMutation;action=Start;index=0\r\n--myboundary\r\n".to_vec(),
        ];
        let app = axum::Router::new().route(
            "/cgi-bin/eventManager.cgi",
            get(move || {
                let chunks = chunks.clone();
                async move { chunked_body(chunks, Duration::from_millis(30)) }
            }),
        );
        let addr = fake_camera::serve(app).await;
        let (s, _hub) = session_with_idle(
            local_camera(CameraBrand::Dahua, addr.port()),
            Duration::from_secs(2),
        );

        let stream = s.event_stream().unwrap();
        tokio::time::timeout(Duration::from_secs(5), s.read_event_stream(&stream))
            .await
            .unwrap()
            .unwrap();

        // Part split over two chunks
        assert_eq!(s.channel_value(Channel::MotionAlarm), Some(ChannelValue::Switch(true)));
        // Overflowed buffer was discarded, the part after it still parsed
        assert_eq!(s.channel_value(Channel::TamperAlarm), None);
        assert_eq!(s.channel_value(Channel::AudioAlarm), Some(ChannelValue::Switch(true)));
    }

    #[tokio::test]
    async fn test_silent_event_stream_fails_after_idle_timeout() {
        use axum::routing::get;
        use futures::StreamExt;

        // Headers and one part, then the connection goes quiet
        let app = axum::Router::new().route(
            "/cgi-bin/eventManager.cgi",
            get(|| async {
                let first = futures::stream::once(async {
                    Ok::<_, std::convert::Infallible>(Bytes::from_static(b"--myboundary\r\n"))
                });
                axum::body::Body::from_stream(first.chain(futures::stream::pending()))
            }),
        );
        let addr = fake_camera::serve(app).await;
        let (s, _hub) = session_with_idle(
            local_camera(CameraBrand::Dahua, addr.port()),
            Duration::from_millis(300),
        );

        let stream = s.event_stream().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), s.read_event_stream(&stream))
            .await
            .expect("event stream read must give up on a silent camera");
        assert!(matches!(result, Err(Error::Connectivity(_))));
    }

    #[tokio::test]
    async fn test_silent_mjpeg_source_ends_relay() {
        use axum::routing::get;
        use futures::StreamExt;

        let app = axum::Router::new().route(
            "/video",
            get(|| async {
                let first = futures::stream::once(async {
                    Ok::<_, std::convert::Infallible>(Bytes::from_static(b"--frame\r\n"))
                });
                axum::body::Body::from_stream(first.chain(futures::stream::pending()))
            }),
        );
        let addr = fake_camera::serve(app).await;
        let (s, _hub) = session_with_idle(
            local_camera(CameraBrand::Onvif, addr.port()),
            Duration::from_millis(300),
        );
        let _viewer = s
            .fanout()
            .subscribe(StreamGroup::Mjpeg, "127.0.0.1".parse().unwrap())
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), s.clone().relay_mjpeg("/video".to_string()))
            .await
            .expect("relay must end when the source goes quiet");
    }

    #[tokio::test]
    async fn test_replies_after_stop_are_discarded() {
        use axum::routing::get;

        let app = axum::Router::new()
            .route(
                "/cgi-bin/eventManager.cgi",
                get(|| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    "found=1\r\nchannels[0]=0\r\n"
                }),
            )
            .route(
                "/cgi-bin/configManager.cgi",
                get(|| async { "table.MotionDetect[0].Enable=true\r\n" }),
            );
        let addr = fake_camera::serve(app).await;
        let (s, hub) = session_with_idle(
            local_camera(CameraBrand::Amcrest, addr.port()),
            Duration::from_secs(2),
        );

        s.poll_path("/cgi-bin/configManager.cgi?action=getConfig&name=MotionDetect")
            .await
            .unwrap();
        assert!(s.status().is_online());

        s.clone().poll_high_priority().await;
        s.stop().await;
        let (_id, mut rx) = hub.register().await;

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(s.channel_value(Channel::MotionAlarm), None);
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            s.status(),
            SessionStatus::Offline { reason: OfflineReason::Gone, .. }
        ));
    }

    #[tokio::test]
    async fn test_unsupported_endpoint_leaves_low_priority_rotation() {
        use axum::http::{StatusCode as HttpStatus, Uri};
        use axum::response::IntoResponse;

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let app = axum::Router::new().fallback(move |uri: Uri| {
            let record = record.clone();
            async move {
                record.lock().push(uri.path().to_string());
                if uri.path().contains("FieldDetection") {
                    (
                        HttpStatus::FORBIDDEN,
                        "<ResponseStatus><statusCode>4</statusCode><statusString>Invalid Operation</statusString><subStatusCode>notSupport</subStatusCode></ResponseStatus>",
                    )
                        .into_response()
                } else {
                    "<MotionDetection><enabled>true</enabled></MotionDetection>".into_response()
                }
            }
        });
        let addr = fake_camera::serve(app).await;
        let (s, _hub) = session_with_idle(
            local_camera(CameraBrand::Hikvision, addr.port()),
            Duration::from_secs(2),
        );

        let field = s
            .low_priority_paths()
            .into_iter()
            .find(|p| p.contains("FieldDetection"))
            .unwrap();
        let before = s.low_priority_paths().len();

        s.poll_path(&field).await.unwrap();
        assert!(s.status().is_online());
        assert!(!s.low_priority_paths().contains(&field));
        assert_eq!(s.low_priority_paths().len(), before - 1);

        let remaining = s.low_priority_paths().len();
        for _ in 0..remaining * 2 {
            s.poll_low_priority().await;
        }

        let seen = seen.lock().clone();
        assert_eq!(seen.iter().filter(|p| **p == field).count(), 1);
        assert_eq!(seen.len(), 1 + remaining * 2);
    }

    #[tokio::test]
    async fn test_going_offline_releases_held_alarms() {
        let (s, hub) = session(unreachable_camera(CameraBrand::Instar));
        s.handle_push("/instar?&active=5&object=0", "").await;
        assert_eq!(s.channel_value(Channel::PirAlarm), Some(ChannelValue::Switch(true)));
        let (_id, mut rx) = hub.register().await;

        let path = "/tmpfs/snap.jpg";
        for _ in 0..OFFLINE_AFTER_FAILURES {
            assert!(s.poll_path(path).await.is_err());
        }
        assert!(s.status().is_offline());
        assert_eq!(s.channel_value(Channel::PirAlarm), Some(ChannelValue::Switch(false)));

        let mut released = false;
        while let Ok(msg) = rx.try_recv() {
            let json: serde_json::Value = serde_json::from_str(&msg).unwrap();
            if json["type"] == "channel_update" && json["data"]["channel"] == "pir_alarm" {
                released = true;
            }
        }
        assert!(released);
    }
}
