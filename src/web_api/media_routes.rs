//! Per-camera media server
//!
//! Every request is checked against the camera's allow-list. Responses carry
//! permissive CORS and `Cache-Control: no-cache`.

use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderValue, StatusCode, Uri,
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::camera_session::CameraSession;
use crate::error::{Error, Result};
use crate::media_fanout::{mjpeg, Listener, StreamGroup};
use crate::transcoder::{require_output, TranscodeFormat};

type Session = State<Arc<CameraSession>>;
type Peer = ConnectInfo<SocketAddr>;

/// Router serving one camera's media
pub fn media_router(session: Arc<CameraSession>) -> Router {
    Router::new()
        .route("/ipcamera.jpg", get(snapshot).post(upload_snapshot))
        .route("/ipcamera.mjpeg", get(mjpeg_stream))
        .route("/snapshots.mjpeg", get(snapshots_stream))
        .route("/autofps.mjpeg", get(autofps_stream))
        .route("/ipcamera.m3u8", get(hls_manifest))
        .route("/ipcamera.mpd", get(dash_manifest))
        .route("/instar", get(instar_push).post(instar_push))
        .route("/OnvifEvent", post(onvif_push))
        .fallback(segment_file)
        .layer(middleware::map_response(no_cache))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(session)
}

/// Serve `session`'s media on an already bound listener
pub fn serve_media(listener: TcpListener, session: Arc<CameraSession>) -> JoinHandle<()> {
    let camera_id = session.id().to_string();
    let app = media_router(session);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            tracing::error!(camera_id = %camera_id, error = %e, "Media server stopped");
        }
    })
}

/// Bind the camera's `server_port`; `None` when the port is 0
pub async fn spawn_media_server(
    session: Arc<CameraSession>,
    host: &str,
) -> Result<Option<JoinHandle<()>>> {
    let port = session.config().server_port;
    if port == 0 {
        return Ok(None);
    }
    let listener = TcpListener::bind((host, port)).await?;
    tracing::info!(camera_id = %session.id(), host = %host, port, "Media server listening");
    Ok(Some(serve_media(listener, session)))
}

async fn no_cache(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn multipart(listener: Listener) -> Response {
    (
        [(CONTENT_TYPE, mjpeg::content_type())],
        Body::from_stream(listener.into_multipart()),
    )
        .into_response()
}

fn content_type_for(path: &FsPath) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str())? {
        "m3u8" => Some("application/vnd.apple.mpegurl"),
        "mpd" => Some("application/dash+xml"),
        "ts" => Some("video/mp2t"),
        "m4s" => Some("video/iso.segment"),
        "mp4" => Some("video/mp4"),
        "jpg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

async fn serve_file(path: &FsPath) -> Result<Response> {
    let content_type = content_type_for(path)
        .ok_or_else(|| Error::NotFound(path.display().to_string()))?;
    require_output(path).await?;
    let bytes = tokio::fs::read(path).await?;
    Ok(([(CONTENT_TYPE, content_type)], bytes).into_response())
}

async fn snapshot(State(session): Session, ConnectInfo(peer): Peer) -> Result<Response> {
    session.fanout().check_peer(peer.ip())?;

    // Cameras not refreshed on a timer fetch on demand
    if !session.config().snapshot_polling {
        if let Err(e) = session.refresh_snapshot().await {
            tracing::debug!(camera_id = %session.id(), error = %e, "On-demand snapshot failed");
        }
    }

    let jpeg = session
        .fanout()
        .snapshot()
        .ok_or_else(|| Error::NotFound(format!("no snapshot cached for {}", session.id())))?;
    Ok(([(CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}

async fn upload_snapshot(
    State(session): Session,
    ConnectInfo(peer): Peer,
    body: Bytes,
) -> Result<StatusCode> {
    session.fanout().check_peer(peer.ip())?;
    if session.store_snapshot(body).await {
        Ok(StatusCode::OK)
    } else {
        Err(Error::Validation("snapshot too small to be an image".to_string()))
    }
}

async fn mjpeg_stream(State(session): Session, ConnectInfo(peer): Peer) -> Result<Response> {
    let listener = session.fanout().subscribe(StreamGroup::Mjpeg, peer.ip())?;
    session.request_mjpeg().await?;
    Ok(multipart(listener))
}

async fn snapshots_stream(State(session): Session, ConnectInfo(peer): Peer) -> Result<Response> {
    let listener = session.fanout().subscribe(StreamGroup::Snapshots, peer.ip())?;
    Ok(multipart(listener))
}

async fn autofps_stream(State(session): Session, ConnectInfo(peer): Peer) -> Result<Response> {
    let listener = session.fanout().subscribe(StreamGroup::AutoFps, peer.ip())?;
    Ok(multipart(listener))
}

async fn transcoded(
    session: &CameraSession,
    peer: SocketAddr,
    format: TranscodeFormat,
) -> Result<Response> {
    session.fanout().check_peer(peer.ip())?;
    let dir = session.request_transcode(format).await?;
    let manifest = format
        .manifest()
        .ok_or_else(|| Error::Internal(format!("{:?} has no manifest", format)))?;
    serve_file(&dir.join(manifest)).await
}

async fn hls_manifest(State(session): Session, ConnectInfo(peer): Peer) -> Result<Response> {
    transcoded(&session, peer, TranscodeFormat::Hls).await
}

async fn dash_manifest(State(session): Session, ConnectInfo(peer): Peer) -> Result<Response> {
    transcoded(&session, peer, TranscodeFormat::Dash).await
}

/// Segment files written by the transcoder
async fn segment_file(
    State(session): Session,
    ConnectInfo(peer): Peer,
    uri: Uri,
) -> Result<Response> {
    session.fanout().check_peer(peer.ip())?;
    let name = uri.path().trim_start_matches('/');
    if name.is_empty() || name.contains('/') || name.contains("..") {
        return Err(Error::NotFound(uri.path().to_string()));
    }
    serve_file(&session.media_dir().join(name)).await
}

/// Instar alarm-server callback (`/instar?&active=N&object=M`)
async fn instar_push(
    State(session): Session,
    ConnectInfo(peer): Peer,
    uri: Uri,
    body: String,
) -> Result<StatusCode> {
    session.fanout().check_peer(peer.ip())?;
    let target = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/instar");
    session.handle_push(target, &body).await;
    Ok(StatusCode::OK)
}

async fn onvif_push(
    State(session): Session,
    ConnectInfo(peer): Peer,
    body: String,
) -> Result<StatusCode> {
    session.fanout().check_peer(peer.ip())?;
    session.handle_push("/OnvifEvent", &body).await;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(FsPath::new("/m/ipcamera.m3u8")), Some("application/vnd.apple.mpegurl"));
        assert_eq!(content_type_for(FsPath::new("/m/seg12.ts")), Some("video/mp2t"));
        assert_eq!(content_type_for(FsPath::new("/m/init.m4s")), Some("video/iso.segment"));
        assert_eq!(content_type_for(FsPath::new("/m/cameras.json")), None);
        assert_eq!(content_type_for(FsPath::new("/m/noext")), None);
    }

    #[tokio::test]
    async fn test_serve_file_not_yet_available() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("ipcamera.m3u8");
        assert!(matches!(serve_file(&missing).await, Err(Error::Transcoder(_))));

        std::fs::write(&missing, "#EXTM3U\n").unwrap();
        let response = serve_file(&missing).await.unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], "application/vnd.apple.mpegurl");
    }
}
