//! stream_server.rs — HTTP endpoints over the live frame publisher.
//!
//! `GET /stream/video.mjpeg`  multipart MJPEG, one part per paced frame
//! `GET /stream/snapshot.jpg` latest frame or 503
//! `GET /stream/health`       liveness + frames captured so far

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::frame_publisher::FramePublisher;

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

#[derive(Clone)]
struct StreamState {
    publisher: FramePublisher,
    interval: Duration,
}

pub fn router(publisher: FramePublisher, interval: Duration) -> Router {
    Router::new()
        .route("/stream/video.mjpeg", get(video_feed))
        .route("/stream/snapshot.jpg", get(snapshot))
        .route("/stream/health", get(health))
        .with_state(StreamState {
            publisher,
            interval,
        })
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(
    addr: SocketAddr,
    publisher: FramePublisher,
    interval: Duration,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, publisher, interval, shutdown).await
}

pub async fn serve_on<F>(
    listener: TcpListener,
    publisher: FramePublisher,
    interval: Duration,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Stream server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(publisher, interval))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Stream server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one (`docker stop`,
/// systemd).
pub async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = terminate.recv() => {
                info!("Received SIGTERM");
                Ok(())
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + 2);
    part.put_slice(PART_HEADER);
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Logs the disconnect when the response body is dropped.
struct ClientGuard;

impl Drop for ClientGuard {
    fn drop(&mut self) {
        info!("Stream client disconnected");
    }
}

async fn video_feed(State(state): State<StreamState>) -> Response {
    info!("Stream client connected");
    let guard = ClientGuard;
    let parts = state.publisher.stream(state.interval).map(move |frame| {
        let _ = &guard;
        Ok::<_, Infallible>(multipart_chunk(&frame.jpeg))
    });

    (
        [
            (header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

async fn snapshot(State(state): State<StreamState>) -> Response {
    match state.publisher.snapshot() {
        Some(frame) => ([(header::CONTENT_TYPE, "image/jpeg")], frame.jpeg).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response(),
    }
}

async fn health(State(state): State<StreamState>) -> Json<serde_json::Value> {
    let health = state.publisher.health();
    Json(json!({
        "status": "ok",
        "streaming": health.streaming,
        "frame_count": health.frame_count,
    }))
}
