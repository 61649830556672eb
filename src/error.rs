//! Error kinds for each pipeline stage.
//!
//! Every stage reports its own error type; the capture loop is the single place
//! that decides whether a failure drops the frame, triggers a reconnect or is
//! simply logged.

use thiserror::Error;

/// Camera connection and frame read failures. Always recoverable.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("failed to open camera {0}")]
    Open(String),

    #[error("failed to read frame: {0}")]
    Read(String),

    #[error("camera stream closed")]
    Closed,

    #[error("unsupported camera source '{0}'")]
    Unsupported(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("image decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[cfg(feature = "rtsp")]
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Recognition backend failures. The frame is dropped, never retried.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),

    #[error("recognition request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("recognition backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid recognition response: {0}")]
    Decode(String),
}

/// Audit store failures. Logged and swallowed by the capture loop.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid stored timestamp '{raw}': {source}")]
    Timestamp {
        raw: String,
        source: chrono::ParseError,
    },
}

/// Outbound alert failures. No retry; the alert-sent flag stays false.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("alert webhook returned {0}")]
    Status(u16),
}

/// Pipeline startup and supervision failures. Fatal.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error("recognition client init failed: {0}")]
    Recognition(#[from] RecognitionError),

    #[error("alert sink init failed: {0}")]
    Alert(#[from] AlertError),

    #[error("capture worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("capture worker exited before reporting readiness")]
    WorkerGone,
}

/// Configuration problems. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
