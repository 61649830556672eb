/// Camera capture — frame sources and connection bookkeeping.
///
/// Two source kinds, chosen by URL scheme:
///   - rtsp://     OpenCV / FFmpeg capture (feature `rtsp`)
///   - http(s)://  JPEG snapshot polling (Hikvision ISAPI `.../picture` style)
///
/// A connected source yields a stream handle; dropping the handle releases it.

use std::fmt;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use tracing::{debug, info};
use url::Url;

use crate::camera_config::CameraConfig;
use crate::error::CameraError;

/// Decoded RGB frame as handed between pipeline stages.
pub type Frame = image::RgbImage;

/// Encode a frame as JPEG at the given quality (1..=100).
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::with_capacity(frame.as_raw().len() / 8);
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
        encoder.encode_image(frame)?;
    }
    Ok(buf)
}

// ─── Connection state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    /// Last connect attempt failed; waiting out the reconnect delay.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ─── Frame admission ────────────────────────────────────────────────────────

/// Outcome of counting one successfully read frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub number: u64,
    pub process: bool,
}

/// Monotonic read counter; every `skip`-th frame is admitted for recognition.
#[derive(Debug, Clone)]
pub struct FrameCounter {
    count: u64,
    skip: u64,
}

impl FrameCounter {
    pub fn new(skip: u32) -> Self {
        Self {
            count: 0,
            skip: u64::from(skip.max(1)),
        }
    }

    pub fn admit(&mut self) -> Admission {
        self.count += 1;
        Admission {
            number: self.count,
            process: self.count % self.skip == 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

// ─── Source traits ──────────────────────────────────────────────────────────

/// Options applied when a stream is opened.
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub width: u32,
    pub height: u32,
    /// Driver-side frame queue; 1 keeps latency low.
    pub buffer_size: u32,
}

impl From<&CameraConfig> for CaptureOptions {
    fn from(cfg: &CameraConfig) -> Self {
        Self {
            width: cfg.frame_width,
            height: cfg.frame_height,
            buffer_size: 1,
        }
    }
}

/// Something that can be (re)connected to produce a frame stream.
pub trait FrameSource {
    type Stream: FrameStream;

    fn connect(&mut self) -> Result<Self::Stream, CameraError>;

    /// Human readable source address with credentials removed.
    fn describe(&self) -> String;
}

/// An open stream. Dropping it releases the underlying handle.
pub trait FrameStream {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Strip userinfo from a camera URL for logging.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

// ─── Scheme dispatch ────────────────────────────────────────────────────────

pub enum CameraSource {
    Http(HttpSnapshotSource),
    #[cfg(feature = "rtsp")]
    Rtsp(OpenCvSource),
}

pub enum CameraStream {
    Http(HttpSnapshotStream),
    #[cfg(feature = "rtsp")]
    Rtsp(OpenCvStream),
}

/// Pick a source implementation for the configured camera URL.
pub fn open_source(cfg: &CameraConfig) -> Result<CameraSource, CameraError> {
    let url = Url::parse(&cfg.url).map_err(|_| CameraError::Unsupported(redact_url(&cfg.url)))?;
    match url.scheme() {
        "http" | "https" => Ok(CameraSource::Http(HttpSnapshotSource::new(
            &cfg.url,
            cfg.snapshot_fps,
        ))),
        #[cfg(feature = "rtsp")]
        "rtsp" => Ok(CameraSource::Rtsp(OpenCvSource::new(
            &cfg.url,
            CaptureOptions::from(cfg),
        ))),
        #[cfg(not(feature = "rtsp"))]
        "rtsp" => Err(CameraError::Unsupported(format!(
            "{} (built without the `rtsp` feature)",
            redact_url(&cfg.url)
        ))),
        _ => Err(CameraError::Unsupported(redact_url(&cfg.url))),
    }
}

impl FrameSource for CameraSource {
    type Stream = CameraStream;

    fn connect(&mut self) -> Result<CameraStream, CameraError> {
        match self {
            CameraSource::Http(source) => source.connect().map(CameraStream::Http),
            #[cfg(feature = "rtsp")]
            CameraSource::Rtsp(source) => source.connect().map(CameraStream::Rtsp),
        }
    }

    fn describe(&self) -> String {
        match self {
            CameraSource::Http(source) => source.describe(),
            #[cfg(feature = "rtsp")]
            CameraSource::Rtsp(source) => source.describe(),
        }
    }
}

impl FrameStream for CameraStream {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        match self {
            CameraStream::Http(stream) => stream.read_frame(),
            #[cfg(feature = "rtsp")]
            CameraStream::Rtsp(stream) => stream.read_frame(),
        }
    }
}

// ─── HTTP snapshot source ───────────────────────────────────────────────────

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpSnapshotSource {
    url: String,
    credentials: Option<(String, String)>,
    interval: Duration,
}

impl HttpSnapshotSource {
    pub fn new(raw_url: &str, fps: u32) -> Self {
        let (url, credentials) = split_credentials(raw_url);
        Self {
            url,
            credentials,
            interval: Duration::from_millis(1000 / u64::from(fps.max(1))),
        }
    }
}

fn split_credentials(raw: &str) -> (String, Option<(String, String)>) {
    match Url::parse(raw) {
        Ok(mut url) if !url.username().is_empty() => {
            let user = url.username().to_string();
            let pass = url.password().unwrap_or_default().to_string();
            let _ = url.set_username("");
            let _ = url.set_password(None);
            (url.to_string(), Some((user, pass)))
        }
        _ => (raw.to_string(), None),
    }
}

impl FrameSource for HttpSnapshotSource {
    type Stream = HttpSnapshotStream;

    fn connect(&mut self) -> Result<HttpSnapshotStream, CameraError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(SNAPSHOT_TIMEOUT)
            .build()?;

        let mut stream = HttpSnapshotStream {
            client,
            url: self.url.clone(),
            credentials: self.credentials.clone(),
            interval: self.interval,
            last_fetch: None,
            pending: None,
        };

        // A first successful fetch is what "connected" means for a snapshot camera.
        let first = stream
            .fetch()
            .map_err(|e| CameraError::Open(format!("{}: {}", self.url, e)))?;
        info!(
            "Snapshot camera reachable at {} ({}x{})",
            self.url,
            first.width(),
            first.height()
        );
        stream.pending = Some(first);
        Ok(stream)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

pub struct HttpSnapshotStream {
    client: reqwest::blocking::Client,
    url: String,
    credentials: Option<(String, String)>,
    interval: Duration,
    last_fetch: Option<Instant>,
    pending: Option<Frame>,
}

impl HttpSnapshotStream {
    fn fetch(&mut self) -> Result<Frame, CameraError> {
        self.last_fetch = Some(Instant::now());

        let mut request = self.client.get(&self.url);
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }
        let resp = request.send()?;
        if !resp.status().is_success() {
            return Err(CameraError::Read(format!("HTTP {}", resp.status())));
        }
        let body = resp.bytes()?;
        if body.is_empty() {
            return Err(CameraError::Read("empty snapshot body".to_string()));
        }
        Ok(image::load_from_memory(&body)?.to_rgb8())
    }
}

impl FrameStream for HttpSnapshotStream {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        if let Some(last) = self.last_fetch {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        let frame = self.fetch()?;
        debug!("snapshot {}x{}", frame.width(), frame.height());
        Ok(frame)
    }
}

// ─── RTSP via OpenCV ────────────────────────────────────────────────────────

#[cfg(feature = "rtsp")]
pub use self::rtsp::{OpenCvSource, OpenCvStream};

#[cfg(feature = "rtsp")]
mod rtsp {
    use opencv::{
        core::Mat,
        imgproc,
        prelude::*,
        videoio::{
            VideoCapture, CAP_FFMPEG, CAP_PROP_BUFFERSIZE, CAP_PROP_FRAME_HEIGHT,
            CAP_PROP_FRAME_WIDTH,
        },
    };
    use tracing::info;

    use super::{redact_url, CaptureOptions, Frame, FrameSource, FrameStream};
    use crate::error::CameraError;

    /// RTSP stream opened through the FFmpeg backend.
    pub struct OpenCvSource {
        url: String,
        options: CaptureOptions,
    }

    impl OpenCvSource {
        pub fn new(url: &str, options: CaptureOptions) -> Self {
            Self {
                url: url.to_string(),
                options,
            }
        }
    }

    impl FrameSource for OpenCvSource {
        type Stream = OpenCvStream;

        fn connect(&mut self) -> Result<OpenCvStream, CameraError> {
            let mut cap = VideoCapture::from_file(&self.url, CAP_FFMPEG)?;
            if !cap.is_opened()? {
                return Err(CameraError::Open(redact_url(&self.url)));
            }

            cap.set(CAP_PROP_FRAME_WIDTH, f64::from(self.options.width))?;
            cap.set(CAP_PROP_FRAME_HEIGHT, f64::from(self.options.height))?;
            // Small buffer: we want fresh frames, not queued ones
            cap.set(CAP_PROP_BUFFERSIZE, f64::from(self.options.buffer_size))?;

            info!(
                "RTSP stream opened {} (requested {}x{})",
                redact_url(&self.url),
                self.options.width,
                self.options.height
            );
            Ok(OpenCvStream { cap })
        }

        fn describe(&self) -> String {
            redact_url(&self.url)
        }
    }

    pub struct OpenCvStream {
        cap: VideoCapture,
    }

    impl FrameStream for OpenCvStream {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            let mut mat = Mat::default();
            if !self.cap.read(&mut mat)? || mat.empty() {
                return Err(CameraError::Read(
                    "empty frame or read error, stream may have dropped".to_string(),
                ));
            }
            mat_to_frame(&mat)
        }
    }

    impl Drop for OpenCvStream {
        fn drop(&mut self) {
            let _ = self.cap.release();
        }
    }

    fn mat_to_frame(bgr: &Mat) -> Result<Frame, CameraError> {
        let mut rgb = Mat::default();
        imgproc::cvt_color_def(bgr, &mut rgb, imgproc::COLOR_BGR2RGB)?;
        let rgb = if rgb.is_continuous() { rgb } else { rgb.try_clone()? };

        let width = rgb.cols() as u32;
        let height = rgb.rows() as u32;
        let data = rgb.data_bytes()?.to_vec();
        Frame::from_raw(width, height, data)
            .ok_or_else(|| CameraError::Read("unexpected frame layout".to_string()))
    }
}
