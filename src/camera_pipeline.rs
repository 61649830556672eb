/// Camera Pipeline — capture loop and per-frame orchestration
///
/// ```text
/// FrameSource ──► FrameCounter ──(every Nth)──► Recognizer ──► FaceClassifier
///                      │                                           │
///                      │ raw frames until the first          AccessStore + AlertDispatcher
///                      ▼ annotated one exists                      │
///                FramePublisher ◄──────────── FrameAnnotator ◄─────┘
/// ```
///
/// The loop runs on a blocking worker thread. It never terminates on camera
/// errors: a failed connect or read leads to a fixed-delay reconnect. Only the
/// stop signal ends it.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::access_db::{AccessDatabase, AccessRecord, AccessStore};
use crate::alerts::{
    sink_from_config, AlertDispatcher, AlertGate, AlertMessage, AlertOutcome, AlertSink,
};
use crate::camera_capture::{
    encode_jpeg, open_source, redact_url, ConnectionState, Frame, FrameCounter, FrameSource,
    FrameStream,
};
use crate::camera_config::AppConfig;
use crate::error::{CameraError, PipelineError, RecognitionError};
use crate::face_classifier::{ClassifiedFace, FaceClassifier};
use crate::face_recognition::{CompreFaceClient, Recognizer};
use crate::frame_annotator::FrameAnnotator;
use crate::frame_publisher::FramePublisher;

const STOP_POLL_SLICE: Duration = Duration::from_millis(100);
const DEBUG_JPEG_QUALITY: u8 = 90;

// ─── Settings & report ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub camera_name: String,
    pub camera_location: String,
    pub frame_skip: u32,
    pub reconnect_delay: Duration,
    pub similarity_threshold: f64,
    /// Directory for raw frames with unauthorized faces; `None` disables saving.
    pub debug_image_dir: Option<PathBuf>,
}

impl LoopSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            camera_name: cfg.camera.name.clone(),
            camera_location: cfg.camera.location.clone(),
            frame_skip: cfg.camera.frame_skip,
            reconnect_delay: cfg.camera.reconnect_delay(),
            similarity_threshold: cfg.recognition.similarity_threshold,
            debug_image_dir: cfg
                .debug
                .save_images
                .then(|| cfg.debug.image_path.clone()),
        }
    }
}

/// Counters accumulated over one `run`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopReport {
    pub connects: u64,
    pub connect_failures: u64,
    pub read_failures: u64,
    pub frames_read: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub alerts_sent: u64,
}

// ─── Capture loop ───────────────────────────────────────────────────────────

pub struct CaptureLoop<S, R, A, K> {
    settings: LoopSettings,
    source: S,
    recognizer: R,
    store: A,
    dispatcher: AlertDispatcher<K>,
    classifier: FaceClassifier,
    annotator: FrameAnnotator,
    publisher: FramePublisher,
    counter: FrameCounter,
    state: ConnectionState,
    report: LoopReport,
}

impl<S, R, A, K> CaptureLoop<S, R, A, K>
where
    S: FrameSource,
    R: Recognizer,
    A: AccessStore,
    K: AlertSink,
{
    pub fn new(
        settings: LoopSettings,
        source: S,
        recognizer: R,
        store: A,
        dispatcher: AlertDispatcher<K>,
        annotator: FrameAnnotator,
        publisher: FramePublisher,
    ) -> Self {
        Self {
            classifier: FaceClassifier::new(settings.similarity_threshold),
            counter: FrameCounter::new(settings.frame_skip),
            settings,
            source,
            recognizer,
            store,
            dispatcher,
            annotator,
            publisher,
            state: ConnectionState::Disconnected,
            report: LoopReport::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn report(&self) -> LoopReport {
        self.report
    }

    pub fn store(&self) -> &A {
        &self.store
    }

    pub fn into_store(self) -> A {
        self.store
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("{}: {} -> {}", self.settings.camera_name, self.state, next);
            self.state = next;
        }
    }

    /// Run until `stop` flips to true. Camera failures never end the loop.
    pub fn run(&mut self, stop: watch::Receiver<bool>) -> LoopReport {
        info!("Starting camera pipeline");
        info!("Camera: {}", self.settings.camera_name);
        info!("Location: {}", self.settings.camera_location);
        info!("Processing every {} frames", self.settings.frame_skip);

        while !stopped(&stop) {
            self.set_state(ConnectionState::Connecting);
            info!("Connecting to camera: {}", redact_url(&self.source.describe()));

            let mut stream = match self.source.connect() {
                Ok(stream) => {
                    self.report.connects += 1;
                    self.set_state(ConnectionState::Streaming);
                    info!("Successfully connected to camera");
                    stream
                }
                Err(e) => {
                    self.report.connect_failures += 1;
                    self.set_state(ConnectionState::Failed);
                    error!("Failed to connect to camera: {}", e);
                    error!(
                        "Retrying connection in {}s...",
                        self.settings.reconnect_delay.as_secs_f32()
                    );
                    if !sleep_unless_stopped(self.settings.reconnect_delay, &stop) {
                        break;
                    }
                    self.set_state(ConnectionState::Disconnected);
                    continue;
                }
            };

            let read_error = self.stream_frames(&mut stream, &stop);
            // Release the handle before waiting to reconnect.
            drop(stream);
            self.set_state(ConnectionState::Disconnected);

            match read_error {
                Some(e) => {
                    self.report.read_failures += 1;
                    error!("Failed to read frame: {}", e);
                    if !sleep_unless_stopped(self.settings.reconnect_delay, &stop) {
                        break;
                    }
                }
                None => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Camera pipeline stopped: {:?}", self.report);
        self.report
    }

    /// Pull frames until a read fails (returned) or stop is requested (`None`).
    fn stream_frames(
        &mut self,
        stream: &mut S::Stream,
        stop: &watch::Receiver<bool>,
    ) -> Option<CameraError> {
        while !stopped(stop) {
            match stream.read_frame() {
                Ok(frame) => self.on_frame(frame),
                Err(e) => return Some(e),
            }
        }
        None
    }

    fn on_frame(&mut self, frame: Frame) {
        self.report.frames_read += 1;
        let admission = self.counter.admit();
        self.publisher.count_frame(admission.number);

        if admission.process {
            info!("Processing frame #{}", admission.number);
            self.report.frames_processed += 1;
            match self.process_frame(&frame) {
                Ok(annotated) => self.publish(&annotated, admission.number, true),
                Err(e) => {
                    self.report.frames_dropped += 1;
                    error!("Recognition failed, dropping frame #{}: {}", admission.number, e);
                }
            }
        } else if !self.publisher.has_annotated() {
            self.publish(&frame, admission.number, false);
        }
    }

    fn publish(&self, frame: &Frame, number: u64, annotated: bool) {
        if let Err(e) = self.publisher.publish(frame, number, annotated) {
            warn!("Failed to publish frame #{}: {}", number, e);
        }
    }

    /// Recognize, classify, audit, alert and annotate one sampled frame.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<Frame, RecognitionError> {
        let detections = self.recognizer.recognize(frame)?;
        let faces = self.classifier.classify(detections);
        if faces.is_empty() {
            return Ok(frame.clone());
        }
        info!(
            "{} authorized, {} unauthorized face(s)",
            faces.authorized.len(),
            faces.unauthorized.len()
        );

        for face in &faces.authorized {
            let record = self.access_record(face, None);
            if let Err(e) = self.store.record(&record) {
                error!("Failed to log access: {}", e);
            }
        }

        let unauthorized_count = faces.unauthorized.len();
        for face in &faces.unauthorized {
            let image_path = self.save_debug_image(frame);
            let record = self.access_record(face, image_path);
            let record_id = match self.store.record(&record) {
                Ok(id) => Some(id),
                Err(e) => {
                    error!("Failed to log access: {}", e);
                    None
                }
            };

            let message = AlertMessage::unauthorized(
                &self.settings.camera_name,
                &self.settings.camera_location,
                face.subject.as_deref(),
                face.similarity,
                unauthorized_count,
            );
            if self.dispatcher.dispatch(&message, Instant::now()) == AlertOutcome::Sent {
                self.report.alerts_sent += 1;
                if let Some(id) = record_id {
                    if let Err(e) = self.store.mark_alert_sent(id) {
                        error!("Failed to update alert status: {}", e);
                    }
                }
            }
        }

        Ok(self.annotator.annotate(frame, &faces))
    }

    fn access_record(&self, face: &ClassifiedFace, image_path: Option<String>) -> AccessRecord {
        let mut record = AccessRecord::new(
            &self.settings.camera_name,
            &self.settings.camera_location,
            face.classification.is_authorized(),
        );
        record.subject_name = face.subject.clone();
        record.similarity = face.similarity;
        record.face_box = Some(face.face_box);
        record.image_path = image_path;
        record.metadata = face.metadata();
        record
    }

    fn save_debug_image(&self, frame: &Frame) -> Option<String> {
        let dir = self.settings.debug_image_dir.as_ref()?;
        let path = dir.join(format!(
            "unauthorized_{}.jpg",
            Local::now().format("%Y%m%d_%H%M%S")
        ));

        let written = std::fs::create_dir_all(dir)
            .map_err(|e| e.to_string())
            .and_then(|_| encode_jpeg(frame, DEBUG_JPEG_QUALITY).map_err(|e| e.to_string()))
            .and_then(|jpeg| std::fs::write(&path, jpeg).map_err(|e| e.to_string()));

        match written {
            Ok(()) => Some(path.to_string_lossy().to_string()),
            Err(e) => {
                warn!("Failed to save debug image {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Sleep for `delay` in short slices; false if stop was requested meanwhile.
fn sleep_unless_stopped(delay: Duration, stop: &watch::Receiver<bool>) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if stopped(stop) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(STOP_POLL_SLICE));
    }
}

// ─── Pipeline handle ────────────────────────────────────────────────────────

/// A running capture loop that can be stopped and joined.
pub struct PipelineHandle {
    pub camera_name: String,
    pub started_at: DateTime<Utc>,
    stop_tx: watch::Sender<bool>,
    worker: JoinHandle<LoopReport>,
}

impl PipelineHandle {
    /// Signal the loop to stop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Resolves when the worker ends, whether stopped, panicked or otherwise.
    /// Cancel safe, so it can sit in a `select!` next to a shutdown signal.
    /// Once this has resolved, do not call `join`.
    pub async fn wait(&mut self) -> Result<LoopReport, JoinError> {
        (&mut self.worker).await
    }

    /// Wait for the worker to release the camera and close the database.
    pub async fn join(self) -> Result<LoopReport, JoinError> {
        self.worker.await
    }
}

pub struct Pipeline {
    cfg: AppConfig,
}

impl Pipeline {
    pub fn new(cfg: AppConfig) -> Self {
        Self { cfg }
    }

    /// Open the camera source, build the recognition client and alert sink
    /// on a blocking worker, then start the capture loop there. Returns only
    /// once the worker is ready; any init failure comes back as an error and
    /// the database is closed.
    pub async fn start(
        self,
        db: AccessDatabase,
        publisher: FramePublisher,
    ) -> Result<PipelineHandle, PipelineError> {
        let cfg = self.cfg;
        let source = open_source(&cfg.camera)?;
        let settings = LoopSettings::from_config(&cfg);
        let gate = AlertGate::from_config(&cfg.alerts);
        let annotator = FrameAnnotator::from_config(&cfg.annotation);

        // Blocking HTTP clients are built on the worker thread, not the runtime.
        launch(settings, source, db, publisher, gate, annotator, move || {
            let recognizer = CompreFaceClient::new(&cfg.recognition)?;
            let sink = sink_from_config(&cfg.alerts)?;
            Ok((recognizer, sink))
        })
        .await
    }
}

async fn launch<S, R, K, B>(
    settings: LoopSettings,
    source: S,
    db: AccessDatabase,
    publisher: FramePublisher,
    gate: AlertGate,
    annotator: FrameAnnotator,
    build: B,
) -> Result<PipelineHandle, PipelineError>
where
    S: FrameSource + Send + 'static,
    R: Recognizer,
    K: AlertSink,
    B: FnOnce() -> Result<(R, K), PipelineError> + Send + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), PipelineError>>();
    let camera_name = settings.camera_name.clone();

    let worker = tokio::task::spawn_blocking(move || {
        let (recognizer, sink) = match build() {
            Ok(parts) => parts,
            Err(e) => {
                close_db(db);
                let _ = ready_tx.send(Err(e));
                return LoopReport::default();
            }
        };
        let _ = ready_tx.send(Ok(()));

        let mut capture = CaptureLoop::new(
            settings,
            source,
            recognizer,
            db,
            AlertDispatcher::new(gate, sink),
            annotator,
            publisher,
        );
        let report = capture.run(stop_rx);
        close_db(capture.into_store());
        report
    });

    match ready_rx.await {
        Ok(Ok(())) => Ok(PipelineHandle {
            camera_name,
            started_at: Utc::now(),
            stop_tx,
            worker,
        }),
        Ok(Err(e)) => {
            let _ = worker.await;
            Err(e)
        }
        // Sender dropped without a word: the build step panicked.
        Err(_) => Err(match worker.await {
            Err(join) => PipelineError::Worker(join),
            Ok(_) => PipelineError::WorkerGone,
        }),
    }
}

fn close_db(db: AccessDatabase) {
    if let Err(e) = db.close() {
        error!("Failed to close audit database: {}", e);
    }
}
