//! entrywatch — camera entry monitoring.
//!
//! Pulls frames from an IP camera, samples every Nth frame for face
//! recognition, audits every classified face, raises cooldown-gated alerts
//! for unauthorized ones and serves the annotated stream over HTTP.

pub mod access_db;
pub mod alerts;
pub mod camera_capture;
pub mod camera_config;
pub mod camera_pipeline;
pub mod error;
pub mod face_classifier;
pub mod face_recognition;
pub mod frame_annotator;
pub mod frame_publisher;
pub mod logging;
pub mod stream_server;

pub use camera_config::AppConfig;
pub use camera_pipeline::{CaptureLoop, LoopReport, LoopSettings, Pipeline, PipelineHandle};
pub use frame_publisher::FramePublisher;
