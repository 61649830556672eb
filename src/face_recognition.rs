//! face_recognition.rs — CompreFace recognition client.
//! Sends a JPEG-encoded frame to the recognition service and returns the raw
//! per-face results. Failures come back as `RecognitionError`; the caller
//! decides to drop the frame.

use std::cmp::Ordering;
use std::time::Duration;

use reqwest::blocking::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::camera_capture::{encode_jpeg, Frame};
use crate::camera_config::RecognitionConfig;
use crate::error::RecognitionError;

const UPLOAD_JPEG_QUALITY: u8 = 95;
const MAX_ERROR_BODY_CHARS: usize = 300;

// ── Wire types ───────────────────────────────────────

/// Face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl FaceBox {
    pub fn new(x_min: i32, y_min: i32, x_max: i32, y_max: i32) -> Self {
        Self {
            probability: None,
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    pub fn width(&self) -> i32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> i32 {
        self.y_max - self.y_min
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectMatch {
    pub subject: String,
    #[serde(default)]
    pub similarity: f64,
}

/// One face as returned by the backend, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(rename = "box")]
    pub face_box: FaceBox,
    /// Candidate identities, best match first.
    #[serde(default)]
    pub subjects: Vec<SubjectMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    result: Vec<RawDetection>,
}

impl RecognizeResponse {
    fn into_detections(self) -> Vec<RawDetection> {
        let mut detections = self.result;
        for det in &mut detections {
            det.subjects.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(Ordering::Equal)
            });
        }
        detections
    }
}

/// Parse a recognize response body.
pub fn parse_recognize_response(body: &str) -> Result<Vec<RawDetection>, RecognitionError> {
    let resp: RecognizeResponse =
        serde_json::from_str(body).map_err(|e| RecognitionError::Decode(e.to_string()))?;
    Ok(resp.into_detections())
}

// ── Client ───────────────────────────────────────────

/// Anything that turns a frame into raw face detections.
pub trait Recognizer {
    fn recognize(&self, frame: &Frame) -> Result<Vec<RawDetection>, RecognitionError>;
}

pub struct CompreFaceClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    limit: u32,
    det_prob_threshold: f64,
    face_plugins: String,
}

impl CompreFaceClient {
    pub fn new(cfg: &RecognitionConfig) -> Result<Self, RecognitionError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: cfg.recognize_endpoint(),
            api_key: cfg.api_key.clone(),
            limit: cfg.max_faces,
            det_prob_threshold: cfg.det_prob_threshold,
            face_plugins: cfg.face_plugins.trim().to_string(),
        })
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("limit", self.limit.to_string()),
            ("det_prob_threshold", self.det_prob_threshold.to_string()),
            ("prediction_count", "1".to_string()),
            ("status", "true".to_string()),
        ];
        if !self.face_plugins.is_empty() {
            params.push(("face_plugins", self.face_plugins.clone()));
        }
        params
    }
}

impl Recognizer for CompreFaceClient {
    fn recognize(&self, frame: &Frame) -> Result<Vec<RawDetection>, RecognitionError> {
        let jpeg = encode_jpeg(frame, UPLOAD_JPEG_QUALITY)?;
        debug!("Recognition payload prepared ({} bytes)", jpeg.len());

        let part = Part::bytes(jpeg)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")?;
        let form = Form::new().part("file", part);

        let resp = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .query(&self.query())
            .multipart(form)
            .send()?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(RecognitionError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let body = resp.text()?;
        let detections = parse_recognize_response(&body)?;
        info!("Detected {} face(s) in frame", detections.len());
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "result": [
            {
                "box": {"probability": 0.99, "x_min": 10, "y_min": 20, "x_max": 110, "y_max": 140},
                "subjects": [
                    {"subject": "bob", "similarity": 0.41},
                    {"subject": "alice", "similarity": 0.93}
                ],
                "age": {"probability": 0.8, "high": 32, "low": 25},
                "gender": {"probability": 0.9, "value": "female"},
                "execution_time": {"detector": 12.0}
            },
            {
                "box": {"x_min": 200, "y_min": 40, "x_max": 260, "y_max": 120}
            }
        ],
        "plugins_versions": {"detector": "facenet.FaceDetector"}
    }"#;

    #[test]
    fn test_parse_recognize_response() {
        let detections = parse_recognize_response(SAMPLE).unwrap();
        assert_eq!(detections.len(), 2);

        let first = &detections[0];
        assert_eq!(first.face_box.x_min, 10);
        assert_eq!(first.face_box.height(), 120);
        // best candidate first, regardless of wire order
        assert_eq!(first.subjects[0].subject, "alice");
        assert_eq!(first.gender.as_ref().unwrap()["value"], "female");

        let second = &detections[1];
        assert!(second.subjects.is_empty());
        assert!(second.age.is_none());
    }

    #[test]
    fn test_parse_missing_result_is_empty() {
        assert!(parse_recognize_response("{}").unwrap().is_empty());
    }

    #[test]
    fn test_parse_garbage_is_decode_error() {
        let err = parse_recognize_response("<html>").unwrap_err();
        assert!(matches!(err, RecognitionError::Decode(_)));
    }

    #[test]
    fn test_query_params() {
        let mut cfg = RecognitionConfig::default();
        cfg.api_key = "k".into();
        cfg.max_faces = 4;
        let client = CompreFaceClient::new(&cfg).unwrap();
        let query = client.query();
        assert!(query.contains(&("limit", "4".to_string())));
        assert!(query.contains(&("prediction_count", "1".to_string())));
        assert!(query.contains(&("face_plugins", "age,gender".to_string())));

        cfg.face_plugins = String::new();
        let client = CompreFaceClient::new(&cfg).unwrap();
        assert!(!client.query().iter().any(|(k, _)| *k == "face_plugins"));
    }
}
