/// Face Classifier — authorized / unauthorized split
///
/// A face is authorized only when its best candidate identity reaches the
/// similarity threshold. A matched-but-weak identity stays attached to the
/// unauthorized face so the audit trail shows who it resembled.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::face_recognition::{FaceBox, RawDetection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnauthorizedReason {
    LowSimilarity,
    UnknownIdentity,
}

impl UnauthorizedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnauthorizedReason::LowSimilarity => "low_similarity",
            UnauthorizedReason::UnknownIdentity => "unknown_identity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Authorized,
    Unauthorized(UnauthorizedReason),
}

impl Classification {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Classification::Authorized)
    }
}

/// A detection after the threshold decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedFace {
    pub face_box: FaceBox,
    pub subject: Option<String>,
    pub similarity: Option<f64>,
    pub age: Option<Value>,
    pub gender: Option<Value>,
    pub classification: Classification,
}

impl ClassifiedFace {
    /// Free-form audit metadata: attributes for authorized faces, the reason otherwise.
    pub fn metadata(&self) -> Value {
        match self.classification {
            Classification::Authorized => json!({
                "age": self.age,
                "gender": self.gender,
            }),
            Classification::Unauthorized(reason) => json!({ "reason": reason.as_str() }),
        }
    }
}

/// Classified faces of one frame, input order preserved within each list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifiedFrame {
    pub authorized: Vec<ClassifiedFace>,
    pub unauthorized: Vec<ClassifiedFace>,
}

impl ClassifiedFrame {
    pub fn is_empty(&self) -> bool {
        self.authorized.is_empty() && self.unauthorized.is_empty()
    }

    pub fn len(&self) -> usize {
        self.authorized.len() + self.unauthorized.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FaceClassifier {
    similarity_threshold: f64,
}

impl FaceClassifier {
    pub fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
        }
    }

    pub fn classify_one(&self, det: RawDetection) -> ClassifiedFace {
        let RawDetection {
            face_box,
            subjects,
            age,
            gender,
        } = det;

        match subjects.into_iter().next() {
            Some(top) => {
                let classification = if top.similarity >= self.similarity_threshold {
                    info!("Authorized: {} ({:.2}%)", top.subject, top.similarity * 100.0);
                    Classification::Authorized
                } else {
                    warn!("Low similarity: {} ({:.2}%)", top.subject, top.similarity * 100.0);
                    Classification::Unauthorized(UnauthorizedReason::LowSimilarity)
                };
                ClassifiedFace {
                    face_box,
                    subject: Some(top.subject),
                    similarity: Some(top.similarity),
                    age,
                    gender,
                    classification,
                }
            }
            None => {
                warn!("Unknown person detected");
                ClassifiedFace {
                    face_box,
                    subject: None,
                    similarity: None,
                    age,
                    gender,
                    classification: Classification::Unauthorized(
                        UnauthorizedReason::UnknownIdentity,
                    ),
                }
            }
        }
    }

    pub fn classify(&self, detections: Vec<RawDetection>) -> ClassifiedFrame {
        let mut out = ClassifiedFrame::default();
        for det in detections {
            let face = self.classify_one(det);
            if face.classification.is_authorized() {
                out.authorized.push(face);
            } else {
                out.unauthorized.push(face);
            }
        }
        out
    }
}
