use crate::template::BiometricTemplate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bounding box of a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// One face reported by a [`FaceEmbedder`](crate::FaceEmbedder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    /// Raw (not necessarily normalized) embedding vector.
    pub vector: Vec<f32>,
}

/// Pick the face with the largest bounding box; the person standing at the
/// scanner is the one closest to the camera.
pub fn largest_face(faces: &[FaceDetection]) -> Option<&FaceDetection> {
    faces.iter().max_by(|a, b| {
        a.bbox
            .area()
            .partial_cmp(&b.bbox.area())
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// A person known to the access system.
#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    /// Badge / barcode identifier.
    pub badge: String,
    pub first_name: String,
    pub last_name: String,
    /// `None` means the person can never pass the face factor.
    pub template: Option<BiometricTemplate>,
}

impl Person {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("person store unavailable: {0}")]
    Unavailable(String),
    #[error("person store query failed: {0}")]
    Query(String),
}

/// Resolves a scanned badge to a person record.
///
/// Implementations must only return templates that are already parsed and
/// normalized; anything unparsable is reported as a person without a
/// template so the caller fails closed.
pub trait PersonLookup: Send + Sync {
    fn find_person_by_badge(&self, badge: &str) -> Result<Option<Person>, LookupError>;
}

/// Where a scan session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    AwaitingBadge,
    FaceMatching,
    Authorized,
    Denied,
    TimedOut,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Authorized | Self::Denied | Self::TimedOut)
    }
}

/// The externally visible view of a session, pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub phase: SessionPhase,
    pub authorized: bool,
    /// Display name of the authorized person, set only once both factors passed.
    pub user: Option<String>,
    pub face_verified: bool,
    pub barcode_verified: bool,
    pub current_name: String,
    pub badge_timeout_exceeded: bool,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            running: false,
            phase: SessionPhase::Idle,
            authorized: false,
            user: None,
            face_verified: false,
            barcode_verified: false,
            current_name: "Idle".to_string(),
            badge_timeout_exceeded: false,
        }
    }
}
