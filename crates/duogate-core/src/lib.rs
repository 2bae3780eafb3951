//! duogate-core: domain model for two-factor (badge + face) access control.
//!
//! Holds the person/template types, the clock abstraction used for validity
//! windows, and the collaborator traits the verification pipeline calls into:
//! barcode decoding, face embedding and person lookup.

pub mod clock;
pub mod decoder;
pub mod embedder;
pub mod template;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decoder::{first_code, BarcodeDecoder, DecodeError, QrDecoder};
pub use embedder::{CommandEmbedder, EmbedError, FaceEmbedder};
pub use template::{BiometricTemplate, TemplateError};
pub use types::{
    largest_face, BoundingBox, FaceDetection, LookupError, Person, PersonLookup, SessionPhase,
    StatusSnapshot,
};
