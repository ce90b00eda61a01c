//! rollcall-core: face-based classroom attendance engine.
//!
//! SCRFD detection and ArcFace recognition run via ONNX Runtime; the
//! resulting embeddings are matched against registered students and
//! reconciled into per-session presence records.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod index;
pub mod reconciler;
pub mod recognizer;
pub mod registration;
pub mod store;
pub mod types;

pub use detector::FaceDetector;
pub use extractor::{EmbeddingExtractor, EngineState, ExtractError, FaceEngine, ModelPaths};
pub use index::{IndexError, SimilarityIndex, StoreIndex, DEFAULT_SIMILARITY_THRESHOLD};
pub use reconciler::{AttendanceReconciler, ReconcileError};
pub use recognizer::FaceRecognizer;
pub use registration::{RegistrationError, StudentRegistrar};
pub use store::{EmbeddingStore, SessionStore, StoreError, StudentRegistry};
pub use types::{
    AttendanceOutcome, AttendanceSession, AuditEntry, BoundingBox, Candidate, CosineMatcher,
    Embedding, GalleryEntry, MatchResult, Matcher, OutcomeStatus, PresenceRecord, SessionReport,
    Student, StudentIdentity, StudentUpdate,
};

use std::path::PathBuf;

/// Default directory for the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/rollcall/models")
}
