//! Contracts for the persistence collaborators the core depends on.
//!
//! None of these are assumed transactional with one another: a session can
//! exist while a later presence write for it fails.

use crate::types::{
    AttendanceSession, AuditEntry, Candidate, Embedding, SessionReport, Student, StudentIdentity,
    StudentUpdate,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("could not create attendance session: {0}")]
    SessionCreateFailed(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Sessions, presence records and the audit log.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, teacher_id: &str, subject: &str) -> Result<AttendanceSession, StoreError>;

    /// Not idempotent: callers must not repeat a (session, student) pair.
    async fn record_presence(&self, session_id: &str, student_id: &str) -> Result<(), StoreError>;

    async fn append_audit_log(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    async fn session_report(&self, session_id: &str) -> Result<SessionReport, StoreError>;
}

/// Nearest-neighbour search over registered face embeddings.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Up to `limit` students scoring at or above `threshold`, best first.
    async fn lookup_closest_embedding(
        &self,
        embedding: &Embedding,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<Candidate>, StoreError>;
}

/// The student roster.
#[async_trait]
pub trait StudentRegistry: Send + Sync {
    async fn register_student(
        &self,
        name: &str,
        roll_number: &str,
        embedding: &Embedding,
    ) -> Result<StudentIdentity, StoreError>;

    /// All students ordered by name.
    async fn list_students(&self) -> Result<Vec<Student>, StoreError>;

    async fn update_student(&self, id: &str, update: &StudentUpdate) -> Result<Student, StoreError>;

    /// Removes the student and every embedding registered for them.
    async fn remove_student(&self, id: &str) -> Result<(), StoreError>;
}
