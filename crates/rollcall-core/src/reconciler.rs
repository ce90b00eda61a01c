//! Attendance reconciliation: classroom embeddings → one presence set.
//!
//! A marking pass creates the session first, so there is always something
//! to audit, then matches every face independently and folds the results
//! into the session with at most one presence record per student.

use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::index::{IndexError, SimilarityIndex};
use crate::store::{SessionStore, StoreError};
use crate::types::{AttendanceOutcome, AttendanceSession, AuditEntry, Embedding, OutcomeStatus};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("{0}")]
    SessionCreate(StoreError),
    #[error("session {session_id}: {source}")]
    Extraction {
        session_id: String,
        #[source]
        source: ExtractError,
    },
}

impl ReconcileError {
    /// True when the upload itself was bad (corrupt image).
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::SessionCreate(_) => false,
            Self::Extraction { source, .. } => source.is_client_error(),
        }
    }

    /// Short machine-readable kind for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreate(_) => "session_create_failed",
            Self::Extraction { source: ExtractError::Decode(_), .. } => "image_decode",
            Self::Extraction { .. } => "extraction_failed",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreate(_) => None,
            Self::Extraction { session_id, .. } => Some(session_id),
        }
    }
}

/// Running state of one pass over a batch of faces.
#[derive(Debug, Default)]
struct Tally {
    marked: HashSet<String>,
    present_students: Vec<String>,
    present_names: Vec<String>,
    unknown_faces: usize,
    degraded: bool,
}

pub struct AttendanceReconciler {
    extractor: Arc<dyn EmbeddingExtractor>,
    index: Arc<dyn SimilarityIndex>,
    store: Arc<dyn SessionStore>,
    threshold: f32,
}

impl AttendanceReconciler {
    pub fn new(
        extractor: Arc<dyn EmbeddingExtractor>,
        index: Arc<dyn SimilarityIndex>,
        store: Arc<dyn SessionStore>,
        threshold: f32,
    ) -> Self {
        Self {
            extractor,
            index,
            store,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Full marking pass for one classroom photo.
    pub async fn mark_attendance(
        &self,
        teacher_id: &str,
        subject: &str,
        image: Vec<u8>,
    ) -> Result<AttendanceOutcome, ReconcileError> {
        let session = self
            .store
            .create_session(teacher_id, subject)
            .await
            .map_err(ReconcileError::SessionCreate)?;
        tracing::info!(session_id = %session.id, teacher_id, subject, "attendance session created");

        let embeddings = match self.extractor.extract_many(image).await {
            Ok(embeddings) => embeddings,
            Err(source) => {
                tracing::error!(
                    session_id = %session.id,
                    teacher_id,
                    error = %source,
                    "face extraction failed"
                );
                self.audit(&session, OutcomeStatus::Failed, &[]).await;
                return Err(ReconcileError::Extraction {
                    session_id: session.id,
                    source,
                });
            }
        };

        Ok(self.reconcile(&session, &embeddings).await)
    }

    /// Match every embedding and record each distinct student once.
    ///
    /// Never fails: lookup and write errors degrade the outcome instead.
    pub async fn reconcile(&self, session: &AttendanceSession, embeddings: &[Embedding]) -> AttendanceOutcome {
        // Lookups are independent; only the fold below touches the session.
        let lookups = join_all(
            embeddings
                .iter()
                .map(|embedding| self.index.find_closest(embedding, self.threshold)),
        )
        .await;

        let mut tally = Tally::default();
        for (face, lookup) in lookups.into_iter().enumerate() {
            let student = match lookup {
                Ok(result) => match result.student {
                    Some(student) if result.matched => student,
                    _ => {
                        tally.unknown_faces += 1;
                        continue;
                    }
                },
                Err(IndexError::Unavailable(reason)) => {
                    tracing::warn!(session_id = %session.id, face, %reason, "similarity lookup failed; counting face as unknown");
                    tally.unknown_faces += 1;
                    tally.degraded = true;
                    continue;
                }
            };

            if tally.marked.contains(&student.id) {
                tracing::debug!(session_id = %session.id, student_id = %student.id, face, "duplicate detection collapsed");
                continue;
            }

            match self.store.record_presence(&session.id, &student.id).await {
                Ok(()) => {
                    tally.marked.insert(student.id.clone());
                    tally.present_students.push(student.id);
                    tally.present_names.push(student.name);
                }
                Err(e) => {
                    // Left unmarked so a later sighting in this batch retries.
                    tracing::error!(session_id = %session.id, student_id = %student.id, error = %e, "presence write failed");
                    tally.degraded = true;
                }
            }
        }

        let status = if tally.degraded {
            OutcomeStatus::Degraded
        } else {
            OutcomeStatus::Completed
        };
        self.audit(session, status, &tally.present_names).await;

        tracing::info!(
            session_id = %session.id,
            faces = embeddings.len(),
            present = tally.present_students.len(),
            unknown = tally.unknown_faces,
            %status,
            "attendance reconciled"
        );

        AttendanceOutcome {
            session_id: session.id.clone(),
            present_students: tally.present_students,
            present_names: tally.present_names,
            unknown_faces: tally.unknown_faces,
            status,
        }
    }

    /// Best-effort audit line; a lost entry is logged, never propagated.
    async fn audit(&self, session: &AttendanceSession, status: OutcomeStatus, names: &[String]) {
        let entry = AuditEntry {
            session_id: session.id.clone(),
            teacher_id: session.teacher_id.clone(),
            status,
            present_count: names.len(),
            student_names: names.join(", "),
        };
        if let Err(e) = self.store.append_audit_log(&entry).await {
            tracing::warn!(session_id = %session.id, teacher_id = %session.teacher_id, error = %e, "audit log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::GalleryIndex;
    use crate::types::{GalleryEntry, MatchResult, PresenceRecord, SessionReport, StudentIdentity};
    use async_trait::async_trait;
    use std::sync::Mutex;

    // --- fakes ---

    /// Returns a fixed batch of embeddings, or a decode failure.
    struct FixedExtractor(Option<Vec<Embedding>>);

    #[async_trait]
    impl EmbeddingExtractor for FixedExtractor {
        async fn extract_many(&self, _image: Vec<u8>) -> Result<Vec<Embedding>, ExtractError> {
            self.0.clone().ok_or_else(|| ExtractError::Decode("bad png".into()))
        }

        async fn extract_single(&self, _image: Vec<u8>) -> Result<Embedding, ExtractError> {
            unreachable!("marking never asks for a single face")
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        fail_create: bool,
        fail_audit: bool,
        /// Presence writes fail for these student ids, once each.
        flaky_students: Mutex<Vec<String>>,
        records: Mutex<Vec<PresenceRecord>>,
        audit: Mutex<Vec<AuditEntry>>,
    }

    #[async_trait]
    impl SessionStore for MemoryStore {
        async fn create_session(&self, teacher_id: &str, subject: &str) -> Result<AttendanceSession, StoreError> {
            if self.fail_create {
                return Err(StoreError::SessionCreateFailed("insert rejected".into()));
            }
            Ok(AttendanceSession {
                id: "session-1".into(),
                teacher_id: teacher_id.into(),
                subject: subject.into(),
                created_at: "2026-10-16T09:00:00Z".into(),
            })
        }

        async fn record_presence(&self, session_id: &str, student_id: &str) -> Result<(), StoreError> {
            let mut flaky = self.flaky_students.lock().unwrap();
            if let Some(pos) = flaky.iter().position(|s| s == student_id) {
                flaky.remove(pos);
                return Err(StoreError::Unavailable("write timed out".into()));
            }
            self.records.lock().unwrap().push(PresenceRecord {
                session_id: session_id.into(),
                student_id: student_id.into(),
                status: PresenceRecord::PRESENT.into(),
            });
            Ok(())
        }

        async fn append_audit_log(&self, entry: &AuditEntry) -> Result<(), StoreError> {
            if self.fail_audit {
                return Err(StoreError::Unavailable("log table locked".into()));
            }
            self.audit.lock().unwrap().push(entry.clone());
            Ok(())
        }

        async fn session_report(&self, _session_id: &str) -> Result<SessionReport, StoreError> {
            unreachable!()
        }
    }

    struct DownIndex;

    #[async_trait]
    impl SimilarityIndex for DownIndex {
        async fn find_closest(&self, _e: &Embedding, _t: f32) -> Result<MatchResult, IndexError> {
            Err(IndexError::Unavailable("connection refused".into()))
        }
    }

    // --- fixtures ---

    fn axis(i: usize) -> Embedding {
        let mut values = vec![0.0; 4];
        values[i] = 1.0;
        Embedding::new(values)
    }

    /// Students "ada" (axis 0) and "bob" (axis 1). Axes 2 and 3 match nobody.
    fn roster() -> Arc<GalleryIndex> {
        let entry = |id: &str, name: &str, i| GalleryEntry {
            student: StudentIdentity { id: id.into(), name: name.into() },
            embedding: axis(i),
        };
        Arc::new(GalleryIndex::new(vec![entry("ada", "Ada", 0), entry("bob", "Bob", 1)]))
    }

    fn reconciler(
        faces: Option<Vec<Embedding>>,
        index: Arc<dyn SimilarityIndex>,
        store: Arc<MemoryStore>,
    ) -> AttendanceReconciler {
        AttendanceReconciler::new(Arc::new(FixedExtractor(faces)), index, store, 0.5)
    }

    // --- tests ---

    #[tokio::test]
    async fn test_empty_photo_completes() {
        let store = Arc::new(MemoryStore::default());
        let outcome = reconciler(Some(vec![]), roster(), store.clone())
            .mark_attendance("t1", "math", vec![1])
            .await
            .unwrap();

        assert_eq!(outcome.session_id, "session-1");
        assert!(outcome.present_students.is_empty());
        assert_eq!(outcome.unknown_faces, 0);
        assert_eq!(outcome.status, OutcomeStatus::Completed);

        let audit = store.audit.lock().unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, OutcomeStatus::Completed);
        assert_eq!(audit[0].present_count, 0);
    }

    #[tokio::test]
    async fn test_all_unknown() {
        let store = Arc::new(MemoryStore::default());
        let faces = vec![axis(2), axis(3), axis(2)];
        let outcome = reconciler(Some(faces), roster(), store.clone())
            .mark_attendance("t1", "math", vec![1])
            .await
            .unwrap();

        assert!(outcome.present_students.is_empty());
        assert_eq!(outcome.unknown_faces, 3);
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert!(store.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mixed_batch() {
        let store = Arc::new(MemoryStore::default());
        let faces = vec![axis(1), axis(3), axis(0)];
        let outcome = reconciler(Some(faces), roster(), store.clone())
            .mark_attendance("t1", "math", vec![1])
            .await
            .unwrap();

        assert_eq!(outcome.present_students, vec!["bob", "ada"]);
        assert_eq!(outcome.present_names, vec!["Bob", "Ada"]);
        assert_eq!(outcome.unknown_faces, 1);
        assert_eq!(store.audit.lock().unwrap()[0].student_names, "Bob, Ada");
    }

    #[tokio::test]
    async fn test_duplicate_detection_collapses() {
        let store = Arc::new(MemoryStore::default());
        let faces = vec![axis(0), axis(0), axis(1), axis(0)];
        let outcome = reconciler(Some(faces), roster(), store.clone())
            .mark_attendance("t1", "math", vec![1])
            .await
            .unwrap();

        assert_eq!(outcome.present_students, vec!["ada", "bob"]);
        assert_eq!(outcome.unknown_faces, 0);
        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records.iter().filter(|r| r.student_id == "ada").count(), 1);
    }

    #[tokio::test]
    async fn test_index_outage_degrades() {
        let store = Arc::new(MemoryStore::default());
        let faces = vec![axis(0), axis(1), axis(2)];
        let outcome = reconciler(Some(faces), Arc::new(DownIndex), store.clone())
            .mark_attendance("t1", "math", vec![1])
            .await
            .unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Degraded);
        assert_eq!(outcome.unknown_faces, 3);
        assert!(outcome.present_students.is_empty());
        assert_eq!(store.audit.lock().unwrap()[0].status, OutcomeStatus::Degraded);
    }

    #[tokio::test]
    async fn test_session_create_failure_is_fatal() {
        let store = Arc::new(MemoryStore { fail_create: true, ..Default::default() });
        let err = reconciler(Some(vec![axis(0)]), roster(), store.clone())
            .mark_attendance("t1", "math", vec![1])
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::SessionCreate(StoreError::SessionCreateFailed(_))));
        assert!(!err.is_client_error());
        assert_eq!(err.session_id(), None);
        assert!(store.records.lock().unwrap().is_empty());
        assert!(store.audit.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extraction_failure_is_audited() {
        let store = Arc::new(MemoryStore::default());
        let err = reconciler(None, roster(), store.clone())
            .mark_attendance("t9", "art", vec![0xde, 0xad])
            .await
            .unwrap_err();

        assert!(err.is_client_error());
        assert_eq!(err.kind(), "image_decode");
        assert_eq!(err.session_id(), Some("session-1"));

        let audit = store.audit.lock().unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, OutcomeStatus::Failed);
        assert_eq!(audit[0].teacher_id, "t9");
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_marking() {
        let store = Arc::new(MemoryStore { fail_audit: true, ..Default::default() });
        let outcome = reconciler(Some(vec![axis(0)]), roster(), store)
            .mark_attendance("t1", "math", vec![1])
            .await
            .unwrap();
        assert_eq!(outcome.present_students, vec!["ada"]);
        assert_eq!(outcome.status, OutcomeStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_presence_write_retries_on_next_sighting() {
        let store = Arc::new(MemoryStore {
            flaky_students: Mutex::new(vec!["ada".into()]),
            ..Default::default()
        });
        let faces = vec![axis(0), axis(0)];
        let outcome = reconciler(Some(faces), roster(), store.clone())
            .mark_attendance("t1", "math", vec![1])
            .await
            .unwrap();

        assert_eq!(outcome.present_students, vec!["ada"]);
        assert_eq!(outcome.status, OutcomeStatus::Degraded);
        assert_eq!(store.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_presence_write_without_retry() {
        let store = Arc::new(MemoryStore {
            flaky_students: Mutex::new(vec!["bob".into()]),
            ..Default::default()
        });
        let outcome = reconciler(Some(vec![axis(1), axis(0)]), roster(), store.clone())
            .mark_attendance("t1", "math", vec![1])
            .await
            .unwrap();

        assert_eq!(outcome.present_students, vec!["ada"]);
        assert_eq!(outcome.unknown_faces, 0);
        assert_eq!(outcome.status, OutcomeStatus::Degraded);
    }

    #[tokio::test]
    async fn test_unknown_count_matches_unmatched_lookups() {
        let store = Arc::new(MemoryStore::default());
        // Slightly off-axis faces still match; a face at cos 0.447 from Ada does not.
        let faces = vec![
            Embedding::new(vec![0.9, 0.1, 0.0, 0.0]),
            Embedding::new(vec![0.0, 0.0, 1.0, 1.0]),
            Embedding::new(vec![1.0, 0.0, 2.0, 0.0]),
            Embedding::new(vec![0.1, 0.9, 0.0, 0.0]),
        ];
        let outcome = reconciler(Some(faces), roster(), store)
            .mark_attendance("t1", "math", vec![1])
            .await
            .unwrap();

        assert_eq!(outcome.present_students, vec!["ada", "bob"]);
        assert_eq!(outcome.unknown_faces, 2);
    }
}
