//! SQLite persistence for students, embeddings, sessions and the audit log.

use async_trait::async_trait;
use rollcall_core::{
    AttendanceSession, AuditEntry, Candidate, CosineMatcher, Embedding, EmbeddingStore,
    GalleryEntry, Matcher, OutcomeStatus, PresenceRecord, SessionReport, SessionStore, StoreError,
    Student, StudentIdentity, StudentRegistry, StudentUpdate,
};
use rusqlite::{params, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS students (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    roll_number TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS student_embeddings (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id    TEXT NOT NULL REFERENCES students(id) ON DELETE CASCADE,
    embedding     BLOB NOT NULL,
    model_version TEXT,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance_sessions (
    id         TEXT PRIMARY KEY,
    teacher_id TEXT NOT NULL,
    subject    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance_records (
    session_id  TEXT NOT NULL REFERENCES attendance_sessions(id),
    student_id  TEXT NOT NULL,
    status      TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    UNIQUE (session_id, student_id)
);

CREATE TABLE IF NOT EXISTS attendance_logs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id    TEXT NOT NULL,
    teacher_id    TEXT NOT NULL,
    status        TEXT NOT NULL,
    present_count INTEGER NOT NULL,
    student_names TEXT NOT NULL,
    created_at    TEXT NOT NULL
);
";

/// Store backed by one SQLite connection on its own thread.
///
/// The decoded embedding gallery is cached between lookups and dropped
/// whenever a student is registered, updated or removed.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
    gallery: Arc<Mutex<Option<Arc<Vec<GalleryEntry>>>>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).await.map_err(from_db)?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(from_db)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(from_db)?;
        Ok(Self {
            conn,
            gallery: Arc::new(Mutex::new(None)),
        })
    }

    /// Gallery for similarity lookups. The lock is held across a reload so
    /// a burst of lookups scans the table once.
    async fn cached_gallery(&self) -> Result<Arc<Vec<GalleryEntry>>, StoreError> {
        let mut cached = self.gallery.lock().await;
        if let Some(gallery) = cached.as_ref() {
            return Ok(gallery.clone());
        }
        let gallery = Arc::new(self.load_gallery().await?);
        tracing::debug!(entries = gallery.len(), "embedding gallery loaded");
        *cached = Some(gallery.clone());
        Ok(gallery)
    }

    async fn invalidate_gallery(&self) {
        *self.gallery.lock().await = None;
    }

    async fn load_gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.id, s.name, e.embedding, e.model_version
                     FROM student_embeddings e JOIN students s ON s.id = e.student_id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(from_db)?;

        rows.into_iter()
            .map(|(id, name, blob, model_version)| {
                Ok(GalleryEntry {
                    student: StudentIdentity { id, name },
                    embedding: Embedding {
                        values: blob_to_values(&blob)?,
                        model_version,
                    },
                })
            })
            .collect()
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(&self, teacher_id: &str, subject: &str) -> Result<AttendanceSession, StoreError> {
        let session = AttendanceSession {
            id: uuid::Uuid::new_v4().to_string(),
            teacher_id: teacher_id.to_string(),
            subject: subject.to_string(),
            created_at: now(),
        };
        let row = session.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance_sessions (id, teacher_id, subject, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![row.id, row.teacher_id, row.subject, row.created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| StoreError::SessionCreateFailed(e.to_string()))?;
        Ok(session)
    }

    async fn record_presence(&self, session_id: &str, student_id: &str) -> Result<(), StoreError> {
        let (session_id, student_id) = (session_id.to_string(), student_id.to_string());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance_records (session_id, student_id, status, recorded_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![session_id, student_id, PresenceRecord::PRESENT, now()],
                )?;
                Ok(())
            })
            .await
            .map_err(from_db)
    }

    async fn append_audit_log(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance_logs
                        (session_id, teacher_id, status, present_count, student_names, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        entry.session_id,
                        entry.teacher_id,
                        entry.status.as_str(),
                        entry.present_count as i64,
                        entry.student_names,
                        now(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(from_db)
    }

    async fn session_report(&self, session_id: &str) -> Result<SessionReport, StoreError> {
        let id = session_id.to_string();
        let (session, records, logs) = self
            .conn
            .call(move |conn| {
                let session = conn
                    .query_row(
                        "SELECT id, teacher_id, subject, created_at FROM attendance_sessions WHERE id = ?1",
                        [&id],
                        |row| {
                            Ok(AttendanceSession {
                                id: row.get(0)?,
                                teacher_id: row.get(1)?,
                                subject: row.get(2)?,
                                created_at: row.get(3)?,
                            })
                        },
                    )
                    .optional()?;

                let mut stmt = conn.prepare(
                    "SELECT session_id, student_id, status FROM attendance_records
                     WHERE session_id = ?1 ORDER BY rowid",
                )?;
                let records = stmt
                    .query_map([&id], |row| {
                        Ok(PresenceRecord {
                            session_id: row.get(0)?,
                            student_id: row.get(1)?,
                            status: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut stmt = conn.prepare(
                    "SELECT session_id, teacher_id, status, present_count, student_names
                     FROM attendance_logs WHERE session_id = ?1 ORDER BY id",
                )?;
                let logs = stmt
                    .query_map([&id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok((session, records, logs))
            })
            .await
            .map_err(from_db)?;

        let session = session.ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        let audit = logs
            .into_iter()
            .map(|(session_id, teacher_id, status, present_count, student_names)| {
                Ok(AuditEntry {
                    status: status.parse::<OutcomeStatus>().map_err(StoreError::Corrupt)?,
                    present_count: usize::try_from(present_count)
                        .map_err(|_| StoreError::Corrupt(format!("present_count {present_count}")))?,
                    session_id,
                    teacher_id,
                    student_names,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(SessionReport { session, records, audit })
    }
}

#[async_trait]
impl EmbeddingStore for SqliteStore {
    async fn lookup_closest_embedding(
        &self,
        embedding: &Embedding,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        let gallery = self.cached_gallery().await?;
        Ok(CosineMatcher.rank(embedding, &gallery, threshold, limit))
    }
}

#[async_trait]
impl StudentRegistry for SqliteStore {
    async fn register_student(
        &self,
        name: &str,
        roll_number: &str,
        embedding: &Embedding,
    ) -> Result<StudentIdentity, StoreError> {
        let identity = StudentIdentity {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
        };
        let (id, name, roll) = (identity.id.clone(), identity.name.clone(), roll_number.to_string());
        let blob = values_to_blob(&embedding.values);
        let model_version = embedding.model_version.clone();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let created_at = now();
                tx.execute(
                    "INSERT INTO students (id, name, roll_number, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![id, name, roll, created_at],
                )?;
                tx.execute(
                    "INSERT INTO student_embeddings (student_id, embedding, model_version, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, blob, model_version, created_at],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_db)?;
        self.invalidate_gallery().await;

        Ok(identity)
    }

    async fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, roll_number, created_at FROM students ORDER BY name, id",
                )?;
                let students = stmt
                    .query_map([], student_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(students)
            })
            .await
            .map_err(from_db)
    }

    async fn update_student(&self, id: &str, update: &StudentUpdate) -> Result<Student, StoreError> {
        let id = id.to_string();
        let update = update.clone();
        let student = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if let Some(name) = &update.name {
                    tx.execute("UPDATE students SET name = ?1 WHERE id = ?2", params![name, id])?;
                }
                if let Some(roll) = &update.roll_number {
                    tx.execute("UPDATE students SET roll_number = ?1 WHERE id = ?2", params![roll, id])?;
                }
                let student = tx
                    .query_row(
                        "SELECT id, name, roll_number, created_at FROM students WHERE id = ?1",
                        [&id],
                        student_from_row,
                    )
                    .optional()?;
                tx.commit()?;
                Ok(student)
            })
            .await
            .map_err(from_db)?;
        self.invalidate_gallery().await;

        student.ok_or_else(|| StoreError::NotFound("student not found".into()))
    }

    async fn remove_student(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM students WHERE id = ?1", [&id])?))
            .await
            .map_err(from_db)?;
        self.invalidate_gallery().await;

        if removed == 0 {
            return Err(StoreError::NotFound("student not found".into()));
        }
        Ok(())
    }
}

fn student_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        identity: StudentIdentity {
            id: row.get(0)?,
            name: row.get(1)?,
        },
        roll_number: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Embeddings are stored as packed little-endian f32.
fn values_to_blob(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_values(blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!("embedding blob of {} bytes", blob.len())));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn from_db(err: tokio_rusqlite::Error) -> StoreError {
    match err {
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(failure, msg))
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(msg.unwrap_or_else(|| failure.to_string()))
        }
        other => StoreError::Unavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding {
            values: values.to_vec(),
            model_version: Some("w600k_r50".into()),
        }
    }

    #[test]
    fn test_blob_roundtrip_and_corruption() {
        let values = vec![0.25f32, -1.5, 3.0];
        assert_eq!(blob_to_values(&values_to_blob(&values)).unwrap(), values);
        assert!(matches!(blob_to_values(&[1, 2, 3]), Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let ada = store.register_student("Ada", "R-01", &emb(&[1.0, 0.0])).await.unwrap();
        store.register_student("Bob", "R-02", &emb(&[0.0, 1.0])).await.unwrap();

        let hits = store
            .lookup_closest_embedding(&emb(&[0.9, 0.1]), 0.5, 1)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].student, ada);

        let none = store
            .lookup_closest_embedding(&emb(&[-1.0, -1.0]), 0.5, 1)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_gallery_cached_until_roster_changes() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let ada = store.register_student("Ada", "R-01", &emb(&[1.0, 0.0])).await.unwrap();
        let probe = emb(&[1.0, 0.0]);
        assert_eq!(store.lookup_closest_embedding(&probe, 0.5, 1).await.unwrap()[0].student, ada);

        // A write behind the store's back is not seen: lookups use the cached gallery.
        store
            .conn
            .call(|conn| Ok(conn.execute("DELETE FROM student_embeddings", [])?))
            .await
            .unwrap();
        assert_eq!(store.lookup_closest_embedding(&probe, 0.5, 1).await.unwrap().len(), 1);

        // Registering drops the cache, so the next lookup sees the table again.
        let bob = store.register_student("Bob", "R-02", &emb(&[0.0, 1.0])).await.unwrap();
        assert!(store.lookup_closest_embedding(&probe, 0.5, 1).await.unwrap().is_empty());

        store
            .update_student(&bob.id, &StudentUpdate { name: Some("Robert".into()), roll_number: None })
            .await
            .unwrap();
        let hits = store.lookup_closest_embedding(&emb(&[0.0, 1.0]), 0.5, 1).await.unwrap();
        assert_eq!(hits[0].student.name, "Robert");

        store.remove_student(&bob.id).await.unwrap();
        assert!(store.lookup_closest_embedding(&emb(&[0.0, 1.0]), 0.5, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_roll_number_conflicts() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.register_student("Ada", "R-01", &emb(&[1.0])).await.unwrap();
        let err = store.register_student("Eve", "R-01", &emb(&[1.0])).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.list_students().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_remove_student() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let ada = store.register_student("Ada", "R-01", &emb(&[1.0, 0.0])).await.unwrap();

        let updated = store
            .update_student(&ada.id, &StudentUpdate { name: Some("Ada L.".into()), roll_number: None })
            .await
            .unwrap();
        assert_eq!(updated.identity.name, "Ada L.");
        assert_eq!(updated.roll_number, "R-01");

        store.remove_student(&ada.id).await.unwrap();
        assert!(store.list_students().await.unwrap().is_empty());
        // Embeddings go with the student.
        assert!(store.load_gallery().await.unwrap().is_empty());

        assert!(matches!(store.remove_student(&ada.id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.update_student(&ada.id, &StudentUpdate::default()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_lifecycle_report() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let session = store.create_session("t1", "physics").await.unwrap();
        store.record_presence(&session.id, "s1").await.unwrap();
        store.record_presence(&session.id, "s2").await.unwrap();
        store
            .append_audit_log(&AuditEntry {
                session_id: session.id.clone(),
                teacher_id: "t1".into(),
                status: OutcomeStatus::Completed,
                present_count: 2,
                student_names: "Ada, Bob".into(),
            })
            .await
            .unwrap();

        let report = store.session_report(&session.id).await.unwrap();
        assert_eq!(report.session, session);
        let ids: Vec<_> = report.records.iter().map(|r| r.student_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert_eq!(report.audit.len(), 1);
        assert_eq!(report.audit[0].status, OutcomeStatus::Completed);
        assert_eq!(report.audit[0].present_count, 2);
    }

    #[tokio::test]
    async fn test_duplicate_presence_is_rejected_by_storage() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let session = store.create_session("t1", "physics").await.unwrap();
        store.record_presence(&session.id, "s1").await.unwrap();
        let err = store.record_presence(&session.id, "s1").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_presence_for_unknown_session_fails() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        assert!(store.record_presence("nope", "s1").await.is_err());
        assert!(matches!(store.session_report("nope").await, Err(StoreError::NotFound(_))));
    }
}
