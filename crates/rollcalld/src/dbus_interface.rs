use crate::engine::EngineHandle;
use rollcall_core::{
    AttendanceReconciler, SessionStore, StoreError, StudentRegistrar, StudentRegistry, StudentUpdate,
};
use std::sync::Arc;
use zbus::fdo;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    reconciler: Arc<AttendanceReconciler>,
    registrar: Arc<StudentRegistrar>,
    registry: Arc<dyn StudentRegistry>,
    sessions: Arc<dyn SessionStore>,
    engine: EngineHandle,
}

impl AttendanceService {
    pub fn new(
        reconciler: Arc<AttendanceReconciler>,
        registrar: Arc<StudentRegistrar>,
        registry: Arc<dyn StudentRegistry>,
        sessions: Arc<dyn SessionStore>,
        engine: EngineHandle,
    ) -> Self {
        Self {
            reconciler,
            registrar,
            registry,
            sessions,
            engine,
        }
    }

    async fn register(&self, name: String, roll_number: String, image: Vec<u8>) -> fdo::Result<String> {
        let registrar = self.registrar.clone();
        let task = tokio::spawn(async move { registrar.register(&name, &roll_number, image).await });

        match task.await.map_err(join_failed)? {
            Ok(student) => Ok(student.id),
            Err(e) => {
                tracing::warn!(error = %e, client_error = e.is_client_error(), "registration rejected");
                Err(reject(e.is_client_error(), e.to_string()))
            }
        }
    }

    async fn mark(&self, teacher_id: String, subject: String, image: Vec<u8>) -> fdo::Result<String> {
        // Spawned so a caller hanging up cannot cut a marking pass short.
        let reconciler = self.reconciler.clone();
        let teacher = teacher_id.clone();
        let task = tokio::spawn(async move { reconciler.mark_attendance(&teacher, &subject, image).await });

        match task.await.map_err(join_failed)? {
            Ok(outcome) => to_json(&outcome),
            Err(e) => {
                tracing::error!(
                    teacher_id = %teacher_id,
                    session_id = e.session_id(),
                    kind = e.kind(),
                    error = %e,
                    "attendance marking failed"
                );
                Err(reject(e.is_client_error(), e.to_string()))
            }
        }
    }

    async fn students(&self) -> fdo::Result<String> {
        let students = self.registry.list_students().await.map_err(store_failed)?;
        to_json(&students)
    }

    async fn update(&self, id: &str, name: &str, roll_number: &str) -> fdo::Result<String> {
        let non_empty = |s: &str| Some(s.trim().to_string()).filter(|s| !s.is_empty());
        let update = StudentUpdate {
            name: non_empty(name),
            roll_number: non_empty(roll_number),
        };
        if update.is_empty() {
            return Err(fdo::Error::InvalidArgs("no fields provided for update".into()));
        }

        let student = self.registry.update_student(id, &update).await.map_err(store_failed)?;
        tracing::info!(student_id = id, "student updated");
        to_json(&student)
    }

    async fn remove(&self, id: &str) -> fdo::Result<bool> {
        self.registry.remove_student(id).await.map_err(store_failed)?;
        tracing::info!(student_id = id, "student removed");
        Ok(true)
    }

    async fn report(&self, session_id: &str) -> fdo::Result<String> {
        let report = self.sessions.session_report(session_id).await.map_err(store_failed)?;
        to_json(&report)
    }

    async fn status_json(&self) -> fdo::Result<String> {
        let students = self.registry.list_students().await.map_err(store_failed)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": self.engine.state().to_string(),
            "similarity_threshold": self.reconciler.threshold(),
            "students": students.len(),
        })
        .to_string())
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Register a student from a single-face portrait. Returns the student id.
    async fn register_student(&self, name: String, roll_number: String, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(name = %name, roll_number = %roll_number, bytes = image.len(), "register_student requested");
        self.register(name, roll_number, image).await
    }

    /// Mark attendance from a classroom photo. Returns the outcome as JSON.
    async fn mark_attendance(&self, teacher_id: String, subject: String, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(teacher_id = %teacher_id, subject = %subject, bytes = image.len(), "mark_attendance requested");
        self.mark(teacher_id, subject, image).await
    }

    /// List registered students as JSON.
    async fn list_students(&self) -> fdo::Result<String> {
        self.students().await
    }

    /// Update a student's name and/or roll number. Empty strings leave a field unchanged.
    async fn update_student(&self, id: &str, name: &str, roll_number: &str) -> fdo::Result<String> {
        self.update(id, name, roll_number).await
    }

    /// Remove a student and their registered faces.
    async fn remove_student(&self, id: &str) -> fdo::Result<bool> {
        self.remove(id).await
    }

    /// Session, presence records and audit entries for one session, as JSON.
    async fn session_report(&self, session_id: &str) -> fdo::Result<String> {
        self.report(session_id).await
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        self.status_json().await
    }
}

fn reject(client_error: bool, message: String) -> fdo::Error {
    if client_error {
        fdo::Error::InvalidArgs(message)
    } else {
        fdo::Error::Failed(message)
    }
}

fn store_failed(e: StoreError) -> fdo::Error {
    let client_error = matches!(e, StoreError::NotFound(_) | StoreError::Conflict(_));
    if !client_error {
        tracing::error!(error = %e, "store request failed");
    }
    reject(client_error, e.to_string())
}

fn join_failed(e: tokio::task::JoinError) -> fdo::Error {
    tracing::error!(error = %e, "request task aborted");
    fdo::Error::Failed(format!("request task aborted: {e}"))
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialize: {e}")))
}
