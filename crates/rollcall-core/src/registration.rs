//! Student registration from a single portrait.

use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::store::{StoreError, StudentRegistry};
use crate::types::StudentIdentity;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("registry error: {0}")]
    Store(#[from] StoreError),
}

impl RegistrationError {
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::InvalidInput(_) => true,
            Self::Extract(e) => e.is_client_error(),
            Self::Store(StoreError::Conflict(_)) => true,
            Self::Store(_) => false,
        }
    }
}

pub struct StudentRegistrar {
    extractor: Arc<dyn EmbeddingExtractor>,
    registry: Arc<dyn StudentRegistry>,
}

impl StudentRegistrar {
    pub fn new(extractor: Arc<dyn EmbeddingExtractor>, registry: Arc<dyn StudentRegistry>) -> Self {
        Self { extractor, registry }
    }

    /// Register a student whose portrait shows exactly one face.
    pub async fn register(
        &self,
        name: &str,
        roll_number: &str,
        image: Vec<u8>,
    ) -> Result<StudentIdentity, RegistrationError> {
        let name = required("name", name)?;
        let roll_number = required("roll_number", roll_number)?;

        let embedding = self.extractor.extract_single(image).await?;
        if let Some(expected) = self.extractor.dimension() {
            if embedding.dimension() != expected {
                return Err(ExtractError::Unavailable(format!(
                    "engine produced {}-dim embedding, expected {expected}",
                    embedding.dimension()
                ))
                .into());
            }
        }

        let student = self.registry.register_student(name, roll_number, &embedding).await?;
        tracing::info!(student_id = %student.id, roll_number, "student registered");
        Ok(student)
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, RegistrationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RegistrationError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(trimmed)
}
