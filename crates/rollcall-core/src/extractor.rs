//! Embedding extraction: image bytes → face embeddings.
//!
//! Two policies share one engine. Classroom photos go through
//! [`EmbeddingExtractor::extract_many`], which never fails on an empty
//! frame. Registration portraits go through
//! [`EmbeddingExtractor::extract_single`], which rejects anything other
//! than exactly one face.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use async_trait::async_trait;
use image::RgbImage;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Side of the blank frame pushed through the detector during warm-up.
const WARMUP_FRAME_SIZE: u32 = 224;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("no face detected; make sure the face is clear and fully visible")]
    NoFaceDetected,
    #[error("{0} faces detected; upload a photo with exactly one face")]
    MultipleFacesDetected(usize),
    #[error("face engine is not ready (state: {0})")]
    NotReady(EngineState),
    #[error("face engine unavailable: {0}")]
    Unavailable(String),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

impl ExtractError {
    /// True when the caller sent bad input rather than the service failing.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::NoFaceDetected | Self::MultipleFacesDetected(_)
        )
    }
}

/// Lifecycle of the process-wide face engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    WarmingUp,
    Ready,
    Failed(String),
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::WarmingUp => f.write_str("warming_up"),
            Self::Ready => f.write_str("ready"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Turns uploaded images into face embeddings.
///
/// Implementations are shared across concurrent requests.
#[async_trait]
pub trait EmbeddingExtractor: Send + Sync {
    /// One embedding per detected face, in detector order. Zero faces is `Ok(vec![])`.
    async fn extract_many(&self, image: Vec<u8>) -> Result<Vec<Embedding>, ExtractError>;

    /// The embedding of the only face in the image.
    async fn extract_single(&self, image: Vec<u8>) -> Result<Embedding, ExtractError>;

    /// Dimensionality of produced embeddings, when known up front.
    fn dimension(&self) -> Option<usize> {
        None
    }
}

/// Decode an uploaded image (any format the `image` crate knows) to RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::Decode("empty upload".into()));
    }
    let decoded = image::load_from_memory(bytes).map_err(|e| ExtractError::Decode(e.to_string()))?;
    Ok(decoded.to_rgb8())
}

/// Require exactly one item: zero is `NoFaceDetected`, more is `MultipleFacesDetected`.
pub fn enforce_single<T>(mut faces: Vec<T>) -> Result<T, ExtractError> {
    match faces.len() {
        0 => Err(ExtractError::NoFaceDetected),
        1 => Ok(faces.remove(0)),
        n => Err(ExtractError::MultipleFacesDetected(n)),
    }
}

/// Locations of the two ONNX models.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: String,
    pub recognizer: String,
}

/// SCRFD detector plus ArcFace recognizer.
///
/// ONNX sessions need `&mut self` to run, so a `FaceEngine` must be owned by
/// one thread (or sit behind a lock) to be shared.
pub struct FaceEngine {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FaceEngine {
    pub fn load(paths: &ModelPaths, detection_threshold: f32) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(&paths.detector)?.with_confidence_threshold(detection_threshold);
        let recognizer = FaceRecognizer::load(&paths.recognizer)?;
        Ok(Self { detector, recognizer })
    }

    /// Run both models once on blank input so the first real request does
    /// not pay for lazy runtime initialization. A blank frame has no faces,
    /// so the recognizer gets its own crop.
    pub fn warm_up(&mut self) -> Result<(), ExtractError> {
        let blank = RgbImage::new(WARMUP_FRAME_SIZE, WARMUP_FRAME_SIZE);
        let faces = self.detector.detect(&blank)?;
        self.recognizer.warm_up()?;
        tracing::debug!(faces = faces.len(), "warm-up inference finished");
        Ok(())
    }

    /// Embeddings for every face in the photo, in detector order.
    ///
    /// Faces that cannot be aligned are skipped; downstream they simply do
    /// not count as anyone.
    pub fn embed_all(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, ExtractError> {
        let faces = self.detector.detect(image)?;
        let mut embeddings = Vec::with_capacity(faces.len());

        for (i, face) in faces.iter().enumerate() {
            match self.recognizer.extract(image, face) {
                Ok(embedding) => embeddings.push(embedding),
                Err(RecognizerError::NoLandmarks) => {
                    tracing::warn!(face = i, confidence = face.confidence, "skipping face without landmarks");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(detected = faces.len(), embedded = embeddings.len(), "classroom photo processed");
        Ok(embeddings)
    }

    /// Embedding of the only face in a registration portrait.
    pub fn embed_single(&mut self, image: &RgbImage) -> Result<Embedding, ExtractError> {
        let face = enforce_single(self.detector.detect(image)?)?;
        tracing::debug!(confidence = face.confidence, "registration face detected");
        Ok(self.recognizer.extract(image, &face)?)
    }
}
