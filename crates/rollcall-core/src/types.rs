use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
///
/// Immutable once produced by the recognizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity between two embeddings, in [-1, 1]. Higher = more similar.
    ///
    /// Embeddings of different dimensionality were produced by different
    /// models and are never similar: the result is 0.0, as for zero vectors.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Return a copy scaled to unit L2 norm. Zero vectors are returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// Identity of a registered student, as returned by similarity search.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StudentIdentity {
    pub id: String,
    pub name: String,
}

/// A registered student as held by the student registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    #[serde(flatten)]
    pub identity: StudentIdentity,
    pub roll_number: String,
    pub created_at: String,
}

/// Partial update of a student record. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudentUpdate {
    pub name: Option<String>,
    pub roll_number: Option<String>,
}

impl StudentUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.roll_number.is_none()
    }
}

/// One registered face in the gallery.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub student: StudentIdentity,
    pub embedding: Embedding,
}

/// A scored search hit from the embedding store.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub student: StudentIdentity,
    /// Cosine similarity to the probe.
    pub score: f32,
}

/// Result of matching a probe embedding against the registered students.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub student: Option<StudentIdentity>,
    /// Cosine similarity of the best candidate, 0.0 if there was none.
    pub similarity: f32,
    pub matched: bool,
}

impl MatchResult {
    pub fn no_match(similarity: f32) -> Self {
        Self {
            student: None,
            similarity,
            matched: false,
        }
    }
}

impl From<Candidate> for MatchResult {
    fn from(candidate: Candidate) -> Self {
        Self {
            student: Some(candidate.student),
            similarity: candidate.score,
            matched: true,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of registered faces.
pub trait Matcher {
    /// Candidates scoring at or above `threshold`, best first, at most `limit`.
    fn rank(
        &self,
        probe: &Embedding,
        gallery: &[GalleryEntry],
        threshold: f32,
        limit: usize,
    ) -> Vec<Candidate>;

    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        match self.rank(probe, gallery, threshold, 1).into_iter().next() {
            Some(best) => best.into(),
            None => MatchResult::no_match(0.0),
        }
    }
}

/// Cosine similarity matcher.
///
/// The threshold is inclusive: a score equal to the threshold matches.
/// Equal scores are ordered by ascending student id, so results are
/// reproducible for the same gallery regardless of insertion order.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn rank(
        &self,
        probe: &Embedding,
        gallery: &[GalleryEntry],
        threshold: f32,
        limit: usize,
    ) -> Vec<Candidate> {
        // Always score every entry; no early exit.
        let mut hits: Vec<Candidate> = gallery
            .iter()
            .map(|entry| Candidate {
                student: entry.student.clone(),
                score: probe.similarity(&entry.embedding),
            })
            .filter(|c| c.score >= threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.student.id.cmp(&b.student.id))
        });
        // A student with several registered faces appears once, at its best score.
        let mut seen = std::collections::HashSet::new();
        hits.retain(|c| seen.insert(c.student.id.clone()));
        hits.truncate(limit);
        hits
    }

    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let best = self.rank(probe, gallery, f32::NEG_INFINITY, 1).into_iter().next();
        match best {
            Some(c) if c.score >= threshold => c.into(),
            Some(c) => MatchResult::no_match(c.score),
            None => MatchResult::no_match(0.0),
        }
    }
}

/// One attendance-taking event. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: String,
    pub teacher_id: String,
    pub subject: String,
    pub created_at: String,
}

/// Durable evidence that a student was identified in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub session_id: String,
    pub student_id: String,
    pub status: String,
}

impl PresenceRecord {
    pub const PRESENT: &'static str = "present";
}

/// Terminal status of one marking pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Completed,
    /// Finished, but some lookup or presence write failed along the way.
    Degraded,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutcomeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "degraded" => Ok(Self::Degraded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown outcome status: {other}")),
        }
    }
}

/// Result of one reconciliation pass, returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceOutcome {
    pub session_id: String,
    /// Distinct ids of students recorded present, in first-detection order.
    pub present_students: Vec<String>,
    /// Display names, parallel to `present_students`.
    pub present_names: Vec<String>,
    pub unknown_faces: usize,
    pub status: OutcomeStatus,
}

/// One audit log line for a marking attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub session_id: String,
    pub teacher_id: String,
    pub status: OutcomeStatus,
    pub present_count: usize,
    /// Comma-separated names of the students marked present.
    pub student_names: String,
}

/// Everything persisted for one session, for operator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session: AttendanceSession,
    pub records: Vec<PresenceRecord>,
    pub audit: Vec<AuditEntry>,
}
