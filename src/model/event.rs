//! Learning events and the sub-scores they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Sub-scores
// ---------------------------------------------------------------------------

/// The four observed sub-scores behind a mastery value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub completion: f64,
    pub quiz: f64,
    pub quality: f64,
    pub consistency: f64,
}

impl SubScores {
    pub fn new(completion: f64, quiz: f64, quality: f64, consistency: f64) -> Self {
        Self {
            completion,
            quiz,
            quality,
            consistency,
        }
    }

    /// Every sub-score pulled into [0, 1]. Out-of-range producers are
    /// tolerated, not rejected.
    pub fn clamped(self) -> Self {
        Self {
            completion: self.completion.clamp(0.0, 1.0),
            quiz: self.quiz.clamp(0.0, 1.0),
            quality: self.quality.clamp(0.0, 1.0),
            consistency: self.consistency.clamp(0.0, 1.0),
        }
    }

    /// NaN and infinities can't be clamped meaningfully.
    pub fn validate(&self) -> Result<()> {
        for component in ScoreComponent::ALL {
            let value = self.get(component);
            if !value.is_finite() {
                return Err(Error::Validation(format!(
                    "{component} score is not a finite number: {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, component: ScoreComponent) -> f64 {
        match component {
            ScoreComponent::Completion => self.completion,
            ScoreComponent::Quiz => self.quiz,
            ScoreComponent::Quality => self.quality,
            ScoreComponent::Consistency => self.consistency,
        }
    }
}

/// Names one of the four sub-scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreComponent {
    Completion,
    Quiz,
    Quality,
    Consistency,
}

impl ScoreComponent {
    pub const ALL: [ScoreComponent; 4] = [
        ScoreComponent::Completion,
        ScoreComponent::Quiz,
        ScoreComponent::Quality,
        ScoreComponent::Consistency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScoreComponent::Completion => "completion",
            ScoreComponent::Quiz => "quiz",
            ScoreComponent::Quality => "quality",
            ScoreComponent::Consistency => "consistency",
        }
    }
}

impl std::fmt::Display for ScoreComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Learning Event
// ---------------------------------------------------------------------------

/// One observed student action, as delivered by the event source.
///
/// Delivery is at-least-once; `idempotency_key` identifies the logical event
/// and may stay the same across redeliveries whose `event_id` differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEvent {
    pub event_id: String,
    pub student_id: String,
    /// Skill or topic key, e.g. "loops".
    pub component: String,
    pub scores: SubScores,
    pub occurred_at: DateTime<Utc>,
    pub idempotency_key: String,
    /// Corrections are applied even when older than the record.
    #[serde(default)]
    pub correction: bool,
}

impl LearningEvent {
    /// Structural checks. Score range is handled by clamping, not here.
    pub fn validate(&self) -> Result<()> {
        if self.student_id.trim().is_empty() {
            return Err(Error::Validation("student_id is empty".to_string()));
        }
        if self.component.trim().is_empty() {
            return Err(Error::Validation("component is empty".to_string()));
        }
        if self.idempotency_key.is_empty() {
            return Err(Error::Validation("idempotency_key is empty".to_string()));
        }
        if self.student_id.contains(':') || self.component.contains(':') {
            return Err(Error::Validation(
                "student_id and component must not contain ':'".to_string(),
            ));
        }
        self.scores.validate()
    }
}

// ---------------------------------------------------------------------------
// Mastery Updated
// ---------------------------------------------------------------------------

/// Published once per accepted ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteryUpdated {
    pub student_id: String,
    pub component: String,
    pub mastery: f64,
    pub occurred_at: DateTime<Utc>,
}
