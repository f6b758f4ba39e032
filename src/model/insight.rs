//! Derived, ephemeral outputs: predictions and recommendations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::ScoreComponent;

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

/// Short-horizon mastery projection for one (student, component).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub student_id: String,
    pub component: String,
    pub horizon_days: u32,
    /// Last trajectory value.
    pub projected_mastery: f64,
    /// R² of the fitted trend, in [0, 1].
    pub confidence: f64,
    /// `(day_offset, value)` for day 1..=horizon_days, values in [0, 1].
    pub trajectory: Vec<(u32, f64)>,
    pub intervention_flag: bool,
    /// `updated_at` of the record this was computed from.
    pub based_on: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Recommendation
// ---------------------------------------------------------------------------

/// Ordered so that `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Practice,
    Review,
    Refactor,
    Schedule,
    Assess,
    LearnNew,
}

impl Action {
    /// The remedial action for a weak sub-score.
    pub fn for_component(component: ScoreComponent) -> Self {
        match component {
            ScoreComponent::Completion => Action::Practice,
            ScoreComponent::Quiz => Action::Review,
            ScoreComponent::Quality => Action::Refactor,
            ScoreComponent::Consistency => Action::Schedule,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Practice => "PRACTICE",
            Action::Review => "REVIEW",
            Action::Refactor => "REFACTOR",
            Action::Schedule => "SCHEDULE",
            Action::Assess => "ASSESS",
            Action::LearnNew => "LEARN_NEW",
        };
        write!(f, "{s}")
    }
}

/// What the recommendation was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rationale {
    SubScore(ScoreComponent),
    ProjectedMastery,
    Mastery,
}

impl Rationale {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rationale::SubScore(c) => c.as_str(),
            Rationale::ProjectedMastery => "projected_mastery",
            Rationale::Mastery => "mastery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub student_id: String,
    pub component: String,
    pub priority: Priority,
    pub action: Action,
    /// Threshold minus observed value; 0 when not gap-driven.
    pub gap: f64,
    pub rationale: Rationale,
}
