//! Recommendation Engine: threshold gap analysis over the current sub-scores
//! plus the predicted trajectory.

use crate::config::RecommendConfig;
use crate::mastery::TOLERANCE;
use crate::model::{
    Action, MasteryRecord, PredictionResult, Priority, Rationale, Recommendation, ScoreComponent,
};

/// Ranked actions for one (student, component) record.
///
/// Ordered by priority, then gap (larger first), then rationale name. An
/// empty list means the student is above every threshold.
pub fn recommend(
    record: &MasteryRecord,
    prediction: Option<&PredictionResult>,
    config: &RecommendConfig,
) -> Vec<Recommendation> {
    let make = |priority, action, gap, rationale| Recommendation {
        student_id: record.student_id.clone(),
        component: record.component.clone(),
        priority,
        action,
        gap,
        rationale,
    };

    let mut out: Vec<Recommendation> = ScoreComponent::ALL
        .into_iter()
        .filter_map(|sub| {
            let value = record.current_scores.get(sub);
            (value < config.threshold).then(|| {
                let gap = config.threshold - value;
                make(
                    priority_for(gap, config),
                    Action::for_component(sub),
                    gap,
                    Rationale::SubScore(sub),
                )
            })
        })
        .collect();

    let intervention = prediction.is_some_and(|p| p.intervention_flag);
    if let Some(p) = prediction.filter(|p| p.intervention_flag) {
        out.push(make(
            Priority::High,
            Action::Assess,
            (config.threshold - p.projected_mastery).max(0.0),
            Rationale::ProjectedMastery,
        ));
    }

    if out.is_empty() && !intervention {
        if let Some(advance) = config.advance_threshold {
            if record.mastery + TOLERANCE >= advance {
                out.push(make(Priority::Low, Action::LearnNew, 0.0, Rationale::Mastery));
            }
        }
    }

    rank(&mut out);
    out
}

/// Sort by priority, then gap (larger first), then rationale and component
/// name for a stable order across records.
pub fn rank(recommendations: &mut [Recommendation]) {
    recommendations.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.gap.total_cmp(&a.gap))
            .then_with(|| a.rationale.as_str().cmp(b.rationale.as_str()))
            .then_with(|| a.component.cmp(&b.component))
    });
}

/// Boundaries are inclusive: a gap of exactly `high_gap` is HIGH.
fn priority_for(gap: f64, config: &RecommendConfig) -> Priority {
    if gap + TOLERANCE >= config.high_gap {
        Priority::High
    } else if gap + TOLERANCE >= config.medium_gap {
        Priority::Medium
    } else {
        Priority::Low
    }
}
