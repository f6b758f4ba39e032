//! Closed-form trend fitting over mastery history.
//!
//! Ordinary least squares over (day offset, mastery). Outliers are removed
//! once: points whose residual from the first fit exceeds `outlier_sd`
//! standard deviations are dropped and the line is refit a single time. The
//! refit is not iterated, so the result is deterministic and never eats into
//! the history more than once.

use crate::config::PredictorConfig;
use crate::error::{Error, Result};
use crate::model::Snapshot;

const EPSILON: f64 = 1e-12;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line {
    pub intercept: f64,
    pub slope: f64,
}

impl Line {
    pub fn at(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// A fitted projection, before it is attached to a student.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub line: Line,
    /// R² of the final fit, in [0, 1].
    pub confidence: f64,
    /// `(day, value)` for day 1..=horizon after the latest snapshot.
    pub trajectory: Vec<(u32, f64)>,
    pub projected_mastery: f64,
    pub intervention_flag: bool,
    pub outliers_removed: usize,
}

pub fn forecast(history: &[Snapshot], horizon_days: u32, config: &PredictorConfig) -> Result<Forecast> {
    if history.len() < config.min_history {
        return Err(Error::InsufficientHistory {
            required: config.min_history,
            available: history.len(),
        });
    }
    if horizon_days == 0 || horizon_days > config.max_horizon_days {
        return Err(Error::Validation(format!(
            "horizon_days must be in 1..={}, got {horizon_days}",
            config.max_horizon_days
        )));
    }

    let origin = history[0].at;
    let points: Vec<(f64, f64)> = history
        .iter()
        .map(|s| {
            let days = (s.at - origin).num_milliseconds() as f64 / MILLIS_PER_DAY;
            (days, s.mastery)
        })
        .collect();

    let first = fit(&points);
    let (line, kept, removed) = match without_outliers(&points, first, config.outlier_sd) {
        Some(kept) if kept.len() >= config.min_history => {
            let removed = points.len() - kept.len();
            (fit(&kept), kept, removed)
        }
        _ => (first, points.clone(), 0),
    };

    let confidence = r_squared(&kept, line);
    let last_x = points.last().map(|(x, _)| *x).unwrap_or_default();
    let trajectory: Vec<(u32, f64)> = (1..=horizon_days)
        .map(|day| (day, line.at(last_x + day as f64).clamp(0.0, 1.0)))
        .collect();
    let projected_mastery = trajectory.last().map(|(_, v)| *v).unwrap_or_default();

    Ok(Forecast {
        line,
        confidence,
        trajectory,
        projected_mastery,
        intervention_flag: projected_mastery < config.intervention_threshold,
        outliers_removed: removed,
    })
}

/// OLS line. Degenerate x (all snapshots at one instant) gives a flat line
/// through the mean.
pub fn fit(points: &[(f64, f64)]) -> Line {
    let n = points.len() as f64;
    if points.is_empty() {
        return Line {
            intercept: 0.0,
            slope: 0.0,
        };
    }
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    let sxy: f64 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();

    if sxx <= EPSILON {
        return Line {
            intercept: mean_y,
            slope: 0.0,
        };
    }
    let slope = sxy / sxx;
    Line {
        intercept: mean_y - slope * mean_x,
        slope,
    }
}

/// Coefficient of determination, clamped to [0, 1]. A perfectly flat series
/// that the line reproduces counts as a perfect fit.
pub fn r_squared(points: &[(f64, f64)], line: Line) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / points.len() as f64;
    let ss_tot: f64 = points.iter().map(|(_, y)| (y - mean_y).powi(2)).sum();
    let ss_res: f64 = points.iter().map(|(x, y)| (y - line.at(*x)).powi(2)).sum();

    if ss_tot <= EPSILON {
        return if ss_res <= EPSILON { 1.0 } else { 0.0 };
    }
    (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
}

/// Points within `bound` residual standard deviations of `line`, or `None`
/// if nothing would be removed.
fn without_outliers(points: &[(f64, f64)], line: Line, bound: f64) -> Option<Vec<(f64, f64)>> {
    let residuals: Vec<f64> = points.iter().map(|(x, y)| y - line.at(*x)).collect();
    let sd = (residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64).sqrt();
    if sd <= EPSILON {
        return None;
    }
    let kept: Vec<(f64, f64)> = points
        .iter()
        .zip(&residuals)
        .filter(|(_, r)| r.abs() <= bound * sd)
        .map(|(p, _)| *p)
        .collect();
    (kept.len() < points.len()).then_some(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn daily(values: &[f64]) -> Vec<Snapshot> {
        values
            .iter()
            .enumerate()
            .map(|(i, &mastery)| Snapshot {
                at: t0() + Duration::days(i as i64),
                mastery,
            })
            .collect()
    }

    #[test]
    fn too_little_history_is_a_typed_error() {
        let err = forecast(&daily(&[0.5, 0.6]), 7, &PredictorConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientHistory {
                required: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn horizon_out_of_range_is_rejected() {
        let history = daily(&[0.5, 0.6, 0.7]);
        let config = PredictorConfig::default();
        assert!(matches!(forecast(&history, 0, &config), Err(Error::Validation(_))));
        assert!(matches!(forecast(&history, 366, &config), Err(Error::Validation(_))));
    }

    #[test]
    fn linear_history_projects_forward_from_latest_snapshot() {
        let history = daily(&[0.50, 0.52, 0.54, 0.56, 0.58]);
        let f = forecast(&history, 5, &PredictorConfig::default()).unwrap();

        assert!((f.line.slope - 0.02).abs() < 1e-9);
        assert!((f.confidence - 1.0).abs() < 1e-9);
        assert_eq!(f.trajectory.len(), 5);
        assert_eq!(f.trajectory[0].0, 1);
        assert!((f.trajectory[0].1 - 0.60).abs() < 1e-9);
        assert!((f.projected_mastery - 0.68).abs() < 1e-9);
        assert!(!f.intervention_flag);
    }

    #[test]
    fn trajectory_is_clamped_to_unit_range() {
        let rising = forecast(&daily(&[0.6, 0.8, 1.0]), 30, &PredictorConfig::default()).unwrap();
        assert!(rising.trajectory.iter().all(|(_, v)| (0.0..=1.0).contains(v)));
        assert_eq!(rising.projected_mastery, 1.0);

        let falling = forecast(&daily(&[0.4, 0.2, 0.0]), 30, &PredictorConfig::default()).unwrap();
        assert!(falling.trajectory.iter().all(|(_, v)| (0.0..=1.0).contains(v)));
        assert_eq!(falling.projected_mastery, 0.0);
        assert!(falling.intervention_flag);
    }

    #[test]
    fn single_outlier_is_removed_once() {
        let mut values: Vec<f64> = (0..10).map(|i| 0.5 + 0.02 * i as f64).collect();
        values[5] = 0.95;
        let f = forecast(&daily(&values), 3, &PredictorConfig::default()).unwrap();

        assert_eq!(f.outliers_removed, 1);
        assert!((f.line.slope - 0.02).abs() < 1e-9);
        assert!((f.line.intercept - 0.5).abs() < 1e-9);
        assert!(f.confidence > 0.999);
    }

    #[test]
    fn flat_history_is_fully_confident() {
        let f = forecast(&daily(&[0.4, 0.4, 0.4, 0.4]), 2, &PredictorConfig::default()).unwrap();
        assert_eq!(f.confidence, 1.0);
        assert!((f.projected_mastery - 0.4).abs() < 1e-12);
        assert!(f.intervention_flag);
    }

    #[test]
    fn noisy_history_has_partial_confidence() {
        let f = forecast(
            &daily(&[0.50, 0.58, 0.52, 0.61, 0.55, 0.64]),
            7,
            &PredictorConfig::default(),
        )
        .unwrap();
        assert!(f.confidence > 0.0 && f.confidence < 1.0);
    }
}
