//! Cohort statistics: per-group summaries and pairwise comparisons.
//!
//! Every pair of groups is compared with a two-sided Mann-Whitney U test
//! (normal approximation with tie correction and continuity correction) and
//! Cohen's d on the pooled sample variance. Groups below the minimum size
//! are flagged instead of producing a p-value.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::CohortConfig;
use crate::error::{Error, Result};

/// Mastery values observed for one named group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortSample {
    pub name: String,
    pub values: Vec<f64>,
}

impl CohortSample {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub name: String,
    pub n: usize,
    pub mean: Option<f64>,
    /// Sample variance (n - 1 denominator); `None` below two values.
    pub variance: Option<f64>,
    pub insufficient_data: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseComparison {
    pub group_a: String,
    pub group_b: String,
    /// mean(a) - mean(b).
    pub mean_difference: Option<f64>,
    /// Cohen's d; `None` when the pooled variance is zero or undefined.
    pub effect_size: Option<f64>,
    /// U for group a.
    pub u_statistic: Option<f64>,
    pub z_score: Option<f64>,
    pub p_value: Option<f64>,
    pub significant: bool,
    /// Either group is below the minimum size; no test was run.
    pub insufficient_data: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortComparison {
    pub alpha: f64,
    pub groups: Vec<GroupSummary>,
    pub comparisons: Vec<PairwiseComparison>,
}

pub fn compare(samples: &[CohortSample], config: &CohortConfig) -> Result<CohortComparison> {
    if samples.len() < 2 {
        return Err(Error::Validation(
            "cohort comparison needs at least two groups".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for sample in samples {
        if sample.name.trim().is_empty() {
            return Err(Error::Validation("cohort name is empty".to_string()));
        }
        if !seen.insert(sample.name.as_str()) {
            return Err(Error::Validation(format!(
                "duplicate cohort name: {}",
                sample.name
            )));
        }
        if sample.values.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation(format!(
                "cohort {} contains a non-finite value",
                sample.name
            )));
        }
    }

    let groups: Vec<GroupSummary> = samples.iter().map(|s| summarize(s, config)).collect();

    let mut comparisons = Vec::new();
    for i in 0..samples.len() {
        for j in (i + 1)..samples.len() {
            comparisons.push(compare_pair(
                &samples[i],
                &groups[i],
                &samples[j],
                &groups[j],
                config.alpha,
            ));
        }
    }

    Ok(CohortComparison {
        alpha: config.alpha,
        groups,
        comparisons,
    })
}

fn summarize(sample: &CohortSample, config: &CohortConfig) -> GroupSummary {
    GroupSummary {
        name: sample.name.clone(),
        n: sample.values.len(),
        mean: mean(&sample.values),
        variance: sample_variance(&sample.values),
        insufficient_data: sample.values.len() < config.min_group_size,
    }
}

fn compare_pair(
    a: &CohortSample,
    summary_a: &GroupSummary,
    b: &CohortSample,
    summary_b: &GroupSummary,
    alpha: f64,
) -> PairwiseComparison {
    let mean_difference = match (summary_a.mean, summary_b.mean) {
        (Some(x), Some(y)) => Some(x - y),
        _ => None,
    };
    let insufficient_data = summary_a.insufficient_data || summary_b.insufficient_data;

    let mut out = PairwiseComparison {
        group_a: a.name.clone(),
        group_b: b.name.clone(),
        mean_difference,
        effect_size: None,
        u_statistic: None,
        z_score: None,
        p_value: None,
        significant: false,
        insufficient_data,
    };
    if insufficient_data {
        return out;
    }

    out.effect_size = cohens_d(&a.values, &b.values);
    let test = mann_whitney(&a.values, &b.values);
    out.u_statistic = Some(test.u);
    out.z_score = Some(test.z);
    out.p_value = Some(test.p_value);
    out.significant = test.p_value < alpha;
    out
}

pub fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    Some(values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64)
}

/// Standardized mean difference using the pooled sample standard deviation.
pub fn cohens_d(a: &[f64], b: &[f64]) -> Option<f64> {
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    let pooled = ((n1 - 1.0) * sample_variance(a)? + (n2 - 1.0) * sample_variance(b)?)
        / (n1 + n2 - 2.0);
    if pooled <= f64::EPSILON {
        return None;
    }
    Some((mean(a)? - mean(b)?) / pooled.sqrt())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankSumTest {
    pub u: f64,
    pub z: f64,
    pub p_value: f64,
}

/// Two-sided Mann-Whitney U. `u` is the statistic for `a`; `z` is positive
/// when `a` tends to rank higher.
pub fn mann_whitney(a: &[f64], b: &[f64]) -> RankSumTest {
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    let n = n1 + n2;

    let mut pooled: Vec<(f64, bool)> = a
        .iter()
        .map(|&v| (v, true))
        .chain(b.iter().map(|&v| (v, false)))
        .collect();
    pooled.sort_by(|x, y| x.0.total_cmp(&y.0));

    // Average ranks over tie runs, accumulating the tie correction.
    let mut rank_sum_a = 0.0;
    let mut tie_term = 0.0;
    let mut i = 0;
    while i < pooled.len() {
        let mut j = i;
        while j + 1 < pooled.len() && pooled[j + 1].0 == pooled[i].0 {
            j += 1;
        }
        let run = (j - i + 1) as f64;
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        rank_sum_a += pooled[i..=j].iter().filter(|(_, in_a)| *in_a).count() as f64 * avg_rank;
        tie_term += run.powi(3) - run;
        i = j + 1;
    }

    let u = rank_sum_a - n1 * (n1 + 1.0) / 2.0;
    let mu = n1 * n2 / 2.0;
    let variance = n1 * n2 / 12.0 * ((n + 1.0) - tie_term / (n * (n - 1.0)));
    if variance <= 0.0 || !variance.is_finite() {
        return RankSumTest {
            u,
            z: 0.0,
            p_value: 1.0,
        };
    }

    let diff = u - mu;
    let corrected = (diff.abs() - 0.5).max(0.0);
    let z = corrected.copysign(diff) / variance.sqrt();
    let p_value = (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0);
    RankSumTest { u, z, p_value }
}

fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Abramowitz & Stegun 7.1.26; absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, values: &[f64]) -> CohortSample {
        CohortSample::new(name, values.to_vec())
    }

    #[test]
    fn fewer_than_two_groups_is_invalid() {
        let err = compare(&[sample("a", &[0.5; 6])], &CohortConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn duplicate_names_are_invalid() {
        let err = compare(
            &[sample("a", &[0.5; 6]), sample("a", &[0.6; 6])],
            &CohortConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn small_group_is_flagged_not_tested() {
        let small = sample("pilot", &[0.9, 0.95]);
        let large = sample("control", &[0.1, 0.2, 0.3, 0.4, 0.5, 0.2, 0.3, 0.4, 0.1, 0.2]);
        let result = compare(&[small, large], &CohortConfig::default()).unwrap();

        assert!(result.groups[0].insufficient_data);
        assert!(!result.groups[1].insufficient_data);
        let pair = &result.comparisons[0];
        assert!(pair.insufficient_data);
        assert!(!pair.significant);
        assert_eq!(pair.p_value, None);
        assert_eq!(pair.u_statistic, None);
        assert!(pair.mean_difference.is_some());
    }

    #[test]
    fn separated_groups_are_significant() {
        let low = sample("low", &[0.1, 0.2, 0.3, 0.4, 0.5]);
        let high = sample("high", &[0.6, 0.7, 0.8, 0.9, 1.0]);
        let result = compare(&[low, high], &CohortConfig::default()).unwrap();
        let pair = &result.comparisons[0];

        assert_eq!(pair.u_statistic, Some(0.0));
        let p = pair.p_value.unwrap();
        assert!((p - 0.0122).abs() < 1e-3, "{p}");
        assert!(pair.significant);
        assert!(pair.z_score.unwrap() < 0.0);
        assert!((pair.mean_difference.unwrap() + 0.5).abs() < 1e-9);
        assert!(pair.effect_size.unwrap() < -3.0);
    }

    #[test]
    fn overlapping_groups_are_not_significant() {
        let a = sample("a", &[0.5, 0.6, 0.7, 0.8, 0.9]);
        let b = sample("b", &[0.55, 0.65, 0.75, 0.85, 0.6]);
        let pair = &compare(&[a, b], &CohortConfig::default()).unwrap().comparisons[0];
        assert!(!pair.significant);
        assert!(pair.p_value.unwrap() > 0.05);
    }

    #[test]
    fn identical_values_give_p_of_one() {
        let test = mann_whitney(&[0.5; 5], &[0.5; 6]);
        assert_eq!(test.p_value, 1.0);
        assert_eq!(test.z, 0.0);
        assert_eq!(cohens_d(&[0.5; 5], &[0.5; 6]), None);
    }

    #[test]
    fn every_pair_is_compared() {
        let groups = [
            sample("a", &[0.1; 5]),
            sample("b", &[0.2; 5]),
            sample("c", &[0.3; 5]),
        ];
        let result = compare(&groups, &CohortConfig::default()).unwrap();
        let pairs: Vec<(&str, &str)> = result
            .comparisons
            .iter()
            .map(|c| (c.group_a.as_str(), c.group_b.as_str()))
            .collect();
        assert_eq!(pairs, vec![("a", "b"), ("a", "c"), ("b", "c")]);
    }

    #[test]
    fn summary_uses_sample_variance() {
        let summary = summarize(&sample("g", &[0.2, 0.4, 0.6]), &CohortConfig::default());
        assert!((summary.mean.unwrap() - 0.4).abs() < 1e-12);
        assert!((summary.variance.unwrap() - 0.04).abs() < 1e-12);
        assert!(summary.insufficient_data);
    }
}
