//! Confidence intervals for the incremental KPIs.
//!
//! Converters follow a binomial model of the control group. Conversions and
//! revenue are not proportions, so their control means are bootstrapped.

use crate::aggregate::PartitionSummary;
use crate::uplift::Degeneracy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpliftIntervals {
    pub confidence_level: f64,
    /// Resamples actually drawn.
    pub bootstrap_size: usize,
    pub incremental_converters: ConfidenceInterval,
    pub cost_per_incremental_converter: Option<ConfidenceInterval>,
    pub incremental_conversions: ConfidenceInterval,
    pub icpa: Option<ConfidenceInterval>,
    pub cvr_uplift: Option<ConfidenceInterval>,
    pub incremental_revenue: ConfidenceInterval,
    pub iroas: Option<ConfidenceInterval>,
    pub flags: Vec<Degeneracy>,
}

/// Smallest `k` with `P(X <= k) >= q` for `X ~ Binomial(n, p)`.
///
/// The pmf is walked in log space so large `n` does not overflow the
/// binomial coefficients.
pub fn binomial_quantile(n: u64, p: f64, q: f64) -> u64 {
    if n == 0 || p <= 0.0 || q <= 0.0 {
        return 0;
    }
    if p >= 1.0 || q >= 1.0 {
        return n;
    }
    let ln_odds = (p / (1.0 - p)).ln();
    let mut ln_pmf = n as f64 * (1.0 - p).ln();
    let mut cdf = 0.0;
    for k in 0..n {
        cdf += ln_pmf.exp();
        if cdf >= q {
            return k;
        }
        ln_pmf += ((n - k) as f64 / (k + 1) as f64).ln() + ln_odds;
    }
    n
}

/// Resample count used for a requested size. Sizes ending in zero drop one
/// resample so the order-statistic indices fall on whole positions.
pub fn effective_bootstrap_size(requested: usize) -> usize {
    if requested > 0 && requested % 10 == 0 {
        requested - 1
    } else {
        requested
    }
}

fn order_statistic_indices(size: usize, confidence: f64) -> (usize, usize) {
    let tail = (1.0 - confidence) / 2.0;
    let scale = (size + 1) as f64;
    let last = size.saturating_sub(1);
    let lower = ((tail * scale) as usize).min(last);
    let upper = (((tail + confidence) * scale) as usize).min(last);
    (lower, upper)
}

/// Two-sided interval of the sample mean from `size` resamples with
/// replacement. `None` for an empty sample.
pub fn bootstrap_mean_interval(
    sample: &[f64],
    size: usize,
    confidence: f64,
    rng: &mut StdRng,
) -> Option<ConfidenceInterval> {
    if sample.is_empty() || size == 0 {
        return None;
    }
    let n = sample.len();
    let mut means: Vec<f64> = (0..size)
        .map(|_| (0..n).map(|_| sample[rng.gen_range(0..n)]).sum::<f64>() / n as f64)
        .collect();
    means.sort_by(f64::total_cmp);

    let (lower, upper) = order_statistic_indices(size, confidence);
    Some(ConfidenceInterval {
        lower: means[lower],
        upper: means[upper],
    })
}

/// Interval of `spend / incremental` over an incremental interval. `None`
/// when the interval reaches zero or below, where the ratio flips sign.
fn cost_interval(spend: f64, incremental: ConfidenceInterval) -> Option<ConfidenceInterval> {
    (spend > 0.0 && incremental.lower > 0.0).then(|| ConfidenceInterval {
        lower: spend / incremental.upper,
        upper: spend / incremental.lower,
    })
}

/// Estimates intervals for one partition. `None` when either group is
/// empty. The generator is seeded from `seed`, so equal inputs give equal
/// bounds.
pub fn estimate_intervals(
    partition: &PartitionSummary,
    confidence: f64,
    bootstrap_size: usize,
    seed: u64,
) -> Option<UpliftIntervals> {
    let test = &partition.test;
    let control = &partition.control;
    if test.n_users == 0 || control.n_users == 0 {
        return None;
    }
    let size = effective_bootstrap_size(bootstrap_size);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut flags = Vec::new();

    let n_test = test.n_users as f64;
    let n_control = control.n_users as f64;
    let ratio = n_test / n_control;
    let spend = test.total_spend;
    let tail = (1.0 - confidence) / 2.0;

    let control_rate = control.n_converters as f64 / n_control;
    let baseline_low = binomial_quantile(control.n_users, control_rate, tail) as f64;
    let baseline_high = binomial_quantile(control.n_users, control_rate, tail + confidence) as f64;
    let incremental_converters = ConfidenceInterval {
        lower: test.n_converters as f64 - baseline_high * ratio,
        upper: test.n_converters as f64 - baseline_low * ratio,
    };

    let conversions: Vec<f64> = partition
        .control_outcomes
        .iter()
        .map(|o| o.conversions as f64)
        .collect();
    let revenue: Vec<f64> = partition.control_outcomes.iter().map(|o| o.revenue).collect();
    let conversion_mean = bootstrap_mean_interval(&conversions, size, confidence, &mut rng)?;
    let revenue_mean = bootstrap_mean_interval(&revenue, size, confidence, &mut rng)?;

    let scale = n_control * ratio;
    let baseline_conversions = ConfidenceInterval {
        lower: conversion_mean.lower * scale,
        upper: conversion_mean.upper * scale,
    };
    let incremental_conversions = ConfidenceInterval {
        lower: test.n_conversions as f64 - baseline_conversions.upper,
        upper: test.n_conversions as f64 - baseline_conversions.lower,
    };

    let test_cvr = test.n_conversions as f64 / n_test;
    let cvr_uplift = (control.n_conversions > 0 && baseline_conversions.lower > 0.0).then(|| {
        ConfidenceInterval {
            lower: test_cvr / (baseline_conversions.upper / n_test) - 1.0,
            upper: test_cvr / (baseline_conversions.lower / n_test) - 1.0,
        }
    });

    let incremental_revenue = ConfidenceInterval {
        lower: test.total_revenue - revenue_mean.upper * scale,
        upper: test.total_revenue - revenue_mean.lower * scale,
    };
    let iroas = (spend > 0.0).then(|| ConfidenceInterval {
        lower: incremental_revenue.lower / spend,
        upper: incremental_revenue.upper / spend,
    });

    let cost_per_incremental_converter = cost_interval(spend, incremental_converters);
    let icpa = cost_interval(spend, incremental_conversions);
    if spend > 0.0 && (cost_per_incremental_converter.is_none() || icpa.is_none()) {
        flags.push(Degeneracy::UninterpretableCostInterval);
    }

    Some(UpliftIntervals {
        confidence_level: confidence,
        bootstrap_size: size,
        incremental_converters,
        cost_per_incremental_converter,
        incremental_conversions,
        icpa,
        cvr_uplift,
        incremental_revenue,
        iroas,
        flags,
    })
}
