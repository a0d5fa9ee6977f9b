//! Two-proportion significance test between the test and control group.

use crate::aggregate::GroupSummary;
use crate::uplift::Degeneracy;
use serde::{Deserialize, Serialize};

/// Which count is compared between the groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignificanceBasis {
    /// `n_conversions / n_users`.
    Conversions,
    /// `n_converters / n_users`.
    Converters,
}

impl SignificanceBasis {
    fn successes(&self, summary: &GroupSummary) -> u64 {
        match self {
            SignificanceBasis::Conversions => summary.n_conversions,
            SignificanceBasis::Converters => summary.n_converters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceResult {
    pub requested_basis: SignificanceBasis,
    pub basis: SignificanceBasis,
    /// True when conversions exceeded users and converters were used instead.
    pub fell_back: bool,
    pub z_score: f64,
    /// 2x2 chi-square statistic without continuity correction, `z²`.
    pub chi_squared: f64,
    pub p_value: f64,
    /// Threshold `p_value` was compared against.
    pub alpha: f64,
    pub significant: bool,
    /// Both groups reached the minimum size.
    pub reliable: bool,
    pub flags: Vec<Degeneracy>,
}

/// Upper tail of the standard normal, Abramowitz and Stegun 26.2.17.
fn normal_upper_tail(z: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.2316419 * z);
    let d = 0.3989422804014327;
    d * (-z * z / 2.0).exp()
        * (t * (0.3193815 + t * (-0.3565638 + t * (1.781478 + t * (-1.821256 + t * 1.330274)))))
}

/// Pooled two-proportion z statistic. `None` when a group is empty or the
/// pooled variance is zero.
pub fn two_proportion_z(x1: u64, n1: u64, x2: u64, n2: u64) -> Option<f64> {
    if n1 == 0 || n2 == 0 {
        return None;
    }
    let p1 = x1 as f64 / n1 as f64;
    let p2 = x2 as f64 / n2 as f64;
    let p = (x1 + x2) as f64 / (n1 + n2) as f64;
    let se = (p * (1.0 - p) * (1.0 / n1 as f64 + 1.0 / n2 as f64)).sqrt();
    if se == 0.0 {
        return None;
    }
    Some((p1 - p2) / se)
}

/// Two-sided p-value of a z statistic.
pub fn two_sided_p_value(z: f64) -> f64 {
    (2.0 * normal_upper_tail(z.abs())).clamp(0.0, 1.0)
}

/// Tests whether the test group's rate differs from the control group's.
///
/// When the conversion basis is requested but either group has more
/// conversions than users, the rates are not proportions and the converter
/// basis is used instead. Groups smaller than `min_group_size` make the
/// verdict unreliable but still produce one.
pub fn test_significance(
    test: &GroupSummary,
    control: &GroupSummary,
    requested_basis: SignificanceBasis,
    alpha: f64,
    min_group_size: u64,
) -> SignificanceResult {
    let mut flags = Vec::new();

    let over_unity = |s: &GroupSummary| s.n_conversions > s.n_users;
    let fell_back = requested_basis == SignificanceBasis::Conversions
        && (over_unity(test) || over_unity(control));
    let basis = if fell_back {
        SignificanceBasis::Converters
    } else {
        requested_basis
    };

    let reliable = test.n_users >= min_group_size && control.n_users >= min_group_size;
    if !reliable {
        flags.push(Degeneracy::InsufficientSample);
    }

    let z = two_proportion_z(
        basis.successes(test),
        test.n_users,
        basis.successes(control),
        control.n_users,
    );
    let (z_score, p_value) = match z {
        Some(z) => (z, two_sided_p_value(z)),
        None => {
            if test.n_users == 0 {
                flags.push(Degeneracy::NoTestUsers);
            }
            if control.n_users == 0 {
                flags.push(Degeneracy::NoControlUsers);
            }
            if test.n_users > 0 && control.n_users > 0 {
                flags.push(Degeneracy::ZeroVariance);
            }
            (0.0, 1.0)
        }
    };

    SignificanceResult {
        requested_basis,
        basis,
        fell_back,
        z_score,
        chi_squared: z_score * z_score,
        p_value,
        alpha,
        significant: z.is_some() && p_value < alpha,
        reliable,
        flags,
    }
}
