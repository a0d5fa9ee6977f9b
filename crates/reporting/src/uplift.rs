//! Incremental revenue, iROAS and the derived KPIs of one partition.

use crate::aggregate::GroupSummary;
use serde::{Deserialize, Serialize};

/// Reason a partition's numbers are undefined or must be read with care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Degeneracy {
    NoTestUsers,
    NoControlUsers,
    ZeroSpend,
    InsufficientSample,
    ZeroVariance,
    NonPositiveIncrementalConversions,
    NonPositiveIncrementalConverters,
    ZeroControlConversionRate,
    UninterpretableCostInterval,
}

impl Degeneracy {
    /// Whether the flag makes every incremental figure undefined.
    pub fn invalidates(&self) -> bool {
        matches!(self, Degeneracy::NoTestUsers | Degeneracy::NoControlUsers)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpliftResult {
    /// `test.n_users / control.n_users`.
    pub ratio: f64,
    pub ad_spend: f64,
    pub scaled_control_revenue: f64,
    pub scaled_control_conversions: f64,
    pub scaled_control_converters: f64,
    pub incremental_revenue: f64,
    pub incremental_conversions: f64,
    pub incremental_converters: f64,
    /// NaN when spend is zero or the partition is invalid.
    pub iroas: f64,
    pub icpa: Option<f64>,
    pub cost_per_incremental_converter: Option<f64>,
    pub test_cvr: Option<f64>,
    pub control_cvr: Option<f64>,
    pub cvr_uplift: Option<f64>,
    pub revenue_per_conversion_test: Option<f64>,
    pub revenue_per_conversion_control: Option<f64>,
    pub flags: Vec<Degeneracy>,
}

impl UpliftResult {
    pub fn is_valid(&self) -> bool {
        !self.flags.iter().any(Degeneracy::invalidates)
    }

    pub fn has_flag(&self, flag: Degeneracy) -> bool {
        self.flags.contains(&flag)
    }
}

/// `spend / incremental`, only when both are positive.
fn cost_per(spend: f64, incremental: f64) -> Option<f64> {
    (spend > 0.0 && incremental > 0.0).then(|| spend / incremental)
}

/// Computes the uplift of `test` over `control`, scaling the control group
/// to the size of the test group:
///
/// `incremental_revenue = test.revenue - control.revenue * (n_test / n_control)`
///
/// Undefined quantities are NaN or `None` and always carry a flag.
pub fn calculate_uplift(test: &GroupSummary, control: &GroupSummary) -> UpliftResult {
    let mut flags = Vec::new();
    let spend = test.total_spend;

    if test.n_users == 0 {
        flags.push(Degeneracy::NoTestUsers);
    }
    if control.n_users == 0 {
        flags.push(Degeneracy::NoControlUsers);
    }
    if spend <= 0.0 {
        flags.push(Degeneracy::ZeroSpend);
    }

    let test_cvr = test.conversion_rate();
    let control_cvr = control.conversion_rate();
    let revenue_per_conversion_test = test.revenue_per_conversion();
    let revenue_per_conversion_control = control.revenue_per_conversion();

    if test.n_users == 0 || control.n_users == 0 {
        return UpliftResult {
            ratio: f64::NAN,
            ad_spend: spend,
            scaled_control_revenue: f64::NAN,
            scaled_control_conversions: f64::NAN,
            scaled_control_converters: f64::NAN,
            incremental_revenue: f64::NAN,
            incremental_conversions: f64::NAN,
            incremental_converters: f64::NAN,
            iroas: f64::NAN,
            icpa: None,
            cost_per_incremental_converter: None,
            test_cvr,
            control_cvr,
            cvr_uplift: None,
            revenue_per_conversion_test,
            revenue_per_conversion_control,
            flags,
        };
    }

    let ratio = test.n_users as f64 / control.n_users as f64;
    let scaled_control_revenue = control.total_revenue * ratio;
    let scaled_control_conversions = control.n_conversions as f64 * ratio;
    let scaled_control_converters = control.n_converters as f64 * ratio;

    let incremental_revenue = test.total_revenue - scaled_control_revenue;
    let incremental_conversions = test.n_conversions as f64 - scaled_control_conversions;
    let incremental_converters = test.n_converters as f64 - scaled_control_converters;

    let iroas = if spend > 0.0 {
        incremental_revenue / spend
    } else {
        f64::NAN
    };

    if incremental_conversions <= 0.0 {
        flags.push(Degeneracy::NonPositiveIncrementalConversions);
    }
    if incremental_converters <= 0.0 {
        flags.push(Degeneracy::NonPositiveIncrementalConverters);
    }

    let cvr_uplift = match (test_cvr, control_cvr) {
        (Some(t), Some(c)) if c > 0.0 => Some(t / c - 1.0),
        _ => {
            flags.push(Degeneracy::ZeroControlConversionRate);
            None
        }
    };

    UpliftResult {
        ratio,
        ad_spend: spend,
        scaled_control_revenue,
        scaled_control_conversions,
        scaled_control_converters,
        incremental_revenue,
        incremental_conversions,
        incremental_converters,
        iroas,
        icpa: cost_per(spend, incremental_conversions),
        cost_per_incremental_converter: cost_per(spend, incremental_converters),
        test_cvr,
        control_cvr,
        cvr_uplift,
        revenue_per_conversion_test,
        revenue_per_conversion_control,
        flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uplift_core::AbGroup;

    fn summary(
        group: AbGroup,
        users: u64,
        converters: u64,
        conversions: u64,
        revenue: f64,
        spend: f64,
    ) -> GroupSummary {
        GroupSummary {
            group,
            n_users: users,
            n_converters: converters,
            n_conversions: conversions,
            total_revenue: revenue,
            total_spend: spend,
        }
    }

    #[test]
    fn test_single_user_scenario() {
        let test = summary(AbGroup::Test, 1, 1, 1, 10.0, 1.0);
        let control = summary(AbGroup::Control, 1, 1, 1, 4.0, 0.0);
        let result = calculate_uplift(&test, &control);
        assert!((result.ratio - 1.0).abs() < 1e-12);
        assert!((result.incremental_revenue - 6.0).abs() < 1e-12);
        assert!((result.iroas - 6.0).abs() < 1e-12);
        assert!(result.is_valid());
        assert_eq!(result.icpa, None);
        assert!(result.has_flag(Degeneracy::NonPositiveIncrementalConversions));
    }

    #[test]
    fn test_control_scaled_to_test_size() {
        let test = summary(AbGroup::Test, 1000, 60, 80, 800.0, 100.0);
        let control = summary(AbGroup::Control, 500, 20, 30, 250.0, 0.0);
        let result = calculate_uplift(&test, &control);
        assert!((result.ratio - 2.0).abs() < 1e-12);
        assert!((result.scaled_control_revenue - 500.0).abs() < 1e-9);
        assert!((result.incremental_revenue - 300.0).abs() < 1e-9);
        assert!((result.incremental_conversions - 20.0).abs() < 1e-9);
        assert!((result.incremental_converters - 20.0).abs() < 1e-9);
        assert!((result.iroas - 3.0).abs() < 1e-9);
        assert!((result.icpa.unwrap() - 5.0).abs() < 1e-9);
        assert!((result.cost_per_incremental_converter.unwrap() - 5.0).abs() < 1e-9);
        // 0.08 / 0.06 - 1
        assert!((result.cvr_uplift.unwrap() - (1.0 / 3.0)).abs() < 1e-9);
        assert!((result.revenue_per_conversion_test.unwrap() - 10.0).abs() < 1e-9);
        assert!(result.flags.is_empty());
    }

    #[test]
    fn test_zero_spend_gives_nan_iroas() {
        let test = summary(AbGroup::Test, 10, 2, 2, 20.0, 0.0);
        let control = summary(AbGroup::Control, 10, 1, 1, 5.0, 0.0);
        let result = calculate_uplift(&test, &control);
        assert!(result.iroas.is_nan());
        assert!((result.incremental_revenue - 15.0).abs() < 1e-12);
        assert!(result.has_flag(Degeneracy::ZeroSpend));
        assert!(result.is_valid());
    }

    #[test]
    fn test_empty_control_is_invalid() {
        let test = summary(AbGroup::Test, 10, 2, 2, 20.0, 3.0);
        let control = GroupSummary::empty(AbGroup::Control);
        let result = calculate_uplift(&test, &control);
        assert!(result.incremental_revenue.is_nan());
        assert!(result.iroas.is_nan());
        assert!(!result.is_valid());
        assert!(result.has_flag(Degeneracy::NoControlUsers));
    }

    #[test]
    fn test_both_groups_empty() {
        let result = calculate_uplift(
            &GroupSummary::empty(AbGroup::Test),
            &GroupSummary::empty(AbGroup::Control),
        );
        assert!(result.has_flag(Degeneracy::NoTestUsers));
        assert!(result.has_flag(Degeneracy::NoControlUsers));
        assert!(result.ratio.is_nan());
    }

    #[test]
    fn test_flags_serialize_snake_case() {
        let json = serde_json::to_string(&Degeneracy::NoControlUsers).unwrap();
        assert_eq!(json, "\"no_control_users\"");
    }
}
