//! Report assembly: runs every stage over loaded tables and collects one
//! row per partition.

use crate::aggregate::{aggregate, GroupSummary, PartitionKey, Partitioning};
use crate::attribution::{match_events, AttributionPolicy, MatchStats};
use crate::confidence::{estimate_intervals, UpliftIntervals};
use crate::conflict::resolve_conflicts;
use crate::dedup::deduplicate;
use crate::significance::{test_significance, SignificanceBasis, SignificanceResult};
use crate::uplift::{calculate_uplift, Degeneracy, UpliftResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info, warn};
use uplift_core::{
    stable_hash, DataSource, DateRange, DedupStrategy, EventTable, MarkTable, ReportConfig,
    ReportResult, UserId,
};

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub partition: PartitionKey,
    /// Display form of the partition key (`total`, a group label, `c_<id>`).
    pub label: String,
    pub test: GroupSummary,
    pub control: GroupSummary,
    pub uplift: UpliftResult,
    pub significance: SignificanceResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intervals: Option<UpliftIntervals>,
    /// Union of the stage flags, sorted.
    pub flags: Vec<Degeneracy>,
}

impl ReportRow {
    pub fn is_valid(&self) -> bool {
        self.uplift.is_valid()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub enabled: bool,
    pub strategy: DedupStrategy,
    pub window_secs: i64,
    pub collapsed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpliftReport {
    pub customer: String,
    pub revenue_event: String,
    pub dates: DateRange,
    pub attribution_dates: DateRange,
    pub confidence_level: f64,
    pub rows: Vec<ReportRow>,
    /// Users dropped for carrying both group labels.
    pub removed_users: BTreeSet<UserId>,
    pub match_stats: MatchStats,
    pub dedup_stats: DedupStats,
}

impl UpliftReport {
    pub fn row(&self, key: &PartitionKey) -> Option<&ReportRow> {
        self.rows.iter().find(|r| &r.partition == key)
    }

    pub fn total(&self) -> Option<&ReportRow> {
        self.row(&PartitionKey::Total)
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

fn timed<T>(stage: &'static str, run: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let out = run();
    let elapsed = started.elapsed();
    metrics::histogram!("uplift.stage.duration_seconds", "stage" => stage)
        .record(elapsed.as_secs_f64());
    debug!(stage, elapsed_ms = elapsed.as_millis() as u64, "Stage finished");
    out
}

/// Runs conflict resolution, attribution, deduplication, aggregation and
/// the per-partition statistics over already loaded tables.
///
/// Pure given its inputs: the same tables and configuration always produce
/// the same report, bootstrap bounds included.
pub fn run_report(
    config: &ReportConfig,
    marks: MarkTable,
    events: &EventTable,
) -> ReportResult<UpliftReport> {
    config.validate()?;
    let named_groups = config.named_groups()?;

    let resolved = timed("conflicts", || resolve_conflicts(marks));

    let policy = AttributionPolicy {
        window: config.attribution_range(),
        revenue_event: &config.revenue_event,
        focus_campaigns: &config.focus_campaigns,
    };
    let matched = timed("attribution", || match_events(&resolved.table, events, &policy));

    let deduplicated = timed("dedup", || {
        deduplicate(matched.attributions, config.use_deduplication, &config.dedup)
    });

    let partitioning = Partitioning {
        per_campaign: config.per_campaign_results,
        named_groups,
    };
    let partitions = timed("aggregate", || {
        aggregate(&resolved.table, &deduplicated.attributions, &partitioning)
    });

    let alpha = if config.significance.bonferroni_correction {
        config.alpha() / partitions.len().max(1) as f64
    } else {
        config.alpha()
    };
    let basis = if config.use_converters_for_significance {
        SignificanceBasis::Converters
    } else {
        SignificanceBasis::Conversions
    };

    let rows: Vec<ReportRow> = timed("statistics", || {
        partitions
            .iter()
            .map(|partition| {
                let label = partition.key.to_string();
                let uplift = calculate_uplift(&partition.test, &partition.control);
                let significance = test_significance(
                    &partition.test,
                    &partition.control,
                    basis,
                    alpha,
                    config.significance.min_group_size,
                );
                let intervals = config.bootstrap.size.and_then(|size| {
                    let seed = config.bootstrap.seed.wrapping_add(stable_hash(&label));
                    estimate_intervals(partition, config.confidence_level, size, seed)
                });

                let mut flags: BTreeSet<Degeneracy> = uplift.flags.iter().copied().collect();
                flags.extend(significance.flags.iter().copied());
                if let Some(intervals) = &intervals {
                    flags.extend(intervals.flags.iter().copied());
                }
                let flags: Vec<Degeneracy> = flags.into_iter().collect();

                if !uplift.is_valid() {
                    warn!(partition = %label, flags = ?flags, "Partition has no usable comparison");
                }

                ReportRow {
                    partition: partition.key.clone(),
                    label,
                    test: partition.test.clone(),
                    control: partition.control.clone(),
                    uplift,
                    significance,
                    intervals,
                    flags,
                }
            })
            .collect()
    });

    info!(
        customer = %config.customer,
        partitions = rows.len(),
        removed_users = resolved.removed_users(),
        matched_events = matched.stats.events_matched,
        collapsed_duplicates = deduplicated.collapsed,
        "Uplift report ready"
    );

    Ok(UpliftReport {
        customer: config.customer.clone(),
        revenue_event: config.revenue_event.clone(),
        dates: config.dates,
        attribution_dates: config.attribution_range(),
        confidence_level: config.confidence_level,
        rows,
        removed_users: resolved.removed,
        match_stats: matched.stats,
        dedup_stats: DedupStats {
            enabled: config.use_deduplication,
            strategy: config.dedup.strategy,
            window_secs: config.dedup.window_secs,
            collapsed: deduplicated.collapsed,
        },
    })
}

/// Validates the configuration, loads both tables from `source` and runs
/// the report. Nothing is loaded when validation fails.
pub fn generate_report(
    config: &ReportConfig,
    source: &dyn DataSource,
) -> ReportResult<UpliftReport> {
    config.validate()?;

    let marks = source.load_marks_and_spend(
        &config.customer,
        &config.audiences,
        config.campaigns.as_deref(),
        &config.dates,
    )?;
    let events = source.load_events(
        &config.customer,
        &config.audiences,
        &config.attribution_range(),
        &config.revenue_event,
    )?;

    run_report(config, marks, &events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use std::cell::Cell;
    use uplift_core::{AbGroup, CampaignId, Event, Mark, ReportError};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn config() -> ReportConfig {
        ReportConfig::new("acme", vec!["aud".to_string()], "purchase", DateRange::single(day()))
    }

    fn tables() -> (MarkTable, EventTable) {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let marks = MarkTable::new(
            vec![
                Mark {
                    user_id: "u1".to_string(),
                    campaign_id: 1,
                    group: AbGroup::Test,
                    timestamp: t0,
                    spend: 1.0,
                },
                Mark {
                    user_id: "u2".to_string(),
                    campaign_id: 1,
                    group: AbGroup::Control,
                    timestamp: t0,
                    spend: 0.0,
                },
            ],
            vec![],
        );
        let events = EventTable::new(vec![
            Event {
                user_id: "u1".to_string(),
                event_type: "purchase".to_string(),
                timestamp: t0 + Duration::hours(1),
                revenue: 10.0,
            },
            Event {
                user_id: "u2".to_string(),
                event_type: "purchase".to_string(),
                timestamp: t0 + Duration::hours(1),
                revenue: 4.0,
            },
        ]);
        (marks, events)
    }

    struct CountingSource {
        calls: Cell<usize>,
    }

    impl DataSource for CountingSource {
        fn load_marks_and_spend(
            &self,
            _customer: &str,
            _audiences: &[String],
            _campaigns: Option<&[CampaignId]>,
            _dates: &DateRange,
        ) -> ReportResult<MarkTable> {
            self.calls.set(self.calls.get() + 1);
            Ok(tables().0)
        }

        fn load_events(
            &self,
            _customer: &str,
            _audiences: &[String],
            _dates: &DateRange,
            _revenue_event: &str,
        ) -> ReportResult<EventTable> {
            self.calls.set(self.calls.get() + 1);
            Ok(tables().1)
        }
    }

    #[test]
    fn test_two_user_report() {
        let (marks, events) = tables();
        let report = run_report(&config(), marks, &events).unwrap();
        assert_eq!(report.rows.len(), 1);
        let total = report.total().unwrap();
        assert_eq!(total.label, "total");
        assert!((total.uplift.incremental_revenue - 6.0).abs() < 1e-12);
        assert!((total.uplift.iroas - 6.0).abs() < 1e-12);
        assert!(total.flags.contains(&Degeneracy::InsufficientSample));
        assert!(total.intervals.is_none());
    }

    #[test]
    fn test_invalid_config_loads_nothing() {
        let source = CountingSource { calls: Cell::new(0) };
        let mut config = config();
        config.confidence_level = 1.5;
        let err = generate_report(&config, &source).unwrap_err();
        assert!(matches!(err, ReportError::Config(_)));
        assert_eq!(source.calls.get(), 0);
    }

    #[test]
    fn test_generate_report_loads_both_tables() {
        let source = CountingSource { calls: Cell::new(0) };
        let report = generate_report(&config(), &source).unwrap();
        assert_eq!(source.calls.get(), 2);
        assert_eq!(report.match_stats.events_matched, 2);
    }

    #[test]
    fn test_bonferroni_divides_alpha_by_rows() {
        let (marks, events) = tables();
        let mut config = config();
        config.per_campaign_results = true;
        config.significance.bonferroni_correction = true;
        let report = run_report(&config, marks, &events).unwrap();
        assert_eq!(report.rows.len(), 2);
        for row in &report.rows {
            assert!((row.significance.alpha - 0.025).abs() < 1e-12);
        }
    }
}
