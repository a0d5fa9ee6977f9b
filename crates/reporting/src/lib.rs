//! Uplift computation: conflict resolution, first-touch attribution,
//! deduplication, aggregation, uplift KPIs, significance and confidence
//! intervals, assembled into a report.

pub mod aggregate;
pub mod attribution;
pub mod confidence;
pub mod conflict;
pub mod dedup;
pub mod report;
pub mod significance;
pub mod uplift;

pub use aggregate::{aggregate, GroupSummary, PartitionKey, PartitionSummary, Partitioning};
pub use attribution::{match_events, Attribution, AttributionPolicy, AttributionSet, MatchStats};
pub use confidence::{estimate_intervals, ConfidenceInterval, UpliftIntervals};
pub use conflict::{resolve_conflicts, ResolvedMarks};
pub use dedup::{deduplicate, Deduplicated};
pub use report::{generate_report, run_report, DedupStats, ReportRow, UpliftReport};
pub use significance::{test_significance, SignificanceBasis, SignificanceResult};
pub use uplift::{calculate_uplift, Degeneracy, UpliftResult};
