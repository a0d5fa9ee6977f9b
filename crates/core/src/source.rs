//! Boundary to whatever retrieves the raw marks-and-spend and event feeds.

use crate::error::ReportResult;
use crate::types::{CampaignId, DateRange, EventTable, MarkTable};

/// Yields the two tabular datasets the report is computed from.
///
/// Any error returned here is fatal for the whole run; rows are never
/// recovered individually.
pub trait DataSource {
    fn load_marks_and_spend(
        &self,
        customer: &str,
        audiences: &[String],
        campaigns: Option<&[CampaignId]>,
        dates: &DateRange,
    ) -> ReportResult<MarkTable>;

    fn load_events(
        &self,
        customer: &str,
        audiences: &[String],
        dates: &DateRange,
        revenue_event: &str,
    ) -> ReportResult<EventTable>;
}
