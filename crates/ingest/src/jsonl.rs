//! Local data source reading one newline-delimited JSON file per audience
//! and day:
//!
//! ```text
//! <root>/<customer>/<audience>/marks_and_spend/<YYYYMMDD>.jsonl
//! <root>/<customer>/<audience>/attributions/<YYYYMMDD>.jsonl
//! ```

use crate::schema::{events_from_rows, marks_from_rows, IngestStats, RawRow};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uplift_core::{
    CampaignId, DataSource, DateRange, EventTable, MarkTable, ReportError, ReportResult,
};

pub const SOURCE_MARKS_AND_SPEND: &str = "marks_and_spend";
pub const SOURCE_ATTRIBUTIONS: &str = "attributions";

/// Reads the marks-and-spend and attribution feeds from a local directory tree.
pub struct JsonLinesSource {
    root: PathBuf,
}

impl JsonLinesSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of one day's file for an audience and feed.
    pub fn day_file(
        &self,
        customer: &str,
        audience: &str,
        source: &str,
        day: chrono::NaiveDate,
    ) -> PathBuf {
        self.root
            .join(customer)
            .join(audience)
            .join(source)
            .join(format!("{}.jsonl", day.format("%Y%m%d")))
    }

    /// Every file for the given audiences and days that exists on disk.
    /// Missing days are skipped with a warning.
    fn existing_files(
        &self,
        customer: &str,
        audiences: &[String],
        source: &str,
        dates: &DateRange,
    ) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for audience in audiences {
            for day in dates.days() {
                let path = self.day_file(customer, audience, source, day);
                if path.is_file() {
                    files.push(path);
                } else {
                    warn!(
                        audience = %audience,
                        source,
                        day = %day,
                        path = %path.display(),
                        "No data file, skipping"
                    );
                }
            }
        }
        files
    }
}

fn read_rows(path: &Path) -> ReportResult<Vec<RawRow>> {
    let file = File::open(path).map_err(|e| {
        ReportError::DataSource(format!("cannot open {}: {}", path.display(), e))
    })?;
    let mut rows = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row: RawRow = serde_json::from_str(&line).map_err(|e| {
            ReportError::DataSource(format!(
                "{} line {}: malformed row: {}",
                path.display(),
                index + 1,
                e
            ))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

impl DataSource for JsonLinesSource {
    fn load_marks_and_spend(
        &self,
        customer: &str,
        audiences: &[String],
        campaigns: Option<&[CampaignId]>,
        dates: &DateRange,
    ) -> ReportResult<MarkTable> {
        let mut table = MarkTable::default();
        let mut stats = IngestStats::default();

        for path in self.existing_files(customer, audiences, SOURCE_MARKS_AND_SPEND, dates) {
            let started = std::time::Instant::now();
            let rows = read_rows(&path)?;
            let (mut part, part_stats) =
                marks_from_rows(&path.display().to_string(), rows)?;
            if let Some(campaigns) = campaigns {
                part.marks.retain(|m| campaigns.contains(&m.campaign_id));
                part.spend.retain(|s| campaigns.contains(&s.campaign_id));
            }
            debug!(
                path = %path.display(),
                marks = part.marks.len(),
                spend_rows = part.spend.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Loaded marks and spend file"
            );
            table.extend(part);
            stats.merge(part_stats);
        }

        info!(
            marks = table.marks.len(),
            spend_rows = table.spend.len(),
            rows_read = stats.rows_read,
            dropped_no_group = stats.dropped_no_group,
            dropped_no_user = stats.dropped_no_user,
            "Marks and spend loaded"
        );
        Ok(table)
    }

    fn load_events(
        &self,
        customer: &str,
        audiences: &[String],
        dates: &DateRange,
        revenue_event: &str,
    ) -> ReportResult<EventTable> {
        let mut table = EventTable::default();
        let mut stats = IngestStats::default();

        for path in self.existing_files(customer, audiences, SOURCE_ATTRIBUTIONS, dates) {
            let rows = read_rows(&path)?;
            let (part, part_stats) =
                events_from_rows(&path.display().to_string(), rows, Some(revenue_event))?;
            table.extend(part);
            stats.merge(part_stats);
        }

        info!(
            events = table.len(),
            revenue_event,
            rows_read = stats.rows_read,
            other_events = stats.dropped_other_kind,
            "Events loaded"
        );
        Ok(table)
    }
}
