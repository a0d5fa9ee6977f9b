//! Raw feed rows to typed records. Column presence and types are checked
//! here, once; downstream stages only ever see `Mark`, `SpendEntry` and
//! `Event`.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uplift_core::{
    AbGroup, CampaignId, Event, EventTable, Mark, MarkTable, ReportError, ReportResult,
    SpendEntry,
};

/// One row of a raw feed, keyed by column name.
pub type RawRow = Map<String, Value>;

pub const MARK_EVENT: &str = "mark";
pub const SPEND_EVENT: &str = "buying_conversion";

const MICROS: f64 = 1_000_000.0;

/// Counters describing what ingestion kept and what it filtered out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub rows_read: usize,
    pub rows_kept: usize,
    /// `ab_test_group` was neither `test` nor `control`.
    pub dropped_no_group: usize,
    pub dropped_no_user: usize,
    /// Marks feed rows that are neither marks nor spend, or events of
    /// another type than the one requested.
    pub dropped_other_kind: usize,
}

impl IngestStats {
    pub fn merge(&mut self, other: IngestStats) {
        self.rows_read += other.rows_read;
        self.rows_kept += other.rows_kept;
        self.dropped_no_group += other.dropped_no_group;
        self.dropped_no_user += other.dropped_no_user;
        self.dropped_other_kind += other.dropped_other_kind;
    }
}

/// A typed row from the marks-and-spend feed.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkRow {
    Mark(Mark),
    Spend(SpendEntry),
}

enum Filtered<T> {
    Keep(T),
    NoGroup,
    NoUser,
    OtherKind,
}

struct RowContext<'a> {
    table: &'a str,
    row: usize,
    raw: &'a RawRow,
}

impl<'a> RowContext<'a> {
    fn required(&self, field: &'static str) -> ReportResult<&'a Value> {
        match self.raw.get(field) {
            Some(Value::Null) | None => Err(ReportError::MissingField {
                table: self.table.to_string(),
                row: self.row,
                field,
            }),
            Some(value) => Ok(value),
        }
    }

    fn invalid(&self, field: &'static str, reason: impl Into<String>) -> ReportError {
        ReportError::InvalidValue {
            table: self.table.to_string(),
            row: self.row,
            field,
            reason: reason.into(),
        }
    }

    fn text(&self, field: &'static str) -> ReportResult<String> {
        match self.required(field)? {
            Value::String(s) => Ok(s.trim().to_string()),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(self.invalid(field, format!("expected text, got {}", other))),
        }
    }

    /// Text column whose cells may be empty. The column must exist; a null
    /// cell reads as an empty string.
    fn blankable_text(&self, field: &'static str) -> ReportResult<String> {
        match self.raw.get(field) {
            Some(Value::Null) => Ok(String::new()),
            _ => self.text(field),
        }
    }

    fn timestamp(&self, field: &'static str) -> ReportResult<DateTime<Utc>> {
        let value = self.required(field)?;
        parse_timestamp(value)
            .ok_or_else(|| self.invalid(field, format!("unrecognised timestamp {}", value)))
    }

    fn campaign(&self, field: &'static str) -> ReportResult<CampaignId> {
        match self.required(field)? {
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| self.invalid(field, format!("not a campaign id: {}", n))),
            Value::String(s) => s
                .trim()
                .parse::<CampaignId>()
                .map_err(|e| self.invalid(field, e.to_string())),
            other => Err(self.invalid(field, format!("not a campaign id: {}", other))),
        }
    }

    fn number(&self, field: &'static str, value: &Value) -> ReportResult<f64> {
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) if s.trim().is_empty() => Some(0.0),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match parsed {
            Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
            Some(v) => Err(self.invalid(field, format!("must be a non-negative amount, got {}", v))),
            None => Err(self.invalid(field, format!("not a number: {}", value))),
        }
    }

    /// Monetary amount: the scaled column wins, otherwise the micro-currency
    /// column divided by 10^6. Absent both, `required` decides between 0
    /// and an error.
    fn amount(
        &self,
        units_field: &'static str,
        micros_field: &'static str,
        required: bool,
    ) -> ReportResult<f64> {
        if let Some(value) = self.raw.get(units_field).filter(|v| !v.is_null()) {
            return self.number(units_field, value);
        }
        match self.raw.get(micros_field).filter(|v| !v.is_null()) {
            Some(value) => Ok(self.number(micros_field, value)? / MICROS),
            None if required => Err(ReportError::MissingField {
                table: self.table.to_string(),
                row: self.row,
                field: micros_field,
            }),
            None => Ok(0.0),
        }
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` (UTC) and epoch seconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| {
                n.as_f64().and_then(|secs| {
                    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
                })
            }),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(naive.and_utc());
            }
            s.parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
        }
        _ => None,
    }
}

fn mark_row_filtered(ctx: &RowContext<'_>) -> ReportResult<Filtered<MarkRow>> {
    let kind = match ctx.raw.get("event_type") {
        None | Some(Value::Null) => MARK_EVENT.to_string(),
        Some(_) => ctx.text("event_type")?,
    };
    if kind != MARK_EVENT && kind != SPEND_EVENT {
        return Ok(Filtered::OtherKind);
    }

    let group = match AbGroup::parse(&ctx.blankable_text("ab_test_group")?) {
        Some(group) => group,
        None => return Ok(Filtered::NoGroup),
    };
    let user_id = ctx.blankable_text("user_id")?;
    if user_id.is_empty() {
        return Ok(Filtered::NoUser);
    }
    let campaign_id = ctx.campaign("campaign_id")?;
    let timestamp = ctx.timestamp("ts")?;

    if kind == MARK_EVENT {
        let spend = match group {
            AbGroup::Test => ctx.amount("spend", "cost_eur", false)?,
            AbGroup::Control => 0.0,
        };
        Ok(Filtered::Keep(MarkRow::Mark(Mark {
            user_id,
            campaign_id,
            group,
            timestamp,
            spend,
        })))
    } else {
        let spend = ctx.amount("spend", "cost_eur", true)?;
        Ok(Filtered::Keep(MarkRow::Spend(SpendEntry {
            user_id,
            campaign_id,
            group,
            timestamp,
            spend,
        })))
    }
}

fn event_row_filtered(
    ctx: &RowContext<'_>,
    revenue_event: Option<&str>,
) -> ReportResult<Filtered<Event>> {
    let event_type = ctx.text("partner_event")?;
    if revenue_event.is_some_and(|wanted| wanted != event_type) {
        return Ok(Filtered::OtherKind);
    }
    let user_id = ctx.blankable_text("user_id")?;
    if user_id.is_empty() {
        return Ok(Filtered::NoUser);
    }
    let timestamp = ctx.timestamp("ts")?;
    let revenue = ctx.amount("revenue", "revenue_eur", true)?;
    Ok(Filtered::Keep(Event {
        user_id,
        event_type,
        timestamp,
        revenue,
    }))
}

fn tally<T>(stats: &mut IngestStats, filtered: Filtered<T>) -> Option<T> {
    stats.rows_read += 1;
    match filtered {
        Filtered::Keep(value) => {
            stats.rows_kept += 1;
            Some(value)
        }
        Filtered::NoGroup => {
            stats.dropped_no_group += 1;
            None
        }
        Filtered::NoUser => {
            stats.dropped_no_user += 1;
            None
        }
        Filtered::OtherKind => {
            stats.dropped_other_kind += 1;
            None
        }
    }
}

/// Parse a single marks-and-spend row; `None` if the row is filtered out.
pub fn mark_row(table: &str, row: usize, raw: &RawRow) -> ReportResult<Option<MarkRow>> {
    let ctx = RowContext { table, row, raw };
    Ok(tally(&mut IngestStats::default(), mark_row_filtered(&ctx)?))
}

/// Parse a marks-and-spend feed. `table` names the feed in error messages;
/// rows are numbered from 1.
pub fn marks_from_rows<I>(table: &str, rows: I) -> ReportResult<(MarkTable, IngestStats)>
where
    I: IntoIterator<Item = RawRow>,
{
    let mut stats = IngestStats::default();
    let mut out = MarkTable::default();
    for (index, raw) in rows.into_iter().enumerate() {
        let ctx = RowContext {
            table,
            row: index + 1,
            raw: &raw,
        };
        match tally(&mut stats, mark_row_filtered(&ctx)?) {
            Some(MarkRow::Mark(mark)) => out.marks.push(mark),
            Some(MarkRow::Spend(entry)) => out.spend.push(entry),
            None => {}
        }
    }
    Ok((out, stats))
}

/// Parse an event feed, keeping only `revenue_event` rows when given.
pub fn events_from_rows<I>(
    table: &str,
    rows: I,
    revenue_event: Option<&str>,
) -> ReportResult<(EventTable, IngestStats)>
where
    I: IntoIterator<Item = RawRow>,
{
    let mut stats = IngestStats::default();
    let mut out = EventTable::default();
    for (index, raw) in rows.into_iter().enumerate() {
        let ctx = RowContext {
            table,
            row: index + 1,
            raw: &raw,
        };
        if let Some(event) = tally(&mut stats, event_row_filtered(&ctx, revenue_event)?) {
            out.events.push(event);
        }
    }
    Ok((out, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn row(value: Value) -> RawRow {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn test_mark_and_spend_rows() {
        let rows = vec![
            row(json!({"ts": "2024-05-01 10:00:00", "user_id": "u1", "ab_test_group": "test",
                       "campaign_id": 1234, "event_type": "mark"})),
            row(json!({"ts": "2024-05-01 10:05:00", "user_id": "u1", "ab_test_group": "test",
                       "campaign_id": "1234", "event_type": "buying_conversion", "cost_eur": 2_500_000})),
            row(json!({"ts": 1714557600, "user_id": "u2", "ab_test_group": "control",
                       "campaign_id": 1234})),
        ];
        let (table, stats) = marks_from_rows("marks_and_spend", rows).unwrap();
        assert_eq!(table.marks.len(), 2);
        assert_eq!(table.spend.len(), 1);
        assert!((table.spend[0].spend - 2.5).abs() < 1e-12);
        assert_eq!(table.marks[1].group, AbGroup::Control);
        assert_eq!(
            table.marks[1].timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(stats.rows_kept, 3);
    }

    #[test]
    fn test_rows_without_group_or_user_are_dropped() {
        let rows = vec![
            row(json!({"ts": "2024-05-01T10:00:00Z", "user_id": "u1", "ab_test_group": "",
                       "campaign_id": 1})),
            row(json!({"ts": "2024-05-01T10:00:00Z", "user_id": "", "ab_test_group": "test",
                       "campaign_id": 1})),
            row(json!({"ts": "2024-05-01T10:00:00Z", "user_id": "u3", "ab_test_group": "test",
                       "campaign_id": 1, "event_type": "impression"})),
        ];
        let (table, stats) = marks_from_rows("marks_and_spend", rows).unwrap();
        assert!(table.is_empty());
        assert_eq!(stats.dropped_no_group, 1);
        assert_eq!(stats.dropped_no_user, 1);
        assert_eq!(stats.dropped_other_kind, 1);
    }

    #[test]
    fn test_null_group_or_user_cells_are_dropped() {
        let rows = vec![
            row(json!({"ts": "2024-05-01T10:00:00Z", "user_id": "u1", "ab_test_group": "test",
                       "campaign_id": 1})),
            row(json!({"ts": "2024-05-01T10:00:00Z", "user_id": "u2", "ab_test_group": null,
                       "campaign_id": 1})),
            row(json!({"ts": "2024-05-01T10:00:00Z", "user_id": null, "ab_test_group": "control",
                       "campaign_id": 1})),
        ];
        let (table, stats) = marks_from_rows("marks_and_spend", rows).unwrap();
        assert_eq!(table.marks.len(), 1);
        assert_eq!(stats.dropped_no_group, 1);
        assert_eq!(stats.dropped_no_user, 1);

        let rows = vec![
            row(json!({"ts": "2024-05-01T11:00:00Z", "user_id": null, "partner_event": "purchase",
                       "revenue_eur": 1_000_000})),
            row(json!({"ts": "2024-05-01T11:00:00Z", "user_id": "u1", "partner_event": "purchase",
                       "revenue_eur": 1_000_000})),
        ];
        let (table, stats) = events_from_rows("attributions", rows, None).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(stats.dropped_no_user, 1);
    }

    #[test]
    fn test_absent_group_column_is_fatal() {
        let rows = vec![row(json!({"ts": "2024-05-01T10:00:00Z", "user_id": "u1",
            "campaign_id": 1}))];
        assert!(matches!(
            marks_from_rows("marks_and_spend", rows),
            Err(ReportError::MissingField { field: "ab_test_group", .. })
        ));
    }

    #[test]
    fn test_missing_column_is_fatal() {
        let rows = vec![
            row(json!({"ts": "2024-05-01T10:00:00Z", "user_id": "u1", "ab_test_group": "test",
                       "campaign_id": 1})),
            row(json!({"ts": "2024-05-01T10:00:00Z", "user_id": "u2", "ab_test_group": "test"})),
        ];
        let err = marks_from_rows("marks_and_spend", rows).unwrap_err();
        match err {
            ReportError::MissingField { row, field, .. } => {
                assert_eq!(row, 2);
                assert_eq!(field, "campaign_id");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_spend_row_requires_cost() {
        let rows = vec![row(json!({"ts": "2024-05-01T10:00:00Z", "user_id": "u1",
            "ab_test_group": "test", "campaign_id": 1, "event_type": "buying_conversion"}))];
        assert!(matches!(
            marks_from_rows("marks_and_spend", rows),
            Err(ReportError::MissingField { field: "cost_eur", .. })
        ));
    }

    #[test]
    fn test_events_filtered_by_revenue_event() {
        let rows = vec![
            row(json!({"ts": "2024-05-01T11:00:00Z", "user_id": "u1", "partner_event": "purchase",
                       "revenue_eur": 9_990_000})),
            row(json!({"ts": "2024-05-01T11:00:00Z", "user_id": "u1", "partner_event": "app_open",
                       "revenue_eur": 0})),
            row(json!({"ts": "2024-05-01T12:00:00Z", "user_id": "u2", "partner_event": "purchase",
                       "revenue": 4.5})),
        ];
        let (table, stats) = events_from_rows("attributions", rows, Some("purchase")).unwrap();
        assert_eq!(table.len(), 2);
        assert!((table.events[0].revenue - 9.99).abs() < 1e-9);
        assert!((table.events[1].revenue - 4.5).abs() < 1e-12);
        assert_eq!(stats.dropped_other_kind, 1);
    }

    #[test]
    fn test_negative_revenue_rejected() {
        let rows = vec![row(json!({"ts": "2024-05-01T11:00:00Z", "user_id": "u1",
            "partner_event": "purchase", "revenue_eur": -5}))];
        assert!(matches!(
            events_from_rows("attributions", rows, None),
            Err(ReportError::InvalidValue { field: "revenue_eur", .. })
        ));
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let raw = row(json!({"ts": "yesterday", "user_id": "u1", "ab_test_group": "test",
            "campaign_id": 1}));
        assert!(matches!(
            mark_row("marks_and_spend", 7, &raw),
            Err(ReportError::InvalidValue { row: 7, field: "ts", .. })
        ));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_timestamp(&json!("2024-05-01T12:00:00+02:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-05-01 10:00:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!(expected.timestamp())), Some(expected));
        assert_eq!(parse_timestamp(&json!(true)), None);
    }
}
