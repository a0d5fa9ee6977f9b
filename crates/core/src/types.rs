use crate::error::{ReportError, ReportResult};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type CampaignId = u64;

/// A/B test group a user was randomly assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbGroup {
    Test,
    Control,
}

impl AbGroup {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "test" => Some(AbGroup::Test),
            "control" => Some(AbGroup::Control),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AbGroup::Test => "test",
            AbGroup::Control => "control",
        }
    }
}

impl std::fmt::Display for AbGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (user, campaign) group assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub group: AbGroup,
    pub timestamp: DateTime<Utc>,
    /// Spend booked with the mark. Always 0 for control.
    pub spend: f64,
}

/// Spend booked against a marked user after the mark (a `buying_conversion`
/// row in the marks-and-spend feed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendEntry {
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub group: AbGroup,
    pub timestamp: DateTime<Utc>,
    pub spend: f64,
}

/// An observed app or business event, e.g. an open or a purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub user_id: UserId,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub revenue: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkTable {
    pub marks: Vec<Mark>,
    pub spend: Vec<SpendEntry>,
}

impl MarkTable {
    pub fn new(marks: Vec<Mark>, spend: Vec<SpendEntry>) -> Self {
        Self { marks, spend }
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty() && self.spend.is_empty()
    }

    pub fn extend(&mut self, other: MarkTable) {
        self.marks.extend(other.marks);
        self.spend.extend(other.spend);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTable {
    pub events: Vec<Event>,
}

impl EventTable {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn extend(&mut self, other: EventTable) {
        self.events.extend(other.events);
    }
}

/// Inclusive range of calendar days (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> ReportResult<Self> {
        let range = Self { start, end };
        range.check()?;
        Ok(range)
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn check(&self) -> ReportResult<()> {
        if self.start > self.end {
            return Err(ReportError::Config(format!(
                "date range starts after it ends ({} > {})",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// First instant inside the range.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start.and_time(NaiveTime::MIN).and_utc()
    }

    /// First instant after the range.
    pub fn end_time(&self) -> DateTime<Utc> {
        let next = self.end.checked_add_days(Days::new(1)).unwrap_or(NaiveDate::MAX);
        next.and_time(NaiveTime::MIN).and_utc()
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start_time() && *ts < self.end_time()
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day <= end)
    }
}

/// FNV-1a over the user id; stable across runs and platforms.
pub fn stable_hash(value: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in value.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Shard a user falls into when the per-user stages are split `shards` ways.
pub fn shard_of(user_id: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    (stable_hash(user_id) % shards as u64) as usize
}
