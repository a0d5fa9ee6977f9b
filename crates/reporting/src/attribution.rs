//! First-touch attribution of revenue events to group assignment marks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;
use uplift_core::{CampaignId, DateRange, EventTable, Mark, MarkTable, UserId};

/// Rules deciding which events count and which mark they are credited to.
#[derive(Debug, Clone)]
pub struct AttributionPolicy<'a> {
    /// Events outside this range are ignored. May extend past the mark range
    /// to catch delayed conversions.
    pub window: DateRange,
    pub revenue_event: &'a str,
    /// Preferred when a user has several marks at the same instant.
    pub focus_campaigns: &'a [CampaignId],
}

/// A qualifying event credited to a mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributedEvent {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub revenue: f64,
    /// Events folded into this one by deduplication.
    #[serde(default)]
    pub merged_duplicates: u32,
}

/// A user's anchor mark with every event credited to it, in time order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub mark: Mark,
    pub events: Vec<AttributedEvent>,
}

impl Attribution {
    pub fn user_id(&self) -> &UserId {
        &self.mark.user_id
    }

    pub fn conversions(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn revenue(&self) -> f64 {
        self.events.iter().map(|e| e.revenue).sum()
    }

    pub fn is_converter(&self) -> bool {
        !self.events.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchStats {
    pub marked_users: usize,
    pub events_considered: usize,
    pub events_matched: usize,
    pub events_other_type: usize,
    pub events_outside_window: usize,
    pub events_unmarked_user: usize,
    pub events_before_mark: usize,
}

impl MatchStats {
    pub fn events_discarded(&self) -> usize {
        self.events_considered - self.events_matched
    }
}

/// One record per marked user, ordered by user id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributionSet {
    pub attributions: Vec<Attribution>,
    pub stats: MatchStats,
}

/// Order of a user's marks: earliest first, then focus campaigns, then the
/// lowest campaign id. Input order never matters.
fn anchor_order(a: &Mark, b: &Mark, focus: &[CampaignId]) -> Ordering {
    a.user_id
        .cmp(&b.user_id)
        .then(a.timestamp.cmp(&b.timestamp))
        .then_with(|| {
            let a_focus = focus.contains(&a.campaign_id);
            let b_focus = focus.contains(&b.campaign_id);
            b_focus.cmp(&a_focus)
        })
        .then(a.campaign_id.cmp(&b.campaign_id))
}

fn event_order(a: &AttributedEvent, b: &AttributedEvent) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then(a.revenue.total_cmp(&b.revenue))
        .then_with(|| a.event_type.cmp(&b.event_type))
}

/// Credits every qualifying event to its user's earliest mark.
///
/// An event qualifies when its type is the revenue event, it lies in the
/// policy window and it happened at or after the user's first mark. Because
/// the earliest mark precedes every later mark, it is the only mark an event
/// can be credited to under first touch; a user therefore contributes exactly
/// one `Attribution`, converting or not. Marks are sorted once; the event
/// pass is a single hash lookup per event.
pub fn match_events(
    marks: &MarkTable,
    events: &EventTable,
    policy: &AttributionPolicy<'_>,
) -> AttributionSet {
    let mut sorted: Vec<&Mark> = marks.marks.iter().collect();
    sorted.sort_by(|a, b| anchor_order(a, b, policy.focus_campaigns));

    let mut attributions: Vec<Attribution> = Vec::new();
    for mark in sorted {
        let is_new_user = attributions
            .last()
            .map_or(true, |last| last.mark.user_id != mark.user_id);
        if is_new_user {
            attributions.push(Attribution {
                mark: mark.clone(),
                events: Vec::new(),
            });
        }
    }

    let index: HashMap<&str, usize> = attributions
        .iter()
        .enumerate()
        .map(|(i, a)| (a.mark.user_id.as_str(), i))
        .collect();

    let mut stats = MatchStats {
        marked_users: attributions.len(),
        ..Default::default()
    };
    let mut credited: Vec<(usize, AttributedEvent)> = Vec::new();

    for event in &events.events {
        stats.events_considered += 1;
        if event.event_type != policy.revenue_event {
            stats.events_other_type += 1;
            continue;
        }
        if !policy.window.contains(&event.timestamp) {
            stats.events_outside_window += 1;
            continue;
        }
        let Some(&slot) = index.get(event.user_id.as_str()) else {
            stats.events_unmarked_user += 1;
            continue;
        };
        if event.timestamp < attributions[slot].mark.timestamp {
            stats.events_before_mark += 1;
            continue;
        }
        stats.events_matched += 1;
        credited.push((
            slot,
            AttributedEvent {
                event_type: event.event_type.clone(),
                timestamp: event.timestamp,
                revenue: event.revenue,
                merged_duplicates: 0,
            },
        ));
    }
    drop(index);

    for (slot, event) in credited {
        attributions[slot].events.push(event);
    }
    for attribution in &mut attributions {
        attribution.events.sort_by(event_order);
    }

    debug!(
        marked_users = stats.marked_users,
        considered = stats.events_considered,
        matched = stats.events_matched,
        before_mark = stats.events_before_mark,
        unmarked_user = stats.events_unmarked_user,
        outside_window = stats.events_outside_window,
        "Attribution matching finished"
    );
    metrics::counter!("uplift.attribution.matched_events").increment(stats.events_matched as u64);
    metrics::counter!("uplift.attribution.discarded_events")
        .increment(stats.events_discarded() as u64);

    AttributionSet {
        attributions,
        stats,
    }
}
