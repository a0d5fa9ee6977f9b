//! Duplicate conversion removal.
//!
//! Some attribution networks post the same conversion twice, once with and
//! once without attribution data, and the two cannot be told apart from a
//! user genuinely converting twice. The heuristic treats same-type events of
//! one user that are closer than the window as one conversion.

use crate::attribution::{AttributedEvent, Attribution};
use chrono::Duration;
use tracing::debug;
use uplift_core::{DedupConfig, DedupStrategy};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deduplicated {
    pub attributions: Vec<Attribution>,
    /// Events removed (merged or dropped) across all users.
    pub collapsed: usize,
}

fn is_duplicate(
    retained: &AttributedEvent,
    candidate: &AttributedEvent,
    window: Duration,
    strategy: DedupStrategy,
) -> bool {
    if retained.event_type != candidate.event_type {
        return false;
    }
    if candidate.timestamp - retained.timestamp > window {
        return false;
    }
    match strategy {
        DedupStrategy::MergeWithinWindow => true,
        DedupStrategy::DropIdenticalRevenue => retained.revenue == candidate.revenue,
    }
}

/// Latest kept event that `candidate` duplicates. `kept` is in time order,
/// so the scan stops at the first event older than the window.
fn duplicate_of(
    kept: &[AttributedEvent],
    candidate: &AttributedEvent,
    window: Duration,
    strategy: DedupStrategy,
) -> Option<usize> {
    for (i, retained) in kept.iter().enumerate().rev() {
        if candidate.timestamp - retained.timestamp > window {
            return None;
        }
        if is_duplicate(retained, candidate, window, strategy) {
            return Some(i);
        }
    }
    None
}

/// Collapses one user's time-ordered events. Candidates are compared with
/// every kept same-type event inside the window, never with removed ones,
/// so a second pass over the output changes nothing.
fn collapse(
    events: Vec<AttributedEvent>,
    window: Duration,
    strategy: DedupStrategy,
) -> (Vec<AttributedEvent>, usize) {
    let mut kept: Vec<AttributedEvent> = Vec::with_capacity(events.len());
    let mut collapsed = 0;

    for event in events {
        match duplicate_of(&kept, &event, window, strategy) {
            Some(i) => {
                let retained = &mut kept[i];
                retained.merged_duplicates += 1 + event.merged_duplicates;
                if strategy == DedupStrategy::MergeWithinWindow {
                    retained.revenue += event.revenue;
                }
                collapsed += 1;
            }
            None => kept.push(event),
        }
    }
    (kept, collapsed)
}

/// Removes duplicate conversions per user. Pass-through when disabled.
pub fn deduplicate(
    attributions: Vec<Attribution>,
    enabled: bool,
    config: &DedupConfig,
) -> Deduplicated {
    if !enabled {
        return Deduplicated {
            attributions,
            collapsed: 0,
        };
    }

    let window = Duration::seconds(config.window_secs);
    let mut collapsed = 0;
    let attributions = attributions
        .into_iter()
        .map(|attribution| {
            let Attribution { mark, events } = attribution;
            let (events, removed) = collapse(events, window, config.strategy);
            collapsed += removed;
            Attribution { mark, events }
        })
        .collect();

    debug!(
        collapsed,
        strategy = ?config.strategy,
        window_secs = config.window_secs,
        "Deduplication finished"
    );
    metrics::counter!("uplift.dedup.collapsed_events").increment(collapsed as u64);

    Deduplicated {
        attributions,
        collapsed,
    }
}
