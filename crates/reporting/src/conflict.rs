//! Conflict resolution: users seen in both test and control are dropped.

use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};
use uplift_core::{AbGroup, MarkTable, UserId};

/// Marks and spend after contaminated users were removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedMarks {
    pub table: MarkTable,
    /// Users removed because they carried both group labels.
    pub removed: BTreeSet<UserId>,
}

impl ResolvedMarks {
    pub fn removed_users(&self) -> usize {
        self.removed.len()
    }
}

const SEEN_TEST: u8 = 0b01;
const SEEN_CONTROL: u8 = 0b10;

fn bit(group: AbGroup) -> u8 {
    match group {
        AbGroup::Test => SEEN_TEST,
        AbGroup::Control => SEEN_CONTROL,
    }
}

/// Removes every user that appears with both `test` and `control` anywhere
/// in the table, across campaigns, together with all of that user's marks
/// and spend. Users are never resolved in favour of either group.
pub fn resolve_conflicts(table: MarkTable) -> ResolvedMarks {
    let mut seen: HashMap<&str, u8> = HashMap::new();
    for (user, group) in table
        .marks
        .iter()
        .map(|m| (m.user_id.as_str(), m.group))
        .chain(table.spend.iter().map(|s| (s.user_id.as_str(), s.group)))
    {
        *seen.entry(user).or_insert(0) |= bit(group);
    }

    let removed: BTreeSet<UserId> = seen
        .into_iter()
        .filter(|(_, flags)| *flags == SEEN_TEST | SEEN_CONTROL)
        .map(|(user, _)| user.to_string())
        .collect();

    if removed.is_empty() {
        debug!(marks = table.marks.len(), "No conflicting group assignments");
        return ResolvedMarks {
            table,
            removed,
        };
    }

    let MarkTable { mut marks, mut spend } = table;
    marks.retain(|m| !removed.contains(&m.user_id));
    spend.retain(|s| !removed.contains(&s.user_id));

    warn!(
        removed_users = removed.len(),
        remaining_marks = marks.len(),
        "Removed users marked for both test and control"
    );
    metrics::counter!("uplift.conflict.removed_users").increment(removed.len() as u64);

    ResolvedMarks {
        table: MarkTable::new(marks, spend),
        removed,
    }
}
