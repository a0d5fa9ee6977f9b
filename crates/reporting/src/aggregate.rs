//! Roll-up of users, conversions, revenue and spend per partition and group.

use crate::attribution::Attribution;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};
use uplift_core::{AbGroup, CampaignId, MarkTable};

/// Which slice of the data a summary describes.
///
/// The derived ordering is the report order: the total first, then named
/// groups by label, then campaigns outside every named group, then single
/// campaigns by id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PartitionKey {
    Total,
    NamedGroup(String),
    /// A campaign missing from the named-group mapping.
    Ungrouped(CampaignId),
    Campaign(CampaignId),
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionKey::Total => f.write_str("total"),
            PartitionKey::NamedGroup(label) => f.write_str(label),
            PartitionKey::Ungrouped(id) => write!(f, "ungrouped_c_{}", id),
            PartitionKey::Campaign(id) => write!(f, "c_{}", id),
        }
    }
}

/// Partitioning schemes requested for a report. The overall partition is
/// always produced.
#[derive(Debug, Clone, Default)]
pub struct Partitioning {
    pub per_campaign: bool,
    /// `campaign_id -> label`; empty disables the named-group scheme.
    pub named_groups: BTreeMap<CampaignId, String>,
}

impl Partitioning {
    /// Exactly one key per active scheme.
    pub fn keys_for(&self, campaign: CampaignId) -> Vec<PartitionKey> {
        let mut keys = vec![PartitionKey::Total];
        if !self.named_groups.is_empty() {
            keys.push(match self.named_groups.get(&campaign) {
                Some(label) => PartitionKey::NamedGroup(label.clone()),
                None => PartitionKey::Ungrouped(campaign),
            });
        }
        if self.per_campaign {
            keys.push(PartitionKey::Campaign(campaign));
        }
        keys
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group: AbGroup,
    pub n_users: u64,
    /// Users with at least one qualifying conversion.
    pub n_converters: u64,
    pub n_conversions: u64,
    pub total_revenue: f64,
    pub total_spend: f64,
}

impl GroupSummary {
    pub fn empty(group: AbGroup) -> Self {
        Self {
            group,
            n_users: 0,
            n_converters: 0,
            n_conversions: 0,
            total_revenue: 0.0,
            total_spend: 0.0,
        }
    }

    pub fn conversion_rate(&self) -> Option<f64> {
        (self.n_users > 0).then(|| self.n_conversions as f64 / self.n_users as f64)
    }

    pub fn converter_rate(&self) -> Option<f64> {
        (self.n_users > 0).then(|| self.n_converters as f64 / self.n_users as f64)
    }

    pub fn revenue_per_conversion(&self) -> Option<f64> {
        (self.n_conversions > 0).then(|| self.total_revenue / self.n_conversions as f64)
    }

    fn add_user(&mut self, outcome: &UserOutcome) {
        self.n_users += 1;
        self.n_conversions += outcome.conversions;
        if outcome.conversions > 0 {
            self.n_converters += 1;
        }
        self.total_revenue += outcome.revenue;
    }
}

impl AddAssign<&GroupSummary> for GroupSummary {
    fn add_assign(&mut self, other: &GroupSummary) {
        debug_assert_eq!(self.group, other.group, "merging summaries of different groups");
        self.n_users += other.n_users;
        self.n_converters += other.n_converters;
        self.n_conversions += other.n_conversions;
        self.total_revenue += other.total_revenue;
        self.total_spend += other.total_spend;
    }
}

impl Add for GroupSummary {
    type Output = GroupSummary;

    fn add(mut self, other: GroupSummary) -> GroupSummary {
        self += &other;
        self
    }
}

/// Per-user outcome, kept for resampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserOutcome {
    pub conversions: u64,
    pub revenue: f64,
}

impl From<&Attribution> for UserOutcome {
    fn from(attribution: &Attribution) -> Self {
        Self {
            conversions: attribution.conversions(),
            revenue: attribution.revenue(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSummary {
    pub key: PartitionKey,
    pub test: GroupSummary,
    pub control: GroupSummary,
    /// Control group outcomes in user id order.
    pub control_outcomes: Vec<UserOutcome>,
}

impl PartitionSummary {
    fn new(key: PartitionKey) -> Self {
        Self {
            key,
            test: GroupSummary::empty(AbGroup::Test),
            control: GroupSummary::empty(AbGroup::Control),
            control_outcomes: Vec::new(),
        }
    }

    pub fn group(&self, group: AbGroup) -> &GroupSummary {
        match group {
            AbGroup::Test => &self.test,
            AbGroup::Control => &self.control,
        }
    }

    fn group_mut(&mut self, group: AbGroup) -> &mut GroupSummary {
        match group {
            AbGroup::Test => &mut self.test,
            AbGroup::Control => &mut self.control,
        }
    }
}

/// Builds test and control summaries for every partition.
///
/// A user lands in the partitions of their anchor mark's campaign. Spend is
/// attributed per row to the partitions of the row's campaign, and only test
/// group spend counts. The total partition is always present, even when
/// empty.
pub fn aggregate(
    marks: &MarkTable,
    attributions: &[Attribution],
    partitioning: &Partitioning,
) -> Vec<PartitionSummary> {
    let mut partitions: BTreeMap<PartitionKey, PartitionSummary> = BTreeMap::new();
    partitions.insert(PartitionKey::Total, PartitionSummary::new(PartitionKey::Total));

    for attribution in attributions {
        let outcome = UserOutcome::from(attribution);
        let group = attribution.mark.group;
        for key in partitioning.keys_for(attribution.mark.campaign_id) {
            let partition = partitions
                .entry(key)
                .or_insert_with_key(|k| PartitionSummary::new(k.clone()));
            partition.group_mut(group).add_user(&outcome);
            if group == AbGroup::Control {
                partition.control_outcomes.push(outcome);
            }
        }
    }

    let spend_rows = marks
        .marks
        .iter()
        .map(|m| (m.campaign_id, m.group, m.spend))
        .chain(marks.spend.iter().map(|s| (s.campaign_id, s.group, s.spend)));
    for (campaign, group, spend) in spend_rows {
        for key in partitioning.keys_for(campaign) {
            let partition = partitions
                .entry(key)
                .or_insert_with_key(|k| PartitionSummary::new(k.clone()));
            if group == AbGroup::Test {
                partition.test.total_spend += spend;
            }
        }
    }

    partitions.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::AttributedEvent;
    use chrono::{Duration, TimeZone, Utc};
    use uplift_core::{shard_of, Mark, SpendEntry};

    fn mark(user: &str, campaign: u64, group: AbGroup, spend: f64) -> Mark {
        Mark {
            user_id: user.to_string(),
            campaign_id: campaign,
            group,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            spend,
        }
    }

    fn attributed(mark: &Mark, revenues: &[f64]) -> Attribution {
        Attribution {
            mark: mark.clone(),
            events: revenues
                .iter()
                .enumerate()
                .map(|(i, r)| AttributedEvent {
                    event_type: "purchase".to_string(),
                    timestamp: mark.timestamp + Duration::hours(i as i64 + 1),
                    revenue: *r,
                    merged_duplicates: 0,
                })
                .collect(),
        }
    }

    fn fixture() -> (MarkTable, Vec<Attribution>) {
        let marks = vec![
            mark("a", 1, AbGroup::Test, 1.0),
            mark("b", 1, AbGroup::Control, 0.0),
            mark("c", 2, AbGroup::Test, 2.0),
            mark("d", 2, AbGroup::Test, 0.5),
            mark("e", 3, AbGroup::Control, 0.0),
        ];
        let attributions = vec![
            attributed(&marks[0], &[10.0, 5.0]),
            attributed(&marks[1], &[4.0]),
            attributed(&marks[2], &[]),
            attributed(&marks[3], &[3.0]),
            attributed(&marks[4], &[]),
        ];
        let spend = vec![SpendEntry {
            user_id: "c".to_string(),
            campaign_id: 2,
            group: AbGroup::Test,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            spend: 0.25,
        }];
        (MarkTable::new(marks, spend), attributions)
    }

    fn find<'a>(parts: &'a [PartitionSummary], key: &PartitionKey) -> &'a PartitionSummary {
        parts.iter().find(|p| &p.key == key).unwrap()
    }

    #[test]
    fn test_overall_summary() {
        let (marks, attributions) = fixture();
        let parts = aggregate(&marks, &attributions, &Partitioning::default());
        assert_eq!(parts.len(), 1);
        let total = &parts[0];
        assert_eq!(total.test.n_users, 3);
        assert_eq!(total.test.n_converters, 2);
        assert_eq!(total.test.n_conversions, 3);
        assert!((total.test.total_revenue - 18.0).abs() < 1e-12);
        assert!((total.test.total_spend - 3.75).abs() < 1e-12);
        assert_eq!(total.control.n_users, 2);
        assert_eq!(total.control.n_converters, 1);
        assert!((total.control.total_spend).abs() < 1e-12);
        assert_eq!(total.control_outcomes.len(), 2);
    }

    #[test]
    fn test_per_campaign_sums_to_total() {
        let (marks, attributions) = fixture();
        let partitioning = Partitioning {
            per_campaign: true,
            ..Default::default()
        };
        let parts = aggregate(&marks, &attributions, &partitioning);
        let total = find(&parts, &PartitionKey::Total);

        for group in [AbGroup::Test, AbGroup::Control] {
            let summed = parts
                .iter()
                .filter(|p| matches!(p.key, PartitionKey::Campaign(_)))
                .map(|p| p.group(group).clone())
                .fold(GroupSummary::empty(group), |acc, s| acc + s);
            let overall = total.group(group);
            assert_eq!(summed.n_users, overall.n_users);
            assert_eq!(summed.n_conversions, overall.n_conversions);
            assert_eq!(summed.n_converters, overall.n_converters);
            assert!((summed.total_revenue - overall.total_revenue).abs() < 1e-9);
            assert!((summed.total_spend - overall.total_spend).abs() < 1e-9);
        }
    }

    #[test]
    fn test_named_groups_with_singleton_fallback() {
        let (marks, attributions) = fixture();
        let mut named_groups = BTreeMap::new();
        named_groups.insert(1, "EU".to_string());
        named_groups.insert(2, "EU".to_string());
        let partitioning = Partitioning {
            per_campaign: false,
            named_groups,
        };
        let parts = aggregate(&marks, &attributions, &partitioning);
        let keys: Vec<String> = parts.iter().map(|p| p.key.to_string()).collect();
        assert_eq!(keys, vec!["total", "EU", "ungrouped_c_3"]);

        let eu = find(&parts, &PartitionKey::NamedGroup("EU".to_string()));
        assert_eq!(eu.test.n_users, 3);
        assert_eq!(eu.control.n_users, 1);
        let ungrouped = find(&parts, &PartitionKey::Ungrouped(3));
        assert_eq!(ungrouped.test.n_users, 0);
        assert_eq!(ungrouped.control.n_users, 1);
    }

    #[test]
    fn test_sharded_summaries_merge_to_whole() {
        let (marks, attributions) = fixture();
        let whole = aggregate(&marks, &attributions, &Partitioning::default());

        let shards = 3;
        let mut merged_test = GroupSummary::empty(AbGroup::Test);
        let mut merged_control = GroupSummary::empty(AbGroup::Control);
        for shard in 0..shards {
            let part_marks = MarkTable::new(
                marks
                    .marks
                    .iter()
                    .filter(|m| shard_of(&m.user_id, shards) == shard)
                    .cloned()
                    .collect(),
                marks
                    .spend
                    .iter()
                    .filter(|s| shard_of(&s.user_id, shards) == shard)
                    .cloned()
                    .collect(),
            );
            let part_attributions: Vec<Attribution> = attributions
                .iter()
                .filter(|a| shard_of(a.user_id(), shards) == shard)
                .cloned()
                .collect();
            let parts = aggregate(&part_marks, &part_attributions, &Partitioning::default());
            merged_test += &parts[0].test;
            merged_control += &parts[0].control;
        }

        assert_eq!(merged_test.n_users, whole[0].test.n_users);
        assert_eq!(merged_test.n_conversions, whole[0].test.n_conversions);
        assert!((merged_test.total_spend - whole[0].test.total_spend).abs() < 1e-9);
        assert_eq!(merged_control.n_converters, whole[0].control.n_converters);
    }

    #[test]
    fn test_empty_input_still_has_total() {
        let parts = aggregate(&MarkTable::default(), &[], &Partitioning::default());
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].key, PartitionKey::Total);
        assert_eq!(parts[0].test.n_users, 0);
        assert_eq!(parts[0].control.conversion_rate(), None);
    }
}
