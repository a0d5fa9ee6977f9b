use crate::error::{ReportError, ReportResult};
use crate::types::{CampaignId, DateRange};
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Prefix for environment overrides, e.g. `UPLIFT_REPORT__REVENUE_EVENT`.
pub const ENV_PREFIX: &str = "UPLIFT_REPORT";

/// Everything a single uplift report run needs. Loaded from an optional TOML
/// file plus environment variables, then passed by reference into the
/// stateless pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    pub customer: String,
    #[serde(default)]
    pub audiences: Vec<String>,
    #[serde(default = "default_revenue_event")]
    pub revenue_event: String,
    /// Days whose marks are analysed.
    pub dates: DateRange,
    /// Days whose events may be attributed. Defaults to `dates`.
    #[serde(default)]
    pub attribution_dates: Option<DateRange>,
    /// Optional whitelist of campaigns to load marks for.
    #[serde(default)]
    pub campaigns: Option<Vec<CampaignId>>,
    /// Named campaign groups, `[[groups]]` tables in TOML. Labels are
    /// values, so they keep their case and may contain spaces or dots.
    #[serde(default)]
    pub groups: Vec<CampaignGroup>,
    /// Campaigns preferred when a user has several marks at the same instant.
    #[serde(default)]
    pub focus_campaigns: Vec<CampaignId>,
    #[serde(default)]
    pub per_campaign_results: bool,
    #[serde(default)]
    pub use_converters_for_significance: bool,
    #[serde(default)]
    pub use_deduplication: bool,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub significance: SignificanceConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignGroup {
    pub label: String,
    pub campaigns: Vec<CampaignId>,
}

impl CampaignGroup {
    pub fn new(label: impl Into<String>, campaigns: Vec<CampaignId>) -> Self {
        Self {
            label: label.into(),
            campaigns,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    /// Fold every same-type event inside the window into the counted one,
    /// summing revenue.
    #[default]
    MergeWithinWindow,
    /// Drop same-type events with identical revenue inside the window
    /// (duplicate postbacks from the attribution network).
    DropIdenticalRevenue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default)]
    pub strategy: DedupStrategy,
    #[serde(default = "default_dedup_window_secs")]
    pub window_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignificanceConfig {
    /// Groups smaller than this make the verdict unreliable.
    #[serde(default = "default_min_group_size")]
    pub min_group_size: u64,
    /// Divide the significance threshold by the number of reported partitions.
    #[serde(default)]
    pub bonferroni_correction: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Number of bootstrap resamples; confidence intervals are skipped when unset.
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default = "default_bootstrap_seed")]
    pub seed: u64,
}

// Default functions
fn default_revenue_event() -> String {
    "purchase".to_string()
}
fn default_confidence_level() -> f64 {
    0.95
}
fn default_dedup_window_secs() -> i64 {
    60
}
fn default_min_group_size() -> u64 {
    30
}
fn default_bootstrap_seed() -> u64 {
    0x5eed_0f_u64
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            strategy: DedupStrategy::default(),
            window_secs: default_dedup_window_secs(),
        }
    }
}

impl Default for SignificanceConfig {
    fn default() -> Self {
        Self {
            min_group_size: default_min_group_size(),
            bonferroni_correction: false,
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            size: None,
            seed: default_bootstrap_seed(),
        }
    }
}

impl ReportConfig {
    pub fn new(
        customer: impl Into<String>,
        audiences: Vec<String>,
        revenue_event: impl Into<String>,
        dates: DateRange,
    ) -> Self {
        Self {
            customer: customer.into(),
            audiences,
            revenue_event: revenue_event.into(),
            dates,
            attribution_dates: None,
            campaigns: None,
            groups: Vec::new(),
            focus_campaigns: Vec::new(),
            per_campaign_results: false,
            use_converters_for_significance: false,
            use_deduplication: false,
            confidence_level: default_confidence_level(),
            dedup: DedupConfig::default(),
            significance: SignificanceConfig::default(),
            bootstrap: BootstrapConfig::default(),
        }
    }

    /// Builder with the config file (if any) and environment sources
    /// registered. Callers may add overrides before building.
    pub fn source_builder(path: Option<&Path>) -> ConfigBuilder<DefaultState> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("audiences")
                .with_list_parse_key("campaigns")
                .with_list_parse_key("focus_campaigns"),
        )
    }

    /// Load configuration from an optional file and environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let config = Self::source_builder(path).build()?;
        config.try_deserialize()
    }

    pub fn attribution_range(&self) -> DateRange {
        self.attribution_dates.unwrap_or(self.dates)
    }

    /// Significance level before any multiple-comparison correction.
    pub fn alpha(&self) -> f64 {
        1.0 - self.confidence_level
    }

    /// Inverts `groups` into `campaign_id -> label`, rejecting repeated
    /// labels, campaigns claimed by more than one group and campaigns outside
    /// the whitelist.
    pub fn named_groups(&self) -> ReportResult<BTreeMap<CampaignId, String>> {
        let whitelist: Option<BTreeSet<CampaignId>> = self
            .campaigns
            .as_ref()
            .map(|campaigns| campaigns.iter().copied().collect());

        let mut labels = BTreeSet::new();
        let mut mapping = BTreeMap::new();
        for CampaignGroup { label, campaigns } in &self.groups {
            if label.trim().is_empty() {
                return Err(ReportError::Config(
                    "named group with an empty label".to_string(),
                ));
            }
            if !labels.insert(label.as_str()) {
                return Err(ReportError::Config(format!(
                    "named group '{}' is defined twice",
                    label
                )));
            }
            if campaigns.is_empty() {
                return Err(ReportError::Config(format!(
                    "named group '{}' lists no campaigns",
                    label
                )));
            }
            for campaign in campaigns {
                if let Some(whitelist) = &whitelist {
                    if !whitelist.contains(campaign) {
                        return Err(ReportError::Config(format!(
                            "named group '{}' references unknown campaign {}",
                            label, campaign
                        )));
                    }
                }
                if let Some(previous) = mapping.insert(*campaign, label.clone()) {
                    if previous != *label {
                        return Err(ReportError::Config(format!(
                            "campaign {} is in both '{}' and '{}'",
                            campaign, previous, label
                        )));
                    }
                }
            }
        }
        Ok(mapping)
    }

    /// Checks everything that can be checked before data is loaded.
    pub fn validate(&self) -> ReportResult<()> {
        if self.customer.trim().is_empty() {
            return Err(ReportError::Config("customer must be set".to_string()));
        }
        if self.audiences.is_empty() {
            return Err(ReportError::Config(
                "at least one audience is required".to_string(),
            ));
        }
        if self.audiences.iter().any(|a| a.trim().is_empty()) {
            return Err(ReportError::Config("empty audience name".to_string()));
        }
        if self.revenue_event.trim().is_empty() {
            return Err(ReportError::Config("revenue_event must be set".to_string()));
        }

        self.dates.check()?;
        let attribution = self.attribution_range();
        attribution.check()?;
        if attribution.end < self.dates.start {
            return Err(ReportError::Config(format!(
                "attribution range ends ({}) before the mark range starts ({})",
                attribution.end, self.dates.start
            )));
        }

        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(ReportError::Config(format!(
                "confidence_level must be in (0, 1), got {}",
                self.confidence_level
            )));
        }
        if self.use_deduplication && self.dedup.window_secs <= 0 {
            return Err(ReportError::Config(format!(
                "dedup window must be positive, got {}s",
                self.dedup.window_secs
            )));
        }
        if self.bootstrap.size == Some(0) {
            return Err(ReportError::Config(
                "bootstrap size must be at least 1".to_string(),
            ));
        }
        if let Some(campaigns) = &self.campaigns {
            if campaigns.is_empty() {
                return Err(ReportError::Config(
                    "campaign whitelist is set but empty".to_string(),
                ));
            }
            if let Some(unknown) = self
                .focus_campaigns
                .iter()
                .find(|c| !campaigns.contains(c))
            {
                return Err(ReportError::Config(format!(
                    "focus campaign {} is not in the campaign whitelist",
                    unknown
                )));
            }
        }

        self.named_groups()?;
        Ok(())
    }
}
