pub mod config;
pub mod error;
pub mod source;
pub mod types;

pub use config::{
    BootstrapConfig, CampaignGroup, DedupConfig, DedupStrategy, ReportConfig, SignificanceConfig,
};
pub use error::{ReportError, ReportResult};
pub use source::DataSource;
pub use types::{
    AbGroup, CampaignId, DateRange, Event, EventTable, Mark, MarkTable, SpendEntry, UserId,
};
pub use types::{shard_of, stable_hash};
