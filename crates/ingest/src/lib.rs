//! Ingestion for the uplift report: schema checks on raw feed rows and a
//! local JSON-lines data source.

pub mod jsonl;
pub mod schema;

pub use jsonl::JsonLinesSource;
pub use schema::{events_from_rows, marks_from_rows, IngestStats, RawRow};
