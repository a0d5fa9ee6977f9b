use thiserror::Error;

pub type ReportResult<T> = Result<T, ReportError>;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing field `{field}` in {table}, row {row}")]
    MissingField {
        table: String,
        row: usize,
        field: &'static str,
    },

    #[error("Invalid value for `{field}` in {table}, row {row}: {reason}")]
    InvalidValue {
        table: String,
        row: usize,
        field: &'static str,
        reason: String,
    },

    #[error("Data source error: {0}")]
    DataSource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
