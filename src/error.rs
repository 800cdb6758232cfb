//! Shared error taxonomy for the anonymization and extraction cores.
//!
//! Per-file and per-leaf errors are *not* represented here: §7 requires that they stay
//! local and get aggregated into `LeafResult`/`BatchOutcome` (see `anonymize::LeafResult`
//! and `writer::BatchOutcome`). Only conditions that abort a whole stage escape as
//! `CoreError` from the top-level engine entry points.

use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoreError {
    #[snafu(display("invalid configuration: {message}"))]
    Configuration { message: String },

    #[snafu(display("cohort root {path:?} is missing or unreadable"))]
    RootUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to create directory {path:?}"))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("database error: {source}"))]
    Database { source: sqlx::Error },

    #[snafu(display("operation cancelled"))]
    Cancelled,

    #[snafu(display("{message}"))]
    Other { message: String },
}

impl From<sqlx::Error> for CoreError {
    fn from(source: sqlx::Error) -> Self {
        CoreError::Database { source }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
