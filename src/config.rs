//! Cohort-wide configuration, loaded once and validated upfront.
//!
//! Field names follow the original Python `anonymize.config` Pydantic models closely so the
//! on-disk config files this core accepts stay compatible with configs already produced by
//! the system this was distilled from.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationSnafu, CoreResult};
use snafu::ensure;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdStrategyConfig {
    None,
    Folder {
        /// 1-indexed path segment to extract the token from.
        segment: usize,
        /// Regex with exactly one capture group, or `None` to take the segment literally.
        pattern: Option<String>,
        /// Output format string using `X` placeholders, e.g. `"SUBJXXXX"`.
        format: String,
    },
    Csv {
        mapping_path: PathBuf,
        fallback: CsvFallback,
        /// Output format string used by the `Hash` fallback.
        format: String,
        salt: String,
    },
    Deterministic {
        salt: String,
        /// Number of decimal digits, hash reduced mod 10^digits.
        digits: u32,
        format: String,
    },
    Sequential {
        discovery: SequentialDiscovery,
        format: String,
        base: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvFallback {
    Hash,
    SequentialPerTopFolder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequentialDiscovery {
    PerTopFolder,
    OnePerStudy,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    Skip,
    Overwrite,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymizeConfig {
    pub worker_count: usize,
    pub id_strategy: IdStrategyConfig,
    pub anonymize_patient_id: bool,
    pub map_study_date_to_timepoint: bool,
    pub rename_patient_folders: bool,
    pub preserve_uids: bool,
    pub scrub_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
}

impl Default for AnonymizeConfig {
    fn default() -> Self {
        AnonymizeConfig {
            worker_count: 4,
            id_strategy: IdStrategyConfig::None,
            anonymize_patient_id: true,
            map_study_date_to_timepoint: false,
            rename_patient_folders: false,
            preserve_uids: true,
            scrub_tags: Vec::new(),
            exclude_tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub subject_workers: usize,
    pub series_workers_per_subject: usize,
    pub queue_size: usize,
    pub allowed_modalities: Vec<String>,
    pub resume_by_path: bool,
    pub use_specific_tags: bool,
    pub subject_code_csv: Option<PathBuf>,
    pub subject_code_salt: String,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        ExtractConfig {
            subject_workers: 4,
            series_workers_per_subject: 2,
            queue_size: 256,
            allowed_modalities: Vec::new(),
            resume_by_path: false,
            use_specific_tags: true,
            subject_code_csv: None,
            subject_code_salt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    pub adaptive: bool,
    pub initial_batch_size: u32,
    pub min_batch_size: u32,
    pub max_batch_size: u32,
    pub target_ms: u64,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            adaptive: true,
            initial_batch_size: 64,
            min_batch_size: 8,
            max_batch_size: 1024,
            target_ms: 500,
            duplicate_policy: DuplicatePolicy::Skip,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortConfig {
    pub cohort_name: String,
    pub root: PathBuf,
    pub database_url: String,
    pub anonymize: AnonymizeConfig,
    pub extract: ExtractConfig,
    pub writer: WriterConfig,
}

impl CohortConfig {
    /// Validate the configuration upfront. Fatal before any work starts (§7 Configuration-invalid).
    pub fn validate(&self) -> CoreResult<()> {
        ensure!(
            !self.cohort_name.trim().is_empty(),
            ConfigurationSnafu {
                message: "cohort_name must not be empty".to_string(),
            }
        );
        ensure!(
            !self.database_url.trim().is_empty(),
            ConfigurationSnafu {
                message: "database_url must not be empty".to_string(),
            }
        );
        ensure!(
            self.anonymize.worker_count >= 1,
            ConfigurationSnafu {
                message: "anonymize.worker_count must be >= 1".to_string(),
            }
        );
        ensure!(
            self.extract.subject_workers >= 1,
            ConfigurationSnafu {
                message: "extract.subject_workers must be >= 1".to_string(),
            }
        );
        ensure!(
            self.extract.series_workers_per_subject >= 1,
            ConfigurationSnafu {
                message: "extract.series_workers_per_subject must be >= 1".to_string(),
            }
        );
        ensure!(
            self.writer.min_batch_size >= 1
                && self.writer.min_batch_size <= self.writer.max_batch_size,
            ConfigurationSnafu {
                message: "writer.min_batch_size must be >= 1 and <= max_batch_size".to_string(),
            }
        );
        ensure!(
            self.writer.initial_batch_size >= self.writer.min_batch_size
                && self.writer.initial_batch_size <= self.writer.max_batch_size,
            ConfigurationSnafu {
                message: "writer.initial_batch_size must fall within [min_batch_size, max_batch_size]"
                    .to_string(),
            }
        );
        if let IdStrategyConfig::Deterministic { digits, .. } = &self.anonymize.id_strategy {
            ensure!(
                *digits >= 1 && *digits <= 18,
                ConfigurationSnafu {
                    message: "deterministic id_strategy digits must be within [1, 18]".to_string(),
                }
            );
        }
        Ok(())
    }

    pub fn load_from_str(raw: &str) -> CoreResult<Self> {
        let config: CohortConfig =
            serde_json::from_str(raw).map_err(|e| crate::error::CoreError::Configuration {
                message: format!("failed to parse configuration: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }
}
