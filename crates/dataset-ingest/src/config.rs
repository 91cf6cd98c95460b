// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Layered configuration for the ingestion pipeline.
//!
//! Values are resolved from built-in defaults, then an optional configuration
//! file (any format supported by the `config` crate), then environment
//! variables carrying the `INGEST_` prefix:
//!
//! ```bash
//! export INGEST_CONCURRENCY=8     # parallel upload lanes
//! export INGEST_BATCH_SIZE=100    # records per database insert
//! ```

use crate::Error;
use log::debug;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Default number of parallel upload lanes.
///
/// Half the available CPUs, minimum 2, maximum 8. Larger values mostly add
/// pressure on the storage backend's rate limits.
pub fn default_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cpus / 2).clamp(2, 8)
}

/// Runtime settings for an ingestion session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Storage bucket receiving images, labels, thumbnails and the manifest.
    pub bucket: String,
    /// Number of files processed concurrently.
    pub concurrency: usize,
    /// Records accumulated before a database insert is scheduled.
    pub batch_size: usize,
    /// Edge length of the square thumbnail canvas in pixels.
    pub thumbnail_size: u32,
    /// Lifetime requested for retrieval URLs.
    pub signed_url_ttl_secs: u64,
    /// Maximum number of cached retrieval URLs.
    pub url_cache_capacity: usize,
    /// Cached URLs are treated as stale this long before they expire.
    pub url_cache_buffer_secs: u64,
    /// Simultaneous retrieval-URL issuance calls.
    pub url_issue_concurrency: usize,
    /// Minimum interval between progress updates.
    pub progress_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bucket: "datasets".to_string(),
            concurrency: default_concurrency(),
            batch_size: 50,
            thumbnail_size: 256,
            signed_url_ttl_secs: 3600,
            url_cache_capacity: 500,
            url_cache_buffer_secs: 30,
            url_issue_concurrency: 4,
            progress_interval_ms: 100,
        }
    }
}

impl IngestConfig {
    /// Load configuration from the environment only.
    pub fn from_env() -> Result<Self, Error> {
        Self::load(None)
    }

    /// Load configuration from an optional file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("INGEST").try_parsing(true))
            .build()?;

        let config: IngestConfig = settings.try_deserialize()?;
        config.validate()?;
        debug!("Ingest configuration: {:?}", config);
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.bucket.trim().is_empty() {
            return Err(Error::InvalidParameters("bucket must not be empty".into()));
        }
        if self.concurrency == 0 || self.url_issue_concurrency == 0 {
            return Err(Error::InvalidParameters(
                "concurrency limits must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidParameters("batch_size must be at least 1".into()));
        }
        if self.thumbnail_size == 0 {
            return Err(Error::InvalidParameters(
                "thumbnail_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn url_cache_buffer(&self) -> Duration {
        Duration::from_secs(self.url_cache_buffer_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_default_concurrency_bounds() {
        let n = default_concurrency();
        assert!((2..=8).contains(&n));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"bucket": "step-data", "batch_size": 7}}"#).unwrap();

        let config = IngestConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.bucket, "step-data");
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.thumbnail_size, 256);
        assert_eq!(config.url_cache_buffer(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = IngestConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidParameters(_))
        ));
    }
}
