use std::sync::atomic::{AtomicUsize, Ordering};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{ApplyError, Result};

/// Default per-batch operation count cap. Changeable at runtime through
/// [`set_batch_limit_operations`]; read once at the start of each batch.
pub const DEFAULT_BATCH_LIMIT_OPERATIONS: usize = 50_000;

static BATCH_LIMIT_OPERATIONS: AtomicUsize = AtomicUsize::new(DEFAULT_BATCH_LIMIT_OPERATIONS);

/// Current per-batch operation count cap.
pub fn batch_limit_operations() -> usize {
    BATCH_LIMIT_OPERATIONS.load(Ordering::Relaxed)
}

/// Update the per-batch operation count cap. Valid range is 1..=1,000,000.
pub fn set_batch_limit_operations(value: usize) -> Result<()> {
    if !(1..=1_000_000).contains(&value) {
        return Err(ApplyError::BadValue(
            "batch operation limit must be between 1 and 1 million, inclusive".to_string(),
        ));
    }
    BATCH_LIMIT_OPERATIONS.store(value, Ordering::Relaxed);
    Ok(())
}

#[cfg(target_pointer_width = "64")]
const DEFAULT_WRITER_THREAD_COUNT: usize = 16;
#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_WRITER_THREAD_COUNT: usize = 2;

/// Startup configuration for the applier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplierConfig {
    /// Number of parallel apply workers. Fixed at startup, 1..=256.
    pub writer_thread_count: usize,
    /// Per-batch byte cap; the effective cap is the minimum of this and 10%
    /// of the oplog max size, computed when the batcher starts.
    pub batch_limit_bytes: usize,
    /// Payload cap for one grouped insert.
    pub insert_vector_max_bytes: usize,
    /// Host used to fetch missing documents during initial sync.
    pub sync_source: String,
    /// Namespace of the local oplog collection.
    pub oplog_ns: String,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            writer_thread_count: DEFAULT_WRITER_THREAD_COUNT,
            batch_limit_bytes: 100 * 1024 * 1024,
            insert_vector_max_bytes: 256 * 1024,
            sync_source: "localhost:27017".to_string(),
            oplog_ns: "local.oplog.rs".to_string(),
        }
    }
}

impl ApplierConfig {
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::with_prefix("REPLITAIL").separator("_"))
            .build()?;

        match config.try_deserialize::<ApplierConfig>() {
            Ok(config) => Ok(config),
            Err(_) => Ok(ApplierConfig::default()),
        }
    }

    /// Validate startup-only knobs. Called once before the applier starts.
    pub fn validate(&self) -> Result<()> {
        if !(1..=256).contains(&self.writer_thread_count) {
            return Err(ApplyError::BadValue(
                "writer_thread_count must be between 1 and 256".to_string(),
            ));
        }
        if self.batch_limit_bytes == 0 {
            return Err(ApplyError::BadValue(
                "batch_limit_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ApplierConfig::default().validate().is_ok());
    }

    #[test]
    fn writer_thread_count_range_is_enforced() {
        let mut config = ApplierConfig::default();
        config.writer_thread_count = 0;
        assert!(config.validate().is_err());
        config.writer_thread_count = 257;
        assert!(config.validate().is_err());
        config.writer_thread_count = 256;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn batch_limit_operations_range_is_enforced() {
        assert!(set_batch_limit_operations(0).is_err());
        assert!(set_batch_limit_operations(1_000_001).is_err());
        assert!(set_batch_limit_operations(1234).is_ok());
        assert_eq!(batch_limit_operations(), 1234);
        set_batch_limit_operations(DEFAULT_BATCH_LIMIT_OPERATIONS).unwrap();
    }
}
