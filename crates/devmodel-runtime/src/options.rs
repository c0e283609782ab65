//! Explicit configuration passed into `Load` and `Run`
//!
//! The compiler hands over a flat string-keyed option map; [`ModelOptions`]
//! parses it once at load. Environment variables can override a few keys for
//! debugging without recompiling:
//!
//! | key                    | env override                     | meaning                                 |
//! |------------------------|----------------------------------|-----------------------------------------|
//! | `dump_dir`             | `DEVMODEL_DUMP_DIR`              | write a layout dump at load             |
//! | `host_input_indices`   | -                                | inputs that may be staged host-to-host  |
//! | `frozen_input_indices` | -                                | inputs whose address never changes      |
//! | `merge_copy_threshold` | `DEVMODEL_MERGE_COPY_THRESHOLD`  | batch CopyOnly inputs up to this size   |
//! | `exec_timeout_ms`      | `DEVMODEL_EXEC_TIMEOUT_MS`       | synchronization bound, `0` = none       |
//! | `reuse_memory`         | -                                | reusable-memory mode                    |

use crate::error::{Result, RuntimeError};
use devmodel_driver::StreamHandle;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Per-model options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelOptions {
    pub dump_dir: Option<PathBuf>,
    pub host_input_indices: BTreeSet<usize>,
    pub frozen_input_indices: BTreeSet<usize>,
    pub merge_copy_threshold: usize,
    pub exec_timeout: Option<Duration>,
    pub reuse_memory: bool,
}

impl ModelOptions {
    /// Parse the compiler's option map
    ///
    /// # Errors
    ///
    /// Returns `ParamInvalid` naming the key when a value does not parse.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut options = Self::default();
        // Sorted so errors and logs are stable.
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        for key in keys {
            let value = map[key].trim();
            match key.as_str() {
                "dump_dir" => options.dump_dir = (!value.is_empty()).then(|| PathBuf::from(value)),
                "host_input_indices" => options.host_input_indices = parse_index_list(key, value)?,
                "frozen_input_indices" => options.frozen_input_indices = parse_index_list(key, value)?,
                "merge_copy_threshold" => options.merge_copy_threshold = parse_size(key, value)?,
                "exec_timeout_ms" => options.exec_timeout = parse_timeout(key, value)?,
                "reuse_memory" => options.reuse_memory = parse_bool(key, value)?,
                _ => debug!(key = key.as_str(), "ignoring unknown model option"),
            }
        }
        Ok(options)
    }

    /// Apply `DEVMODEL_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("DEVMODEL_DUMP_DIR") {
            self.dump_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
        if let Ok(value) = std::env::var("DEVMODEL_EXEC_TIMEOUT_MS") {
            self.exec_timeout = parse_timeout("DEVMODEL_EXEC_TIMEOUT_MS", value.trim())?;
        }
        if let Ok(value) = std::env::var("DEVMODEL_MERGE_COPY_THRESHOLD") {
            self.merge_copy_threshold = parse_size("DEVMODEL_MERGE_COPY_THRESHOLD", value.trim())?;
        }
        Ok(self)
    }

    pub fn is_host_input(&self, index: usize) -> bool {
        self.host_input_indices.contains(&index)
    }

    pub fn is_frozen_input(&self, index: usize) -> bool {
        self.frozen_input_indices.contains(&index)
    }
}

/// Caller-provided memory for `Load`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryParams {
    /// Caller-owned device memory backing all feature-map regions
    pub feature_map_base: Option<u64>,
    pub feature_map_size: usize,
    /// Caller-owned device memory backing fixed feature-map regions
    pub fixed_feature_map_base: Option<u64>,
    /// Host-placed caller buffers may be bound directly to task arguments
    pub host_zero_copy_reserved: bool,
}

/// Process-wide stream pool limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPoolConfig {
    pub max_streams: usize,
}

impl Default for StreamPoolConfig {
    fn default() -> Self {
        Self { max_streams: 64 }
    }
}

/// Per-invocation options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Execute on this caller stream instead of the model's own
    pub stream: Option<StreamHandle>,
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| RuntimeError::param_invalid(format!("option {key}: expected an unsigned integer, got {value:?}")))
}

fn parse_size(key: &str, value: &str) -> Result<usize> {
    let n = parse_number(key, value)?;
    usize::try_from(n)
        .map_err(|_| RuntimeError::param_invalid(format!("option {key}: {n} does not fit in a byte count on this target")))
}

fn parse_timeout(key: &str, value: &str) -> Result<Option<Duration>> {
    let ms = parse_number(key, value)?;
    Ok((ms > 0).then(|| Duration::from_millis(ms)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" | "" => Ok(false),
        _ => Err(RuntimeError::param_invalid(format!(
            "option {key}: expected a boolean, got {value:?}"
        ))),
    }
}

fn parse_index_list(key: &str, value: &str) -> Result<BTreeSet<usize>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<usize>()
                .map_err(|_| RuntimeError::param_invalid(format!("option {key}: bad index {part:?}")))
        })
        .collect()
}
