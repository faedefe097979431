//! Engine configuration, loadable from JSON.
//!
//! ```json
//! {
//!   "method": "zstd",
//!   "level": 3,
//!   "index_method": "zstd",
//!   "chunk_size": 4194304,
//!   "defrag_ratio": 0.2,
//!   "defrag_min_raw_size": 4096,
//!   "sniff": true,
//!   "never_compress": ["text/x-log"],
//!   "always_compress": ["application/pdf"]
//! }
//! ```
//! Every field is optional; missing ones take the defaults below.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CompressionMethod;
use crate::sniff::{ContentSniffer, MagicSniffer, NoSniffer};

pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_LEVEL: i32 = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Read {
        path:   String,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Transform for data Blocks.
    pub method:              CompressionMethod,
    pub level:               i32,
    /// Transform for the stored index.
    pub index_method:        CompressionMethod,
    /// Writes larger than this are split into several Blocks.
    pub chunk_size:          usize,
    /// Defragment once raw size exceeds logical size by this fraction...
    pub defrag_ratio:        f64,
    /// ...and raw size is above this many bytes.
    pub defrag_min_raw_size: u64,
    /// Store natively compressed content plainly.
    pub sniff:               bool,
    /// Mime types added to the natively compressed set.
    pub never_compress:      Vec<String>,
    /// Mime types removed from the natively compressed set.
    pub always_compress:     Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            method:              CompressionMethod::Zstd,
            level:               DEFAULT_LEVEL,
            index_method:        CompressionMethod::Zstd,
            chunk_size:          DEFAULT_CHUNK_SIZE,
            defrag_ratio:        0.2,
            defrag_min_raw_size: 4096,
            sniff:               true,
            never_compress:      Vec::new(),
            always_compress:     Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} must be in 1..=u32::MAX", self.chunk_size
            )));
        }
        if !(self.defrag_ratio.is_finite() && self.defrag_ratio >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "defrag_ratio {} must be a non-negative number", self.defrag_ratio
            )));
        }
        if self.method == CompressionMethod::Zstd && !(1..=22).contains(&self.level) {
            return Err(ConfigError::Invalid(format!(
                "zstd level {} out of range 1..=22", self.level
            )));
        }
        Ok(())
    }

    /// Whether a file with this raw and logical size is due for
    /// defragmentation.
    pub fn wants_defrag(&self, raw_size: u64, logical_size: u64) -> bool {
        let threshold = logical_size as f64 * (1.0 + self.defrag_ratio);
        raw_size > self.defrag_min_raw_size && raw_size as f64 > threshold
    }

    pub fn sniffer(&self) -> Arc<dyn ContentSniffer> {
        if !self.sniff {
            return Arc::new(NoSniffer);
        }
        let mut sniffer = MagicSniffer::new();
        sniffer.add(&self.never_compress.join(";"));
        sniffer.remove(&self.always_compress.join(";"));
        Arc::new(sniffer)
    }
}
