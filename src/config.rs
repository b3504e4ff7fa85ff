//! Tracing configuration
//!
//! Buffer capacities trade I/O frequency against crash loss: a larger buffer
//! flushes less often but leaves more unflushed records behind if the traced
//! process dies before the emergency flush can run.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TraceError};
use crate::record::StreamKind;

/// Per-stream buffer capacities, in records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferCapacities {
    pub instruction: usize,
    pub register: usize,
    pub memory_count: usize,
    pub memory_detail: usize,
    pub raw_byte_map: usize,
}

impl Default for BufferCapacities {
    fn default() -> Self {
        Self {
            instruction: 8192,
            register: 8192,
            memory_count: 8192,
            memory_detail: 8192,
            raw_byte_map: 128,
        }
    }
}

impl BufferCapacities {
    /// Same capacity for every stream (handy for exercising flush cycles)
    pub fn uniform(records: usize) -> Self {
        Self {
            instruction: records,
            register: records,
            memory_count: records,
            memory_detail: records,
            raw_byte_map: records,
        }
    }

    pub fn for_stream(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Instruction => self.instruction,
            StreamKind::Register => self.register,
            StreamKind::MemoryCount => self.memory_count,
            StreamKind::MemoryDetail => self.memory_detail,
            StreamKind::RawByteMap => self.raw_byte_map,
        }
    }
}

/// Configuration for a tracing run
///
/// # Example
/// ```
/// use peekaboo::config::TraceConfig;
///
/// let config = TraceConfig::default();
/// assert_eq!(config.capacities.instruction, 8192);
/// assert_eq!(config.capacities.raw_byte_map, 128);
/// assert!(!config.store_simd);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Directory in which the trace root is created
    pub output_dir: PathBuf,

    pub capacities: BufferCapacities,

    /// Capture YMM registers into each AMD64 register snapshot
    pub store_simd: bool,

    /// Capture the FXSAVE area into each AMD64 register snapshot
    pub store_fxsave: bool,

    /// Copy the process memory map into each process directory
    pub copy_memory_map: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            capacities: BufferCapacities::default(),
            store_simd: false,
            store_fxsave: false,
            copy_memory_map: true,
        }
    }
}

impl TraceConfig {
    /// Load configuration from a TOML file
    ///
    /// # Example TOML
    /// ```toml
    /// output_dir = "/tmp/traces"
    /// store_simd = true
    ///
    /// [capacities]
    /// instruction = 16384
    /// ```
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            TraceError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TraceConfig = toml::from_str(content)
            .map_err(|e| TraceError::Config(format!("Failed to parse TOML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject capacities that could never hold a record
    pub fn validate(&self) -> Result<()> {
        for kind in StreamKind::ALL {
            if self.capacities.for_stream(kind) == 0 {
                return Err(TraceError::Config(format!(
                    "{} buffer capacity must be > 0",
                    kind
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacities() {
        let caps = BufferCapacities::default();
        assert_eq!(caps.for_stream(StreamKind::Register), 8192);
        assert_eq!(caps.for_stream(StreamKind::MemoryDetail), 8192);
        assert_eq!(caps.for_stream(StreamKind::RawByteMap), 128);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TraceConfig::from_toml_str(
            r#"
            store_simd = true

            [capacities]
            instruction = 64
            "#,
        )
        .unwrap();
        assert!(config.store_simd);
        assert!(!config.store_fxsave);
        assert_eq!(config.capacities.instruction, 64);
        assert_eq!(config.capacities.register, 8192);
        assert_eq!(config.output_dir, PathBuf::from("."));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = TraceConfig::from_toml_str("[capacities]\nraw_byte_map = 0\n").unwrap_err();
        assert!(err.to_string().contains("raw-byte-map"));
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(TraceConfig::from_toml_str("store_simd = maybe").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = TraceConfig::from_toml("/nonexistent/peekaboo.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
