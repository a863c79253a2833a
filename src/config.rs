//! Engine configuration, loaded from a JSON document

use crate::compression::CompressionMethod;
use crate::error::{EsdmError, Result};
use crate::types::Accessibility;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EsdmConfig {
    /// Data backends, in registration order
    pub backends: Vec<BackendConfig>,
    /// Metadata backend
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Maximum concurrent backend operations within one commit or read
    #[serde(default = "default_max_concurrent_io")]
    pub max_concurrent_io: usize,
    /// Default deadline for backend I/O, in milliseconds
    #[serde(default)]
    pub io_timeout_ms: Option<u64>,
}

fn default_max_concurrent_io() -> usize {
    16
}

/// The document may wrap the configuration in an `"esdm"` object
#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigDocument {
    Wrapped { esdm: EsdmConfig },
    Bare(EsdmConfig),
}

impl EsdmConfig {
    /// Parse and validate a JSON configuration string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let document: ConfigDocument = serde_json::from_str(json)
            .map_err(|e| EsdmError::Configuration(format!("invalid configuration: {}", e)))?;
        let config = match document {
            ConfigDocument::Wrapped { esdm } => esdm,
            ConfigDocument::Bare(config) => config,
        };
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EsdmError::Configuration(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// A single in-memory data backend and in-memory metadata
    pub fn in_memory() -> Self {
        Self {
            backends: vec![BackendConfig::new(BackendType::Memory, "mem", "")],
            metadata: MetadataConfig::default(),
            max_concurrent_io: default_max_concurrent_io(),
            io_timeout_ms: None,
        }
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(EsdmError::Configuration(
                "at least one data backend is required".to_string(),
            ));
        }
        if self.max_concurrent_io == 0 {
            return Err(EsdmError::Configuration(
                "max-concurrent-io must be positive".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for backend in &self.backends {
            if !ids.insert(backend.id.as_str()) {
                return Err(EsdmError::Configuration(format!(
                    "duplicate backend id '{}'",
                    backend.id
                )));
            }
            backend.validate()?;
        }
        Ok(())
    }
}

/// Built-in backend implementations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendType {
    /// Directory tree on a local or parallel filesystem
    #[serde(rename = "POSIX", alias = "posix", alias = "metadummy")]
    Posix,
    /// Process-local object store
    #[serde(rename = "MEMORY", alias = "memory")]
    Memory,
    /// Anything else; must be supplied through the engine builder
    #[serde(untagged)]
    Other(String),
}

/// Configuration of one data backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    pub id: String,
    #[serde(default)]
    pub target: String,
    /// Unset means the backend type's default
    #[serde(default)]
    pub accessibility: Option<Accessibility>,
    /// Largest fragment this backend accepts, in bytes
    #[serde(default)]
    pub max_fragment_size: Option<u64>,
    #[serde(default)]
    pub compression: CompressionMethod,
    #[serde(default)]
    pub compression_level: Option<u8>,
    #[serde(default)]
    pub performance_model: PerformanceModelConfig,
}

impl BackendConfig {
    pub fn new(backend_type: BackendType, id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            backend_type,
            id: id.into(),
            target: target.into(),
            accessibility: None,
            max_fragment_size: None,
            compression: CompressionMethod::None,
            compression_level: None,
            performance_model: PerformanceModelConfig::default(),
        }
    }

    pub fn with_max_fragment_size(mut self, bytes: u64) -> Self {
        self.max_fragment_size = Some(bytes);
        self
    }

    pub fn with_performance_model(mut self, model: PerformanceModelConfig) -> Self {
        self.performance_model = model;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(EsdmError::Configuration("backend id must not be empty".to_string()));
        }
        if self.backend_type == BackendType::Posix && self.target.is_empty() {
            return Err(EsdmError::Configuration(format!(
                "POSIX backend '{}' needs a target directory",
                self.id
            )));
        }
        if self.max_fragment_size == Some(0) {
            return Err(EsdmError::Configuration(format!(
                "backend '{}' has a zero max-fragment-size",
                self.id
            )));
        }
        self.performance_model.validate(&self.id)
    }
}

/// Static performance model parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PerformanceModelConfig {
    /// Fixed cost per operation, in milliseconds
    pub latency_ms: f64,
    /// Sustained throughput, in MiB per second
    pub throughput_mbps: f64,
}

impl Default for PerformanceModelConfig {
    fn default() -> Self {
        Self {
            latency_ms: 1.0,
            throughput_mbps: 500.0,
        }
    }
}

impl PerformanceModelConfig {
    fn validate(&self, id: &str) -> Result<()> {
        if !(self.latency_ms.is_finite() && self.latency_ms >= 0.0) {
            return Err(EsdmError::Configuration(format!(
                "backend '{}' latency must be a non-negative number",
                id
            )));
        }
        if !(self.throughput_mbps.is_finite() && self.throughput_mbps > 0.0) {
            return Err(EsdmError::Configuration(format!(
                "backend '{}' throughput must be positive",
                id
            )));
        }
        Ok(())
    }
}

/// Configuration of the metadata backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetadataConfig {
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    #[serde(default = "default_metadata_id")]
    pub id: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub accessibility: Accessibility,
}

fn default_metadata_id() -> String {
    "md".to_string()
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend_type: BackendType::Memory,
            id: default_metadata_id(),
            target: String::new(),
            accessibility: Accessibility::Global,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "esdm": {
            "backends": [
                { "type": "POSIX", "id": "p1", "target": "./_posix1",
                  "max-fragment-size": 1048576, "compression": "zstd",
                  "performance-model": { "latency-ms": 2.0, "throughput-mbps": 250.0 } },
                { "type": "MEMORY", "id": "m1", "accessibility": "node-local" }
            ],
            "metadata": { "type": "metadummy", "target": "./_metadummy" },
            "io-timeout-ms": 5000
        }
    }"#;

    #[test]
    fn test_parse_wrapped_document() {
        let config = EsdmConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].backend_type, BackendType::Posix);
        assert_eq!(config.backends[0].max_fragment_size, Some(1048576));
        assert_eq!(config.backends[0].compression, CompressionMethod::Zstd);
        assert_eq!(config.backends[0].performance_model.latency_ms, 2.0);
        assert_eq!(config.backends[0].accessibility, None);
        assert_eq!(config.backends[1].accessibility, Some(Accessibility::NodeLocal));
        assert_eq!(config.metadata.backend_type, BackendType::Posix);
        assert_eq!(config.metadata.id, "md");
        assert_eq!(config.max_concurrent_io, 16);
        assert_eq!(config.io_timeout(), Some(Duration::from_millis(5000)));
    }

    #[test]
    fn test_parse_bare_document() {
        let config =
            EsdmConfig::from_json_str(r#"{ "backends": [ { "type": "MEMORY", "id": "m" } ] }"#).unwrap();
        assert_eq!(config.metadata.backend_type, BackendType::Memory);
    }

    #[test]
    fn test_unknown_backend_type_parses() {
        let config =
            EsdmConfig::from_json_str(r#"{ "backends": [ { "type": "KDSA", "id": "k" } ] }"#).unwrap();
        assert_eq!(config.backends[0].backend_type, BackendType::Other("KDSA".to_string()));
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            r#"{ "backends": [] }"#,
            r#"{ "backends": [ { "type": "MEMORY", "id": "a" }, { "type": "MEMORY", "id": "a" } ] }"#,
            r#"{ "backends": [ { "type": "POSIX", "id": "p" } ] }"#,
            r#"{ "backends": [ { "type": "MEMORY", "id": "m", "max-fragment-size": 0 } ] }"#,
            r#"{ "backends": [ { "type": "MEMORY", "id": "m",
                 "performance-model": { "latency-ms": 1.0, "throughput-mbps": 0.0 } } ] }"#,
            r#"not json"#,
        ];
        for json in cases {
            assert!(
                matches!(EsdmConfig::from_json_str(json), Err(EsdmError::Configuration(_))),
                "accepted {}",
                json
            );
        }
    }
}
