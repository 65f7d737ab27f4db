use crate::error::ConfigError;
use crate::fusion::FusionConfig;
use crate::integrity::IntegrityConfig;
use crate::models::QueryOptions;
use crate::packer::PackingConfig;
use crate::reranker::RerankConfig;
use crate::retriever::RetrievalConfig;
use crate::sectioning::SectioningOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Every tunable of the ingestion and query pipeline. Missing keys in a
/// config file fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub retrieval: RetrievalConfig,
    pub fusion: FusionConfig,
    pub rerank: RerankConfig,
    pub packing: PackingConfig,
    pub integrity: IntegrityConfig,
    pub sectioning: SectioningOptions,
    /// Default fan-out per retrieval source.
    pub k: usize,
    pub rerank_threshold: f64,
    pub strict_integrity: bool,
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {value}")))
            }
        };
        unit("fusion.dense_weight", self.fusion.dense_weight)?;
        unit("rerank_threshold", self.rerank_threshold)?;
        unit("integrity.citation_threshold", self.integrity.citation_threshold)?;
        unit("integrity.aggregate_threshold", self.integrity.aggregate_threshold)?;
        unit("integrity.anchor_penalty", self.integrity.anchor_penalty)?;
        if self.fusion.k <= 0.0 {
            return Err(ConfigError::Invalid("fusion.k must be positive".to_string()));
        }
        if self.k == 0 {
            return Err(ConfigError::Invalid("k must be at least 1".to_string()));
        }
        if self.rerank.batch_size == 0 {
            return Err(ConfigError::Invalid("rerank.batch_size must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Query options seeded from this config.
    pub fn query_defaults(&self) -> QueryOptions {
        QueryOptions {
            k: self.k,
            token_budget: self.packing.token_budget,
            strict_integrity: self.strict_integrity,
            rerank_threshold: self.rerank_threshold,
            dense_weight: self.fusion.dense_weight,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let options = QueryOptions::default();
        Self {
            retrieval: RetrievalConfig::default(),
            fusion: FusionConfig {
                dense_weight: options.dense_weight,
                ..FusionConfig::default()
            },
            rerank: RerankConfig::default(),
            packing: PackingConfig {
                token_budget: options.token_budget,
            },
            integrity: IntegrityConfig::default(),
            sectioning: SectioningOptions::default(),
            k: options.k,
            rerank_threshold: options.rerank_threshold,
            strict_integrity: options.strict_integrity,
        }
    }
}
