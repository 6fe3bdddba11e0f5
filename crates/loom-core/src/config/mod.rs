//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::consolidation::ConsolidationConfig;
use crate::domain::dedup::DetectorConfig;
use crate::domain::pipeline::PipelineConfig;
use crate::domain::query::SelectionCriteria;
use crate::domain::repair::{RepairConfig, parse_utc_offset};
use crate::domain::taxonomy::PlacementConfig;
use crate::llm::{GatewayConfig, HttpModelConfig};

/// Loom configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub consolidation: ConsolidationSettings,
    pub detection: DetectionSettings,
    pub taxonomy: TaxonomySettings,
    pub repair: RepairSettings,
    pub proposals: ProposalSettings,
    pub pipeline: PipelineSettings,
    pub query: QuerySettings,
    pub database: DatabaseSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationSettings {
    /// Minimum merge confidence for a proposal to be applied
    pub merge_threshold: f32,
    /// How long a merge waits for a locked node before it is deferred
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub similarity_threshold: f32,
    /// Comparisons per fresh node
    pub sample_size: usize,
    /// Fixed sampling seed; random when unset
    pub seed: Option<u64>,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxonomySettings {
    pub confidence_threshold: f32,
    pub max_keywords: usize,
    pub max_depth: usize,
    pub max_children: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairSettings {
    /// Zone every postponement timestamp is normalised to, as `+HH:MM`
    pub reference_offset: String,
    /// Zone naive timestamps from the controller are interpreted in
    pub upstream_offset: String,
    pub scan_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalSettings {
    #[serde(skip)]
    pub api_key: Option<String>,
    pub endpoint: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Parallel resolution/extraction workers
    pub workers: usize,
    /// Preceding units passed to resolution as context
    pub context_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub max_depth: u32,
    pub max_width: usize,
    pub limit: usize,
    pub hop_decay: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite file for the commit log; defaults to the user data directory
    pub path: Option<String>,
}

impl Default for ConsolidationSettings {
    fn default() -> Self {
        Self {
            merge_threshold: 0.5,
            lock_timeout_ms: 5_000,
        }
    }
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            sample_size: 16,
            seed: None,
            interval_secs: 60,
        }
    }
}

impl Default for TaxonomySettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.35,
            max_keywords: 5,
            max_depth: 4,
            max_children: 12,
        }
    }
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            reference_offset: "+00:00".to_string(),
            upstream_offset: "+00:00".to_string(),
            scan_interval_secs: 30,
        }
    }
}

impl Default for ProposalSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "http://127.0.0.1:8700/v1/proposals".to_string(),
            max_retries: 3,
            timeout_secs: 60,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            context_window: 3,
        }
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_width: 25,
            limit: 20,
            hop_decay: 0.7,
        }
    }
}

impl ProposalSettings {
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;
        Ok(env::var("LOOM_API_KEY").ok())
    }

    pub fn redacted_api_key(&self) -> anyhow::Result<Option<String>> {
        self.resolved_api_key().map(|opt| {
            opt.map(|key| {
                if key.len() <= 4 {
                    "***".to_string()
                } else {
                    format!("***{}", &key[key.len() - 4..])
                }
            })
        })
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "Model API keys must be provided via the LOOM_API_KEY environment variable, not stored in configuration"
            ));
        }
        Ok(())
    }
}

const KEYS: &[&str] = &[
    "consolidation.merge_threshold",
    "consolidation.lock_timeout_ms",
    "detection.similarity_threshold",
    "detection.sample_size",
    "detection.seed",
    "detection.interval_secs",
    "taxonomy.confidence_threshold",
    "taxonomy.max_keywords",
    "taxonomy.max_depth",
    "taxonomy.max_children",
    "repair.reference_offset",
    "repair.upstream_offset",
    "repair.scan_interval_secs",
    "proposals.endpoint",
    "proposals.max_retries",
    "proposals.timeout_secs",
    "proposals.api_key",
    "pipeline.workers",
    "pipeline.context_window",
    "query.max_depth",
    "query.max_width",
    "query.limit",
    "query.hop_decay",
    "database.path",
];

fn parse_unit_interval(key: &str, value: &str) -> anyhow::Result<f32> {
    let parsed: f32 = value
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(anyhow!("{} must be between 0.0 and 1.0", key));
    }
    Ok(parsed)
}

fn parse_positive<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let parsed: T = value
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))?;
    if parsed <= T::default() {
        return Err(anyhow!("{} must be greater than zero", key));
    }
    Ok(parsed)
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("LOOM_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("loom")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.proposals.enforce_env_only()?;
        for (key, value) in [
            ("consolidation.merge_threshold", self.consolidation.merge_threshold),
            ("detection.similarity_threshold", self.detection.similarity_threshold),
            ("taxonomy.confidence_threshold", self.taxonomy.confidence_threshold),
            ("query.hop_decay", self.query.hop_decay),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be between 0.0 and 1.0", key));
            }
        }
        if !(1..=5).contains(&self.taxonomy.max_keywords) {
            return Err(anyhow!("taxonomy.max_keywords must be between 1 and 5"));
        }
        if self.taxonomy.max_depth == 0 || self.taxonomy.max_children == 0 {
            return Err(anyhow!(
                "taxonomy.max_depth and taxonomy.max_children must be greater than zero"
            ));
        }
        if self.pipeline.workers == 0 {
            return Err(anyhow!("pipeline.workers must be greater than zero"));
        }
        parse_utc_offset(&self.repair.reference_offset)
            .map_err(|e| anyhow!("repair.reference_offset: {}", e))?;
        parse_utc_offset(&self.repair.upstream_offset)
            .map_err(|e| anyhow!("repair.upstream_offset: {}", e))?;
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let value = match key {
            "consolidation.merge_threshold" => self.consolidation.merge_threshold.to_string(),
            "consolidation.lock_timeout_ms" => self.consolidation.lock_timeout_ms.to_string(),

            "detection.similarity_threshold" => self.detection.similarity_threshold.to_string(),
            "detection.sample_size" => self.detection.sample_size.to_string(),
            "detection.seed" => self
                .detection
                .seed
                .map_or_else(|| "(random)".to_string(), |s| s.to_string()),
            "detection.interval_secs" => self.detection.interval_secs.to_string(),

            "taxonomy.confidence_threshold" => self.taxonomy.confidence_threshold.to_string(),
            "taxonomy.max_keywords" => self.taxonomy.max_keywords.to_string(),
            "taxonomy.max_depth" => self.taxonomy.max_depth.to_string(),
            "taxonomy.max_children" => self.taxonomy.max_children.to_string(),

            "repair.reference_offset" => self.repair.reference_offset.clone(),
            "repair.upstream_offset" => self.repair.upstream_offset.clone(),
            "repair.scan_interval_secs" => self.repair.scan_interval_secs.to_string(),

            "proposals.endpoint" => self.proposals.endpoint.clone(),
            "proposals.max_retries" => self.proposals.max_retries.to_string(),
            "proposals.timeout_secs" => self.proposals.timeout_secs.to_string(),
            "proposals.api_key" => match self.proposals.redacted_api_key()? {
                Some(redacted) => redacted,
                None => "(not set - use LOOM_API_KEY env var)".to_string(),
            },

            "pipeline.workers" => self.pipeline.workers.to_string(),
            "pipeline.context_window" => self.pipeline.context_window.to_string(),

            "query.max_depth" => self.query.max_depth.to_string(),
            "query.max_width" => self.query.max_width.to_string(),
            "query.limit" => self.query.limit.to_string(),
            "query.hop_decay" => self.query.hop_decay.to_string(),

            "database.path" => match &self.database.path {
                Some(path) => path.clone(),
                None => self.database_path()?.display().to_string(),
            },

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `loom config list` to see available keys.",
                    key
                ));
            }
        };
        Ok(value)
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "consolidation.merge_threshold" => {
                self.consolidation.merge_threshold = parse_unit_interval(key, value)?;
            }
            "consolidation.lock_timeout_ms" => {
                self.consolidation.lock_timeout_ms = parse_positive(key, value)?;
            }

            "detection.similarity_threshold" => {
                self.detection.similarity_threshold = parse_unit_interval(key, value)?;
            }
            "detection.sample_size" => {
                self.detection.sample_size = parse_positive(key, value)?;
            }
            "detection.seed" => {
                self.detection.seed = match value {
                    "" | "random" | "none" => None,
                    v => Some(
                        v.parse()
                            .with_context(|| format!("Invalid detection.seed value: {}", v))?,
                    ),
                };
            }
            "detection.interval_secs" => {
                self.detection.interval_secs = parse_positive(key, value)?;
            }

            "taxonomy.confidence_threshold" => {
                self.taxonomy.confidence_threshold = parse_unit_interval(key, value)?;
            }
            "taxonomy.max_keywords" => {
                let max: usize = parse_positive(key, value)?;
                if max > 5 {
                    return Err(anyhow!("taxonomy.max_keywords must be between 1 and 5"));
                }
                self.taxonomy.max_keywords = max;
            }
            "taxonomy.max_depth" => {
                self.taxonomy.max_depth = parse_positive(key, value)?;
            }
            "taxonomy.max_children" => {
                self.taxonomy.max_children = parse_positive(key, value)?;
            }

            "repair.reference_offset" | "repair.upstream_offset" => {
                parse_utc_offset(value).map_err(|e| anyhow!("{}: {}", key, e))?;
                if key == "repair.reference_offset" {
                    self.repair.reference_offset = value.to_string();
                } else {
                    self.repair.upstream_offset = value.to_string();
                }
            }
            "repair.scan_interval_secs" => {
                self.repair.scan_interval_secs = parse_positive(key, value)?;
            }

            "proposals.endpoint" => {
                if !(value.starts_with("http://") || value.starts_with("https://")) {
                    return Err(anyhow!("proposals.endpoint must be an http(s) URL"));
                }
                self.proposals.endpoint = value.to_string();
            }
            "proposals.max_retries" => {
                self.proposals.max_retries = value
                    .parse()
                    .with_context(|| format!("Invalid proposals.max_retries value: {}", value))?;
            }
            "proposals.timeout_secs" => {
                self.proposals.timeout_secs = parse_positive(key, value)?;
            }
            "proposals.api_key" => {
                return Err(anyhow!(
                    "API keys cannot be stored in configuration. Set the LOOM_API_KEY environment variable instead."
                ));
            }

            "pipeline.workers" => {
                self.pipeline.workers = parse_positive(key, value)?;
            }
            "pipeline.context_window" => {
                self.pipeline.context_window = value
                    .parse()
                    .with_context(|| format!("Invalid pipeline.context_window value: {}", value))?;
            }

            "query.max_depth" => {
                self.query.max_depth = value
                    .parse()
                    .with_context(|| format!("Invalid query.max_depth value: {}", value))?;
            }
            "query.max_width" => {
                self.query.max_width = parse_positive(key, value)?;
            }
            "query.limit" => {
                self.query.limit = parse_positive(key, value)?;
            }
            "query.hop_decay" => {
                self.query.hop_decay = parse_unit_interval(key, value)?;
            }

            "database.path" => {
                self.database.path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `loom config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }

    /// Commit log database path
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.database.path {
            Some(path) if path.trim().is_empty() => Err(anyhow!("database.path is empty")),
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(crate::storage::default_database_path()),
        }
    }

    pub fn consolidation_config(&self) -> ConsolidationConfig {
        ConsolidationConfig {
            merge_threshold: self.consolidation.merge_threshold,
            lock_timeout: Duration::from_millis(self.consolidation.lock_timeout_ms),
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            similarity_threshold: self.detection.similarity_threshold,
            sample_size: self.detection.sample_size,
            seed: self.detection.seed,
        }
    }

    pub fn placement_config(&self) -> PlacementConfig {
        PlacementConfig {
            confidence_threshold: self.taxonomy.confidence_threshold,
            max_keywords: self.taxonomy.max_keywords,
            max_depth: self.taxonomy.max_depth,
            max_children: self.taxonomy.max_children,
            ..PlacementConfig::default()
        }
    }

    pub fn repair_config(&self) -> anyhow::Result<RepairConfig> {
        Ok(RepairConfig {
            reference_offset: parse_utc_offset(&self.repair.reference_offset)
                .map_err(|e| anyhow!("repair.reference_offset: {}", e))?,
            upstream_offset: parse_utc_offset(&self.repair.upstream_offset)
                .map_err(|e| anyhow!("repair.upstream_offset: {}", e))?,
            scan_interval: Duration::from_secs(self.repair.scan_interval_secs),
            lock_timeout: Duration::from_millis(self.consolidation.lock_timeout_ms),
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.pipeline.workers,
            context_window: self.pipeline.context_window,
            detection_interval: Duration::from_secs(self.detection.interval_secs),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_retries: self.proposals.max_retries,
            ..GatewayConfig::default()
        }
    }

    pub fn http_model_config(&self) -> anyhow::Result<HttpModelConfig> {
        Ok(HttpModelConfig {
            endpoint: self.proposals.endpoint.clone(),
            api_key: self.proposals.resolved_api_key()?,
            timeout: Duration::from_secs(self.proposals.timeout_secs),
        })
    }

    /// Query defaults; callers fill in text or seeds
    pub fn selection_defaults(&self) -> SelectionCriteria {
        SelectionCriteria {
            max_depth: self.query.max_depth,
            max_width: self.query.max_width,
            limit: self.query.limit,
            hop_decay: self.query.hop_decay,
            ..SelectionCriteria::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.consolidation.merge_threshold, 0.5);
        assert_eq!(config.taxonomy.max_keywords, 5);
    }

    #[test]
    fn test_get_set_roundtrip_and_validation() {
        let mut config = Config::default();
        config.set("consolidation.merge_threshold", "0.65").unwrap();
        assert_eq!(config.get("consolidation.merge_threshold").unwrap(), "0.65");

        assert!(config.set("consolidation.merge_threshold", "1.5").is_err());
        assert!(config.set("taxonomy.max_keywords", "6").is_err());
        assert!(config.set("repair.upstream_offset", "+25:00").is_err());
        config.set("repair.upstream_offset", "-05:00").unwrap();
        assert_eq!(config.get("repair.upstream_offset").unwrap(), "-05:00");

        config.set("detection.seed", "42").unwrap();
        assert_eq!(config.detector_config().seed, Some(42));
        config.set("detection.seed", "random").unwrap();
        assert_eq!(config.get("detection.seed").unwrap(), "(random)");

        assert!(config.set("nope.key", "1").is_err());
        assert!(config.set("proposals.api_key", "secret").is_err());
    }

    #[test]
    fn test_list_covers_every_key() {
        let mut config = Config::default();
        config.database.path = Some("/tmp/loom.db".to_string());
        let listed = config.list().unwrap();
        assert_eq!(listed.len(), KEYS.len());
        assert!(
            listed
                .iter()
                .any(|(k, v)| k == "database.path" && v == "/tmp/loom.db")
        );
    }

    #[test]
    fn test_toml_roundtrip_with_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [consolidation]
            merge_threshold = 0.7

            [pipeline]
            workers = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.consolidation.merge_threshold, 0.7);
        assert_eq!(config.consolidation.lock_timeout_ms, 5_000);
        assert_eq!(config.pipeline.workers, 2);
        assert_eq!(config.query.max_depth, 2);
    }
}
