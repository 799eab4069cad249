use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use invoicemem_core::{
    ApplicationConfig, ConfidenceConfig, DecisionConfig, LearningConfig, PipelineConfig,
};
use invoicemem_engine::ProcessorConfig;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "DatabaseConfig::default_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
        }
    }
}

impl DatabaseConfig {
    fn default_url() -> String {
        "sqlite://invoicemem.db?mode=rwc".to_string()
    }
}

fn unit_range(name: &str, value: f64) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&value) {
        anyhow::bail!("{name} must be within [0, 1], got {value}");
    }
    Ok(())
}

impl Config {
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot find home directory"))?
            .join("invoicemem"))
    }

    /// Load `~/invoicemem/config.json`.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");

        if !config_path.exists() {
            anyhow::bail!(
                "Config file not found at: {}. Call Config::create_config() to write a template.",
                config_path.display()
            );
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn ensure_config_dir() -> anyhow::Result<PathBuf> {
        let config_dir = Self::config_dir()?;
        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir)
    }

    /// Write the default template into the config directory.
    pub fn create_config() -> anyhow::Result<PathBuf> {
        let config_path = Self::ensure_config_dir()?.join("config.json");
        Self::write_template(&config_path)?;
        Ok(config_path)
    }

    /// Write the default configuration to `path`, refusing to overwrite.
    pub fn write_template(path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            anyhow::bail!(
                "Config file already exists at: {}. Please edit it directly.",
                path.display()
            );
        }

        let template = serde_json::to_string_pretty(&Self::default())?;
        std::fs::write(path, template)?;
        info!("Created config file at: {}", path.display());
        Ok(())
    }

    /// Reject thresholds outside their meaningful ranges.
    pub fn validate(&self) -> anyhow::Result<()> {
        unit_range("application.min_confidence_threshold", self.application.min_confidence_threshold)?;
        if self.application.max_memories == 0 {
            anyhow::bail!("application.max_memories must be at least 1");
        }
        if self.application.default_currency.len() != 3 {
            anyhow::bail!(
                "application.default_currency must be a 3-letter code, got '{}'",
                self.application.default_currency
            );
        }

        let confidence = &self.confidence;
        unit_range("confidence.reinforcement_step", confidence.reinforcement_step)?;
        unit_range("confidence.penalty_step", confidence.penalty_step)?;
        unit_range("confidence.daily_decay_rate", confidence.daily_decay_rate)?;
        unit_range("confidence.min_decay_factor", confidence.min_decay_factor)?;
        unit_range("confidence.archive_confidence", confidence.archive_confidence)?;
        unit_range("confidence.archive_success_rate", confidence.archive_success_rate)?;
        if confidence.min_confidence <= 0.0 || confidence.min_confidence >= confidence.max_confidence {
            anyhow::bail!("confidence.min_confidence must be positive and below max_confidence");
        }
        unit_range("confidence.max_confidence", confidence.max_confidence)?;

        let decision = &self.decision;
        unit_range("decision.escalation_threshold", decision.escalation_threshold)?;
        unit_range("decision.rejection_floor", decision.rejection_floor)?;
        if decision.rejection_floor > decision.escalation_threshold {
            anyhow::bail!("decision.rejection_floor must not exceed escalation_threshold");
        }
        if decision.medium_amount > decision.high_amount {
            anyhow::bail!("decision.medium_amount must not exceed high_amount");
        }

        let learning = &self.learning;
        unit_range("learning.pattern_base_confidence", learning.pattern_base_confidence)?;
        unit_range("learning.pattern_confidence_cap", learning.pattern_confidence_cap)?;
        unit_range("learning.pattern_commit_confidence", learning.pattern_commit_confidence)?;
        unit_range("learning.resolution_confidence", learning.resolution_confidence)?;
        if learning.batch_size == 0 {
            anyhow::bail!("learning.batch_size must be at least 1");
        }

        if self.pipeline.stage_timeout_ms == 0 {
            anyhow::bail!("pipeline.stage_timeout_ms must be positive");
        }
        if self.database.url.trim().is_empty() {
            anyhow::bail!("database.url must not be empty");
        }
        Ok(())
    }
}

impl From<&Config> for ProcessorConfig {
    fn from(config: &Config) -> Self {
        Self {
            application: config.application.clone(),
            confidence: config.confidence.clone(),
            decision: config.decision.clone(),
            learning: config.learning.clone(),
            pipeline: config.pipeline.clone(),
        }
    }
}
