//! Configuration management

use crate::error::{Result, SiteAskError};
use crate::pipeline::{FastTrackMode, JudgmentKind};
use crate::session::TurnPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// LLM service configuration
    #[serde(default)]
    pub llm_service: LLMServiceConfig,

    /// Query pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Per-site configuration keyed by site name
    #[serde(default)]
    pub sites: HashMap<String, SiteConfig>,

    /// Extra or replacement prompt templates
    #[serde(default)]
    pub prompts: Vec<PromptOverride>,

    /// Extra type hierarchy edges (child -> parent)
    #[serde(default)]
    pub type_parents: HashMap<String, String>,
}

/// LLM service configuration for external inference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMServiceConfig {
    /// Base URL of the OpenAI-compatible chat completion service
    pub url: String,

    /// Model used for cheap, latency-sensitive calls (ranking, light checks)
    #[serde(default = "default_fast_model")]
    pub fast_model: String,

    /// Model used for accurate calls (decontextualization, synthesis)
    #[serde(default = "default_accurate_model")]
    pub accurate_model: String,

    /// API key (optional, for authenticated services)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Sampling temperature
    #[serde(default)]
    pub temperature: f32,

    /// Maximum tokens per completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl LLMServiceConfig {
    /// Model name configured for a tier
    pub fn model_for(&self, tier: crate::llm::Tier) -> &str {
        match tier {
            crate::llm::Tier::Fast => &self.fast_model,
            crate::llm::Tier::Accurate => &self.accurate_model,
        }
    }
}

impl Default for LLMServiceConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("SITEASK_LLM_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            fast_model: default_fast_model(),
            accurate_model: default_accurate_model(),
            api_key: std::env::var("SITEASK_LLM_API_KEY").ok(),
            timeout_secs: default_timeout(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_fast_model() -> String {
    std::env::var("SITEASK_LLM_FAST_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string())
}

fn default_accurate_model() -> String {
    std::env::var("SITEASK_LLM_ACCURATE_MODEL").unwrap_or_else(|_| "gpt-4o".to_string())
}

fn default_timeout() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    512
}

/// Tuning knobs for one query turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum relevance score (inclusive) for an item to be emitted
    pub ranking_threshold: u8,

    /// Rationale is kept only for scores strictly above this value
    pub detail_threshold: u8,

    /// Items scoring above this are sent immediately as their own batch
    pub early_send_threshold: Option<u8>,

    /// Generate mode keeps items scoring above this value
    pub gather_threshold: u8,

    /// Maximum number of items emitted per turn
    pub max_results: usize,

    /// Maximum number of outstanding ranking calls
    pub ranking_concurrency: usize,

    /// Number of candidates requested from retrieval
    pub retrieval_limit: usize,

    /// Number of top items handed to the summarizer
    pub summarize_top_n: usize,

    /// Budget for each classifier judgment
    pub classifier_timeout_ms: u64,

    /// Budget for each retrieval call
    pub retrieval_timeout_ms: u64,

    /// Budget for each ranking call
    pub ranking_timeout_ms: u64,

    /// Budget for post-processing calls
    pub post_timeout_ms: u64,

    /// Global per-turn deadline
    pub turn_deadline_ms: u64,

    /// When speculative retrieval on the raw query is launched
    ///
    /// Site-scoped turns that run the relevance judgment never launch it:
    /// their retrieval starts only after classification, which adds the
    /// classifier's latency to time-to-first-result.
    pub fast_track: FastTrackMode,

    /// Judgments run by the classifier
    pub judgments: Vec<JudgmentKind>,

    /// What a new turn does to an in-flight turn of the same session
    pub turn_policy: TurnPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ranking_threshold: 50,
            detail_threshold: 45,
            early_send_threshold: Some(59),
            gather_threshold: 55,
            max_results: 10,
            ranking_concurrency: 16,
            retrieval_limit: 50,
            summarize_top_n: 3,
            classifier_timeout_ms: 8_000,
            retrieval_timeout_ms: 10_000,
            ranking_timeout_ms: 8_000,
            post_timeout_ms: 20_000,
            turn_deadline_ms: 60_000,
            fast_track: FastTrackMode::Heuristic,
            judgments: JudgmentKind::all().to_vec(),
            turn_policy: TurnPolicy::CancelPrevious,
        }
    }
}

impl PipelineConfig {
    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval_timeout_ms)
    }

    pub fn ranking_timeout(&self) -> Duration {
        Duration::from_millis(self.ranking_timeout_ms)
    }

    pub fn post_timeout(&self) -> Duration {
        Duration::from_millis(self.post_timeout_ms)
    }

    pub fn turn_deadline(&self) -> Duration {
        Duration::from_millis(self.turn_deadline_ms)
    }

    /// Reject settings the pipeline cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.ranking_threshold > 100 || self.detail_threshold > 100 {
            return Err(SiteAskError::Config(
                "thresholds must be within 0..=100".to_string(),
            ));
        }
        if self.ranking_concurrency == 0 {
            return Err(SiteAskError::Config(
                "ranking_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_results == 0 {
            return Err(SiteAskError::Config(
                "max_results must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-site configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// schema.org-like type of the items this site serves
    pub item_type: String,

    /// Short human description used in relevance prompts
    #[serde(default)]
    pub description: Option<String>,
}

/// Prompt template supplied through configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptOverride {
    pub name: String,
    #[serde(default = "default_prompt_type")]
    pub item_type: String,
    pub template: String,
    #[serde(default)]
    pub schema: HashMap<String, String>,
}

fn default_prompt_type() -> String {
    "Thing".to_string()
}

impl Config {
    /// Load config from default path
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load config from an explicit path, falling back to defaults when absent
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_yaml::from_str(&content)?;
            config.pipeline.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to default path
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config path
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("SITEASK_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(crate::CONFIG_DIR_NAME)
            .join("config.yml")
    }

    /// Item type served by a site, `Item` when the site is unknown
    pub fn item_type_for_site(&self, site: &str) -> String {
        self.sites
            .get(site)
            .map(|s| s.item_type.clone())
            .unwrap_or_else(|| crate::DEFAULT_ITEM_TYPE.to_string())
    }
}
