//! HTTP client for OpenAI-compatible chat completion services (vLLM, OpenAI, etc.)

use super::Tier;
use crate::config::LLMServiceConfig;
use crate::error::{Result, SiteAskError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{atomic::AtomicU64, Arc};
use std::time::{Duration, Instant};

/// Trait for LLM service clients
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Generate chat completion
    async fn chat_completion(&self, messages: Vec<ChatMessage>) -> Result<String>;

    /// Get model name
    fn model_name(&self) -> &str;

    /// Usage counters, for clients that keep them
    fn metrics(&self) -> Option<MetricsSnapshot> {
        None
    }
}

/// Chat message for completion requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// API metrics for monitoring
#[derive(Debug, Default)]
pub struct APIMetrics {
    pub total_requests: AtomicU64,
    pub total_errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub total_latency_ms: AtomicU64,
}

/// vLLM/OpenAI-compatible client bound to one model
pub struct VLLMClient {
    http_client: reqwest::Client,
    config: LLMServiceConfig,
    model: String,
    cache: Arc<super::cache::LLMCache>,
    metrics: Arc<APIMetrics>,
}

impl VLLMClient {
    /// Create a client for the model configured for `tier`
    pub fn new(config: LLMServiceConfig, tier: Tier) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(SiteAskError::Http)?;

        let model = config.model_for(tier).to_string();

        // Judgments repeat across turns of a session; cache for 10 minutes
        let cache = Arc::new(super::cache::LLMCache::with_ttl(Duration::from_secs(600)));

        let metrics = Arc::new(APIMetrics::default());

        Ok(Self {
            http_client,
            config,
            model,
            cache,
            metrics,
        })
    }

    /// Create from environment variables
    pub fn from_env(tier: Tier) -> Result<Self> {
        Self::new(LLMServiceConfig::default(), tier)
    }

    /// Get current API metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        use std::sync::atomic::Ordering;

        let total = self.metrics.total_requests.load(Ordering::Relaxed);
        let hits = self.metrics.cache_hits.load(Ordering::Relaxed);
        let misses = self.metrics.cache_misses.load(Ordering::Relaxed);

        MetricsSnapshot {
            model: self.model.clone(),
            total_requests: total,
            total_errors: self.metrics.total_errors.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_entries: self.cache.stats().active_entries,
            cache_hit_rate: if total > 0 {
                hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            avg_latency_ms: if total > 0 {
                self.metrics.total_latency_ms.load(Ordering::Relaxed) as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of API metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub model: String,
    pub total_requests: u64,
    pub total_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_entries: usize,
    pub cache_hit_rate: f64,
    pub avg_latency_ms: f64,
}

#[async_trait]
impl LLMClient for VLLMClient {
    async fn chat_completion(&self, messages: Vec<ChatMessage>) -> Result<String> {
        use std::sync::atomic::Ordering;

        let start = Instant::now();
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        let messages_json = serde_json::to_string(&messages).unwrap_or_default();
        let cache_key = super::cache::chat_cache_key(&self.model, &messages_json);

        if let Some(cached) = self.cache.get(&cache_key) {
            tracing::debug!("Cache hit for chat completion ({})", self.model);
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }

        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);

        #[derive(Serialize)]
        struct ChatRequest {
            model: String,
            messages: Vec<ChatMessage>,
            temperature: f32,
            max_tokens: u32,
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<ChatChoice>,
        }

        #[derive(Deserialize)]
        struct ChatChoice {
            message: ChatMessage,
        }

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let url = format!(
            "{}/v1/chat/completions",
            self.config.url.trim_end_matches('/')
        );

        let mut req = self.http_client.post(&url).json(&request);

        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req.send().await.map_err(|e| {
            self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
            if e.is_timeout() {
                SiteAskError::Timeout(Duration::from_secs(self.config.timeout_secs))
            } else {
                SiteAskError::Http(e)
            }
        })?;

        if !response.status().is_success() {
            self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SiteAskError::ExternalError(format!(
                "LLM service error (HTTP {}): {}",
                status, body
            )));
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
            SiteAskError::Http(e)
        })?;

        let content = chat_response
            .choices
            .first()
            .ok_or_else(|| {
                self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
                SiteAskError::Llm("No response from LLM".to_string())
            })?
            .message
            .content
            .clone();

        let _ = self.cache.set(cache_key, content.clone());

        let elapsed = start.elapsed().as_millis() as u64;
        self.metrics
            .total_latency_ms
            .fetch_add(elapsed, Ordering::Relaxed);

        Ok(content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn metrics(&self) -> Option<MetricsSnapshot> {
        Some(self.snapshot())
    }
}

/// Extract the outermost JSON object from a model reply
///
/// Models wrap JSON in prose or markdown fences; the slice from the first `{`
/// to the last `}` is parsed.
pub fn extract_json_object(response: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let json_str = match (response.find('{'), response.rfind('}')) {
        (Some(start), Some(end)) if start < end => &response[start..=end],
        _ => {
            return Err(SiteAskError::InvalidResponse(format!(
                "no JSON object in reply: {}",
                truncate_for_log(response)
            )))
        }
    };

    match serde_json::from_str::<serde_json::Value>(json_str) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(SiteAskError::InvalidResponse(
            "reply JSON is not an object".to_string(),
        )),
        Err(e) => {
            tracing::debug!("Raw LLM response: {}", response);
            Err(SiteAskError::InvalidResponse(format!(
                "failed to parse reply JSON: {}",
                e
            )))
        }
    }
}

fn truncate_for_log(s: &str) -> &str {
    match s.char_indices().nth(120) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let reply = "Sure!\n```json\n{\"score\": 72, \"description\": \"good\"}\n```";
        let obj = extract_json_object(reply).unwrap();
        assert_eq!(obj["score"], 72);
    }

    #[test]
    fn test_extract_json_rejects_prose() {
        assert!(extract_json_object("I cannot help with that").is_err());
        assert!(extract_json_object("} backwards {").is_err());
    }

    #[test]
    fn test_extract_json_rejects_malformed() {
        let err = extract_json_object("{score: 5}").unwrap_err();
        assert!(matches!(err, SiteAskError::InvalidResponse(_)));
    }

    #[test]
    fn test_client_uses_tier_model() {
        let config = LLMServiceConfig {
            url: "http://127.0.0.1:9".to_string(),
            fast_model: "small".to_string(),
            accurate_model: "large".to_string(),
            ..Default::default()
        };
        let fast = VLLMClient::new(config.clone(), Tier::Fast).unwrap();
        let accurate = VLLMClient::new(config, Tier::Accurate).unwrap();
        assert_eq!(fast.model_name(), "small");
        assert_eq!(accurate.model_name(), "large");
        let metrics = fast.metrics().unwrap();
        assert_eq!(metrics.model, "small");
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.cache_entries, 0);
    }
}
