//! Schema-checked structured inference over two model tiers

use super::client::{extract_json_object, ChatMessage, LLMClient, MetricsSnapshot, VLLMClient};
use super::prompts::{PromptBindings, PromptTemplate};
use super::Tier;
use crate::config::LLMServiceConfig;
use crate::error::{Result, SiteAskError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// One structured inference call
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub prompt_name: String,
    pub template: PromptTemplate,
    pub bindings: PromptBindings,
    pub tier: Tier,
}

impl InferenceRequest {
    pub fn new(template: &PromptTemplate, bindings: PromptBindings, tier: Tier) -> Self {
        Self {
            prompt_name: template.name.clone(),
            template: template.clone(),
            bindings,
            tier,
        }
    }

    /// Template text with bindings substituted
    pub fn render(&self) -> String {
        self.template.fill(&self.bindings)
    }
}

/// Language inference capability
///
/// Returns a JSON object carrying every field of the template's schema.
/// Implementations are shared across turns and must allow concurrent calls.
#[async_trait]
pub trait Inference: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<Value>;

    /// Usage counters of the underlying service, if any
    fn metrics(&self) -> Vec<MetricsSnapshot> {
        Vec::new()
    }
}

/// Inference backed by a fast and an accurate chat client
pub struct TieredInference {
    fast: Arc<dyn LLMClient>,
    accurate: Arc<dyn LLMClient>,
}

impl TieredInference {
    pub fn new(fast: Arc<dyn LLMClient>, accurate: Arc<dyn LLMClient>) -> Self {
        Self { fast, accurate }
    }

    /// Create both tiers from configuration
    pub fn from_config(config: &LLMServiceConfig) -> Result<Self> {
        let fast = VLLMClient::new(config.clone(), Tier::Fast)?;
        let accurate = VLLMClient::new(config.clone(), Tier::Accurate)?;
        Ok(Self::new(Arc::new(fast), Arc::new(accurate)))
    }

    fn client(&self, tier: Tier) -> &Arc<dyn LLMClient> {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Accurate => &self.accurate,
        }
    }
}

#[async_trait]
impl Inference for TieredInference {
    async fn infer(&self, request: InferenceRequest) -> Result<Value> {
        let schema = serde_json::to_string(&request.template.schema)?;
        let messages = vec![
            ChatMessage::system(format!(
                "Respond ONLY with a JSON object with exactly these fields: {}",
                schema
            )),
            ChatMessage::user(request.render()),
        ];

        let client = self.client(request.tier);
        tracing::debug!(
            "Inference {} on {} ({})",
            request.prompt_name,
            client.model_name(),
            request.tier
        );
        let response = client.chat_completion(messages).await?;
        let object = extract_json_object(&response)?;
        check_schema(&request.template, &object)?;
        Ok(Value::Object(object))
    }

    fn metrics(&self) -> Vec<MetricsSnapshot> {
        [&self.fast, &self.accurate]
            .iter()
            .filter_map(|client| client.metrics())
            .collect()
    }
}

fn check_schema(
    template: &PromptTemplate,
    object: &serde_json::Map<String, Value>,
) -> Result<()> {
    let missing: Vec<&str> = template
        .schema
        .keys()
        .filter(|k| !object.contains_key(k.as_str()))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SiteAskError::InvalidResponse(format!(
            "{} reply is missing {}",
            template.name,
            missing.join(", ")
        )))
    }
}

/// Read a boolean reply field; models answer with `true` or `"True"`
pub fn field_bool(reply: &Value, key: &str) -> Option<bool> {
    match reply.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Read a non-empty string reply field
pub fn field_str<'a>(reply: &'a Value, key: &str) -> Option<&'a str> {
    reply
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedClient {
        reply: String,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl LLMClient for FixedClient {
        async fn chat_completion(&self, messages: Vec<ChatMessage>) -> Result<String> {
            self.seen.lock().unwrap().push(messages);
            Ok(self.reply.clone())
        }

        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    fn fixed(reply: &str) -> Arc<FixedClient> {
        Arc::new(FixedClient {
            reply: reply.to_string(),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn ranking_template() -> PromptTemplate {
        PromptTemplate::new(
            "RankingPrompt",
            "Thing",
            "Rate {item.description} for {request.query}",
            &[("score", "int"), ("description", "text")],
        )
    }

    #[tokio::test]
    async fn test_infer_routes_by_tier_and_fills_prompt() {
        let fast = fixed(r#"{"score": 80, "description": "fits"}"#);
        let accurate = fixed(r#"{"score": 10, "description": ""}"#);
        let inference = TieredInference::new(fast.clone(), accurate.clone());

        let bindings = PromptBindings::new()
            .set("item.description", "mango sticky rice")
            .set("request.query", "thai dessert");
        let reply = inference
            .infer(InferenceRequest::new(&ranking_template(), bindings, Tier::Fast))
            .await
            .unwrap();

        assert_eq!(reply["score"], 80);
        assert!(accurate.seen.lock().unwrap().is_empty());
        let seen = fast.seen.lock().unwrap();
        assert_eq!(seen[0][1].content, "Rate mango sticky rice for thai dessert");
        assert!(seen[0][0].content.contains("\"score\""));
    }

    #[tokio::test]
    async fn test_infer_rejects_missing_schema_fields() {
        let client = fixed(r#"{"score": 80}"#);
        let inference = TieredInference::new(client.clone(), client);
        let err = inference
            .infer(InferenceRequest::new(
                &ranking_template(),
                PromptBindings::new(),
                Tier::Fast,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, SiteAskError::InvalidResponse(_)));
    }

    #[test]
    fn test_metrics_cover_both_tiers() {
        let config = LLMServiceConfig {
            url: "http://127.0.0.1:9".to_string(),
            fast_model: "small".to_string(),
            accurate_model: "large".to_string(),
            ..Default::default()
        };
        let inference = TieredInference::from_config(&config).unwrap();
        let models: Vec<String> = inference.metrics().into_iter().map(|m| m.model).collect();
        assert_eq!(models, vec!["small", "large"]);

        let client = fixed("{}");
        assert!(TieredInference::new(client.clone(), client).metrics().is_empty());
    }

    #[test]
    fn test_field_readers() {
        let reply = serde_json::json!({
            "a": "True", "b": false, "c": "maybe", "d": "  text ", "e": ""
        });
        assert_eq!(field_bool(&reply, "a"), Some(true));
        assert_eq!(field_bool(&reply, "b"), Some(false));
        assert_eq!(field_bool(&reply, "c"), None);
        assert_eq!(field_str(&reply, "d"), Some("text"));
        assert_eq!(field_str(&reply, "e"), None);
    }
}
