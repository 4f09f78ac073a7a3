//! Summaries and synthesized answers over ranked items

use super::ranking::RankedItem;
use super::PromptContext;
use crate::error::{Result, SiteAskError};
use crate::llm::prompts::{DESCRIPTION_FOR_GENERATE, SUMMARIZE_RESULTS, SYNTHESIZE_FOR_GENERATE};
use crate::llm::{field_str, Inference, InferenceRequest, PromptTable, Tier};
use crate::retrieval::{trim, CandidateItem};
use crate::session::CancelToken;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const NO_ANSWER: &str = "I couldn't find relevant information to answer your question.";

/// Output of generate mode
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    pub answer: String,
    /// Cited items, each one of the ranked items
    pub items: Vec<CandidateItem>,
    /// Per-item descriptions that succeeded, in citation order
    pub details: Vec<(CandidateItem, String)>,
}

pub struct PostProcessor {
    inference: Arc<dyn Inference>,
    prompts: Arc<PromptTable>,
    top_n: usize,
    timeout: Duration,
}

impl PostProcessor {
    pub fn new(
        inference: Arc<dyn Inference>,
        prompts: Arc<PromptTable>,
        top_n: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            inference,
            prompts,
            top_n: top_n.max(1),
            timeout,
        }
    }

    async fn run(
        &self,
        name: &str,
        item_type: &str,
        bindings: crate::llm::PromptBindings,
        tier: Tier,
    ) -> Result<Value> {
        let template = self
            .prompts
            .find(name, item_type)
            .ok_or_else(|| SiteAskError::PromptNotFound {
                name: name.to_string(),
                item_type: item_type.to_string(),
            })?;
        let request = InferenceRequest::new(template, bindings, tier);
        tokio::time::timeout(self.timeout, self.inference.infer(request))
            .await
            .map_err(|_| SiteAskError::Timeout(self.timeout))?
    }

    /// Short summary of the best items; `None` when there is nothing to summarize
    pub async fn summarize(
        &self,
        context: &PromptContext,
        items: &[RankedItem],
    ) -> Result<Option<String>> {
        if items.is_empty() {
            return Ok(None);
        }
        let answers: Vec<Value> = items
            .iter()
            .take(self.top_n)
            .map(|item| trim::trim(item.payload()))
            .collect();
        let bindings = context
            .bindings()
            .set("request.answers", Value::Array(answers).to_string());

        let reply = self
            .run(SUMMARIZE_RESULTS, &context.item_type, bindings, Tier::Accurate)
            .await?;
        let summary = field_str(&reply, "summary")
            .ok_or_else(|| SiteAskError::InvalidResponse("summary reply is empty".into()))?;
        Ok(Some(summary.to_string()))
    }

    /// Answer the query directly from the gathered items
    ///
    /// Only URLs of gathered items survive the citation check, so the answer
    /// never points at a record retrieval did not return.
    pub async fn generate(
        &self,
        context: &PromptContext,
        items: &[RankedItem],
        cancel: &CancelToken,
    ) -> Result<GeneratedAnswer> {
        if items.is_empty() {
            return Ok(GeneratedAnswer {
                answer: NO_ANSWER.to_string(),
                items: Vec::new(),
                details: Vec::new(),
            });
        }

        let answers: Vec<Value> = items
            .iter()
            .map(|item| {
                json!({
                    "url": item.source_identifier(),
                    "name": item.candidate.name,
                    "item": trim::trim_hard(item.payload()),
                })
            })
            .collect();
        let bindings = context
            .bindings()
            .set("request.answers", Value::Array(answers).to_string());
        let reply = self
            .run(SYNTHESIZE_FOR_GENERATE, &context.item_type, bindings, Tier::Accurate)
            .await?;

        let answer = field_str(&reply, "answer").unwrap_or(NO_ANSWER).to_string();
        let cited = cited_urls(reply.get("urls"));
        let mut cited_items: Vec<CandidateItem> = Vec::new();
        for url in &cited {
            match items.iter().find(|i| i.source_identifier() == url) {
                Some(item) if !cited_items.iter().any(|c| &c.source_identifier == url) => {
                    cited_items.push(item.candidate.clone())
                }
                Some(_) => {}
                None => tracing::warn!("Answer cited unknown url {}; dropped", url),
            }
        }

        if cancel.is_cancelled() {
            return Err(SiteAskError::Cancelled);
        }
        let details = self.describe(context, &cited_items).await;
        Ok(GeneratedAnswer {
            answer,
            items: cited_items,
            details,
        })
    }

    async fn describe(
        &self,
        context: &PromptContext,
        items: &[CandidateItem],
    ) -> Vec<(CandidateItem, String)> {
        let calls = items.iter().map(|item| async move {
            let bindings = context
                .bindings()
                .set("item.description", trim::trim_hard(&item.payload).to_string());
            let result = self
                .run(DESCRIPTION_FOR_GENERATE, &context.item_type, bindings, Tier::Fast)
                .await
                .and_then(|reply| {
                    field_str(&reply, "description")
                        .map(str::to_string)
                        .ok_or_else(|| SiteAskError::InvalidResponse("empty description".into()))
                });
            (item, result)
        });

        futures::future::join_all(calls)
            .await
            .into_iter()
            .filter_map(|(item, result)| match result {
                Ok(description) => Some((item.clone(), description)),
                Err(e) => {
                    tracing::warn!("Describing {} failed: {}", item.source_identifier, e);
                    None
                }
            })
            .collect()
    }
}

/// URLs cited by a synthesis reply; accepts a list or a delimited string
fn cited_urls(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(urls)) => urls
            .iter()
            .filter_map(|u| u.as_str())
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(|u| u.trim_matches(|c: char| c == '[' || c == ']' || c == '"' || c == '\''))
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
