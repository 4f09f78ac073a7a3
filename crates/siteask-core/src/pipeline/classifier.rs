//! Query classification
//!
//! Independent judgments run concurrently, each with its own time budget,
//! and are folded into one [`DecontextualizedQuery`]. A failed judgment
//! degrades to a permissive default, except relevance which fails closed.

use super::PromptContext;
use crate::error::{Result, SiteAskError};
use crate::llm::prompts::{
    DECONTEXTUALIZE_CONTEXT, DETECT_IRRELEVANT_QUERY, DETECT_MEMORY_REQUEST,
    PREV_QUERY_DECONTEXTUALIZER, REQUIRED_INFO,
};
use crate::llm::{field_bool, field_str, Inference, InferenceRequest, PromptTable, Tier};
use crate::query::{DecontextualizedQuery, Query, SiteScope};
use crate::retrieval::Retriever;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CLARIFICATION: &str = "Could you tell me a little more about what you are looking for?";
const RELEVANCE_UNKNOWN: &str =
    "I could not determine whether this site can answer that question, so I won't guess.";

/// The narrow questions the classifier can ask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgmentKind {
    Relevance,
    Decontextualize,
    Memory,
    RequiredInfo,
}

impl JudgmentKind {
    pub fn all() -> [JudgmentKind; 4] {
        [
            Self::Relevance,
            Self::Decontextualize,
            Self::Memory,
            Self::RequiredInfo,
        ]
    }
}

impl fmt::Display for JudgmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Relevance => "relevance",
            Self::Decontextualize => "decontextualize",
            Self::Memory => "memory",
            Self::RequiredInfo => "required_info",
        };
        write!(f, "{}", name)
    }
}

/// Answer of one judgment
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Relevance {
        relevant: bool,
        explanation: Option<String>,
    },
    Decontextualized {
        resolved_text: String,
        mode: DecontextMode,
    },
    Memory {
        fact: Option<String>,
    },
    RequiredInfo {
        /// Question for the user when information is missing
        missing: Option<String>,
    },
    /// No prompt applies to this query or item type
    NotApplicable,
}

/// How the query is resolved against prior context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecontextMode {
    /// Nothing to resolve, or the caller already resolved it
    NoOp,
    /// Resolve against previous queries of the session
    PrevQuery,
    /// Resolve against the item the user was looking at
    ContextReference,
}

impl DecontextMode {
    pub fn for_query(query: &Query) -> Self {
        if query.supplied_resolution.is_some() {
            Self::NoOp
        } else if query.context_reference.is_some() {
            Self::ContextReference
        } else if !query.session_history.is_empty() {
            Self::PrevQuery
        } else {
            Self::NoOp
        }
    }
}

/// Everything a judgment may consult
pub struct JudgmentContext {
    pub query: Query,
    pub scope: SiteScope,
    pub item_type: String,
    pub prompt: PromptContext,
    pub prompts: Arc<PromptTable>,
    pub inference: Arc<dyn Inference>,
    pub retriever: Arc<dyn Retriever>,
}

impl JudgmentContext {
    /// Run a named prompt for the context's item type; `None` when no prompt applies
    async fn run_prompt(
        &self,
        name: &str,
        bindings: crate::llm::PromptBindings,
        tier: Tier,
    ) -> Result<Option<Value>> {
        let Some(template) = self.prompts.find(name, &self.item_type) else {
            tracing::debug!("No {} prompt for {}", name, self.item_type);
            return Ok(None);
        };
        let reply = self
            .inference
            .infer(InferenceRequest::new(template, bindings, tier))
            .await?;
        Ok(Some(reply))
    }
}

/// One prompt-driven classification
#[async_trait]
pub trait Judgment: Send + Sync {
    fn kind(&self) -> JudgmentKind;
    async fn judge(&self, ctx: &JudgmentContext) -> Result<Verdict>;
}

fn missing_field(prompt: &str, field: &str) -> SiteAskError {
    SiteAskError::InvalidResponse(format!("{} reply has no usable {}", prompt, field))
}

/// Is the site the right kind of place to ask this?
pub struct RelevanceCheck;

#[async_trait]
impl Judgment for RelevanceCheck {
    fn kind(&self) -> JudgmentKind {
        JudgmentKind::Relevance
    }

    async fn judge(&self, ctx: &JudgmentContext) -> Result<Verdict> {
        // every site together can answer anything
        if ctx.scope.is_all() {
            return Ok(Verdict::Relevance {
                relevant: true,
                explanation: None,
            });
        }
        let Some(reply) = ctx
            .run_prompt(DETECT_IRRELEVANT_QUERY, ctx.prompt.bindings(), Tier::Accurate)
            .await?
        else {
            return Ok(Verdict::NotApplicable);
        };
        let irrelevant = field_bool(&reply, "site_is_irrelevant_to_query")
            .ok_or_else(|| missing_field(DETECT_IRRELEVANT_QUERY, "site_is_irrelevant_to_query"))?;
        Ok(Verdict::Relevance {
            relevant: !irrelevant,
            explanation: field_str(&reply, "explanation_for_irrelevance").map(str::to_string),
        })
    }
}

/// Resolve follow-up queries into standalone ones
pub struct Decontextualizer;

#[async_trait]
impl Judgment for Decontextualizer {
    fn kind(&self) -> JudgmentKind {
        JudgmentKind::Decontextualize
    }

    async fn judge(&self, ctx: &JudgmentContext) -> Result<Verdict> {
        let query = &ctx.query;
        let mode = DecontextMode::for_query(query);
        let (prompt_name, bindings) = match mode {
            DecontextMode::NoOp => {
                return Ok(Verdict::Decontextualized {
                    resolved_text: query
                        .supplied_resolution
                        .clone()
                        .unwrap_or_else(|| query.raw_text.clone()),
                    mode,
                })
            }
            DecontextMode::PrevQuery => (PREV_QUERY_DECONTEXTUALIZER, ctx.prompt.bindings()),
            DecontextMode::ContextReference => {
                let reference = query.context_reference.as_deref().unwrap_or_default();
                let description = match ctx.retriever.lookup(reference).await? {
                    Some(item) => item.description(),
                    None => {
                        tracing::debug!("Context reference {} not in corpus", reference);
                        reference.to_string()
                    }
                };
                let bindings = ctx
                    .prompt
                    .bindings()
                    .set("request.contextDescription", description);
                (DECONTEXTUALIZE_CONTEXT, bindings)
            }
        };

        let Some(reply) = ctx.run_prompt(prompt_name, bindings, Tier::Accurate).await? else {
            return Ok(Verdict::Decontextualized {
                resolved_text: query.raw_text.clone(),
                mode,
            });
        };
        let required = field_bool(&reply, "requires_decontextualization")
            .ok_or_else(|| missing_field(prompt_name, "requires_decontextualization"))?;
        let resolved_text = match field_str(&reply, "decontextualized_query") {
            Some(resolved) if required => resolved.to_string(),
            _ => query.raw_text.clone(),
        };
        Ok(Verdict::Decontextualized {
            resolved_text,
            mode,
        })
    }
}

/// Does the statement carry a durable fact about the user?
pub struct MemoryDetector;

#[async_trait]
impl Judgment for MemoryDetector {
    fn kind(&self) -> JudgmentKind {
        JudgmentKind::Memory
    }

    async fn judge(&self, ctx: &JudgmentContext) -> Result<Verdict> {
        let Some(reply) = ctx
            .run_prompt(DETECT_MEMORY_REQUEST, ctx.prompt.bindings(), Tier::Fast)
            .await?
        else {
            return Ok(Verdict::NotApplicable);
        };
        let is_memory = field_bool(&reply, "is_memory_request").unwrap_or(false);
        let fact = field_str(&reply, "memory_request")
            .filter(|_| is_memory)
            .filter(|fact| !ctx.query.remembered_facts.iter().any(|f| f == fact))
            .map(str::to_string);
        Ok(Verdict::Memory { fact })
    }
}

/// Is information the item type depends on (e.g. location) present?
pub struct RequiredInfoCheck;

#[async_trait]
impl Judgment for RequiredInfoCheck {
    fn kind(&self) -> JudgmentKind {
        JudgmentKind::RequiredInfo
    }

    async fn judge(&self, ctx: &JudgmentContext) -> Result<Verdict> {
        let Some(reply) = ctx
            .run_prompt(REQUIRED_INFO, ctx.prompt.bindings(), Tier::Accurate)
            .await?
        else {
            return Ok(Verdict::NotApplicable);
        };
        let found = field_bool(&reply, "required_info_found")
            .ok_or_else(|| missing_field(REQUIRED_INFO, "required_info_found"))?;
        let missing = if found {
            None
        } else {
            Some(
                field_str(&reply, "user_question")
                    .unwrap_or(DEFAULT_CLARIFICATION)
                    .to_string(),
            )
        };
        Ok(Verdict::RequiredInfo { missing })
    }
}

/// Folded result of all judgments
#[derive(Debug, Clone)]
pub struct ClassifierOutcome {
    pub decontextualized: DecontextualizedQuery,
    /// Shown to the user when the query is irrelevant
    pub irrelevance_explanation: Option<String>,
    /// Judgments that failed or timed out and fell back to their default
    pub degraded: Vec<JudgmentKind>,
}

pub struct Classifier {
    judgments: Vec<Arc<dyn Judgment>>,
    timeout: Duration,
}

impl Classifier {
    pub fn new(judgments: Vec<Arc<dyn Judgment>>, timeout: Duration) -> Self {
        Self { judgments, timeout }
    }

    /// Build the configured set of judgments
    pub fn from_kinds(kinds: &[JudgmentKind], timeout: Duration) -> Self {
        let mut judgments: Vec<Arc<dyn Judgment>> = Vec::new();
        for kind in kinds {
            if judgments.iter().any(|j| j.kind() == *kind) {
                continue;
            }
            judgments.push(match kind {
                JudgmentKind::Relevance => Arc::new(RelevanceCheck),
                JudgmentKind::Decontextualize => Arc::new(Decontextualizer),
                JudgmentKind::Memory => Arc::new(MemoryDetector),
                JudgmentKind::RequiredInfo => Arc::new(RequiredInfoCheck),
            });
        }
        Self::new(judgments, timeout)
    }

    pub fn kinds(&self) -> Vec<JudgmentKind> {
        self.judgments.iter().map(|j| j.kind()).collect()
    }

    /// Run every judgment concurrently and fold their verdicts
    pub async fn classify(&self, ctx: &JudgmentContext) -> ClassifierOutcome {
        let runs = self.judgments.iter().map(|judgment| async move {
            let kind = judgment.kind();
            let result = match tokio::time::timeout(self.timeout, judgment.judge(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(SiteAskError::Timeout(self.timeout)),
            };
            (kind, result)
        });
        let results = futures::future::join_all(runs).await;

        let query = &ctx.query;
        let mut outcome = ClassifierOutcome {
            decontextualized: DecontextualizedQuery::passthrough(query),
            irrelevance_explanation: None,
            degraded: Vec::new(),
        };
        if let Some(supplied) = &query.supplied_resolution {
            outcome.decontextualized.resolved_text = supplied.clone();
        }

        for (kind, result) in results {
            match result {
                Ok(verdict) => apply_verdict(&mut outcome, verdict),
                Err(e) => {
                    tracing::warn!("Judgment {} degraded: {}", kind, e);
                    outcome.degraded.push(kind);
                    if kind == JudgmentKind::Relevance {
                        outcome.decontextualized.is_relevant_to_corpus = false;
                        outcome.irrelevance_explanation = Some(RELEVANCE_UNKNOWN.to_string());
                    }
                }
            }
        }

        tracing::debug!(
            "Classified {:?} as {:?} (degraded: {:?})",
            query.raw_text,
            outcome.decontextualized.resolved_text,
            outcome.degraded
        );
        outcome
    }
}

fn apply_verdict(outcome: &mut ClassifierOutcome, verdict: Verdict) {
    let dq = &mut outcome.decontextualized;
    match verdict {
        Verdict::Relevance {
            relevant,
            explanation,
        } => {
            dq.is_relevant_to_corpus = relevant;
            if !relevant {
                outcome.irrelevance_explanation = Some(explanation.unwrap_or_else(|| {
                    "This site does not have information about that.".to_string()
                }));
            }
        }
        Verdict::Decontextualized { resolved_text, .. } => {
            dq.resolved_text = resolved_text;
        }
        Verdict::Memory { fact } => dq.memory_candidate = fact,
        Verdict::RequiredInfo { missing } => {
            dq.requires_user_clarification = missing.is_some();
            dq.clarification_prompt = missing;
        }
        Verdict::NotApplicable => {}
    }
}
