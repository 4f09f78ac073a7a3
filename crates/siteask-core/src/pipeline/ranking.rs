//! Per-candidate relevance scoring
//!
//! Every candidate gets one inference call with the ranking prompt nearest to
//! its declared type. Calls run concurrently up to a limit and outcomes are
//! yielded as soon as each call finishes.

use super::PromptContext;
use crate::config::PipelineConfig;
use crate::error::{Result, SiteAskError};
use crate::llm::prompts::RANKING;
use crate::llm::{field_str, Inference, InferenceRequest, PromptTable, Tier};
use crate::retrieval::{trim, CandidateItem};
use crate::session::CancelToken;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A retrieved item with the score and rationale ranking attached
///
/// The payload inside `candidate` is exactly what retrieval returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    #[serde(flatten)]
    pub candidate: CandidateItem,
    #[serde(rename = "score")]
    pub relevance_score: u8,
    #[serde(rename = "description", default)]
    pub rationale: String,
    #[serde(rename = "rank_latency_ms", with = "duration_ms", default)]
    pub rank_latency: Duration,
    /// Position in the retrieval order, used as the tie-break
    #[serde(skip)]
    pub retrieval_index: usize,
}

impl RankedItem {
    pub fn source_identifier(&self) -> &str {
        &self.candidate.source_identifier
    }

    pub fn payload(&self) -> &Value {
        &self.candidate.payload
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Sort descending by score, ties kept in retrieval order
pub fn sort_batch(items: &mut [RankedItem]) {
    items.sort_by(|a, b| {
        b.relevance_score
            .cmp(&a.relevance_score)
            .then(a.retrieval_index.cmp(&b.retrieval_index))
    });
}

/// Result of scoring one candidate
#[derive(Debug)]
pub enum RankOutcome {
    Ranked(RankedItem),
    /// Scored, but under the threshold
    Below { source_identifier: String, score: u8 },
    Failed {
        source_identifier: String,
        error: SiteAskError,
    },
    /// Not issued because the turn was cancelled
    Skipped { source_identifier: String },
}

#[derive(Debug, Clone)]
pub struct RankingSettings {
    /// Minimum score (inclusive) to keep an item
    pub threshold: u8,
    /// Rationale kept only above this score
    pub detail_threshold: u8,
    pub concurrency: usize,
    pub timeout: Duration,
}

impl From<&PipelineConfig> for RankingSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            threshold: config.ranking_threshold,
            detail_threshold: config.detail_threshold,
            concurrency: config.ranking_concurrency.max(1),
            timeout: config.ranking_timeout(),
        }
    }
}

pub struct RankingEngine {
    inference: Arc<dyn Inference>,
    prompts: Arc<PromptTable>,
    site_types: HashMap<String, String>,
    settings: RankingSettings,
}

impl RankingEngine {
    pub fn new(
        inference: Arc<dyn Inference>,
        prompts: Arc<PromptTable>,
        site_types: HashMap<String, String>,
        settings: RankingSettings,
    ) -> Self {
        Self {
            inference,
            prompts,
            site_types,
            settings,
        }
    }

    /// Item type used to pick the ranking prompt
    ///
    /// First declared `@type` the hierarchy knows, then the site's configured
    /// type, then whatever the candidate declares first.
    pub fn item_type_for(&self, candidate: &CandidateItem) -> String {
        let declared = candidate.declared_types();
        if let Some(known) = declared
            .iter()
            .find(|t| self.prompts.hierarchy().is_known(t))
        {
            return known.clone();
        }
        if let Some(site_type) = self.site_types.get(&candidate.site) {
            return site_type.clone();
        }
        declared
            .into_iter()
            .next()
            .unwrap_or_else(|| crate::DEFAULT_ITEM_TYPE.to_string())
    }

    /// Score candidates concurrently, yielding outcomes in completion order
    pub fn rank_stream<'a>(
        &'a self,
        context: &'a PromptContext,
        candidates: Vec<CandidateItem>,
        hard_trim: bool,
        cancel: CancelToken,
    ) -> impl Stream<Item = RankOutcome> + Send + 'a {
        stream::iter(candidates.into_iter().enumerate())
            .map(move |(idx, candidate)| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return RankOutcome::Skipped {
                            source_identifier: candidate.source_identifier,
                        };
                    }
                    self.rank_one(context, idx, candidate, hard_trim).await
                }
            })
            .buffer_unordered(self.settings.concurrency)
    }

    async fn rank_one(
        &self,
        context: &PromptContext,
        retrieval_index: usize,
        candidate: CandidateItem,
        hard_trim: bool,
    ) -> RankOutcome {
        let start = Instant::now();
        let source_identifier = candidate.source_identifier.clone();

        match self.score(context, &candidate, hard_trim).await {
            Ok((score, _)) if score < self.settings.threshold => {
                tracing::debug!("{} scored {} (below threshold)", source_identifier, score);
                RankOutcome::Below {
                    source_identifier,
                    score,
                }
            }
            Ok((score, description)) => {
                let rationale = if score > self.settings.detail_threshold {
                    description
                } else {
                    String::new()
                };
                RankOutcome::Ranked(RankedItem {
                    candidate,
                    relevance_score: score,
                    rationale,
                    rank_latency: start.elapsed(),
                    retrieval_index,
                })
            }
            Err(error) => {
                tracing::warn!("Ranking {} failed: {}", source_identifier, error);
                RankOutcome::Failed {
                    source_identifier,
                    error,
                }
            }
        }
    }

    async fn score(
        &self,
        context: &PromptContext,
        candidate: &CandidateItem,
        hard_trim: bool,
    ) -> Result<(u8, String)> {
        if !candidate.payload.is_object() {
            return Err(SiteAskError::InvalidInput(format!(
                "payload of {} is not an object",
                candidate.source_identifier
            )));
        }

        let item_type = self.item_type_for(candidate);
        let template =
            self.prompts
                .find(RANKING, &item_type)
                .ok_or_else(|| SiteAskError::PromptNotFound {
                    name: RANKING.to_string(),
                    item_type: item_type.clone(),
                })?;

        let description = if hard_trim {
            trim::trim_hard(&candidate.payload).to_string()
        } else {
            candidate.description()
        };
        let bindings = context
            .bindings()
            .set("request.site", candidate.site.clone())
            .set("site.itemType", item_type)
            .set("item.description", description)
            .set(
                "ranking.detailThreshold",
                self.settings.detail_threshold.to_string(),
            );

        let request = InferenceRequest::new(template, bindings, Tier::Fast);
        let reply = tokio::time::timeout(self.settings.timeout, self.inference.infer(request))
            .await
            .map_err(|_| SiteAskError::Timeout(self.settings.timeout))??;

        let score = parse_score(reply.get("score")).ok_or_else(|| {
            SiteAskError::InvalidResponse(format!("unusable score: {:?}", reply.get("score")))
        })?;
        let description = field_str(&reply, "description").unwrap_or_default();
        Ok((score, description.to_string()))
    }
}

/// Integer score in `0..=100`; floats round, out-of-range values clamp
pub fn parse_score(value: Option<&Value>) -> Option<u8> {
    let raw = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    Some(raw.round().clamp(0.0, 100.0) as u8)
}
