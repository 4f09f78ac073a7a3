//! Query pipeline
//!
//! A turn flows through:
//! - [`classifier`]: concurrent prompt-driven judgments over the raw query
//! - [`fast_track`]: speculative retrieval racing the classifier
//! - [`ranking`]: per-candidate scoring, streamed as calls complete
//! - [`post`]: optional summary or synthesized answer
//!
//! [`coordinator`] drives the turn and writes [`events`] to the caller.

pub mod classifier;
pub mod coordinator;
pub mod events;
pub mod fast_track;
pub mod post;
pub mod ranking;

pub use classifier::{
    Classifier, ClassifierOutcome, DecontextMode, Judgment, JudgmentContext, JudgmentKind, Verdict,
};
pub use coordinator::{Coordinator, TurnPhase, TurnState};
pub use events::{
    collect_response, encode_sse, EventKind, EventSink, SseDecoder, TurnEvent, TurnResponse,
};
pub use fast_track::{FastTrack, FastTrackMode};
pub use post::{GeneratedAnswer, PostProcessor};
pub use ranking::{RankOutcome, RankedItem, RankingEngine, RankingSettings};

use crate::llm::PromptBindings;

/// Values every prompt of a turn can reference
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub raw_query: String,
    /// Set once the classifier has produced the authoritative reading
    pub resolved_query: Option<String>,
    pub previous_queries: Vec<String>,
    pub site: String,
    pub item_type: String,
    pub remembered_facts: Vec<String>,
}

impl PromptContext {
    /// The query text prompts should judge against
    pub fn query_text(&self) -> String {
        match &self.resolved_query {
            Some(resolved) => resolved.clone(),
            None if !self.previous_queries.is_empty() => format!(
                "{} previous queries: {}",
                self.raw_query,
                format_list(&self.previous_queries)
            ),
            None => self.raw_query.clone(),
        }
    }

    pub fn bindings(&self) -> PromptBindings {
        PromptBindings::new()
            .set("request.query", self.query_text())
            .set("request.rawQuery", self.raw_query.clone())
            .set("request.previousQueries", format_list(&self.previous_queries))
            .set("request.site", self.site.clone())
            .set("request.itemType", self.item_type.clone())
            .set("site.itemType", self.item_type.clone())
            .set("request.rememberedFacts", format_list(&self.remembered_facts))
            .set("request.contextDescription", String::new())
    }
}

fn format_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_default()
}
