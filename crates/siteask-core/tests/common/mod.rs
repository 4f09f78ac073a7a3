//! Scripted collaborators shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use siteask_core::config::SiteConfig;
use siteask_core::llm::prompts::RANKING;
use siteask_core::pipeline::{EventKind, EventSink, FastTrackMode, TurnEvent};
use siteask_core::{
    CancelToken, CandidateItem, Config, Coordinator, Inference, InferenceRequest, QueryRequest,
    Result, Retriever, SiteAskError, SiteScope, TurnState,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Inference replying from a script keyed by prompt name
///
/// Ranking replies are looked up by item name: the first scripted name that
/// appears in the rendered prompt decides the score.
#[derive(Default)]
pub struct ScriptedInference {
    replies: HashMap<String, Value>,
    scores: Vec<(String, u8)>,
    delays: HashMap<String, Duration>,
    item_delays: Vec<(String, Duration)>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
            .reply(
                "DetectMemoryRequestPrompt",
                json!({"is_memory_request": false, "memory_request": ""}),
            )
            .reply(
                "DetectIrrelevantQueryPrompt",
                json!({"site_is_irrelevant_to_query": false, "explanation_for_irrelevance": ""}),
            )
    }

    pub fn reply(mut self, prompt: &str, value: Value) -> Self {
        self.replies.insert(prompt.to_string(), value);
        self
    }

    pub fn score(mut self, item_name: &str, score: u8) -> Self {
        self.scores.push((item_name.to_string(), score));
        self
    }

    pub fn delay(mut self, prompt: &str, delay: Duration) -> Self {
        self.delays.insert(prompt.to_string(), delay);
        self
    }

    /// Slow down ranking of one item only
    pub fn delay_item(mut self, item_name: &str, delay: Duration) -> Self {
        self.item_delays.push((item_name.to_string(), delay));
        self
    }

    pub fn calls_to(&self, prompt: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_str() == prompt)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Inference for ScriptedInference {
    async fn infer(&self, request: InferenceRequest) -> Result<Value> {
        self.calls.lock().unwrap().push(request.prompt_name.clone());
        if let Some(delay) = self.delays.get(&request.prompt_name) {
            tokio::time::sleep(*delay).await;
        }

        if request.prompt_name == RANKING {
            let text = request.render();
            if let Some((_, delay)) = self
                .item_delays
                .iter()
                .find(|(name, _)| text.contains(name.as_str()))
            {
                tokio::time::sleep(*delay).await;
            }
            return self
                .scores
                .iter()
                .find(|(name, _)| text.contains(name.as_str()))
                .map(|(name, score)| {
                    json!({"score": score, "description": format!("{} fits the question", name)})
                })
                .ok_or_else(|| SiteAskError::Llm("no score scripted".into()));
        }

        self.replies
            .get(&request.prompt_name)
            .cloned()
            .ok_or_else(|| SiteAskError::Llm(format!("unscripted prompt {}", request.prompt_name)))
    }
}

/// Retriever over a fixed item list that records every call
#[derive(Default)]
pub struct RecordingRetriever {
    items: Vec<CandidateItem>,
    queries: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingRetriever {
    pub fn new(items: Vec<CandidateItem>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    pub fn item(&self, source_identifier: &str) -> Option<CandidateItem> {
        self.items
            .iter()
            .find(|item| item.source_identifier == source_identifier)
            .cloned()
    }
}

#[async_trait]
impl Retriever for RecordingRetriever {
    async fn retrieve(
        &self,
        query: &str,
        scope: &SiteScope,
        limit: usize,
    ) -> Result<Vec<CandidateItem>> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.fail {
            return Err(SiteAskError::Retrieval("index unavailable".into()));
        }
        Ok(self
            .items
            .iter()
            .filter(|item| scope.includes(&item.site))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn lookup(&self, source_identifier: &str) -> Result<Option<CandidateItem>> {
        Ok(self.item(source_identifier))
    }
}

pub fn recipe(slug: &str, name: &str) -> CandidateItem {
    CandidateItem::new(
        format!("https://eats.example/{}", slug),
        "eats",
        json!({"@type": "Recipe", "name": name, "recipeCategory": "Dessert"}),
    )
}

/// Cooking site configuration with early sends and fast track switched off
pub fn config() -> Config {
    let mut config = Config::default();
    config.sites.insert(
        "eats".to_string(),
        SiteConfig {
            item_type: "Recipe".to_string(),
            description: Some("A cooking site".to_string()),
        },
    );
    config.pipeline.early_send_threshold = None;
    config.pipeline.fast_track = FastTrackMode::Disabled;
    config
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub inference: Arc<ScriptedInference>,
    pub retriever: Arc<RecordingRetriever>,
}

impl Harness {
    pub fn new(config: Config, inference: ScriptedInference, retriever: RecordingRetriever) -> Self {
        let inference = Arc::new(inference);
        let retriever = Arc::new(retriever);
        Self {
            coordinator: Coordinator::new(&config, inference.clone(), retriever.clone()),
            inference,
            retriever,
        }
    }

    /// Run a turn to completion and collect everything it emitted
    pub async fn run(&self, request: QueryRequest) -> (TurnState, Vec<TurnEvent>) {
        let cancel = CancelToken::new();
        let (mut sink, mut rx) = EventSink::channel(request.query_id.clone(), cancel.clone());
        let state = self.coordinator.run_turn(request, &mut sink, cancel).await;
        drop(sink);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (state, events)
    }
}

/// Score lists of every result batch, in emission order
pub fn batch_scores(events: &[TurnEvent]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ResultBatch { results } => {
                Some(results.iter().map(|r| r.relevance_score).collect())
            }
            _ => None,
        })
        .collect()
}

pub fn message_types(events: &[TurnEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.message_type()).collect()
}

pub fn assert_single_terminal_last(events: &[TurnEvent]) {
    let terminals: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_terminal())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(terminals, vec![events.len() - 1], "events: {:?}", message_types(events));
}
