//! Turn coordination
//!
//! The [`Coordinator`] owns one [`TurnState`] per turn and is the only
//! writer of the turn's event stream. Classification and fast-track retrieval
//! start together; ranked items are streamed as they clear the thresholds.

use super::classifier::{Classifier, JudgmentContext, JudgmentKind};
use super::events::{EventKind, EventSink, TurnEvent};
use super::fast_track::FastTrack;
use super::post::PostProcessor;
use super::ranking::{sort_batch, RankOutcome, RankedItem, RankingEngine, RankingSettings};
use super::PromptContext;
use crate::config::{Config, PipelineConfig};
use crate::llm::MetricsSnapshot;
use crate::error::{Result, SiteAskError};
use crate::llm::{Inference, PromptTable};
use crate::query::{DecontextualizedQuery, GenerateMode, Query, QueryRequest, SiteScope};
use crate::retrieval::{CandidateItem, Retriever};
use crate::session::{CancelToken, SessionRegistry};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const REMEMBER_MESSAGE: &str = "I'll remember that";
const NO_RESULTS: &str = "No results were found for that query.";
const TIMED_OUT: &str = "The query took too long; showing the results found so far.";

/// Where a turn is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnPhase {
    Started,
    Classifying,
    Retrieving,
    Ranking,
    PostProcessing,
    Completed,
    ClarificationNeeded,
    Irrelevant,
    Cancelled,
}

impl TurnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::ClarificationNeeded | Self::Irrelevant | Self::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TurnPhase) -> bool {
        use TurnPhase::*;
        if self.is_terminal() {
            return false;
        }
        // the deadline and cancellation can end any live turn
        if matches!(next, Completed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Started, Classifying)
                | (Classifying, Retrieving)
                | (Classifying, Ranking)
                | (Classifying, ClarificationNeeded)
                | (Classifying, Irrelevant)
                | (Retrieving, Ranking)
                | (Ranking, PostProcessing)
        )
    }
}

/// Mutable state of one turn, owned by the coordinator
#[derive(Debug, Clone)]
pub struct TurnState {
    pub query_id: String,
    pub phase: TurnPhase,
    /// Every phase entered, in order
    pub phases: Vec<TurnPhase>,
    pub decontextualized: Option<DecontextualizedQuery>,
    /// Items that cleared the ranking threshold
    pub ranked: Vec<RankedItem>,
    pub emitted_count: usize,
    pub emitted_ids: HashSet<String>,
    pub remembered: Vec<String>,
    pub fast_track_discarded: bool,
}

impl TurnState {
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            phase: TurnPhase::Started,
            phases: vec![TurnPhase::Started],
            decontextualized: None,
            ranked: Vec::new(),
            emitted_count: 0,
            emitted_ids: HashSet::new(),
            remembered: Vec::new(),
            fast_track_discarded: false,
        }
    }

    pub fn transition(&mut self, next: TurnPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(SiteAskError::InvalidInput(format!(
                "turn {} cannot move from {:?} to {:?}",
                self.query_id, self.phase, next
            )));
        }
        debug!("Turn {}: {:?} -> {:?}", self.query_id, self.phase, next);
        self.phase = next;
        self.phases.push(next);
        Ok(())
    }

    /// Record an item as sent; false if it already was
    fn mark_emitted(&mut self, source_identifier: &str) -> bool {
        if self.emitted_ids.insert(source_identifier.to_string()) {
            self.emitted_count += 1;
            true
        } else {
            false
        }
    }
}

/// How a turn ended, before the terminal event is written
enum Ending {
    Complete,
    Irrelevant(String),
    AskUser(String),
}

pub struct Coordinator {
    config: PipelineConfig,
    site_types: HashMap<String, String>,
    prompts: Arc<PromptTable>,
    inference: Arc<dyn Inference>,
    retriever: Arc<dyn Retriever>,
    classifier: Classifier,
    ranking: RankingEngine,
    post: PostProcessor,
    sessions: SessionRegistry,
}

impl Coordinator {
    pub fn new(config: &Config, inference: Arc<dyn Inference>, retriever: Arc<dyn Retriever>) -> Self {
        let prompts = Arc::new(PromptTable::from_config(config));
        let pipeline = config.pipeline.clone();
        let site_types: HashMap<String, String> = config
            .sites
            .iter()
            .map(|(site, cfg)| (site.clone(), cfg.item_type.clone()))
            .collect();

        Self {
            classifier: Classifier::from_kinds(&pipeline.judgments, pipeline.classifier_timeout()),
            ranking: RankingEngine::new(
                inference.clone(),
                prompts.clone(),
                site_types.clone(),
                RankingSettings::from(&pipeline),
            ),
            post: PostProcessor::new(
                inference.clone(),
                prompts.clone(),
                pipeline.summarize_top_n,
                pipeline.post_timeout(),
            ),
            sessions: SessionRegistry::new(pipeline.turn_policy),
            config: pipeline,
            site_types,
            prompts,
            inference,
            retriever,
        }
    }

    /// Usage of the inference service behind this coordinator
    pub fn inference_metrics(&self) -> Vec<MetricsSnapshot> {
        self.inference.metrics()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn retriever(&self) -> &Arc<dyn Retriever> {
        &self.retriever
    }

    /// Item type shared by every site in scope, `Item` when they differ
    pub fn item_type_for_scope(&self, scope: &SiteScope) -> String {
        let types: HashSet<&String> = match scope {
            SiteScope::All => self.site_types.values().collect(),
            SiteScope::Sites(sites) => sites.iter().filter_map(|s| self.site_types.get(s)).collect(),
        };
        match (types.len(), types.into_iter().next()) {
            (1, Some(item_type)) => item_type.clone(),
            _ => crate::DEFAULT_ITEM_TYPE.to_string(),
        }
    }

    /// Run a turn in the background, returning its event stream
    ///
    /// With a session id the turn goes through the session registry, so a
    /// newer turn on the same session supersedes or queues behind it.
    /// Dropping the receiver cancels the turn.
    pub fn spawn_turn(
        self: &Arc<Self>,
        request: QueryRequest,
        session_id: Option<String>,
    ) -> mpsc::UnboundedReceiver<TurnEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            match session_id {
                Some(session_id) => {
                    let guard = coordinator
                        .sessions
                        .begin_turn(&session_id, &request.query_id)
                        .await;
                    let cancel = guard.cancel_token();
                    let mut sink = EventSink::new(request.query_id.clone(), tx, cancel.clone());
                    coordinator.run_turn(request, &mut sink, cancel).await;
                    // release the session before the stream closes
                    drop(guard);
                }
                None => {
                    let cancel = CancelToken::new();
                    let mut sink = EventSink::new(request.query_id.clone(), tx, cancel.clone());
                    coordinator.run_turn(request, &mut sink, cancel).await;
                }
            }
        });
        rx
    }

    /// Run one turn to its terminal event
    ///
    /// `cancel` should be the token the sink was built with.
    pub async fn run_turn(
        &self,
        request: QueryRequest,
        sink: &mut EventSink,
        cancel: CancelToken,
    ) -> TurnState {
        let started = Instant::now();
        let mut state = TurnState::new(&request.query_id);
        let deadline = self.config.turn_deadline();
        let disconnected = sink.disconnected();

        let flow = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SiteAskError::Cancelled),
            _ = disconnected => {
                cancel.cancel();
                Err(SiteAskError::Cancelled)
            }
            result = tokio::time::timeout(deadline, self.drive(&request, &mut state, sink, &cancel)) => {
                result.unwrap_or(Err(SiteAskError::Timeout(deadline)))
            }
        };

        let (phase, terminal) = match flow {
            Ok(Ending::Complete) => (TurnPhase::Completed, EventKind::Complete),
            Ok(Ending::Irrelevant(message)) => (
                TurnPhase::Irrelevant,
                EventKind::SiteIsIrrelevantToQuery { message },
            ),
            Ok(Ending::AskUser(message)) => {
                (TurnPhase::ClarificationNeeded, EventKind::AskUser { message })
            }
            Err(SiteAskError::Timeout(_)) => {
                warn!("Turn {} hit its {:?} deadline", request.query_id, deadline);
                let _ = sink.emit(EventKind::IntermediateMessage {
                    message: TIMED_OUT.to_string(),
                });
                if request.generate_mode != GenerateMode::Generate {
                    if let Err(e) = self.flush_unsent(&mut state, sink) {
                        debug!("Final batch of {} not delivered: {}", request.query_id, e);
                    }
                }
                (TurnPhase::Completed, EventKind::Complete)
            }
            Err(SiteAskError::Cancelled) => (
                TurnPhase::Cancelled,
                EventKind::Cancelled {
                    reason: "turn was cancelled".to_string(),
                },
            ),
            Err(e) => {
                warn!("Turn {} failed: {}", request.query_id, e);
                let _ = sink.emit(EventKind::IntermediateMessage {
                    message: format!("Something went wrong: {}", e),
                });
                (TurnPhase::Completed, EventKind::Complete)
            }
        };

        if state.phase != phase {
            if let Err(e) = state.transition(phase) {
                warn!("{}", e);
            }
        }
        if !sink.is_terminated() {
            if let Err(e) = sink.emit(terminal) {
                debug!("Terminal event of {} not delivered: {}", request.query_id, e);
            }
        }

        info!(
            "Turn {} ended {:?}: {} items sent, {} events, {:?}",
            request.query_id,
            state.phase,
            state.emitted_count,
            sink.sent(),
            started.elapsed()
        );
        state
    }

    async fn drive(
        &self,
        request: &QueryRequest,
        state: &mut TurnState,
        sink: &mut EventSink,
        cancel: &CancelToken,
    ) -> Result<Ending> {
        let query = request.to_query();
        let scope = request.site_scope.clone();
        let item_type = self.item_type_for_scope(&scope);
        let mut prompt = PromptContext {
            raw_query: query.raw_text.clone(),
            resolved_query: None,
            previous_queries: query.session_history.clone(),
            site: scope.to_string(),
            item_type: item_type.clone(),
            remembered_facts: query.remembered_facts.clone(),
        };

        state.transition(TurnPhase::Classifying)?;
        // an irrelevant query must not reach retrieval at all, so a scoped
        // turn waits for the relevance verdict before retrieving
        let relevance_pending =
            !scope.is_all() && self.classifier.kinds().contains(&JudgmentKind::Relevance);
        let launch = !relevance_pending && self.config.fast_track.should_launch(&query);
        let fast_track = launch.then(|| {
            FastTrack::launch(
                self.retriever.clone(),
                &query,
                scope.clone(),
                self.config.retrieval_limit,
                self.config.retrieval_timeout(),
            )
        });

        let judgment_ctx = JudgmentContext {
            query: query.clone(),
            scope: scope.clone(),
            item_type,
            prompt: prompt.clone(),
            prompts: self.prompts.clone(),
            inference: self.inference.clone(),
            retriever: self.retriever.clone(),
        };
        let outcome = self.classifier.classify(&judgment_ctx).await;
        let dq = outcome.decontextualized;
        state.decontextualized = Some(dq.clone());

        if !dq.is_relevant_to_corpus {
            state.transition(TurnPhase::Irrelevant)?;
            return Ok(Ending::Irrelevant(outcome.irrelevance_explanation.unwrap_or_default()));
        }

        for kind in outcome
            .degraded
            .iter()
            .filter(|k| **k != JudgmentKind::Relevance)
        {
            sink.emit(EventKind::IntermediateMessage {
                message: format!("The {} check did not finish; continuing without it.", kind),
            })?;
        }

        if dq.requires_user_clarification {
            state.transition(TurnPhase::ClarificationNeeded)?;
            return Ok(Ending::AskUser(dq.clarification_prompt.unwrap_or_default()));
        }

        sink.emit(EventKind::QueryAnalysis {
            decontextualized_query: dq.resolved_text.clone(),
            memory_candidate: dq.memory_candidate.clone(),
        })?;
        if let Some(fact) = &dq.memory_candidate {
            state.remembered.push(fact.clone());
            sink.emit(EventKind::Remember {
                item_to_remember: fact.clone(),
                message: REMEMBER_MESSAGE.to_string(),
            })?;
        }

        prompt.resolved_query = Some(dq.resolved_text.clone());
        let candidates = match self
            .candidates(&query, &dq.resolved_text, &scope, fast_track, state)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Retrieval for {} failed: {}", request.query_id, e);
                sink.emit(EventKind::IntermediateMessage {
                    message: format!("Could not search the sites: {}", e),
                })?;
                Vec::new()
            }
        };
        if cancel.is_cancelled() {
            return Err(SiteAskError::Cancelled);
        }

        if scope.is_all() {
            let sites = busiest_sites(&candidates, 3);
            if sites.len() > 1 {
                sink.emit(EventKind::AskingSites {
                    message: format!("Asking {}", sites.join(", ")),
                    sites,
                })?;
            }
        }

        if state.phase != TurnPhase::Ranking {
            state.transition(TurnPhase::Ranking)?;
        }
        let gathered = self
            .rank(request.generate_mode, &prompt, candidates, state, sink, cancel)
            .await?;

        match request.generate_mode {
            GenerateMode::List => {}
            GenerateMode::Summarize if state.ranked.is_empty() => {}
            GenerateMode::Summarize => {
                state.transition(TurnPhase::PostProcessing)?;
                let mut top = state.ranked.clone();
                sort_batch(&mut top);
                match self.post.summarize(&prompt, &top).await {
                    Ok(Some(message)) => sink.emit(EventKind::Summary { message })?,
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Summary for {} failed: {}", request.query_id, e);
                        sink.emit(EventKind::IntermediateMessage {
                            message: "Could not summarize the results.".to_string(),
                        })?;
                    }
                }
            }
            GenerateMode::Generate => {
                state.transition(TurnPhase::PostProcessing)?;
                match self.post.generate(&prompt, &gathered, cancel).await {
                    Ok(generated) => {
                        for item in &generated.items {
                            state.mark_emitted(&item.source_identifier);
                        }
                        sink.emit(EventKind::Nlws {
                            answer: generated.answer,
                            items: generated.items,
                        })?;
                        for (item, details) in generated.details {
                            sink.emit(EventKind::ItemDetails { item, details })?;
                        }
                    }
                    Err(SiteAskError::Cancelled) => return Err(SiteAskError::Cancelled),
                    Err(e) => {
                        warn!("Answer for {} failed: {}", request.query_id, e);
                        sink.emit(EventKind::IntermediateMessage {
                            message: "Could not generate an answer.".to_string(),
                        })?;
                    }
                }
            }
        }

        if request.generate_mode != GenerateMode::Generate && state.emitted_count == 0 {
            sink.emit(EventKind::IntermediateMessage {
                message: NO_RESULTS.to_string(),
            })?;
        }

        state.transition(TurnPhase::Completed)?;
        Ok(Ending::Complete)
    }

    /// Candidates for the resolved query, reusing fast-track results when valid
    ///
    /// A promoted fast track moves the turn straight to `Ranking`; anything
    /// else goes through `Retrieving`.
    async fn candidates(
        &self,
        query: &Query,
        resolved: &str,
        scope: &SiteScope,
        fast_track: Option<FastTrack>,
        state: &mut TurnState,
    ) -> Result<Vec<CandidateItem>> {
        let speculative = match fast_track {
            Some(ft) if ft.is_valid_for(resolved) => match ft.promote().await {
                Ok(candidates) => {
                    debug!("Fast track promoted for {:?}", query.raw_text);
                    Some(candidates)
                }
                Err(e) => {
                    warn!("Fast track failed ({}); retrieving again", e);
                    None
                }
            },
            Some(ft) => {
                ft.discard();
                state.fast_track_discarded = true;
                None
            }
            None => None,
        };

        let candidates = match speculative {
            Some(candidates) => {
                state.transition(TurnPhase::Ranking)?;
                candidates
            }
            None => {
                state.transition(TurnPhase::Retrieving)?;
                let timeout = self.config.retrieval_timeout();
                tokio::time::timeout(
                    timeout,
                    self.retriever
                        .retrieve(resolved, scope, self.config.retrieval_limit),
                )
                .await
                .map_err(|_| SiteAskError::Timeout(timeout))??
            }
        };

        let mut seen = HashSet::new();
        Ok(candidates
            .into_iter()
            .filter(|c| {
                if !c.payload.is_object() {
                    warn!("Dropping {}: payload is not an object", c.source_identifier);
                    return false;
                }
                seen.insert(c.source_identifier.clone())
            })
            .collect())
    }

    /// Rank candidates, streaming batches as items clear the thresholds
    ///
    /// Returns the items gathered for answer generation.
    async fn rank(
        &self,
        mode: GenerateMode,
        prompt: &PromptContext,
        candidates: Vec<CandidateItem>,
        state: &mut TurnState,
        sink: &mut EventSink,
        cancel: &CancelToken,
    ) -> Result<Vec<RankedItem>> {
        let total = candidates.len();
        let early_limit = self.config.max_results.saturating_sub(5);
        let mut gathered: Vec<RankedItem> = Vec::new();
        let mut failures = 0usize;

        let outcomes = self.ranking.rank_stream(
            prompt,
            candidates,
            mode == GenerateMode::Generate,
            cancel.clone(),
        );
        futures::pin_mut!(outcomes);

        while let Some(outcome) = outcomes.next().await {
            let item = match outcome {
                RankOutcome::Ranked(item) => item,
                RankOutcome::Failed { .. } => {
                    failures += 1;
                    continue;
                }
                RankOutcome::Below { .. } | RankOutcome::Skipped { .. } => continue,
            };
            state.ranked.push(item.clone());

            if mode == GenerateMode::Generate {
                if item.relevance_score > self.config.gather_threshold {
                    gathered.push(item);
                }
                continue;
            }

            let early = self
                .config
                .early_send_threshold
                .is_some_and(|t| item.relevance_score > t)
                && state.emitted_count < early_limit;
            if early && state.mark_emitted(item.source_identifier()) {
                sink.emit(EventKind::ResultBatch {
                    results: vec![item],
                })?;
            }
        }

        if cancel.is_cancelled() {
            return Err(SiteAskError::Cancelled);
        }
        if failures > 0 {
            sink.emit(EventKind::IntermediateMessage {
                message: format!("{} of {} results could not be checked.", failures, total),
            })?;
        }

        if mode != GenerateMode::Generate {
            self.flush_unsent(state, sink)?;
        }

        sort_batch(&mut gathered);
        Ok(gathered)
    }

    /// Send every ranked item not sent yet as one sorted batch, up to `max_results`
    fn flush_unsent(&self, state: &mut TurnState, sink: &mut EventSink) -> Result<()> {
        let mut unsent: Vec<RankedItem> = state
            .ranked
            .iter()
            .filter(|item| !state.emitted_ids.contains(item.source_identifier()))
            .cloned()
            .collect();
        sort_batch(&mut unsent);

        let mut batch = Vec::new();
        for item in unsent {
            if state.emitted_count >= self.config.max_results {
                break;
            }
            if state.mark_emitted(item.source_identifier()) {
                batch.push(item);
            }
        }
        if !batch.is_empty() {
            sink.emit(EventKind::ResultBatch { results: batch })?;
        }
        Ok(())
    }
}

/// Sites contributing the most candidates, ties in first-seen order
fn busiest_sites(candidates: &[CandidateItem], n: usize) -> Vec<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for candidate in candidates {
        match counts.iter_mut().find(|(site, _)| *site == candidate.site) {
            Some((_, count)) => *count += 1,
            None => counts.push((candidate.site.clone(), 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.into_iter().take(n).map(|(site, _)| site).collect()
}
