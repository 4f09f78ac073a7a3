use super::transport::EventTransport;
use crate::error::{Result, SiteAskError};
use crate::pipeline::{EventKind, RankedItem, TurnEvent};
use crate::query::QueryRequest;
use futures::StreamExt;
use std::collections::HashSet;
use std::time::Duration;

/// What applying an event did to the client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Accepted,
    /// Belongs to a query other than the current one
    Stale,
    /// Already seen, e.g. replayed after a reconnect
    Duplicate,
    /// Arrived after the terminal event
    Finished,
}

/// Client view of one turn
///
/// A reconnect replays the turn from its start. Result items are deduplicated
/// by source identifier; other events by their position on the connection,
/// so a replayed prefix leaves the state unchanged while a message the
/// server legitimately repeats is still shown twice.
#[derive(Debug, Clone)]
pub struct ClientState {
    query_id: String,
    results: Vec<RankedItem>,
    seen_items: HashSet<String>,
    events: Vec<TurnEvent>,
    terminal: Option<EventKind>,
    /// Non-batch events accepted over all connections
    messages_accepted: usize,
    /// Non-batch events seen on the current connection
    position: usize,
}

impl ClientState {
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            results: Vec::new(),
            seen_items: HashSet::new(),
            events: Vec::new(),
            terminal: None,
            messages_accepted: 0,
            position: 0,
        }
    }

    /// A new connection starts replaying the turn from its first event
    pub fn reconnected(&mut self) {
        self.position = 0;
    }

    /// Switch to a newer query, dropping everything shown for the old one
    pub fn begin(&mut self, query_id: impl Into<String>) {
        *self = Self::new(query_id);
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn apply(&mut self, event: TurnEvent) -> Applied {
        if event.query_id != self.query_id {
            tracing::debug!("Dropping stale {} event of {}", event.kind.message_type(), event.query_id);
            return Applied::Stale;
        }
        if self.terminal.is_some() {
            return Applied::Finished;
        }

        match &event.kind {
            EventKind::ResultBatch { results } => {
                let fresh: Vec<RankedItem> = results
                    .iter()
                    .filter(|item| self.seen_items.insert(item.source_identifier().to_string()))
                    .cloned()
                    .collect();
                if fresh.is_empty() {
                    return Applied::Duplicate;
                }
                self.results.extend(fresh);
            }
            kind => {
                self.position += 1;
                if self.position <= self.messages_accepted {
                    return Applied::Duplicate;
                }
                self.messages_accepted += 1;
                if kind.is_terminal() {
                    self.terminal = Some(kind.clone());
                }
            }
        }
        self.events.push(event);
        Applied::Accepted
    }

    /// Items shown so far, in arrival order
    pub fn results(&self) -> &[RankedItem] {
        &self.results
    }

    /// Accepted events, in arrival order
    pub fn events(&self) -> &[TurnEvent] {
        &self.events
    }

    pub fn terminal(&self) -> Option<&EventKind> {
        self.terminal.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.terminal.is_some()
    }
}

/// Bounded exponential backoff between reconnects
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            max_retries: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect number `attempt` (zero based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

pub struct StreamConsumer<T> {
    transport: T,
    policy: ReconnectPolicy,
}

impl<T: EventTransport> StreamConsumer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Follow a turn until its terminal event, reconnecting as needed
    ///
    /// `on_event` sees each accepted event once. Retries reset whenever a
    /// connection makes progress; an error no retry can fix ends the run.
    pub async fn run<F>(&self, request: &QueryRequest, mut on_event: F) -> Result<ClientState>
    where
        F: FnMut(&TurnEvent) + Send,
    {
        let mut state = ClientState::new(&request.query_id);
        let mut retries = 0u32;

        loop {
            let mut progressed = false;
            state.reconnected();
            match self.transport.open(request).await {
                Ok(mut events) => {
                    while let Some(next) = events.next().await {
                        match next {
                            Ok(event) => {
                                if state.apply(event.clone()) == Applied::Accepted {
                                    progressed = true;
                                    on_event(&event);
                                }
                                if state.is_finished() {
                                    return Ok(state);
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Event stream of {} broke: {}", request.query_id, e);
                                break;
                            }
                        }
                    }
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => tracing::warn!("Could not open stream for {}: {}", request.query_id, e),
            }

            if progressed {
                retries = 0;
            }
            if retries >= self.policy.max_retries {
                return Err(SiteAskError::Stream(format!(
                    "gave up on {} after {} reconnects",
                    request.query_id, retries
                )));
            }
            let delay = self.policy.delay(retries);
            tracing::info!("Reconnecting to {} in {:?}", request.query_id, delay);
            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::CandidateItem;
    use crate::stream::EventStream;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn ev(query_id: &str, kind: EventKind) -> TurnEvent {
        TurnEvent {
            query_id: query_id.into(),
            kind,
        }
    }

    fn batch(query_id: &str, urls: &[&str]) -> TurnEvent {
        let results = urls
            .iter()
            .map(|u| RankedItem {
                candidate: CandidateItem::new(*u, "s", json!({"name": u})),
                relevance_score: 80,
                rationale: String::new(),
                rank_latency: Duration::ZERO,
                retrieval_index: 0,
            })
            .collect();
        ev(query_id, EventKind::ResultBatch { results })
    }

    #[test]
    fn test_stale_and_duplicate_events_are_ignored() {
        let mut state = ClientState::new("q2");
        assert_eq!(state.apply(batch("q1", &["old"])), Applied::Stale);
        assert_eq!(state.apply(batch("q2", &["a", "b"])), Applied::Accepted);
        assert_eq!(state.apply(batch("q2", &["b"])), Applied::Duplicate);
        assert_eq!(state.apply(batch("q2", &["b", "c"])), Applied::Accepted);
        assert_eq!(state.apply(ev("q2", EventKind::Complete)), Applied::Accepted);
        assert_eq!(state.apply(batch("q2", &["d"])), Applied::Finished);

        let urls: Vec<_> = state.results().iter().map(|r| r.source_identifier()).collect();
        assert_eq!(urls, vec!["a", "b", "c"]);
        assert!(state.is_finished());
    }

    #[test]
    fn test_repeated_message_is_kept_but_replay_is_not() {
        let note = || {
            ev(
                "q",
                EventKind::IntermediateMessage {
                    message: "still ranking".into(),
                },
            )
        };
        let mut state = ClientState::new("q");
        assert_eq!(state.apply(note()), Applied::Accepted);
        assert_eq!(state.apply(note()), Applied::Accepted);

        state.reconnected();
        assert_eq!(state.apply(note()), Applied::Duplicate);
        assert_eq!(state.apply(note()), Applied::Duplicate);
        assert_eq!(state.apply(note()), Applied::Accepted);
        assert_eq!(state.events().len(), 3);
    }

    #[test]
    fn test_begin_discards_previous_query() {
        let mut state = ClientState::new("q1");
        state.apply(batch("q1", &["a"]));
        state.begin("q2");
        assert!(state.results().is_empty());
        assert_eq!(state.apply(batch("q1", &["b"])), Applied::Stale);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..8).map(|a| policy.delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 8000, 8000, 8000]);
        assert_eq!(policy.delay(40), Duration::from_secs(8));
    }

    /// Each connection replays the stream up to a cut-off, like a server
    /// re-running the same query id
    struct Flaky {
        script: Vec<TurnEvent>,
        cut_offs: Mutex<Vec<usize>>,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl EventTransport for Flaky {
        async fn open(&self, _request: &QueryRequest) -> Result<EventStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let cut = {
                let mut cuts = self.cut_offs.lock().unwrap();
                if cuts.is_empty() {
                    self.script.len()
                } else {
                    cuts.remove(0)
                }
            };
            if cut == 0 {
                return Err(SiteAskError::Stream("refused".into()));
            }
            let mut items: Vec<Result<TurnEvent>> =
                self.script.iter().take(cut).cloned().map(Ok).collect();
            if cut < self.script.len() {
                items.push(Err(SiteAskError::Stream("reset".into())));
            }
            Ok(futures::stream::iter(items).boxed())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_idempotently() {
        let script = vec![
            batch("q", &["a"]),
            ev("q", EventKind::IntermediateMessage { message: "m".into() }),
            ev("q", EventKind::IntermediateMessage { message: "m".into() }),
            batch("q", &["b"]),
            ev("q", EventKind::Complete),
        ];
        let transport = Flaky {
            script,
            cut_offs: Mutex::new(vec![3, 0, 4]),
            opens: AtomicUsize::new(0),
        };
        let consumer = StreamConsumer::new(transport);
        let mut seen = 0;
        let state = consumer
            .run(&crate::query::QueryRequest::new("q", "x"), |_| seen += 1)
            .await
            .unwrap();

        assert_eq!(seen, 5);
        assert_eq!(state.results().len(), 2);
        assert_eq!(state.events().len(), 5);
        assert_eq!(state.terminal(), Some(&EventKind::Complete));
        assert_eq!(consumer.transport.opens.load(Ordering::SeqCst), 4);
    }

    struct Rejecting {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl EventTransport for Rejecting {
        async fn open(&self, _request: &QueryRequest) -> Result<EventStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Err(SiteAskError::InvalidInput("400 Bad Request".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_request_is_not_retried() {
        let consumer = StreamConsumer::new(Rejecting {
            opens: AtomicUsize::new(0),
        });
        let result = consumer.run(&QueryRequest::new("q", "x"), |_| {}).await;
        assert!(matches!(result, Err(SiteAskError::InvalidInput(_))));
        assert_eq!(consumer.transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let transport = Flaky {
            script: vec![batch("q", &["a"]), ev("q", EventKind::Complete)],
            cut_offs: Mutex::new(vec![0; 10]),
            opens: AtomicUsize::new(0),
        };
        let consumer = StreamConsumer::new(transport).with_policy(ReconnectPolicy {
            max_retries: 2,
            ..Default::default()
        });
        let result = consumer.run(&QueryRequest::new("q", "x"), |_| {}).await;
        assert!(matches!(result, Err(SiteAskError::Stream(_))));
        assert_eq!(consumer.transport.opens.load(Ordering::SeqCst), 3);
    }
}
