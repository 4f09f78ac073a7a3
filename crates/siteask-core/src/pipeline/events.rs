//! Outbound turn events and their wire framing

use super::ranking::RankedItem;
use crate::error::{Result, SiteAskError};
use crate::retrieval::CandidateItem;
use crate::session::CancelToken;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// One event of a turn, tagged with the query it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnEvent {
    pub query_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum EventKind {
    QueryAnalysis {
        decontextualized_query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory_candidate: Option<String>,
    },
    Remember {
        item_to_remember: String,
        message: String,
    },
    AskingSites {
        message: String,
        sites: Vec<String>,
    },
    SiteIsIrrelevantToQuery {
        message: String,
    },
    AskUser {
        message: String,
    },
    ResultBatch {
        results: Vec<RankedItem>,
    },
    IntermediateMessage {
        message: String,
    },
    Summary {
        message: String,
    },
    ItemDetails {
        #[serde(flatten)]
        item: CandidateItem,
        details: String,
    },
    Nlws {
        answer: String,
        items: Vec<CandidateItem>,
    },
    Complete,
    Cancelled {
        reason: String,
    },
}

impl EventKind {
    /// Terminal events end the turn; exactly one is sent, last
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SiteIsIrrelevantToQuery { .. }
                | Self::AskUser { .. }
                | Self::Complete
                | Self::Cancelled { .. }
        )
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Self::QueryAnalysis { .. } => "query_analysis",
            Self::Remember { .. } => "remember",
            Self::AskingSites { .. } => "asking_sites",
            Self::SiteIsIrrelevantToQuery { .. } => "site_is_irrelevant_to_query",
            Self::AskUser { .. } => "ask_user",
            Self::ResultBatch { .. } => "result_batch",
            Self::IntermediateMessage { .. } => "intermediate_message",
            Self::Summary { .. } => "summary",
            Self::ItemDetails { .. } => "item_details",
            Self::Nlws { .. } => "nlws",
            Self::Complete => "complete",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Ordered, append-only event channel of one turn
///
/// Tags every event with the turn's query id, refuses events after the
/// terminal one, and cancels the turn once the receiver is gone.
pub struct EventSink {
    query_id: String,
    tx: mpsc::UnboundedSender<TurnEvent>,
    cancel: CancelToken,
    terminated: bool,
    sent: usize,
}

impl EventSink {
    pub fn new(
        query_id: impl Into<String>,
        tx: mpsc::UnboundedSender<TurnEvent>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            query_id: query_id.into(),
            tx,
            cancel,
            terminated: false,
            sent: 0,
        }
    }

    /// Sink plus the receiving end for the caller
    pub fn channel(
        query_id: impl Into<String>,
        cancel: CancelToken,
    ) -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(query_id, tx, cancel), rx)
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Events delivered so far
    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Resolves once the receiving side has gone away
    pub fn disconnected(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let tx = self.tx.clone();
        async move { tx.closed().await }
    }

    pub fn emit(&mut self, kind: EventKind) -> Result<()> {
        if self.terminated {
            return Err(SiteAskError::Stream(format!(
                "{} event after terminal event of {}",
                kind.message_type(),
                self.query_id
            )));
        }
        if kind.is_terminal() {
            self.terminated = true;
        }
        tracing::debug!("{} -> {}", self.query_id, kind.message_type());
        let event = TurnEvent {
            query_id: self.query_id.clone(),
            kind,
        };
        match self.tx.send(event) {
            Ok(()) => {
                self.sent += 1;
                Ok(())
            }
            Err(_) => {
                tracing::info!("Receiver of {} went away; cancelling turn", self.query_id);
                self.cancel.cancel();
                Err(SiteAskError::Cancelled)
            }
        }
    }
}

/// Frame an event for a server-sent event stream
pub fn encode_sse(event: &TurnEvent) -> Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

/// Incremental server-sent event parser
///
/// Bytes may arrive split anywhere; complete events are returned as soon as
/// their terminating blank line is seen.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<TurnEvent>> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim_end_matches('\r').to_string();
            self.buffer.drain(..=line_end);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // comments and other fields (event:, id:, retry:) carry nothing we use
        }
        events
    }

    /// Flush a final event whose blank line never arrived
    pub fn finish(&mut self) -> Option<Result<TurnEvent>> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            if let Some(data) = rest.trim_end_matches('\r').strip_prefix("data:") {
                self.data.push(data.trim_start().to_string());
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<Result<TurnEvent>> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        Some(serde_json::from_str(&payload).map_err(|e| {
            SiteAskError::Stream(format!("undecodable event ({}): {}", e, payload))
        }))
    }
}

/// A whole turn aggregated into one document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnResponse {
    pub query_id: String,
    pub results: Vec<RankedItem>,
    /// Other events keyed by message type; repeated kinds become arrays
    #[serde(flatten)]
    pub messages: Map<String, Value>,
}

impl TurnResponse {
    /// Message type of the terminal event, if the turn ended
    pub fn terminal(&self) -> Option<&str> {
        ["complete", "cancelled", "site_is_irrelevant_to_query", "ask_user"]
            .into_iter()
            .find(|k| self.messages.contains_key(*k))
    }
}

const REPEATABLE: &[&str] = &["intermediate_message", "item_details", "remember"];

/// Aggregate a turn's events for non-streaming callers
pub fn collect_response(query_id: &str, events: &[TurnEvent]) -> TurnResponse {
    let mut response = TurnResponse {
        query_id: query_id.to_string(),
        ..Default::default()
    };

    for event in events.iter().filter(|e| e.query_id == query_id) {
        if let EventKind::ResultBatch { results } = &event.kind {
            response.results.extend(results.iter().cloned());
            continue;
        }
        let message_type = event.kind.message_type();
        let mut value = match serde_json::to_value(&event.kind) {
            Ok(Value::Object(obj)) => obj,
            _ => Map::new(),
        };
        value.remove("message_type");
        let value = Value::Object(value);

        if REPEATABLE.contains(&message_type) {
            let entry = response
                .messages
                .entry(message_type.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = entry {
                items.push(value);
            }
        } else {
            response.messages.insert(message_type.to_string(), value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn ranked(url: &str, score: u8) -> RankedItem {
        RankedItem {
            candidate: CandidateItem::new(url, "eats", json!({"name": url})),
            relevance_score: score,
            rationale: "tasty".into(),
            rank_latency: Duration::from_millis(12),
            retrieval_index: 0,
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let event = TurnEvent {
            query_id: "q1".into(),
            kind: EventKind::Remember {
                item_to_remember: "vegetarian".into(),
                message: "I'll remember that".into(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["message_type"], "remember");
        assert_eq!(value["query_id"], "q1");

        let complete = serde_json::to_value(TurnEvent {
            query_id: "q1".into(),
            kind: EventKind::Complete,
        })
        .unwrap();
        assert_eq!(complete, json!({"query_id": "q1", "message_type": "complete"}));
    }

    #[test]
    fn test_result_batch_shape() {
        let event = TurnEvent {
            query_id: "q".into(),
            kind: EventKind::ResultBatch {
                results: vec![ranked("https://x/1", 80)],
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        let item = &value["results"][0];
        assert_eq!(item["url"], "https://x/1");
        assert_eq!(item["score"], 80);
        assert_eq!(item["description"], "tasty");
        assert_eq!(item["schema_object"]["name"], "https://x/1");
        assert_eq!(item["rank_latency_ms"], 12);
    }

    #[test]
    fn test_sink_rejects_after_terminal() {
        let (mut sink, mut rx) = EventSink::channel("q", CancelToken::new());
        sink.emit(EventKind::IntermediateMessage {
            message: "hi".into(),
        })
        .unwrap();
        sink.emit(EventKind::Complete).unwrap();
        assert!(sink.emit(EventKind::Complete).is_err());
        assert_eq!(sink.sent(), 2);
        assert_eq!(rx.try_recv().unwrap().query_id, "q");
        assert!(rx.try_recv().unwrap().is_terminal());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sink_cancels_when_receiver_dropped() {
        let cancel = CancelToken::new();
        let (mut sink, rx) = EventSink::channel("q", cancel.clone());
        drop(rx);
        assert!(!sink.is_connected());
        assert!(matches!(
            sink.emit(EventKind::Complete),
            Err(SiteAskError::Cancelled)
        ));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_sse_decoder_handles_split_frames() {
        let a = TurnEvent {
            query_id: "q".into(),
            kind: EventKind::Summary {
                message: "short".into(),
            },
        };
        let b = TurnEvent {
            query_id: "q".into(),
            kind: EventKind::Complete,
        };
        let wire = format!(": keep-alive\n\n{}{}", encode_sse(&a).unwrap(), encode_sse(&b).unwrap())
            .replace("\n\n", "\r\n\r\n");
        let bytes = wire.as_bytes();

        let mut decoder = SseDecoder::new();
        let mut decoded = Vec::new();
        for chunk in bytes.chunks(7) {
            decoded.extend(decoder.push(chunk).into_iter().map(|r| r.unwrap()));
        }
        assert_eq!(decoded, vec![a, b]);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_sse_decoder_reports_garbage() {
        let mut decoder = SseDecoder::new();
        let out = decoder.push(b"data: {not json}\n\n");
        assert!(out[0].is_err());
        assert!(decoder.push(b"data: {\"query_id\":\"q\",\"message_type\":\"complete\"}").is_empty());
        assert!(decoder.finish().unwrap().unwrap().is_terminal());
    }

    #[test]
    fn test_collect_response() {
        let ev = |kind| TurnEvent {
            query_id: "q".into(),
            kind,
        };
        let events = vec![
            ev(EventKind::ResultBatch {
                results: vec![ranked("a", 90)],
            }),
            ev(EventKind::IntermediateMessage {
                message: "one".into(),
            }),
            ev(EventKind::ResultBatch {
                results: vec![ranked("b", 70)],
            }),
            TurnEvent {
                query_id: "stale".into(),
                kind: EventKind::ResultBatch {
                    results: vec![ranked("z", 99)],
                },
            },
            ev(EventKind::IntermediateMessage {
                message: "two".into(),
            }),
            ev(EventKind::Summary {
                message: "sum".into(),
            }),
            ev(EventKind::Complete),
        ];
        let response = collect_response("q", &events);
        let urls: Vec<_> = response
            .results
            .iter()
            .map(|r| r.source_identifier())
            .collect();
        assert_eq!(urls, vec!["a", "b"]);
        assert_eq!(response.messages["intermediate_message"][1]["message"], "two");
        assert_eq!(response.messages["summary"]["message"], "sum");
        assert_eq!(response.terminal(), Some("complete"));
    }
}
