//! Turn policies for concurrent turns on one session

mod common;

use common::*;
use siteask_core::llm::prompts::RANKING;
use siteask_core::pipeline::TurnEvent;
use siteask_core::{Coordinator, QueryRequest, TurnPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn coordinator(policy: TurnPolicy) -> Arc<Coordinator> {
    let inference = ScriptedInference::new()
        .score("Mango Sorbet", 90)
        .delay(RANKING, Duration::from_secs(5));
    let retriever = RecordingRetriever::new(vec![recipe("sorbet", "Mango Sorbet")]);
    let mut config = config();
    config.pipeline.turn_policy = policy;
    config.pipeline.ranking_timeout_ms = 30_000;
    Arc::new(Coordinator::new(
        &config,
        Arc::new(inference),
        Arc::new(retriever),
    ))
}

async fn drain(mut rx: UnboundedReceiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_new_turn_cancels_previous() {
    let coordinator = coordinator(TurnPolicy::CancelPrevious);
    let first = coordinator.spawn_turn(QueryRequest::new("q1", "sorbet"), Some("s1".into()));
    // let the first turn reach ranking
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(coordinator.sessions().active_query("s1").as_deref(), Some("q1"));

    let second = coordinator.spawn_turn(QueryRequest::new("q2", "sorbet"), Some("s1".into()));
    let first = drain(first).await;
    let second = drain(second).await;

    assert_eq!(message_types(&first).last(), Some(&"cancelled"));
    assert!(batch_scores(&first).is_empty());
    assert_single_terminal_last(&first);

    assert_eq!(message_types(&second).last(), Some(&"complete"));
    assert_eq!(batch_scores(&second), vec![vec![90]]);
    assert!(second.iter().all(|e| e.query_id == "q2"));
    assert_eq!(coordinator.sessions().active_query("s1"), None);
    assert_eq!(coordinator.sessions().session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_queued_turn_waits_for_previous() {
    let coordinator = coordinator(TurnPolicy::Queue);
    let first = coordinator.spawn_turn(QueryRequest::new("q1", "sorbet"), Some("s1".into()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = coordinator.spawn_turn(QueryRequest::new("q2", "sorbet"), Some("s1".into()));

    let first = drain(first).await;
    let second = drain(second).await;

    assert_eq!(message_types(&first).last(), Some(&"complete"));
    assert_eq!(batch_scores(&first), vec![vec![90]]);
    assert_eq!(message_types(&second).last(), Some(&"complete"));
    assert_eq!(batch_scores(&second), vec![vec![90]]);
}

#[tokio::test(start_paused = true)]
async fn test_separate_sessions_run_independently() {
    let coordinator = coordinator(TurnPolicy::CancelPrevious);
    let a = coordinator.spawn_turn(QueryRequest::new("q1", "sorbet"), Some("a".into()));
    let b = coordinator.spawn_turn(QueryRequest::new("q1", "sorbet"), Some("b".into()));

    let (a, b) = tokio::join!(drain(a), drain(b));
    assert_eq!(message_types(&a).last(), Some(&"complete"));
    assert_eq!(message_types(&b).last(), Some(&"complete"));
    // both sessions are released once their turns end
    assert_eq!(coordinator.sessions().session_count(), 0);
}
