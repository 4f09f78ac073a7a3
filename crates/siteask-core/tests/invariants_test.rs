//! Property tests over randomly scored corpora

mod common;

use common::*;
use proptest::prelude::*;
use serde_json::json;
use siteask_core::pipeline::EventKind;
use siteask_core::{CandidateItem, QueryRequest, SiteScope};
use std::collections::HashSet;

fn run_turn(
    scores: &[u8],
    duplicates: usize,
    early_send: Option<u8>,
    max_results: usize,
) -> (Vec<CandidateItem>, Vec<siteask_core::TurnEvent>) {
    let mut inference = ScriptedInference::new();
    let mut items = Vec::new();
    for (i, score) in scores.iter().enumerate() {
        let name = format!("Item-{:03}-x", i);
        inference = inference.score(&name, *score);
        items.push(CandidateItem::new(
            format!("https://eats.example/{}", i),
            "eats",
            json!({"@type": "Recipe", "name": name, "position": i}),
        ));
    }
    let mut served = items.clone();
    served.extend(items.iter().take(duplicates).cloned());

    let mut config = config();
    config.pipeline.early_send_threshold = early_send;
    config.pipeline.max_results = max_results;
    config.pipeline.retrieval_limit = served.len().max(1);
    let harness = Harness::new(config, inference, RecordingRetriever::new(served));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let request = QueryRequest::new("q", "desserts").with_scope(SiteScope::parse("eats"));
    let (_, events) = runtime.block_on(harness.run(request));
    (items, events)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_turn_invariants(
        scores in proptest::collection::vec(0u8..=100, 0..16),
        duplicates in 0usize..4,
        early_send in proptest::option::of(40u8..90),
        max_results in 1usize..12,
    ) {
        let (items, events) = run_turn(&scores, duplicates, early_send, max_results);

        // exactly one terminal event, and it is last
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        prop_assert_eq!(terminals, 1);
        prop_assert!(events.last().unwrap().is_terminal());

        let mut seen = HashSet::new();
        let mut sent = 0usize;
        for event in &events {
            prop_assert_eq!(event.query_id.as_str(), "q");
            if let EventKind::ResultBatch { results } = &event.kind {
                // sorted within the batch
                prop_assert!(results.windows(2).all(|w| w[0].relevance_score >= w[1].relevance_score));
                for item in results {
                    // never twice
                    prop_assert!(seen.insert(item.source_identifier().to_string()));
                    // never fabricated
                    let backing = items
                        .iter()
                        .find(|c| c.source_identifier == item.source_identifier());
                    prop_assert_eq!(Some(&item.candidate), backing);
                    prop_assert!(item.relevance_score >= 50);
                    sent += 1;
                }
            }
        }
        prop_assert!(sent <= max_results);

        let passing = scores.iter().filter(|s| **s >= 50).count();
        prop_assert_eq!(sent, passing.min(max_results));
    }
}
