//! Speculative retrieval on the raw query
//!
//! Launched alongside the classifier. Its candidates are held back and only
//! used when the classifier's resolved query matches the raw text.

use crate::error::{Result, SiteAskError};
use crate::query::{normalize_query_text, Query, SiteScope};
use crate::retrieval::{CandidateItem, Retriever};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

lazy_static! {
    static ref BACK_REFERENCE: Regex = Regex::new(
        r"(?i)\b(it|its|that|those|them|these|they|their|this one|that one|the same|same one|the other|what about|how about|and for|instead|more like)\b"
    )
    .unwrap();
}

/// When the speculative retrieval runs
///
/// The coordinator skips it for site-scoped turns that check relevance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FastTrackMode {
    Disabled,
    /// Only for queries that look self-contained
    #[default]
    Heuristic,
    /// Every turn without a context reference
    Always,
}

impl FastTrackMode {
    pub fn should_launch(&self, query: &Query) -> bool {
        match self {
            Self::Disabled => false,
            Self::Heuristic => is_eligible(query),
            Self::Always => query.context_reference.is_none(),
        }
    }
}

/// Cheap local guess that classification will leave the query unchanged
pub fn is_eligible(query: &Query) -> bool {
    query.session_history.is_empty()
        && query.context_reference.is_none()
        && query.supplied_resolution.is_none()
        && !BACK_REFERENCE.is_match(&query.raw_text)
}

/// In-flight speculative retrieval; aborted when dropped
pub struct FastTrack {
    raw_text: String,
    handle: JoinHandle<Result<Vec<CandidateItem>>>,
}

impl FastTrack {
    pub fn launch(
        retriever: Arc<dyn Retriever>,
        query: &Query,
        scope: SiteScope,
        limit: usize,
        timeout: Duration,
    ) -> Self {
        let raw_text = query.raw_text.clone();
        let text = raw_text.clone();
        let handle = tokio::spawn(async move {
            tokio::time::timeout(timeout, retriever.retrieve(&text, &scope, limit))
                .await
                .map_err(|_| SiteAskError::Timeout(timeout))?
        });
        tracing::debug!("Fast track launched for {:?}", raw_text);
        Self { raw_text, handle }
    }

    /// Buffered results are usable when the resolved text matches the raw text
    pub fn is_valid_for(&self, resolved_text: &str) -> bool {
        normalize_query_text(resolved_text) == normalize_query_text(&self.raw_text)
    }

    /// Wait for the buffered candidates
    pub async fn promote(mut self) -> Result<Vec<CandidateItem>> {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(e) => Err(SiteAskError::Retrieval(format!(
                "fast track task failed: {}",
                e
            ))),
        }
    }

    pub fn discard(self) {
        tracing::debug!("Fast track discarded for {:?}", self.raw_text);
    }
}

impl Drop for FastTrack {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryRequest;

    #[test]
    fn test_eligibility_heuristic() {
        let first = QueryRequest::new("q", "What desserts pair with mango?").to_query();
        assert!(is_eligible(&first));

        let back_ref = QueryRequest::new("q", "is it spicy?").to_query();
        assert!(!is_eligible(&back_ref));

        let follow_up = QueryRequest::new("q", "chocolate cake")
            .with_history(vec!["cakes".into()])
            .to_query();
        assert!(!is_eligible(&follow_up));
        assert!(FastTrackMode::Always.should_launch(&follow_up));
        assert!(!FastTrackMode::Disabled.should_launch(&first));

        let with_context = QueryRequest::new("q", "chocolate cake")
            .with_context_reference("https://x")
            .to_query();
        assert!(!FastTrackMode::Always.should_launch(&with_context));
    }

    #[test]
    fn test_words_containing_markers_are_eligible() {
        let q = QueryRequest::new("q", "italian themed dinner").to_query();
        assert!(is_eligible(&q));
    }
}
