//! Retrieval capability and the local corpus behind it

mod corpus;
pub mod loader;
pub mod trim;

pub use crate::query::SiteScope;
pub use corpus::{CorpusStats, CorpusStore, SiteInfo};
pub use loader::{load_path, LoadedItem};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A record returned by retrieval
///
/// The payload is never modified downstream; ranking and post-processing
/// attach metadata next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    /// Stable identifier of the backing record (its URL)
    #[serde(rename = "url")]
    pub source_identifier: String,
    pub name: String,
    pub site: String,
    #[serde(rename = "schema_object")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_score: Option<f64>,
}

impl CandidateItem {
    pub fn new(source_identifier: impl Into<String>, site: impl Into<String>, payload: Value) -> Self {
        let source_identifier = source_identifier.into();
        let name = loader::item_name(&payload, &source_identifier);
        Self {
            source_identifier,
            name,
            site: site.into(),
            payload,
            raw_score: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.raw_score = Some(score);
        self
    }

    /// Declared `@type` tags of the payload
    pub fn declared_types(&self) -> Vec<String> {
        trim::declared_types(&self.payload)
    }

    /// Trimmed payload rendered for a prompt
    pub fn description(&self) -> String {
        trim::trim(&self.payload).to_string()
    }
}

/// Retrieval capability
///
/// Implementations do their own keyword/vector scoring and are shared
/// across concurrent turns.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Candidates for `query`, best first
    async fn retrieve(
        &self,
        query: &str,
        scope: &SiteScope,
        limit: usize,
    ) -> Result<Vec<CandidateItem>>;

    /// Fetch one record by identifier
    async fn lookup(&self, _source_identifier: &str) -> Result<Option<CandidateItem>> {
        Ok(None)
    }
}
