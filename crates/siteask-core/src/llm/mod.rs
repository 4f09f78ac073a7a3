//! LLM integration
//!
//! Provides:
//! - OpenAI-compatible chat client with response caching and metrics
//! - Structured, schema-checked inference over a fast and an accurate tier
//! - Prompt templates resolved through an item type hierarchy

mod cache;
mod client;
mod inference;
pub mod prompts;

pub use cache::{CacheStats, LLMCache};
pub use client::{extract_json_object, ChatMessage, LLMClient, MetricsSnapshot, VLLMClient};
pub use inference::{field_bool, field_str, Inference, InferenceRequest, TieredInference};
pub use prompts::{PromptBindings, PromptTable, PromptTemplate, TypeHierarchy};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Model tier a call runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Cheap and latency-sensitive
    Fast,
    /// Slower, used where a wrong answer derails the turn
    Accurate,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Accurate => write!(f, "accurate"),
        }
    }
}
