//! Siteask Core Library
//!
//! Streaming natural-language query resolution over structured site corpora.
//!
//! # Features
//! - Concurrent prompt-driven query classification (relevance, follow-up
//!   resolution, memory, required information)
//! - Speculative fast-track retrieval racing the classifier
//! - Per-item LLM relevance ranking streamed as calls complete
//! - Summaries and synthesized answers with attribution checks
//! - SQLite FTS5 corpus with BM25 scoring
//! - Server-sent event framing and a reconnecting stream consumer

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod query;
pub mod retrieval;
pub mod session;
pub mod stream;

pub use config::{Config, LLMServiceConfig, PipelineConfig, SiteConfig};
pub use error::{Error, Result, SiteAskError};
pub use llm::{
    ChatMessage, Inference, InferenceRequest, LLMClient, MetricsSnapshot, PromptTable,
    PromptTemplate, TieredInference, Tier, TypeHierarchy, VLLMClient,
};
pub use pipeline::{
    collect_response, encode_sse, Coordinator, EventKind, EventSink, RankedItem, SseDecoder,
    TurnEvent, TurnPhase, TurnResponse, TurnState,
};
pub use query::{DecontextualizedQuery, GenerateMode, Query, QueryRequest, SiteScope};
pub use retrieval::{CandidateItem, CorpusStore, Retriever, SiteInfo};
pub use session::{CancelToken, SessionRegistry, TurnPolicy};
pub use stream::{AskParams, ClientState, HttpTransport, ReconnectPolicy, StreamConsumer};

/// Default cache directory name
pub const CACHE_DIR_NAME: &str = "siteask";

/// Default config directory name
pub const CONFIG_DIR_NAME: &str = "siteask";

/// Item type assumed for sites without one configured
pub const DEFAULT_ITEM_TYPE: &str = "Item";
