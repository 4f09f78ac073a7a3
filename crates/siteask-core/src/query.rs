//! Inbound query types
//!
//! A [`QueryRequest`] arrives from a caller; the coordinator turns it into an
//! immutable [`Query`] for the duration of one turn.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the caller wants done with the ranked items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerateMode {
    /// Stream ranked items
    #[default]
    #[serde(alias = "none")]
    List,
    /// Stream ranked items, then a summary of the top ones
    Summarize,
    /// Synthesize a direct answer that replaces the item list
    Generate,
}

impl GenerateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Summarize => "summarize",
            Self::Generate => "generate",
        }
    }
}

impl std::str::FromStr for GenerateMode {
    type Err = crate::error::SiteAskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "list" | "none" => Ok(Self::List),
            "summarize" => Ok(Self::Summarize),
            "generate" => Ok(Self::Generate),
            other => Err(crate::error::SiteAskError::InvalidInput(format!(
                "Unknown generate mode: {}",
                other
            ))),
        }
    }
}

/// Which sites a query is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub enum SiteScope {
    #[default]
    All,
    Sites(Vec<String>),
}

impl SiteScope {
    /// Parse a comma separated list; `all`, `nlws` and empty mean every site
    pub fn parse(raw: &str) -> Self {
        let sites: Vec<String> = raw
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        Self::from(sites)
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn includes(&self, site: &str) -> bool {
        match self {
            Self::All => true,
            Self::Sites(sites) => sites.iter().any(|s| s == site),
        }
    }

    /// The single site this scope names, if any
    pub fn single(&self) -> Option<&str> {
        match self {
            Self::Sites(sites) if sites.len() == 1 => Some(&sites[0]),
            _ => None,
        }
    }
}

impl From<Vec<String>> for SiteScope {
    fn from(sites: Vec<String>) -> Self {
        if sites.is_empty() || sites.iter().any(|s| s == "all" || s == "nlws") {
            Self::All
        } else {
            Self::Sites(sites)
        }
    }
}

impl From<SiteScope> for Vec<String> {
    fn from(scope: SiteScope) -> Self {
        match scope {
            SiteScope::All => vec!["all".to_string()],
            SiteScope::Sites(sites) => sites,
        }
    }
}

impl fmt::Display for SiteScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Sites(sites) => write!(f, "{}", sites.join(",")),
        }
    }
}

/// Inbound request for one turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Opaque caller-supplied id; every outbound event is tagged with it
    pub query_id: String,

    pub query_text: String,

    #[serde(default)]
    pub site_scope: SiteScope,

    #[serde(default)]
    pub generate_mode: GenerateMode,

    /// Prior queries of this session, oldest first
    #[serde(default)]
    pub session_history: Vec<String>,

    /// Facts the client persisted from earlier `remember` events
    #[serde(default)]
    pub remembered_facts: Vec<String>,

    /// Identifier of the item the user was looking at, if any
    #[serde(default)]
    pub context_reference: Option<String>,

    /// Caller already resolved the query against its history
    #[serde(default)]
    pub decontextualized_query: Option<String>,
}

impl QueryRequest {
    pub fn new(query_id: impl Into<String>, query_text: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            query_text: query_text.into(),
            site_scope: SiteScope::All,
            generate_mode: GenerateMode::List,
            session_history: Vec::new(),
            remembered_facts: Vec::new(),
            context_reference: None,
            decontextualized_query: None,
        }
    }

    pub fn with_scope(mut self, scope: SiteScope) -> Self {
        self.site_scope = scope;
        self
    }

    pub fn with_mode(mut self, mode: GenerateMode) -> Self {
        self.generate_mode = mode;
        self
    }

    pub fn with_history(mut self, history: Vec<String>) -> Self {
        self.session_history = history;
        self
    }

    pub fn with_context_reference(mut self, reference: impl Into<String>) -> Self {
        self.context_reference = Some(reference.into());
        self
    }

    /// Freeze the request into the turn's immutable query
    pub fn to_query(&self) -> Query {
        Query {
            raw_text: self.query_text.trim().to_string(),
            session_history: self.session_history.clone(),
            context_reference: self
                .context_reference
                .clone()
                .filter(|r| !r.trim().is_empty()),
            remembered_facts: self.remembered_facts.clone(),
            supplied_resolution: self
                .decontextualized_query
                .clone()
                .filter(|q| !q.trim().is_empty()),
        }
    }
}

/// One user turn; never mutated after creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub raw_text: String,
    pub session_history: Vec<String>,
    pub context_reference: Option<String>,
    pub remembered_facts: Vec<String>,
    pub supplied_resolution: Option<String>,
}

impl Query {
    pub fn is_first_turn(&self) -> bool {
        self.session_history.is_empty() && self.context_reference.is_none()
    }
}

/// Authoritative reading of the query for this turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecontextualizedQuery {
    pub resolved_text: String,
    pub is_relevant_to_corpus: bool,
    pub requires_user_clarification: bool,
    pub clarification_prompt: Option<String>,
    pub memory_candidate: Option<String>,
}

impl DecontextualizedQuery {
    /// Reading that accepts the raw query as-is
    pub fn passthrough(query: &Query) -> Self {
        Self {
            resolved_text: query.raw_text.clone(),
            is_relevant_to_corpus: true,
            requires_user_clarification: false,
            clarification_prompt: None,
            memory_candidate: None,
        }
    }
}

/// Normalise text for "materially different" comparisons
pub fn normalize_query_text(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .trim()
        .to_string()
}
