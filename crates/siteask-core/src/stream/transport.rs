use crate::error::{Result, SiteAskError};
use crate::pipeline::{SseDecoder, TurnEvent};
use crate::query::{GenerateMode, QueryRequest, SiteScope};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type EventStream = BoxStream<'static, Result<TurnEvent>>;

/// Opens one connection carrying a turn's events
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn open(&self, request: &QueryRequest) -> Result<EventStream>;
}

/// Query-string form of a [`QueryRequest`] used by `GET /ask`
///
/// List-valued fields travel as JSON arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AskParams {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remembered: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decontextualized_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AskParams {
    pub fn from_request(request: &QueryRequest, session_id: Option<&str>) -> Result<Self> {
        let list = |values: &[String]| -> Result<Option<String>> {
            if values.is_empty() {
                Ok(None)
            } else {
                Ok(Some(serde_json::to_string(values)?))
            }
        };
        Ok(Self {
            query: request.query_text.clone(),
            query_id: Some(request.query_id.clone()),
            site: (!request.site_scope.is_all()).then(|| request.site_scope.to_string()),
            generate_mode: Some(request.generate_mode.as_str().to_string()),
            prev: list(&request.session_history)?,
            remembered: list(&request.remembered_facts)?,
            context_url: request.context_reference.clone(),
            decontextualized_query: request.decontextualized_query.clone(),
            session_id: session_id.map(str::to_string),
        })
    }

    /// Build the request, generating a query id when none was given
    pub fn into_request(self) -> Result<QueryRequest> {
        let parse_list = |raw: Option<String>| -> Result<Vec<String>> {
            match raw.as_deref().map(str::trim) {
                None | Some("") => Ok(Vec::new()),
                Some(raw) if raw.starts_with('[') => Ok(serde_json::from_str(raw)?),
                Some(raw) => Ok(vec![raw.to_string()]),
            }
        };
        if self.query.trim().is_empty() {
            return Err(SiteAskError::InvalidInput("query must not be empty".into()));
        }
        let generate_mode = match self.generate_mode.as_deref() {
            Some(mode) => mode.parse()?,
            None => GenerateMode::List,
        };
        let query_id = self
            .query_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_query_id);

        let mut request = QueryRequest::new(query_id, self.query)
            .with_scope(SiteScope::parse(self.site.as_deref().unwrap_or_default()))
            .with_mode(generate_mode)
            .with_history(parse_list(self.prev)?);
        request.remembered_facts = parse_list(self.remembered)?;
        request.context_reference = self.context_url;
        request.decontextualized_query = self.decontextualized_query;
        Ok(request)
    }
}

/// Time-based query id, unique enough for one process
pub fn new_query_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "q{}-{}",
        chrono::Utc::now().timestamp_millis(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Reads `GET /ask` on a siteask server as server-sent events
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    session_id: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: None,
        })
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn open(&self, request: &QueryRequest) -> Result<EventStream> {
        let params = AskParams::from_request(request, self.session_id.as_deref())?;
        let response = self
            .client
            .get(format!("{}/ask", self.base_url))
            .header("Accept", "text/event-stream")
            .query(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = format!("{}: {}", status, body);
            return Err(if status.is_client_error() {
                SiteAskError::InvalidInput(message)
            } else {
                SiteAskError::ExternalError(message)
            });
        }

        let bytes = response.bytes_stream().boxed();
        let events = stream::unfold(
            (bytes, SseDecoder::new(), Vec::<Result<TurnEvent>>::new(), false),
            |(mut bytes, mut decoder, mut ready, mut done)| async move {
                loop {
                    if !ready.is_empty() {
                        let next = ready.remove(0);
                        return Some((next, (bytes, decoder, ready, done)));
                    }
                    if done {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => ready.extend(decoder.push(&chunk)),
                        Some(Err(e)) => {
                            done = true;
                            ready.push(Err(SiteAskError::Stream(e.to_string())));
                        }
                        None => {
                            done = true;
                            ready.extend(decoder.finish());
                        }
                    }
                }
            },
        );
        Ok(events.boxed())
    }
}
