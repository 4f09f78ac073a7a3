//! HTTP surface of the pipeline
//!
//! `GET /ask` streams a turn as server-sent events; dropping the connection
//! cancels the turn. `POST /ask` takes the same fields as a JSON body and
//! answers with the aggregated turn once it ends.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use siteask_core::{
    collect_response, AskParams, Coordinator, CorpusStore, MetricsSnapshot, SiteAskError,
    SiteInfo, TurnResponse,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub corpus: Arc<CorpusStore>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, corpus: Arc<CorpusStore>) -> Self {
        Self {
            coordinator,
            corpus,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ask", get(ask_stream).post(ask_json))
        .route("/sites", get(sites))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    /// Sessions with a turn running or waiting
    sessions: usize,
    inference: Vec<MetricsSnapshot>,
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        sessions: state.coordinator.sessions().session_count(),
        inference: state.coordinator.inference_metrics(),
    })
}

async fn ask_stream(
    State(state): State<AppState>,
    Query(params): Query<AskParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let session_id = params.session_id.clone();
    let request = params.into_request()?;
    tracing::info!(query_id = %request.query_id, "Streaming turn.");

    let rx = state.coordinator.spawn_turn(request, session_id);
    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .map(|event| Event::default().json_data(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn ask_json(
    State(state): State<AppState>,
    Json(params): Json<AskParams>,
) -> Result<Json<TurnResponse>, ApiError> {
    let session_id = params.session_id.clone();
    let request = params.into_request()?;
    let query_id = request.query_id.clone();

    let mut rx = state.coordinator.spawn_turn(request, session_id);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    Ok(Json(collect_response(&query_id, &events)))
}

async fn sites(State(state): State<AppState>) -> Result<Json<Vec<SiteInfo>>, ApiError> {
    Ok(Json(state.corpus.list_sites()?))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error_code: String,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error_code: &'static str,
    message: String,
}

impl From<SiteAskError> for ApiError {
    fn from(err: SiteAskError) -> Self {
        let (status, error_code) = match &err {
            SiteAskError::InvalidInput(_) | SiteAskError::Parse(_) | SiteAskError::Serialization(_) => {
                (StatusCode::BAD_REQUEST, "invalid_input")
            }
            SiteAskError::SiteNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", err);
        }
        Self {
            status,
            error_code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error_code: self.error_code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use siteask_core::llm::prompts::{DETECT_MEMORY_REQUEST, RANKING};
    use siteask_core::pipeline::{FastTrackMode, JudgmentKind};
    use siteask_core::retrieval::loader::parse_json_lines;
    use siteask_core::{
        Config, Inference, InferenceRequest, QueryRequest, Result, SiteScope, StreamConsumer,
        HttpTransport,
    };
    use tokio::net::TcpListener;

    const RECIPES: &str = r#"{"url": "https://eats.example/sorbet", "@type": "Recipe", "name": "Mango Sorbet"}
{"url": "https://eats.example/lassi", "@type": "Recipe", "name": "Mango Lassi"}
{"url": "https://eats.example/stew", "@type": "Recipe", "name": "Lentil Stew"}
"#;

    struct Scores;

    #[async_trait]
    impl Inference for Scores {
        async fn infer(&self, request: InferenceRequest) -> Result<Value> {
            if request.prompt_name == DETECT_MEMORY_REQUEST {
                return Ok(json!({"is_memory_request": false, "memory_request": ""}));
            }
            if request.prompt_name != RANKING {
                return Err(SiteAskError::Llm(format!("unexpected {}", request.prompt_name)));
            }
            let text = request.render();
            let score = if text.contains("Mango Sorbet") {
                85
            } else if text.contains("Mango Lassi") {
                64
            } else {
                10
            };
            Ok(json!({"score": score, "description": "fits"}))
        }
    }

    async fn spawn_server() -> String {
        let corpus = CorpusStore::open_in_memory().unwrap();
        corpus
            .load_items(&parse_json_lines(RECIPES, "eats", "Recipe").unwrap())
            .unwrap();
        let corpus = Arc::new(corpus);

        let mut config = Config::default();
        config.pipeline.fast_track = FastTrackMode::Disabled;
        config.pipeline.judgments = vec![JudgmentKind::Memory];
        let coordinator = Arc::new(Coordinator::new(
            &config,
            Arc::new(Scores),
            Arc::clone(&corpus) as Arc<dyn siteask_core::Retriever>,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(AppState::new(coordinator, corpus));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_stream_consumer_reads_served_turn() {
        let base = spawn_server().await;
        let consumer = StreamConsumer::new(HttpTransport::new(&base).unwrap());
        let request = QueryRequest::new("q1", "mango").with_scope(SiteScope::parse("eats"));

        let mut seen = Vec::new();
        let state = consumer
            .run(&request, |event| seen.push(event.kind.message_type()))
            .await
            .unwrap();

        assert!(state.is_finished());
        let scores: Vec<u8> = state.results().iter().map(|r| r.relevance_score).collect();
        assert_eq!(scores, vec![85, 64]);
        assert_eq!(seen.first(), Some(&"query_analysis"));
        assert_eq!(seen.last(), Some(&"complete"));
    }

    #[tokio::test]
    async fn test_post_ask_aggregates_turn() {
        let base = spawn_server().await;
        let response: Value = reqwest::Client::new()
            .post(format!("{}/ask", base))
            .json(&json!({"query": "mango", "query_id": "q9", "site": "eats"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(response["query_id"], "q9");
        let urls: Vec<&str> = response["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["url"].as_str().unwrap())
            .collect();
        assert_eq!(
            urls,
            vec!["https://eats.example/sorbet", "https://eats.example/lassi"]
        );
        assert!(response.get("complete").is_some());
    }

    #[tokio::test]
    async fn test_empty_query_is_bad_request() {
        let base = spawn_server().await;
        let response = reqwest::Client::new()
            .get(format!("{}/ask", base))
            .query(&[("query", " ")])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error_code"], "invalid_input");
    }

    #[tokio::test]
    async fn test_sites_and_health() {
        let base = spawn_server().await;
        let client = reqwest::Client::new();
        let health = client.get(format!("{}/health", base)).send().await.unwrap();
        assert!(health.status().is_success());
        let health: Value = health.json().await.unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["sessions"], 0);
        assert_eq!(health["inference"], json!([]));

        let sites: Value = client
            .get(format!("{}/sites", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            sites,
            json!([{"site": "eats", "item_count": 3, "item_types": ["Recipe"]}])
        );
    }
}
