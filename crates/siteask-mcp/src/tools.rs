//! MCP tool definitions and handlers

use crate::protocol::*;
use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use siteask_core::stream::new_query_id;
use siteask_core::{
    collect_response, Coordinator, CorpusStore, GenerateMode, QueryRequest, SiteScope,
    TurnResponse,
};
use std::sync::Arc;

pub fn ask_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: "ask".to_string(),
        description: "Ask a natural-language question of the loaded sites; items are ranked by an LLM and only items from the corpus are returned".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The question"
                },
                "site": {
                    "type": "string",
                    "description": "Comma separated sites to ask (default: all sites)"
                },
                "mode": {
                    "type": "string",
                    "enum": ["list", "summarize", "generate"],
                    "description": "list ranked items, add a summary, or synthesize an answer (default: list)",
                    "default": "list"
                },
                "prev": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Earlier questions of the conversation, oldest first"
                },
                "remembered": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Facts the user asked to remember in earlier turns"
                },
                "contextUrl": {
                    "type": "string",
                    "description": "URL of the item the user is looking at"
                },
                "sessionId": {
                    "type": "string",
                    "description": "Conversation id; a new question cancels the session's running one"
                }
            },
            "required": ["query"]
        }),
    }
}

pub fn list_sites_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: "list_sites".to_string(),
        description: "List the loaded sites with their item counts and types".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {}
        }),
    }
}

/// Build the turn request from tool arguments
pub fn request_from_args(args: &Value) -> Result<QueryRequest> {
    let query = args
        .get("query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("Missing query"))?;
    if query.trim().is_empty() {
        bail!("Query must not be empty");
    }

    let mode = match args.get("mode").and_then(|v| v.as_str()) {
        Some(mode) => mode.parse::<GenerateMode>()?,
        None => GenerateMode::List,
    };
    let site = args.get("site").and_then(|v| v.as_str()).unwrap_or_default();

    let mut request = QueryRequest::new(new_query_id(), query)
        .with_scope(SiteScope::parse(site))
        .with_mode(mode)
        .with_history(string_list(args, "prev"));
    request.remembered_facts = string_list(args, "remembered");
    request.context_reference = args
        .get("contextUrl")
        .and_then(|v| v.as_str())
        .map(String::from);
    Ok(request)
}

fn string_list(args: &Value, key: &str) -> Vec<String> {
    match args.get(key) {
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str())
            .map(String::from)
            .collect(),
        Some(Value::String(value)) if !value.trim().is_empty() => vec![value.clone()],
        _ => Vec::new(),
    }
}

pub async fn handle_ask(coordinator: &Arc<Coordinator>, args: Value) -> Result<ToolResult> {
    let request = request_from_args(&args)?;
    let query_id = request.query_id.clone();
    let session_id = args
        .get("sessionId")
        .and_then(|v| v.as_str())
        .map(String::from);

    let mut rx = coordinator.spawn_turn(request, session_id);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let response = collect_response(&query_id, &events);
    let text = render_turn(&response);
    Ok(ToolResult::text(text, serde_json::to_value(&response)?))
}

/// Plain-text rendering of an aggregated turn
pub fn render_turn(response: &TurnResponse) -> String {
    let message = |kind: &str, field: &str| {
        response
            .messages
            .get(kind)
            .and_then(|v| v.get(field))
            .and_then(|v| v.as_str())
            .map(String::from)
    };

    if let Some(text) = message("site_is_irrelevant_to_query", "message") {
        return text;
    }
    if let Some(text) = message("ask_user", "message") {
        return text;
    }

    let mut lines = Vec::new();
    if let Some(answer) = message("nlws", "answer") {
        lines.push(answer);
        let sources = response
            .messages
            .get("nlws")
            .and_then(|v| v.get("items"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if !sources.is_empty() {
            lines.push(String::new());
            lines.push("Sources:".to_string());
            for source in sources {
                lines.push(format!(
                    "- {} <{}>",
                    source["name"].as_str().unwrap_or_default(),
                    source["url"].as_str().unwrap_or_default()
                ));
            }
        }
    } else if response.results.is_empty() {
        lines.push("No results".to_string());
    } else {
        lines.push(format!("Found {} results", response.results.len()));
        for item in &response.results {
            lines.push(format!(
                "{:>3} {} <{}>",
                item.relevance_score,
                item.candidate.name,
                item.source_identifier()
            ));
        }
    }

    if let Some(summary) = message("summary", "message") {
        lines.push(String::new());
        lines.push(summary);
    }
    if let Some(Value::Array(notes)) = response.messages.get("intermediate_message") {
        for note in notes {
            if let Some(note) = note.get("message").and_then(|v| v.as_str()) {
                lines.push(format!("Note: {}", note));
            }
        }
    }
    if let Some(reason) = message("cancelled", "reason") {
        lines.push(format!("Cancelled: {}", reason));
    }
    lines.join("\n")
}

pub async fn handle_list_sites(corpus: &CorpusStore) -> Result<ToolResult> {
    let sites = corpus.list_sites()?;
    let mut summary = format!("{} sites loaded", sites.len());
    for site in &sites {
        summary.push_str(&format!(
            "\n  - {}: {} items ({})",
            site.site,
            site.item_count,
            site.item_types.join(", ")
        ));
    }
    Ok(ToolResult::text(
        summary,
        serde_json::json!({ "sites": sites }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_from_args() {
        let request = request_from_args(&json!({
            "query": "what about for kids?",
            "site": "eats",
            "mode": "summarize",
            "prev": ["tell me about mango desserts"],
            "remembered": "I am vegetarian",
            "contextUrl": "https://eats.example/sorbet"
        }))
        .unwrap();

        assert_eq!(request.query_text, "what about for kids?");
        assert_eq!(request.site_scope, SiteScope::Sites(vec!["eats".into()]));
        assert_eq!(request.generate_mode, GenerateMode::Summarize);
        assert_eq!(
            request.session_history,
            vec!["tell me about mango desserts".to_string()]
        );
        assert_eq!(request.remembered_facts, vec!["I am vegetarian".to_string()]);
        assert_eq!(
            request.context_reference.as_deref(),
            Some("https://eats.example/sorbet")
        );
        assert!(!request.query_id.is_empty());
    }

    #[test]
    fn test_request_requires_query() {
        assert!(request_from_args(&json!({})).is_err());
        assert!(request_from_args(&json!({"query": "  "})).is_err());
        assert!(request_from_args(&json!({"query": "x", "mode": "poem"})).is_err());
    }

    #[test]
    fn test_render_irrelevant_turn() {
        let mut response = TurnResponse::default();
        response.messages.insert(
            "site_is_irrelevant_to_query".into(),
            json!({"message": "This is a cooking site."}),
        );
        assert_eq!(render_turn(&response), "This is a cooking site.");
    }

    #[test]
    fn test_render_answer_with_sources() {
        let mut response = TurnResponse::default();
        response.messages.insert(
            "nlws".into(),
            json!({
                "answer": "Try the sorbet.",
                "items": [{"url": "https://eats.example/sorbet", "name": "Mango Sorbet"}]
            }),
        );
        assert_eq!(
            render_turn(&response),
            "Try the sorbet.\n\nSources:\n- Mango Sorbet <https://eats.example/sorbet>"
        );
    }
}
