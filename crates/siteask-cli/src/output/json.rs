//! JSON output formatter

use siteask_core::TurnResponse;

pub fn format_response(response: &TurnResponse) -> String {
    serde_json::to_string_pretty(response).unwrap_or_else(|_| "{}".to_string()) + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use siteask_core::{collect_response, EventKind, TurnEvent};

    #[test]
    fn test_format_response_keys_messages_by_type() {
        let events = vec![
            TurnEvent {
                query_id: "q1".into(),
                kind: EventKind::IntermediateMessage {
                    message: "No results were found for that query.".into(),
                },
            },
            TurnEvent {
                query_id: "q1".into(),
                kind: EventKind::Complete,
            },
        ];
        let out = format_response(&collect_response("q1", &events));
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();

        assert_eq!(value["query_id"], "q1");
        assert_eq!(value["results"], serde_json::json!([]));
        assert_eq!(
            value["intermediate_message"][0]["message"],
            "No results were found for that query."
        );
        assert!(value.get("complete").is_some());
    }
}
