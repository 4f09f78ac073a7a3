//! Payload reduction before items are shown to a model
//!
//! Trimmed payloads only ever feed prompts; emitted items always carry the
//! untouched payload.

use serde_json::{Map, Value};

const COMMON_SKIP: &[&str] = &[
    "mainEntityOfPage",
    "publisher",
    "image",
    "datePublished",
    "dateModified",
    "author",
];

const RECIPE_HARD_SKIP: &[&str] = &["review", "recipeYield", "recipeInstructions", "nutrition"];

const PEOPLE_FIELDS: &[&str] = &["actor", "director", "creator"];

/// Declared `@type` tags of a payload, in declaration order
pub fn declared_types(payload: &Value) -> Vec<String> {
    match payload.get("@type") {
        Some(Value::String(t)) => vec![t.clone()],
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn has_type(payload: &Value, wanted: &[&str]) -> bool {
    declared_types(payload)
        .iter()
        .any(|t| wanted.contains(&t.as_str()))
}

/// Drop bulky fields that do not help relevance judgments
pub fn trim(payload: &Value) -> Value {
    trim_with(payload, false)
}

/// Stricter trim used when many items go into one synthesis prompt
pub fn trim_hard(payload: &Value) -> Value {
    trim_with(payload, true)
}

fn trim_with(payload: &Value, hard: bool) -> Value {
    let Value::Object(obj) = payload else {
        return payload.clone();
    };

    if has_type(payload, &["Recipe"]) {
        let mut skip: Vec<&str> = COMMON_SKIP.to_vec();
        if hard {
            skip.extend_from_slice(RECIPE_HARD_SKIP);
        }
        return Value::Object(without(obj, &skip));
    }

    if has_type(payload, &["Movie", "TVSeries"]) {
        let mut skip: Vec<&str> = COMMON_SKIP.to_vec();
        skip.push("trailer");
        if hard {
            skip.extend_from_slice(PEOPLE_FIELDS);
            skip.push("review");
        }
        let mut out = without(obj, &skip);
        for field in PEOPLE_FIELDS {
            if let Some(people) = out.get(*field) {
                let names = person_names(people);
                out.insert(
                    field.to_string(),
                    Value::Array(names.into_iter().map(Value::String).collect()),
                );
            }
        }
        return Value::Object(out);
    }

    payload.clone()
}

fn without(obj: &Map<String, Value>, skip: &[&str]) -> Map<String, Value> {
    obj.iter()
        .filter(|(k, _)| !skip.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn person_names(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Object(o) => o
            .get("name")
            .and_then(Value::as_str)
            .map(|n| vec![n.to_string()])
            .unwrap_or_default(),
        Value::Array(items) => items.iter().flat_map(person_names).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trim_recipe() {
        let recipe = json!({
            "@type": "Recipe",
            "name": "Mango Sticky Rice",
            "image": "https://x/img.jpg",
            "author": {"name": "A"},
            "recipeIngredient": ["mango", "rice"],
            "recipeInstructions": ["steam"]
        });
        let soft = trim(&recipe);
        assert!(soft.get("image").is_none());
        assert!(soft.get("author").is_none());
        assert!(soft.get("recipeInstructions").is_some());

        let hard = trim_hard(&recipe);
        assert!(hard.get("recipeInstructions").is_none());
        assert_eq!(hard["recipeIngredient"], json!(["mango", "rice"]));
    }

    #[test]
    fn test_trim_movie_flattens_people() {
        let movie = json!({
            "@type": ["Movie"],
            "name": "Heat",
            "trailer": {"url": "x"},
            "actor": [{"@type": "Person", "name": "Al Pacino"}, {"name": "Robert De Niro"}],
            "director": {"name": "Michael Mann"}
        });
        let soft = trim(&movie);
        assert!(soft.get("trailer").is_none());
        assert_eq!(soft["actor"], json!(["Al Pacino", "Robert De Niro"]));
        assert_eq!(soft["director"], json!(["Michael Mann"]));

        let hard = trim_hard(&movie);
        assert!(hard.get("actor").is_none());
    }

    #[test]
    fn test_trim_leaves_other_types() {
        let product = json!({"@type": "Product", "image": "x", "name": "Pan"});
        assert_eq!(trim(&product), product);
        assert_eq!(declared_types(&json!({"name": "x"})), Vec::<String>::new());
    }
}
