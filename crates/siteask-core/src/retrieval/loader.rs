//! Corpus file loading
//!
//! Accepted formats:
//! - `.json`: an item, an array of items, or an object with `@graph`
//! - `.jsonl`: one JSON document per line
//! - `.tsv` / `.txt`: `url<TAB>json[<TAB>ignored...]` lines

use crate::error::{Result, SiteAskError};
use csv::ReaderBuilder;
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One normalised item ready for the corpus store
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedItem {
    pub url: String,
    pub site: String,
    pub name: String,
    pub item_type: String,
    pub payload: Value,
}

/// Load every supported file under `path` for `site`
///
/// `default_type` is used for items that declare no `@type`.
pub fn load_path(path: &Path, site: &str, default_type: &str) -> Result<Vec<LoadedItem>> {
    if !path.exists() {
        return Err(SiteAskError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Path not found: {:?}", path),
        )));
    }

    let files = if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        scan_directory(path)?
    };

    let mut items = Vec::new();
    for file in files {
        match load_file(&file, site, default_type) {
            Ok(loaded) => {
                tracing::debug!("Loaded {} items from {:?}", loaded.len(), file);
                items.extend(loaded);
            }
            Err(e) => tracing::warn!("Failed to load {:?}: {}", file, e),
        }
    }
    Ok(items)
}

fn scan_directory(base_path: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(base_path)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
    {
        let entry = entry?;
        if entry.file_type().is_file() && format_of(entry.path()).is_some() {
            files.push(entry.path().to_path_buf());
        }
    }
    Ok(files)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    JsonLines,
    Tsv,
}

fn format_of(path: &Path) -> Option<Format> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "json" => Some(Format::Json),
        "jsonl" | "ndjson" => Some(Format::JsonLines),
        "tsv" | "txt" => Some(Format::Tsv),
        _ => None,
    }
}

/// Load one file, picking the parser from its extension
pub fn load_file(path: &Path, site: &str, default_type: &str) -> Result<Vec<LoadedItem>> {
    let content = std::fs::read_to_string(path)?;
    match format_of(path) {
        Some(Format::Json) => parse_json(&content, site, default_type),
        Some(Format::JsonLines) => parse_json_lines(&content, site, default_type),
        Some(Format::Tsv) => parse_tsv(&content, site, default_type),
        None => Err(SiteAskError::Parse(format!(
            "Unsupported corpus file {:?}",
            path
        ))),
    }
}

/// Parse a JSON document of one or more items; each must carry `url` or `@id`
pub fn parse_json(content: &str, site: &str, default_type: &str) -> Result<Vec<LoadedItem>> {
    let doc: Value = serde_json::from_str(content)?;
    Ok(normalize_items(doc)
        .into_iter()
        .filter_map(|payload| match item_url(&payload) {
            Some(url) => Some(build_item(url, site, default_type, payload)),
            None => {
                tracing::warn!("Skipping item without url in {} corpus", site);
                None
            }
        })
        .collect())
}

pub fn parse_json_lines(content: &str, site: &str, default_type: &str) -> Result<Vec<LoadedItem>> {
    let mut items = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_json(line, site, default_type) {
            Ok(loaded) => items.extend(loaded),
            Err(e) => tracing::warn!("Skipping line {}: {}", line_no + 1, e),
        }
    }
    Ok(items)
}

/// Parse `url<TAB>json` lines; a multi-item line gets `url`, `url#1`, ...
pub fn parse_tsv(content: &str, site: &str, default_type: &str) -> Result<Vec<LoadedItem>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(content.as_bytes());

    let mut items = Vec::new();
    for (row_num, result) in reader.records().enumerate() {
        let record = result?;
        let (Some(url), Some(json)) = (record.get(0), record.get(1)) else {
            tracing::warn!("Skipping row {}: expected url and json columns", row_num + 1);
            continue;
        };
        let doc: Value = match serde_json::from_str(json) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!("Skipping row {} ({}): {}", row_num + 1, url, e);
                continue;
            }
        };
        for (i, payload) in normalize_items(doc).into_iter().enumerate() {
            let item_url = if i == 0 {
                url.trim().to_string()
            } else {
                format!("{}#{}", url.trim(), i)
            };
            items.push(build_item(item_url, site, default_type, payload));
        }
    }
    Ok(items)
}

/// Flatten arrays, single-element wrappers and `@graph` containers into item objects
pub fn normalize_items(doc: Value) -> Vec<Value> {
    let mut out = Vec::new();
    collect_items(doc, &mut out);
    out
}

fn collect_items(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_items(item, out);
            }
        }
        Value::Object(mut obj) => match obj.remove("@graph") {
            Some(graph) => collect_items(graph, out),
            None => out.push(Value::Object(obj)),
        },
        other => tracing::debug!("Ignoring non-object corpus entry: {}", other),
    }
}

fn item_url(payload: &Value) -> Option<String> {
    ["url", "@id"]
        .iter()
        .filter_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn build_item(url: String, site: &str, default_type: &str, payload: Value) -> LoadedItem {
    let name = item_name(&payload, &url);
    let item_type = super::trim::declared_types(&payload)
        .into_iter()
        .next()
        .unwrap_or_else(|| default_type.to_string());
    LoadedItem {
        url,
        site: site.to_string(),
        name,
        item_type,
        payload,
    }
}

/// Display name from `name`, `headline` or `title`, else the longest URL path segment
pub fn item_name(payload: &Value, url: &str) -> String {
    for field in ["name", "headline", "title"] {
        if let Some(name) = payload.get(field).and_then(Value::as_str) {
            if !name.trim().is_empty() {
                return name.trim().to_string();
            }
        }
    }

    let without_scheme = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let Some((_, path)) = without_scheme.split_once('/') else {
        return String::new();
    };
    let longest = path
        .split(['/', '?', '#'])
        .max_by_key(|p| p.len())
        .unwrap_or_default();
    longest
        .replace(['-', '_'], " ")
        .split_whitespace()
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
