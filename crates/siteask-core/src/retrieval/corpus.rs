//! SQLite corpus store with FTS5 keyword retrieval

use super::loader::LoadedItem;
use super::{CandidateItem, Retriever, SiteScope};
use crate::error::{Result, SiteAskError};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_VERSION: i32 = 1;

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE,
    site TEXT NOT NULL,
    name TEXT NOT NULL,
    item_type TEXT NOT NULL,
    schema_json TEXT NOT NULL,
    search_text TEXT NOT NULL,
    loaded_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS items_fts USING fts5(
    name,
    body,
    tokenize='porter unicode61'
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

CREATE INDEX IF NOT EXISTS idx_items_site ON items(site);
"#;

const CREATE_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS items_ai
AFTER INSERT ON items
BEGIN
    INSERT INTO items_fts(rowid, name, body) VALUES (new.id, new.name, new.search_text);
END;

CREATE TRIGGER IF NOT EXISTS items_au
AFTER UPDATE ON items
BEGIN
    DELETE FROM items_fts WHERE rowid = old.id;
    INSERT INTO items_fts(rowid, name, body) VALUES (new.id, new.name, new.search_text);
END;

CREATE TRIGGER IF NOT EXISTS items_ad
AFTER DELETE ON items
BEGIN
    DELETE FROM items_fts WHERE rowid = old.id;
END;
"#;

/// Per-site summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteInfo {
    pub site: String,
    pub item_count: usize,
    pub item_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorpusStats {
    pub site_count: usize,
    pub item_count: usize,
}

/// Local corpus of structured items
pub struct CorpusStore {
    conn: Mutex<Connection>,
}

impl CorpusStore {
    /// Open the store at path, creating it if necessary
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.initialize()?;
        Ok(store)
    }

    /// In-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Default store location, overridable with `SITEASK_DB`
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("SITEASK_DB") {
            return PathBuf::from(path);
        }
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(crate::CACHE_DIR_NAME)
            .join("corpus.sqlite")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SiteAskError::Retrieval("corpus connection poisoned".to_string()))
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(CREATE_TABLES)?;
        conn.execute_batch(CREATE_TRIGGERS)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    /// Insert or replace items; returns the number written
    pub fn load_items(&self, items: &[LoadedItem]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO items (url, site, name, item_type, schema_json, search_text, loaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(url) DO UPDATE SET
                    site = excluded.site,
                    name = excluded.name,
                    item_type = excluded.item_type,
                    schema_json = excluded.schema_json,
                    search_text = excluded.search_text,
                    loaded_at = excluded.loaded_at",
            )?;
            for item in items {
                stmt.execute(params![
                    item.url,
                    item.site,
                    item.name,
                    item.item_type,
                    item.payload.to_string(),
                    search_text(&item.payload),
                    now,
                ])?;
                written += 1;
            }
        }
        tx.commit()?;
        tracing::info!("Loaded {} items into corpus", written);
        Ok(written)
    }

    /// Remove every item of a site
    pub fn remove_site(&self, site: &str) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM items WHERE site = ?1", params![site])?;
        if removed == 0 {
            return Err(SiteAskError::SiteNotFound(site.to_string()));
        }
        Ok(removed)
    }

    /// Keyword search ranked by bm25, best first
    pub fn search(&self, query: &str, scope: &SiteScope, limit: usize) -> Result<Vec<CandidateItem>> {
        let Some(match_expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };

        let mut sql = String::from(
            r#"
            SELECT i.url, i.site, i.name, i.schema_json, bm25(items_fts, 10.0, 1.0) AS rank
            FROM items_fts
            JOIN items i ON i.id = items_fts.rowid
            WHERE items_fts MATCH ?1
        "#,
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(match_expr)];

        if let SiteScope::Sites(sites) = scope {
            let placeholders: Vec<String> = sites
                .iter()
                .map(|site| {
                    params_vec.push(Box::new(site.clone()));
                    format!("?{}", params_vec.len())
                })
                .collect();
            sql.push_str(&format!(" AND i.site IN ({})", placeholders.join(", ")));
        }

        sql.push_str(" ORDER BY rank ASC, i.id ASC");
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                    ))
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(url, site, name, json, rank)| {
                // bm25 is negative, more negative is better
                let relevance = -rank;
                let score = relevance / (1.0 + relevance);
                row_to_candidate(url, site, name, &json).map(|c| c.with_score(score))
            })
            .collect())
    }

    /// Fetch one item by URL
    pub fn get(&self, url: &str) -> Result<Option<CandidateItem>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT url, site, name, schema_json FROM items WHERE url = ?1",
                params![url],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.and_then(|(url, site, name, json)| row_to_candidate(url, site, name, &json)))
    }

    /// Sites with their item counts and item types
    pub fn list_sites(&self) -> Result<Vec<SiteInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT site, COUNT(*), GROUP_CONCAT(DISTINCT item_type)
             FROM items GROUP BY site ORDER BY site",
        )?;
        let sites = stmt
            .query_map([], |row| {
                let types: Option<String> = row.get(2)?;
                let mut item_types: Vec<String> = types
                    .unwrap_or_default()
                    .split(',')
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
                item_types.sort();
                Ok(SiteInfo {
                    site: row.get(0)?,
                    item_count: row.get::<_, i64>(1)? as usize,
                    item_types,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sites)
    }

    pub fn stats(&self) -> Result<CorpusStats> {
        let conn = self.conn()?;
        let (site_count, item_count): (i64, i64) = conn.query_row(
            "SELECT COUNT(DISTINCT site), COUNT(*) FROM items",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(CorpusStats {
            site_count: site_count as usize,
            item_count: item_count as usize,
        })
    }
}

#[async_trait]
impl Retriever for CorpusStore {
    async fn retrieve(
        &self,
        query: &str,
        scope: &SiteScope,
        limit: usize,
    ) -> Result<Vec<CandidateItem>> {
        let results = self.search(query, scope, limit)?;
        tracing::debug!("Corpus returned {} candidates for {:?}", results.len(), query);
        Ok(results)
    }

    async fn lookup(&self, source_identifier: &str) -> Result<Option<CandidateItem>> {
        self.get(source_identifier)
    }
}

fn row_to_candidate(url: String, site: String, name: String, json: &str) -> Option<CandidateItem> {
    match serde_json::from_str::<Value>(json) {
        Ok(payload @ Value::Object(_)) => Some(CandidateItem {
            source_identifier: url,
            name,
            site,
            payload,
            raw_score: None,
        }),
        Ok(_) => {
            tracing::warn!("Dropping {}: payload is not a JSON object", url);
            None
        }
        Err(e) => {
            tracing::warn!("Dropping {}: malformed payload ({})", url, e);
            None
        }
    }
}

/// Quote each term and OR them so punctuation never reaches the FTS parser
fn fts_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Flatten every string leaf of a payload into searchable text
fn search_text(payload: &Value) -> String {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) if !s.starts_with("http") => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(obj) => obj
                .iter()
                .filter(|(k, _)| !k.starts_with('@'))
                .for_each(|(_, v)| walk(v, out)),
            _ => {}
        }
    }
    let mut parts = Vec::new();
    walk(payload, &mut parts);
    parts.join(" ")
}
