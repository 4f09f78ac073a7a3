//! MCP resource handlers
//!
//! Every corpus item is readable as `siteask://item/<item url>`.

use crate::protocol::ResourceContent;
use anyhow::Result;
use siteask_core::CorpusStore;

pub const ITEM_URI_PREFIX: &str = "siteask://item/";

pub fn item_uri(url: &str) -> String {
    format!("{}{}", ITEM_URI_PREFIX, url)
}

/// Read an item resource by URI
pub fn read_resource(corpus: &CorpusStore, uri: &str) -> Result<ResourceContent> {
    let Some(url) = uri.strip_prefix(ITEM_URI_PREFIX) else {
        anyhow::bail!("Invalid URI: {}", uri);
    };
    if url.is_empty() {
        anyhow::bail!("Invalid URI format: {}", uri);
    }

    let item = corpus
        .get(url)?
        .ok_or_else(|| anyhow::anyhow!("Item not found: {}", url))?;

    Ok(ResourceContent {
        uri: uri.to_string(),
        name: item.name.clone(),
        mime_type: "application/ld+json".to_string(),
        text: serde_json::to_string_pretty(&item.payload)?,
    })
}
