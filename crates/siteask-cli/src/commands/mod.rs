//! CLI command handlers

pub mod ask;
pub mod load;
pub mod serve;
pub mod sites;
pub mod watch;

use crate::app::TurnArgs;
use anyhow::{bail, Result};
use siteask_core::config::SiteConfig;
use siteask_core::stream::new_query_id;
use siteask_core::{
    Config, Coordinator, CorpusStore, QueryRequest, SiteScope, TieredInference,
};
use std::sync::Arc;

/// Build the coordinator over the configured inference service and the corpus
pub fn coordinator(config: &Config, corpus: Arc<CorpusStore>) -> Result<Arc<Coordinator>> {
    let inference = TieredInference::from_config(&config.llm_service)?;
    Ok(Arc::new(Coordinator::new(config, Arc::new(inference), corpus)))
}

/// Give sites known only to the corpus their item type
///
/// Configured sites win; a loaded site is adopted only when all of its items
/// share one type.
pub fn adopt_corpus_sites(config: &mut Config, corpus: &CorpusStore) -> Result<()> {
    for site in corpus.list_sites()? {
        if config.sites.contains_key(&site.site) {
            continue;
        }
        if let [item_type] = site.item_types.as_slice() {
            config.sites.insert(
                site.site.clone(),
                SiteConfig {
                    item_type: item_type.clone(),
                    description: None,
                },
            );
        }
    }
    Ok(())
}

impl TurnArgs {
    pub fn to_request(&self) -> Result<QueryRequest> {
        let text = self.query.join(" ");
        if text.trim().is_empty() {
            bail!(siteask_core::SiteAskError::InvalidInput(
                "query must not be empty".to_string()
            ));
        }
        let query_id = self.query_id.clone().unwrap_or_else(new_query_id);

        let mut request = QueryRequest::new(query_id, text)
            .with_scope(SiteScope::parse(self.site.as_deref().unwrap_or_default()))
            .with_mode(self.mode)
            .with_history(self.prev.clone());
        request.remembered_facts = self.remembered.clone();
        request.context_reference = self.context_url.clone();
        Ok(request)
    }
}
