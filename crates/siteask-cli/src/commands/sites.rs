//! Site listing and removal

use crate::app::{OutputFormat, SitesArgs};
use anyhow::Result;
use siteask_core::CorpusStore;

pub async fn run(args: SitesArgs, corpus: &CorpusStore, format: OutputFormat) -> Result<()> {
    if let Some(site) = args.remove {
        let removed = corpus.remove_site(&site)?;
        println!("Removed site '{}' ({} items)", site, removed);
        return Ok(());
    }

    let sites = corpus.list_sites()?;
    match format {
        OutputFormat::Json | OutputFormat::Sse => {
            println!("{}", serde_json::to_string_pretty(&sites)?);
        }
        OutputFormat::Cli => {
            if sites.is_empty() {
                println!("No sites loaded");
                return Ok(());
            }
            for site in sites {
                println!(
                    "{}: {} items ({})",
                    site.site,
                    site.item_count,
                    site.item_types.join(", ")
                );
            }
            let stats = corpus.stats()?;
            println!(
                "{} items across {} sites",
                stats.item_count, stats.site_count
            );
        }
    }
    Ok(())
}
