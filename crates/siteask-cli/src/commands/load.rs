//! Corpus loading

use crate::app::LoadArgs;
use crate::progress::ProgressReporter;
use anyhow::{Context, Result};
use siteask_core::retrieval::load_path;
use siteask_core::{Config, CorpusStore, SiteAskError};
use std::collections::HashSet;
use std::path::Path;

pub async fn run(args: LoadArgs, corpus: &CorpusStore, config: &Config, verbose: bool) -> Result<()> {
    let mut progress = ProgressReporter::new(args.paths.len(), verbose);
    let mut replaced = HashSet::new();

    for path in &args.paths {
        let site = match &args.site {
            Some(site) => site.clone(),
            None => site_name(path)?,
        };
        let item_type = args
            .item_type
            .clone()
            .unwrap_or_else(|| config.item_type_for_site(&site));

        if args.replace && replaced.insert(site.clone()) {
            match corpus.remove_site(&site) {
                Ok(removed) => println!("Removed {} items from '{}'", removed, site),
                Err(SiteAskError::SiteNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        progress.set_message(&path.display().to_string());
        let items = load_path(path, &site, &item_type)
            .with_context(|| format!("loading {}", path.display()))?;
        let written = corpus.load_items(&items)?;
        progress.increment(written);
        println!(
            "Loaded {} items into '{}' from {}",
            written,
            site,
            path.display()
        );
    }

    progress.finish();
    if args.paths.len() > 1 {
        println!("Loaded {} items in total", progress.items());
    }
    Ok(())
}

/// Site named after the file stem or directory name
fn site_name(path: &Path) -> Result<String> {
    let resolved = path.canonicalize()?;
    resolved
        .file_stem()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            SiteAskError::InvalidInput(format!(
                "cannot name a site after {}; pass --site",
                path.display()
            ))
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_site_name_from_file_and_dir() {
        let dir = TempDir::new().unwrap();
        let eats = dir.path().join("eats");
        fs::create_dir_all(&eats).unwrap();
        let films = dir.path().join("films.tsv");
        fs::write(&films, "").unwrap();

        assert_eq!(site_name(&eats).unwrap(), "eats");
        assert_eq!(site_name(&films).unwrap(), "films");
        assert!(site_name(&dir.path().join("missing")).is_err());
    }
}
