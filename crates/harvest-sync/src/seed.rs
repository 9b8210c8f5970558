//! Source onboarding from a YAML file.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use harvest_adapters::AdapterRegistry;
use harvest_core::NewSource;
use harvest_storage::RecordStore;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedFile {
    pub sources: Vec<NewSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub inserted: Vec<Uuid>,
    /// Already present under the same platform and base URL.
    pub existing: usize,
    /// Inserted, but no adapter is registered for the platform yet.
    pub unknown_platform: usize,
}

pub fn parse_seed_yaml(text: &str) -> Result<SeedFile> {
    serde_yaml::from_str(text).context("parsing seed yaml")
}

pub async fn load_seed_file(path: impl AsRef<Path>) -> Result<SeedFile> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_seed_yaml(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Inserts every source whose (platform, base_url) is not stored yet.
pub async fn seed_sources(
    store: &dyn RecordStore,
    registry: &AdapterRegistry,
    sources: Vec<NewSource>,
    now: DateTime<Utc>,
) -> Result<SeedReport> {
    let mut report = SeedReport::default();
    for new in sources {
        if store
            .find_source_by_endpoint(&new.platform, &new.base_url)
            .await?
            .is_some()
        {
            report.existing += 1;
            continue;
        }
        if !registry.contains(&new.platform) {
            warn!(platform = %new.platform, base_url = %new.base_url, "no adapter registered for platform");
            report.unknown_platform += 1;
        }
        let source = store
            .insert_source(new, now)
            .await
            .context("inserting seeded source")?;
        info!(source = %source.label(), id = %source.id, "seeded source");
        report.inserted.push(source.id);
    }
    Ok(report)
}
