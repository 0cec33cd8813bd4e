//! Plan command - Compute the collections of a backup without storing it
//!
//! Runs the collections orchestrator for one owner and reports what a backup
//! would contain: every collection with its state, the base-backup entries it
//! replaces, and the skips and alerts raised along the way. The delta feed
//! comes either from a recording (`--input`) or from Microsoft Graph
//! (`--access-token`).
//!
//! Metadata written with `--write-metadata` can be passed back with
//! `--previous` to plan the next incremental backup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use drivesnap_backup::collection::CollectionState;
use drivesnap_backup::collections::{BackupCollection, Collections};
use drivesnap_backup::excludes::ExcludeSet;
use drivesnap_backup::metadata::{MetadataCollection, MetadataEntry};
use drivesnap_core::config::Config;
use drivesnap_core::domain::{
    Alert, BackupPath, Category, FaultBus, ResourceScope, Service, Skipped,
};
use drivesnap_core::ports::{AllPass, DirScope, DriveSource, GlobScope, ItemStore};
use drivesnap_graph::client::GraphClient;
use drivesnap_graph::provider::GraphProvider;
use serde::Serialize;
use tracing::info;

use crate::output::{get_formatter, plural, OutputFormat};
use crate::replay::{Recording, ReplaySource, ReplayStore};

#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Recorded delta pages to replay (JSON)
    #[arg(long, required_unless_present = "access_token", conflicts_with = "access_token")]
    input: Option<PathBuf>,

    /// Graph access token; plans against the owner's live drives
    #[arg(long)]
    access_token: Option<String>,

    /// Tenant ID
    #[arg(long)]
    tenant: String,

    /// User or site whose drives are backed up
    #[arg(long)]
    owner: String,

    /// Service: onedrive or sharepoint
    #[arg(long, default_value = "onedrive")]
    service: Service,

    /// Folder selection glob; may be repeated. Everything is selected when omitted
    #[arg(long = "select")]
    select: Vec<String>,

    /// Metadata of the previous backup, as written by --write-metadata
    #[arg(long)]
    previous: Option<PathBuf>,

    /// Write the metadata of this backup to a file
    #[arg(long)]
    write_metadata: Option<PathBuf>,
}

/// One collection as reported to the user
#[derive(Debug, Serialize)]
struct CollectionSummary {
    kind: &'static str,
    state: CollectionState,
    path: Option<String>,
    previous_path: Option<String>,
    do_not_merge_items: bool,
    items: usize,
}

impl CollectionSummary {
    fn of(col: &BackupCollection) -> Self {
        let (kind, items) = match col {
            BackupCollection::Drive(c) => ("drive", c.file_count()),
            BackupCollection::Tombstone(_) => ("tombstone", 0),
            BackupCollection::Metadata(m) => ("metadata", m.entries().len()),
        };

        Self {
            kind,
            state: col.state(),
            path: col.full_path().map(BackupPath::to_string),
            previous_path: col.previous_path().map(BackupPath::to_string),
            do_not_merge_items: col.do_not_merge_items(),
            items,
        }
    }

    fn describe(&self) -> String {
        let location = match (&self.previous_path, &self.path) {
            (Some(prev), Some(curr)) if prev != curr => format!("{prev} -> {curr}"),
            (_, Some(curr)) => curr.clone(),
            (Some(prev), None) => prev.clone(),
            (None, None) => String::new(),
        };
        let merge = if self.do_not_merge_items { " [no merge]" } else { "" };

        format!(
            "{:<9} {:<9} {}  ({}){}",
            self.kind,
            self.state.to_string(),
            location,
            plural(self.items, "item"),
            merge
        )
    }
}

/// Everything the plan produced
#[derive(Debug, Serialize)]
struct PlanReport {
    owner: String,
    can_use_previous_backup: bool,
    collections: Vec<CollectionSummary>,
    /// Drive root -> base-backup item IDs replaced by this backup
    excluded: BTreeMap<String, Vec<String>>,
    skipped: Vec<Skipped>,
    alerts: Vec<Alert>,
    recovered: Vec<String>,
}

struct Plan {
    report: PlanReport,
    /// Metadata files of this backup, keyed by file name
    metadata: Option<serde_json::Value>,
}

impl PlanCommand {
    /// Execute the plan command
    pub async fn execute(&self, format: OutputFormat, config: &Config) -> Result<()> {
        let formatter = get_formatter(format);
        let plan = self.run(config).await?;

        if let Some(path) = &self.write_metadata {
            let metadata = plan
                .metadata
                .as_ref()
                .context("The backup produced no metadata collection")?;
            write_metadata_file(path, metadata)?;
            info!(path = %path.display(), "Wrote backup metadata");
        }

        let report = &plan.report;

        if format.is_json() {
            let json = serde_json::to_value(report).context("Failed to serialize plan")?;
            formatter.print_json(&json);
            return Ok(());
        }

        formatter.success(&format!(
            "Planned {} for {}",
            plural(report.collections.len(), "collection"),
            report.owner
        ));
        if !report.can_use_previous_backup {
            formatter.warn("Previous metadata unusable; planned a full backup");
        }

        formatter.info("");
        for col in &report.collections {
            formatter.info(&col.describe());
        }

        let excluded: usize = report.excluded.values().map(Vec::len).sum();
        if excluded > 0 {
            formatter.info("");
            formatter.info(&format!(
                "{} replaced in the base backup",
                plural(excluded, "item")
            ));
        }

        if !report.skipped.is_empty() {
            formatter.info("");
            formatter.info(&format!("Skipped {}:", plural(report.skipped.len(), "item")));
            for skip in &report.skipped {
                formatter.info(&format!("  {} ({}, {})", skip.name, skip.item_id, skip.cause));
            }
        }

        for alert in &report.alerts {
            formatter.warn(&format!("{} ({})", alert.message, alert.resource));
        }
        if !report.recovered.is_empty() {
            formatter.warn(&format!(
                "{} recovered during planning",
                plural(report.recovered.len(), "error")
            ));
        }

        if let Some(path) = &self.write_metadata {
            formatter.info("");
            formatter.info(&format!("Metadata written to {}", path.display()));
        }

        Ok(())
    }

    fn scope(&self) -> Result<ResourceScope> {
        let category = match self.service {
            Service::OneDrive => Category::Files,
            Service::SharePoint => Category::Libraries,
            other => anyhow::bail!("Cannot plan a backup of service {other}"),
        };

        Ok(ResourceScope::new(&self.tenant, &self.owner, self.service, category)?)
    }

    fn ports(&self, config: &Config) -> Result<(Arc<dyn DriveSource>, Arc<dyn ItemStore>)> {
        if let Some(input) = &self.input {
            let recording = Recording::load(input)?;
            let source = ReplaySource::from_recording(recording)?;
            return Ok((Arc::new(source), Arc::new(ReplayStore)));
        }

        let token = self
            .access_token
            .as_deref()
            .context("Either --input or --access-token is required")?;
        let provider = Arc::new(GraphProvider::new(GraphClient::with_base_url(
            token,
            config.graph.base_url.as_str(),
        )));

        Ok((provider.clone(), provider))
    }

    async fn run(&self, config: &Config) -> Result<Plan> {
        let scope = self.scope()?;
        let (source, store) = self.ports(config)?;

        let selector: Arc<dyn DirScope> = if self.select.is_empty() {
            Arc::new(AllPass)
        } else {
            Arc::new(GlobScope::new(&self.select)?)
        };

        let previous = match &self.previous {
            Some(path) => vec![read_metadata_file(path, scope.metadata_prefix()?)?],
            None => Vec::new(),
        };

        info!(
            owner = %scope.owner_id(),
            use_delta_tree = config.backup.use_delta_tree,
            has_previous = !previous.is_empty(),
            "Planning backup"
        );

        let collections = Collections::new(source, store, scope.clone(), selector, config)?;
        let errs = FaultBus::new(config.backup.fail_fast);
        let mut excludes = ExcludeSet::new();

        let (cols, can_use_previous_backup) = collections
            .get(&previous, &mut excludes, &errs)
            .await
            .context("Failed to plan backup")?;

        let metadata = cols
            .iter()
            .find_map(|col| match col {
                BackupCollection::Metadata(md) => Some(metadata_document(md)),
                _ => None,
            })
            .transpose()?;

        let excluded = excludes
            .iter()
            .map(|(prefix, ids)| {
                let mut ids: Vec<String> = ids.iter().cloned().collect();
                ids.sort();
                (prefix.clone(), ids)
            })
            .collect();

        Ok(Plan {
            report: PlanReport {
                owner: scope.owner_id().to_string(),
                can_use_previous_backup,
                collections: cols.iter().map(CollectionSummary::of).collect(),
                excluded,
                skipped: errs.skipped(),
                alerts: errs.alerts(),
                recovered: errs.recovered(),
            },
            metadata,
        })
    }
}

/// Renders a metadata collection as one JSON object keyed by file name.
fn metadata_document(md: &MetadataCollection) -> Result<serde_json::Value> {
    let mut files = serde_json::Map::new();
    for entry in md.entries() {
        let value: serde_json::Value = serde_json::from_slice(&entry.data)
            .with_context(|| format!("Metadata file {} is not JSON", entry.file_name))?;
        files.insert(entry.file_name.clone(), value);
    }
    Ok(serde_json::Value::Object(files))
}

fn write_metadata_file(path: &Path, metadata: &serde_json::Value) -> Result<()> {
    let content =
        serde_json::to_string_pretty(metadata).context("Failed to serialize metadata")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write metadata to {}", path.display()))
}

fn read_metadata_file(path: &Path, prefix: BackupPath) -> Result<MetadataCollection> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read metadata {}", path.display()))?;
    let files: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse metadata {}", path.display()))?;

    let entries = files
        .iter()
        .map(|(name, value)| MetadataEntry::new(name.clone(), value))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(MetadataCollection::new(prefix, entries))
}
