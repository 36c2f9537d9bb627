//! Work-item catalog loading and filtering.
//!
//! The catalog is a CSV file with at least an `ID` and a `Description`
//! column. Each row becomes a [`WorkItem`] whose output directory lives under
//! the results root as `item_<zero-padded id>`.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::BatchError;

/// One catalog entry to be driven through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: u64,
    pub description: String,
    pub output_dir: PathBuf,
}

impl WorkItem {
    pub fn new(id: u64, description: String, results_root: &Path) -> Self {
        Self {
            id,
            description,
            output_dir: results_root.join(item_dir_name(id)),
        }
    }
}

/// Directory name for an item under the results root.
pub fn item_dir_name(id: u64) -> String {
    format!("item_{id:03}")
}

/// Parses an item id back out of a directory name produced by [`item_dir_name`].
pub fn parse_item_dir_name(name: &str) -> Option<u64> {
    name.strip_prefix("item_")?.parse().ok()
}

#[derive(Debug, Deserialize)]
struct CatalogRow {
    #[serde(rename = "ID")]
    id: u64,
    #[serde(rename = "Description")]
    description: String,
}

/// Loads work items from a catalog and applies run-level filters.
#[derive(Debug, Clone)]
pub struct WorkItemSource {
    results_root: PathBuf,
}

impl WorkItemSource {
    pub fn new(results_root: impl Into<PathBuf>) -> Self {
        Self {
            results_root: results_root.into(),
        }
    }

    /// Reads every row of the catalog, returning items sorted by id.
    ///
    /// Fails with [`BatchError::CatalogRead`] if the file is missing, a row
    /// lacks a required field, an id is not an integer, or an id repeats.
    pub fn load(&self, catalog_path: &Path) -> Result<Vec<WorkItem>, BatchError> {
        let file = File::open(catalog_path).map_err(|e| BatchError::catalog(catalog_path, e))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::Headers)
            .from_reader(BufReader::new(file));

        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for result in reader.deserialize::<CatalogRow>() {
            let row = result.map_err(|e| BatchError::catalog(catalog_path, e))?;
            if !seen.insert(row.id) {
                return Err(BatchError::catalog(
                    catalog_path,
                    format!("duplicate ID {}", row.id),
                ));
            }
            items.push(WorkItem::new(row.id, row.description, &self.results_root));
        }

        items.sort_by_key(|item| item.id);
        tracing::debug!(count = items.len(), catalog = %catalog_path.display(), "catalog loaded");
        Ok(items)
    }

    /// Drops items that already have their terminal artifact on disk.
    ///
    /// This is a one-shot existence check; nothing re-checks it while workers run.
    pub fn filter_incomplete(&self, items: Vec<WorkItem>, terminal_artifact: &str) -> Vec<WorkItem> {
        items
            .into_iter()
            .filter(|item| !item.output_dir.join(terminal_artifact).exists())
            .collect()
    }
}

/// Keeps items whose id lies within the inclusive bounds. A missing bound is
/// unbounded on that side; order is preserved.
pub fn filter_by_range(items: Vec<WorkItem>, start_id: Option<u64>, end_id: Option<u64>) -> Vec<WorkItem> {
    items
        .into_iter()
        .filter(|item| start_id.is_none_or(|start| item.id >= start))
        .filter(|item| end_id.is_none_or(|end| item.id <= end))
        .collect()
}

/// Keeps only the items whose id appears in `ids`, in catalog order.
pub fn select_ids(items: Vec<WorkItem>, ids: &[u64]) -> Vec<WorkItem> {
    let wanted: HashSet<u64> = ids.iter().copied().collect();
    items.into_iter().filter(|item| wanted.contains(&item.id)).collect()
}
