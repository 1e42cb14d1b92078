//! File-backed resource catalog.
//!
//! Loads a JSON snapshot of the materialized catalog, either a bare array
//! of resources or an object with a `resources` field. Lookups read an
//! `Arc` snapshot so a concurrent [`FileCatalog::refresh`] never blocks
//! them for longer than a pointer swap.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use civicline_core::{CatalogProvider, CivicError, ProviderError, Resource, Result};

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    Bare(Vec<Resource>),
    Wrapped { resources: Vec<Resource> },
}

impl CatalogFile {
    fn into_resources(self) -> Vec<Resource> {
        match self {
            CatalogFile::Bare(resources) | CatalogFile::Wrapped { resources } => resources,
        }
    }
}

pub struct FileCatalog {
    path: PathBuf,
    resources: RwLock<Arc<Vec<Resource>>>,
}

impl FileCatalog {
    /// Open the catalog at `path`. A missing file yields an empty catalog.
    pub fn open(path: &Path) -> Result<Self> {
        let catalog = Self {
            path: path.to_path_buf(),
            resources: RwLock::new(Arc::new(Vec::new())),
        };
        catalog.refresh()?;
        Ok(catalog)
    }

    pub fn from_resources(resources: Vec<Resource>) -> Self {
        Self {
            path: PathBuf::new(),
            resources: RwLock::new(Arc::new(resources)),
        }
    }

    /// Re-read the snapshot file. Returns the number of entries loaded.
    ///
    /// On a parse failure the previous snapshot stays in place.
    pub fn refresh(&self) -> Result<usize> {
        if !self.path.exists() {
            warn!(path = %self.path.display(), "Catalog file not found, serving empty catalog");
            return Ok(self.len());
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let resources = serde_json::from_str::<CatalogFile>(&raw)?.into_resources();
        let count = resources.len();
        let active = resources.iter().filter(|r| r.active).count();

        let mut guard = self
            .resources
            .write()
            .map_err(|e| CivicError::Storage(format!("Catalog lock poisoned: {}", e)))?;
        *guard = Arc::new(resources);

        info!(count, active, path = %self.path.display(), "Catalog loaded");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.snapshot().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> std::result::Result<Arc<Vec<Resource>>, ProviderError> {
        self.resources
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|e| ProviderError::Unavailable(format!("catalog lock poisoned: {}", e)))
    }

    fn select(
        &self,
        category: Option<&str>,
        active: bool,
    ) -> std::result::Result<Vec<Resource>, ProviderError> {
        Ok(self
            .snapshot()?
            .iter()
            .filter(|r| r.active == active)
            .filter(|r| category.map_or(true, |c| r.category == c))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CatalogProvider for FileCatalog {
    async fn list_active_resources(
        &self,
        category: Option<&str>,
    ) -> std::result::Result<Vec<Resource>, ProviderError> {
        self.select(category, true)
    }

    async fn list_retired_resources(
        &self,
        category: Option<&str>,
    ) -> std::result::Result<Vec<Resource>, ProviderError> {
        self.select(category, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource_json(id: &str, category: &str, active: bool) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "title": format!("Scheme {}", id),
            "description": "Support for households.",
            "category": category,
            "eligibility": [],
            "informational_only": false,
            "application_process": "Apply online.",
            "contact": { "phone": "1800-11-2233", "website": null, "office_address": null },
            "source_reference": "gazette-2025",
            "keywords": ["pension"],
            "active": active,
            "superseded_by": null,
            "last_updated": "2025-06-01T00:00:00Z"
        })
    }

    fn write_catalog(dir: &Path, body: &serde_json::Value) -> PathBuf {
        let path = dir.join("catalog.json");
        std::fs::write(&path, serde_json::to_string_pretty(body).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_filters_by_category_and_active() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_catalog(
            dir.path(),
            &serde_json::json!([
                resource_json("p1", "pension", true),
                resource_json("p0", "pension", false),
                resource_json("h1", "housing", true),
            ]),
        );
        let catalog = FileCatalog::open(&path).unwrap();
        assert_eq!(catalog.len(), 3);

        let active = catalog.list_active_resources(Some("pension")).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "p1");

        let retired = catalog.list_retired_resources(Some("pension")).await.unwrap();
        assert_eq!(retired[0].id, "p0");

        assert_eq!(catalog.list_active_resources(None).await.unwrap().len(), 2);
    }

    #[test]
    fn test_wrapped_format_and_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_catalog(
            dir.path(),
            &serde_json::json!({ "resources": [resource_json("a", "housing", true)] }),
        );
        let catalog = FileCatalog::open(&path).unwrap();
        assert_eq!(catalog.len(), 1);

        write_catalog(
            dir.path(),
            &serde_json::json!([
                resource_json("a", "housing", true),
                resource_json("b", "housing", true),
            ]),
        );
        assert_eq!(catalog.refresh().unwrap(), 2);
    }

    #[test]
    fn test_bad_refresh_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_catalog(dir.path(), &serde_json::json!([resource_json("a", "housing", true)]));
        let catalog = FileCatalog::open(&path).unwrap();

        std::fs::write(&path, "{ not json").unwrap();
        assert!(catalog.refresh().is_err());
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FileCatalog::open(&dir.path().join("absent.json")).unwrap();
        assert!(catalog.is_empty());
    }
}
