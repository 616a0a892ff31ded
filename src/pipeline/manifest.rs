//! Stats manifest: the small JSON record describing which upstream image set
//! produced the current table outputs. Used to short-circuit the stats stage
//! when the source collection has not changed.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ManifestSource;
use crate::error::{AppError, AppResult};
use crate::services::ObjectStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub target_system: String,
    #[serde(default)]
    pub stats_exports: Vec<ManifestExportEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestExportEntry {
    pub id: String,
    pub name: String,
    pub date_updated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ManifestCollection {
    #[serde(default)]
    pub image_collection: String,
    pub first_image: Option<String>,
    pub last_image: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub date_created: String,
    #[serde(default)]
    pub metadata: ManifestMetadata,
    pub source: ManifestCollection,
}

impl Manifest {
    /// Build a manifest for the current collection contents. Images are
    /// stored sorted.
    pub fn build(
        collection_path: &str,
        mut images: Vec<String>,
        metadata: ManifestMetadata,
    ) -> Self {
        images.sort();
        Self {
            date_created: Utc::now().to_rfc3339(),
            metadata,
            source: ManifestCollection {
                image_collection: collection_path.to_string(),
                first_image: images.first().cloned(),
                last_image: images.last().cloned(),
                images,
            },
        }
    }

    /// Whether the recorded source still matches the collection: same path
    /// and element-wise equal sorted image lists.
    pub fn matches_collection(&self, collection_path: &str, current_images: &[String]) -> bool {
        if self.source.image_collection != collection_path {
            return false;
        }
        if self.source.images.len() != current_images.len() {
            return false;
        }
        let mut recorded = self.source.images.clone();
        recorded.sort();
        let mut current = current_images.to_vec();
        current.sort();
        recorded == current
    }

    /// Merge previous export entries with this run's: entries for
    /// re-exported names are replaced, the rest are retained.
    pub fn merge_stats_exports(
        previous: &[ManifestExportEntry],
        started: Vec<ManifestExportEntry>,
    ) -> Vec<ManifestExportEntry> {
        let started_names: std::collections::BTreeSet<&str> =
            started.iter().map(|e| e.name.as_str()).collect();
        let mut merged: Vec<ManifestExportEntry> = previous
            .iter()
            .filter(|e| !started_names.contains(e.name.as_str()))
            .cloned()
            .collect();
        merged.extend(started);
        merged
    }

    pub fn to_json(&self) -> AppResult<String> {
        serde_json::to_string_pretty(self).map_err(AppError::from)
    }

    pub fn from_json(raw: &str) -> AppResult<Self> {
        serde_json::from_str(raw).map_err(AppError::from)
    }
}

/// Reads and writes manifests at their configured location.
pub struct ManifestStore<'a> {
    source: ManifestSource,
    base_path: PathBuf,
    storage: Option<&'a ObjectStore>,
}

impl<'a> ManifestStore<'a> {
    pub fn new(source: ManifestSource, base_path: &Path, storage: Option<&'a ObjectStore>) -> Self {
        Self {
            source,
            base_path: base_path.to_path_buf(),
            storage,
        }
    }

    fn full_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    /// Read a manifest. A missing or unreadable manifest is treated as
    /// absent (the stats stage then runs in full).
    pub async fn read(&self, name: &str) -> Option<Manifest> {
        let raw = match self.source {
            ManifestSource::File => {
                tokio::fs::read_to_string(self.full_path(name)).await.ok()?
            }
            ManifestSource::Storage => {
                let storage = self.storage?;
                let key = self.full_path(name).to_string_lossy().to_string();
                storage.read_text(&key).await.ok()?
            }
        };
        match Manifest::from_json(&raw) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Couldn't parse manifest {}: {}", name, e);
                None
            }
        }
    }

    /// Write a manifest, replacing any existing one.
    pub async fn write(&self, name: &str, manifest: &Manifest) -> AppResult<()> {
        let json = manifest.to_json()?;
        match self.source {
            ManifestSource::File => {
                let path = self.full_path(name);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        AppError::Storage(format!("Failed to create {}: {}", parent.display(), e))
                    })?;
                }
                tokio::fs::write(&path, json).await.map_err(|e| {
                    AppError::Storage(format!("Failed to write manifest {}: {}", path.display(), e))
                })
            }
            ManifestSource::Storage => {
                let storage = self.storage.ok_or_else(|| {
                    AppError::Storage(
                        "Manifest source is 'storage' but no object store is configured".to_string(),
                    )
                })?;
                let key = self.full_path(name).to_string_lossy().to_string();
                storage.write_text(&key, &json).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest::build(
            "projects/snow/assets/monthly",
            vec!["Snow_TAC_2024_01".to_string(), "Snow_TAC_2023_12".to_string()],
            ManifestMetadata {
                target_system: "storage".to_string(),
                stats_exports: vec![ManifestExportEntry {
                    id: "abc".to_string(),
                    name: "SCA_m_BNA_023.csv".to_string(),
                    date_updated: "2024-02-01".to_string(),
                }],
            },
        )
    }

    #[test]
    fn test_round_trip() {
        let manifest = sample();
        let parsed = Manifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_images_stored_sorted_with_first_and_last() {
        let manifest = sample();
        assert_eq!(
            manifest.source.images,
            vec!["Snow_TAC_2023_12", "Snow_TAC_2024_01"]
        );
        assert_eq!(manifest.source.first_image.as_deref(), Some("Snow_TAC_2023_12"));
        assert_eq!(manifest.source.last_image.as_deref(), Some("Snow_TAC_2024_01"));
    }

    #[test]
    fn test_matches_collection_is_order_insensitive() {
        let manifest = sample();
        let current = vec!["Snow_TAC_2024_01".to_string(), "Snow_TAC_2023_12".to_string()];
        assert!(manifest.matches_collection("projects/snow/assets/monthly", &current));
    }

    #[test]
    fn test_matches_collection_detects_changes() {
        let manifest = sample();
        assert!(!manifest.matches_collection("projects/other", &manifest.source.images.clone()));
        let grown = vec![
            "Snow_TAC_2023_12".to_string(),
            "Snow_TAC_2024_01".to_string(),
            "Snow_TAC_2024_02".to_string(),
        ];
        assert!(!manifest.matches_collection("projects/snow/assets/monthly", &grown));
        let swapped = vec!["Snow_TAC_2023_12".to_string(), "Snow_TAC_2024_02".to_string()];
        assert!(!manifest.matches_collection("projects/snow/assets/monthly", &swapped));
    }

    #[test]
    fn test_merge_replaces_reexported_entries() {
        let previous = vec![
            ManifestExportEntry {
                id: "old-1".to_string(),
                name: "SCA_m_BNA_023.csv".to_string(),
                date_updated: "2024-01-01".to_string(),
            },
            ManifestExportEntry {
                id: "old-2".to_string(),
                name: "SCA_m_BNA_038.csv".to_string(),
                date_updated: "2024-01-01".to_string(),
            },
        ];
        let started = vec![ManifestExportEntry {
            id: "new-1".to_string(),
            name: "SCA_m_BNA_023.csv".to_string(),
            date_updated: "2024-02-01".to_string(),
        }];
        let merged = Manifest::merge_stats_exports(&previous, started);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|e| e.id == "old-2"));
        assert!(merged.iter().any(|e| e.id == "new-1"));
        assert!(!merged.iter().any(|e| e.id == "old-1"));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(ManifestSource::File, dir.path(), None);
        assert!(store.read("monthly_manifest.json").await.is_none());

        let manifest = sample();
        store.write("monthly_manifest.json", &manifest).await.unwrap();
        let read_back = store.read("monthly_manifest.json").await.unwrap();
        assert_eq!(read_back, manifest);
    }
}
