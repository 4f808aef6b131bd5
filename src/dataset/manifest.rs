//! `data.yaml`: the authoritative class-name to id mapping.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fs, path::Path};

use super::types::{DatasetLayout, Split};

/// On-disk shape of `data.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ManifestFile {
    train: String,
    val: String,
    names: Vec<String>,
    nc: usize,
}

/// Ordered class names; a class's id is its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetManifest {
    names: Vec<String>,
}

impl DatasetManifest {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Read the class list. A missing, unreadable or malformed file is an empty manifest.
    pub fn load(path: &Path) -> Self {
        let names = fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_yaml::from_str::<serde_yaml::Value>(&raw).ok())
            .and_then(|doc| doc.get("names").cloned())
            .and_then(|names| serde_yaml::from_value::<Vec<String>>(names).ok())
            .unwrap_or_default();
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn id_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn name_of(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    /// Existing names keep their ids; unseen names are appended in sorted order.
    pub fn merged_with<I, S>(&self, new_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fresh: Vec<String> = new_names.into_iter().map(Into::into).collect();
        fresh.sort();

        let mut seen = HashSet::new();
        let names = self
            .names
            .iter()
            .cloned()
            .chain(fresh)
            .filter(|name| seen.insert(name.clone()))
            .collect();
        Self { names }
    }

    pub fn save(&self, layout: &DatasetLayout) -> Result<()> {
        let path = layout.manifest_path();
        fs::create_dir_all(layout.root())
            .with_context(|| format!("failed to create dataset dir {}", layout.root().display()))?;

        let file = ManifestFile {
            train: layout.images_dir(Split::Train).display().to_string(),
            val: layout.images_dir(Split::Valid).display().to_string(),
            names: self.names.clone(),
            nc: self.names.len(),
        };
        let body = serde_yaml::to_string(&file).context("failed to serialize manifest")?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write manifest {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_existing_ids_and_sorts_new_names() {
        let existing = DatasetManifest::new(vec!["Nabi".into(), "Coco".into()]);
        let merged = existing.merged_with(["Tori", "Coco", "Bam"]);

        assert_eq!(merged.names(), &["Nabi", "Coco", "Bam", "Tori"]);
        assert_eq!(merged.id_of("Nabi"), Some(0));
        assert_eq!(merged.id_of("Coco"), Some(1));
        assert_eq!(merged.id_of("Bam"), Some(2));
    }

    #[test]
    fn save_then_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path().join("u1"));
        let manifest = DatasetManifest::new(vec!["Zed".into(), "Ami".into()]);
        manifest.save(&layout).unwrap();

        let raw = fs::read_to_string(layout.manifest_path()).unwrap();
        assert!(raw.contains("nc: 2"));
        assert!(raw.contains("train/images"));
        assert_eq!(DatasetManifest::load(&layout.manifest_path()), manifest);
    }

    #[test]
    fn unreadable_manifest_means_no_classes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.yaml");
        assert!(DatasetManifest::load(&path).is_empty());

        fs::write(&path, "names: [unterminated").unwrap();
        assert!(DatasetManifest::load(&path).is_empty());

        fs::write(&path, "names: {0: cat}\nnc: 1\n").unwrap();
        assert!(DatasetManifest::load(&path).is_empty());
    }
}
