//! Counting what is already on disk.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use super::balance::SplitCounts;
use super::manifest::DatasetManifest;
use super::types::{DatasetLayout, Split};

fn label_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .map(|e| e.to_string_lossy().eq_ignore_ascii_case("txt"))
                .unwrap_or(false)
        })
        .collect()
}

fn first_class_id(path: &Path) -> Option<usize> {
    let raw = fs::read_to_string(path).ok()?;
    raw.lines().next()?.split_whitespace().next()?.parse().ok()
}

/// Per-class image counts in one labels dir, keyed by the class id on each
/// file's first line. Unreadable, empty or unknown-id files are skipped.
pub fn count_first_line_classes(labels_dir: &Path, manifest: &DatasetManifest) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for path in label_files(labels_dir) {
        let Some(name) = first_class_id(&path).and_then(|id| manifest.name_of(id)) else {
            continue;
        };
        *counts.entry(name.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Existing train/valid counts per class, as the builder balances against.
pub fn existing_split_counts(
    layout: &DatasetLayout,
    manifest: &DatasetManifest,
) -> HashMap<String, SplitCounts> {
    let train = count_first_line_classes(&layout.labels_dir(Split::Train), manifest);
    let valid = count_first_line_classes(&layout.labels_dir(Split::Valid), manifest);

    let mut counts: HashMap<String, SplitCounts> = HashMap::new();
    for (name, n) in train {
        counts.entry(name).or_default().train = n;
    }
    for (name, n) in valid {
        counts.entry(name).or_default().valid = n;
    }
    counts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CountMode {
    /// A label file counts once per distinct class it contains.
    #[default]
    Image,
    /// Every label line counts.
    Object,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileTotals {
    pub train_images: usize,
    pub train_labels: usize,
    pub valid_images: usize,
    pub valid_labels: usize,
    pub all_files: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassCount {
    pub train: usize,
    pub valid: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub totals: FileTotals,
    pub per_class: BTreeMap<String, ClassCount>,
}

fn count_entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|it| it.flatten().count()).unwrap_or(0)
}

/// Class ids of every line up to the first unparsable one.
fn label_class_ids(path: &Path) -> Vec<usize> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map_while(|line| line.split_whitespace().next()?.parse().ok())
        .collect()
}

fn count_classes(labels_dir: &Path, mode: CountMode, manifest: &DatasetManifest) -> BTreeMap<String, usize> {
    let name = |id: usize| {
        manifest
            .name_of(id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("cls_{id}"))
    };

    let mut counts = BTreeMap::new();
    for path in label_files(labels_dir) {
        let ids = label_class_ids(&path);
        let counted: Vec<usize> = match mode {
            CountMode::Image => ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect(),
            CountMode::Object => ids,
        };
        for id in counted {
            *counts.entry(name(id)).or_insert(0) += 1;
        }
    }
    counts
}

/// File totals and per-class counts of a dataset directory.
pub fn count_dataset_by_class(root: &Path, mode: CountMode) -> DatasetStats {
    let layout = DatasetLayout::new(root);
    let manifest = DatasetManifest::load(&layout.manifest_path());

    let mut totals = FileTotals {
        train_images: count_entries(&layout.images_dir(Split::Train)),
        train_labels: count_entries(&layout.labels_dir(Split::Train)),
        valid_images: count_entries(&layout.images_dir(Split::Valid)),
        valid_labels: count_entries(&layout.labels_dir(Split::Valid)),
        all_files: 0,
    };
    totals.all_files =
        totals.train_images + totals.train_labels + totals.valid_images + totals.valid_labels;

    let train = count_classes(&layout.labels_dir(Split::Train), mode, &manifest);
    let valid = count_classes(&layout.labels_dir(Split::Valid), mode, &manifest);

    let mut per_class: BTreeMap<String, ClassCount> = BTreeMap::new();
    for (name, n) in train {
        per_class.entry(name).or_default().train = n;
    }
    for (name, n) in valid {
        per_class.entry(name).or_default().valid = n;
    }
    for count in per_class.values_mut() {
        count.total = count.train + count.valid;
    }

    DatasetStats { totals, per_class }
}
