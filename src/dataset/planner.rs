use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use super::types::LabeledSample;

/// One augmentation seed: a box of one unique sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxSource {
    pub sample: usize,
    pub box_index: usize,
}

/// How a class reaches its target size.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassPlan {
    pub class_name: String,
    pub unique_samples: Vec<LabeledSample>,
    /// Every `(sample, box)` pair, in sample order.
    pub bbox_source_pool: Vec<BoxSource>,
    /// Drawn round-robin from the pool, one entry per planned augmentation.
    pub augmentations: Vec<BoxSource>,
}

impl ClassPlan {
    pub fn original_count(&self) -> usize {
        self.unique_samples.len()
    }

    pub fn augmentations_needed(&self) -> usize {
        self.augmentations.len()
    }
}

/// Group samples by class. A path seen twice keeps its first position and its
/// last boxes. Samples without boxes stay: they pass through as originals but
/// seed no augmentation.
pub fn group_by_class(samples: &[LabeledSample]) -> BTreeMap<String, Vec<LabeledSample>> {
    let mut grouped: BTreeMap<String, Vec<LabeledSample>> = BTreeMap::new();
    let mut positions: HashMap<(String, PathBuf), usize> = HashMap::new();

    for sample in samples {
        let bucket = grouped.entry(sample.class_name.clone()).or_default();
        let key = (sample.class_name.clone(), sample.image_path.clone());
        match positions.get(&key) {
            Some(&at) => bucket[at] = sample.clone(),
            None => {
                positions.insert(key, bucket.len());
                bucket.push(sample.clone());
            }
        }
    }
    grouped
}

/// Plan one class: `max(target - unique, 0)` augmentations drawn round-robin
/// from the box pool, or none when the pool is empty.
pub fn plan_class(class_name: &str, unique_samples: Vec<LabeledSample>, target: usize) -> ClassPlan {
    let pool: Vec<BoxSource> = unique_samples
        .iter()
        .enumerate()
        .flat_map(|(sample, s)| {
            (0..s.boxes.len()).map(move |box_index| BoxSource { sample, box_index })
        })
        .collect();

    let needed = if pool.is_empty() {
        0
    } else {
        target.saturating_sub(unique_samples.len())
    };
    let augmentations = pool.iter().copied().cycle().take(needed).collect();

    ClassPlan {
        class_name: class_name.to_string(),
        unique_samples,
        bbox_source_pool: pool,
        augmentations,
    }
}
