//! Incremental trainset builder: plans augmentations per class, balances the
//! produced samples across train/valid against what is already on disk, and
//! writes images, YOLO labels and the merged manifest.

use anyhow::{Context, Result};
use image::{ImageFormat, ImageReader};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use super::augment::{AugmentConfig, AugmentParams, Augmenter, RandomAugmenter};
use super::balance::{allocate, SplitAllocation, SplitCounts};
use super::manifest::DatasetManifest;
use super::planner::{group_by_class, plan_class, ClassPlan};
use super::scan::existing_split_counts;
use super::types::{read_dimensions, BoxXyxy, DatasetLayout, LabeledSample, Split, TrainingInput};
use super::writer::{
    aug_file_name, label_path_for, link_then_copy, next_aug_seq, write_yolo_label, Placement,
};
use crate::settings::BuilderSettings;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassReport {
    pub class_name: String,
    pub class_id: usize,
    pub originals: usize,
    pub planned_augmentations: usize,
    pub produced_augmentations: usize,
    pub allocation: SplitAllocation,
    /// Items actually written per split.
    pub added: SplitCounts,
    /// Items that failed while being written.
    pub write_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildReport {
    pub manifest_path: PathBuf,
    pub added_train: usize,
    pub added_valid: usize,
    pub classes: Vec<ClassReport>,
    pub training_input: TrainingInput,
}

/// A sample that will land in a split once the class is allocated.
enum PendingItem<'a> {
    Original(&'a LabeledSample),
    Augmented {
        source: &'a LabeledSample,
        params: AugmentParams,
        bbox: BoxXyxy,
    },
}

pub struct TrainsetBuilder<A: Augmenter = RandomAugmenter> {
    layout: DatasetLayout,
    target_per_class: usize,
    train_ratio: f64,
    rng: StdRng,
    augmenter: A,
}

impl TrainsetBuilder<RandomAugmenter> {
    pub fn new(layout: DatasetLayout, settings: &BuilderSettings) -> Self {
        let augmenter = RandomAugmenter::new(
            AugmentConfig::default(),
            settings.seed.map(|s| s.wrapping_add(1)),
        );
        Self::with_augmenter(layout, settings, augmenter)
    }
}

impl<A: Augmenter> TrainsetBuilder<A> {
    pub fn with_augmenter(layout: DatasetLayout, settings: &BuilderSettings, augmenter: A) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            layout,
            target_per_class: settings.target_per_class,
            train_ratio: settings.train_ratio.clamp(0.0, 1.0),
            rng,
            augmenter,
        }
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    /// Run one build over `samples`. Per-item write failures are logged and
    /// skipped; failing to create the split directories or the manifest aborts.
    pub fn build(&mut self, samples: &[LabeledSample]) -> Result<BuildReport> {
        for split in Split::ALL {
            for dir in [self.layout.images_dir(split), self.layout.labels_dir(split)] {
                fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
        }

        let existing_manifest = DatasetManifest::load(&self.layout.manifest_path());
        let grouped = group_by_class(samples);
        let manifest = existing_manifest.merged_with(grouped.keys().cloned());
        let current = existing_split_counts(&self.layout, &manifest);

        let mut classes = Vec::with_capacity(grouped.len());
        for (class_name, unique) in grouped {
            let Some(class_id) = manifest.id_of(&class_name) else {
                continue;
            };
            let plan = plan_class(&class_name, unique, self.target_per_class);
            let existing = current.get(&class_name).copied().unwrap_or_default();

            classes.push(self.build_class(&plan, class_id, existing));
        }

        manifest.save(&self.layout)?;

        let added_train: usize = classes.iter().map(|c| c.added.train).sum();
        let added_valid: usize = classes.iter().map(|c| c.added.valid).sum();
        log_info!(
            "trainset built at {}: {} classes, +{} train, +{} valid",
            self.layout.root().display(),
            manifest.len(),
            added_train,
            added_valid
        );

        Ok(BuildReport {
            manifest_path: self.layout.manifest_path(),
            added_train,
            added_valid,
            classes,
            training_input: TrainingInput {
                data_path: self.layout.root().to_path_buf(),
                manifest_path: self.layout.manifest_path(),
            },
        })
    }

    fn build_class(
        &mut self,
        plan: &ClassPlan,
        class_id: usize,
        existing: SplitCounts,
    ) -> ClassReport {
        let mut items = Vec::with_capacity(plan.original_count() + plan.augmentations_needed());

        for sample in &plan.unique_samples {
            match read_dimensions(&sample.image_path) {
                Ok(_) => items.push(PendingItem::Original(sample)),
                Err(e) => log_warn!("[{}] skipping unreadable original: {:#}", plan.class_name, e),
            }
        }
        let originals = items.len();

        for source in &plan.augmentations {
            let sample = &plan.unique_samples[source.sample];
            let Ok((width, height)) = read_dimensions(&sample.image_path) else {
                continue;
            };
            let params = self.augmenter.sample(width, height);
            if let Some(bbox) = params.map_box(sample.boxes[source.box_index], width, height) {
                items.push(PendingItem::Augmented {
                    source: sample,
                    params,
                    bbox,
                });
            }
        }
        let produced_augmentations = items.len() - originals;

        let allocation = allocate(existing, items.len(), self.train_ratio);
        items.shuffle(&mut self.rng);

        let mut added = SplitCounts::default();
        let mut write_failures = 0;
        for (index, item) in items.iter().enumerate() {
            let split = if index < allocation.need_train {
                Split::Train
            } else {
                Split::Valid
            };
            match self.write_item(item, class_id, split) {
                Ok(()) => match split {
                    Split::Train => added.train += 1,
                    Split::Valid => added.valid += 1,
                },
                Err(e) => {
                    write_failures += 1;
                    log_warn!("[{}] failed to write {} item: {:#}", plan.class_name, split, e);
                }
            }
        }

        log_info!(
            "[{}] plan={} n_new={} need_train={} need_valid={} written={}/{}",
            plan.class_name,
            plan.augmentations_needed(),
            allocation.n_new,
            allocation.need_train,
            allocation.need_valid,
            added.train,
            added.valid
        );

        ClassReport {
            class_name: plan.class_name.clone(),
            class_id,
            originals,
            planned_augmentations: plan.augmentations_needed(),
            produced_augmentations,
            allocation,
            added,
            write_failures,
        }
    }

    fn write_item(&self, item: &PendingItem<'_>, class_id: usize, split: Split) -> Result<()> {
        let images_dir = self.layout.images_dir(split);
        let labels_dir = self.layout.labels_dir(split);

        let (placed, placement, boxes, size) = match item {
            PendingItem::Original(sample) => {
                let file_name = sample
                    .image_path
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| format!("{}.jpg", sample.base_name()).into());
                let (placed, placement) =
                    link_then_copy(&sample.image_path, &images_dir.join(file_name), &labels_dir)?;
                let size = read_dimensions(&placed);
                (placed, placement, sample.boxes.clone(), size)
            }
            PendingItem::Augmented {
                source,
                params,
                bbox,
            } => {
                let image = decode_rgb(&source.image_path)?;
                let out = params.apply(image);
                let base = source.base_name();
                let seq = next_aug_seq(&images_dir, &base);
                let dst = images_dir.join(aug_file_name(&base, seq));
                out.save_with_format(&dst, ImageFormat::Jpeg)
                    .with_context(|| format!("failed to save {}", dst.display()))?;
                (dst, Placement::Copied, vec![*bbox], Ok(out.dimensions()))
            }
        };

        let labelled = size.and_then(|(width, height)| {
            write_yolo_label(&label_path_for(&labels_dir, &placed), &boxes, class_id, width, height)
        });
        if labelled.is_err() && placement != Placement::Same {
            // Never leave an unlabeled image behind; it would train as background.
            let _ = fs::remove_file(&placed);
        }
        labelled
    }
}

fn decode_rgb(path: &Path) -> Result<image::RgbImage> {
    Ok(ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to sniff {}", path.display()))?
        .decode()
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8())
}
