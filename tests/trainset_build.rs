use std::fs;
use std::path::{Path, PathBuf};

use feedwatch_lib::dataset::{
    count_dataset_by_class, CountMode, DatasetLayout, DatasetManifest, IdentityAugmenter,
    LabeledSample, Split, TrainsetBuilder,
};
use feedwatch_lib::settings::BuilderSettings;
use image::{ImageFormat, Rgb, RgbImage};

fn upload(dir: &Path, class: &str, range: std::ops::Range<usize>) -> Vec<LabeledSample> {
    range
        .map(|i| {
            let path = dir.join(format!("{class}_{i}.png"));
            RgbImage::from_pixel(16, 12, Rgb([(i % 255) as u8, 40, 200]))
                .save_with_format(&path, ImageFormat::Png)
                .unwrap();
            LabeledSample {
                image_path: path,
                class_name: class.to_string(),
                boxes: vec![[2.0, 2.0, 10.0, 8.0]],
            }
        })
        .collect()
}

fn files(dir: PathBuf) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn aug_count(layout: &DatasetLayout) -> usize {
    Split::ALL
        .iter()
        .map(|split| {
            files(layout.images_dir(*split))
                .iter()
                .filter(|n| n.starts_with("aug_"))
                .count()
        })
        .sum()
}

fn settings() -> BuilderSettings {
    BuilderSettings {
        target_per_class: 300,
        train_ratio: 0.7,
        seed: Some(42),
    }
}

#[test]
fn fresh_class_reaches_target_with_seventy_thirty_split() {
    let uploads = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let samples = upload(uploads.path(), "Nabi", 0..100);

    let layout = DatasetLayout::new(data.path().join("user-1"));
    let mut builder = TrainsetBuilder::with_augmenter(layout.clone(), &settings(), IdentityAugmenter);
    let report = builder.build(&samples).unwrap();

    let nabi = &report.classes[0];
    assert_eq!(nabi.class_id, 0);
    assert_eq!(nabi.originals, 100);
    assert_eq!(nabi.produced_augmentations, 200);
    assert_eq!((report.added_train, report.added_valid), (210, 90));

    assert_eq!(files(layout.images_dir(Split::Train)).len(), 210);
    assert_eq!(files(layout.labels_dir(Split::Train)).len(), 210);
    assert_eq!(files(layout.images_dir(Split::Valid)).len(), 90);
    assert_eq!(files(layout.labels_dir(Split::Valid)).len(), 90);
    assert_eq!(aug_count(&layout), 200);

    assert_eq!(report.training_input.data_path, layout.root());
    assert_eq!(report.training_input.manifest_path, layout.manifest_path());

    let stats = count_dataset_by_class(layout.root(), CountMode::Image);
    assert_eq!(stats.per_class["Nabi"].train, 210);
    assert_eq!(stats.per_class["Nabi"].valid, 90);
}

#[test]
fn rerun_keeps_ids_and_never_overwrites_augmentations() {
    let uploads = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let nabi = upload(uploads.path(), "Nabi", 0..100);
    let layout = DatasetLayout::new(data.path().join("user-1"));

    TrainsetBuilder::with_augmenter(layout.clone(), &settings(), IdentityAugmenter)
        .build(&nabi)
        .unwrap();

    // Second cycle: same cat again plus a new one whose name sorts first.
    let mut second = nabi.clone();
    second.extend(upload(uploads.path(), "Bam", 0..10));
    let report = TrainsetBuilder::with_augmenter(layout.clone(), &settings(), IdentityAugmenter)
        .build(&second)
        .unwrap();

    let manifest = DatasetManifest::load(&layout.manifest_path());
    assert_eq!(manifest.names(), &["Nabi", "Bam"]);

    let by_name = |name: &str| {
        report
            .classes
            .iter()
            .find(|c| c.class_name == name)
            .unwrap()
            .clone()
    };
    let nabi_report = by_name("Nabi");
    assert_eq!(nabi_report.class_id, 0);
    assert_eq!(nabi_report.allocation.existing.train, 210);
    assert_eq!(nabi_report.allocation.existing.valid, 90);
    assert_eq!(nabi_report.allocation.need_train, 210);
    assert_eq!(nabi_report.allocation.need_valid, 90);

    let bam_report = by_name("Bam");
    assert_eq!(bam_report.class_id, 1);
    assert_eq!(bam_report.produced_augmentations, 290);
    assert_eq!(bam_report.allocation.need_train, 210);

    // 200 + 200 for Nabi, 290 for Bam: every augmentation got a fresh name.
    assert_eq!(aug_count(&layout), 690);

    let bam_label = fs::read_dir(layout.labels_dir(Split::Train))
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.file_name().unwrap().to_string_lossy().starts_with("aug_Bam_"))
        .unwrap();
    assert!(fs::read_to_string(bam_label).unwrap().starts_with("1 "));
}
