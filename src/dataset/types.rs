//! Core types shared by the trainset builder.

use anyhow::{Context, Result};
use image::ImageReader;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Pixel box `[x1, y1, x2, y2]`.
pub type BoxXyxy = [f64; 4];

/// One labeled image produced upstream by detection inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledSample {
    pub image_path: PathBuf,
    pub class_name: String,
    #[serde(default)]
    pub boxes: Vec<BoxXyxy>,
}

impl LabeledSample {
    /// File stem used for destination and augmentation names.
    pub fn base_name(&self) -> String {
        self.image_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Valid,
}

impl Split {
    pub const ALL: [Split; 2] = [Split::Train, Split::Valid];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// `root/{train,valid}/{images,labels}` plus `root/data.yaml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    pub const MANIFEST_FILE: &'static str = "data.yaml";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self, split: Split) -> PathBuf {
        self.root.join(split.dir_name()).join("images")
    }

    pub fn labels_dir(&self, split: Split) -> PathBuf {
        self.root.join(split.dir_name()).join("labels")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(Self::MANIFEST_FILE)
    }
}

/// What the external trainer is handed once the dataset is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingInput {
    pub data_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// Real pixel size of an image on disk, sniffing the format from its content.
pub fn read_dimensions(path: &Path) -> Result<(u32, u32)> {
    ImageReader::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to sniff image format of {}", path.display()))?
        .into_dimensions()
        .with_context(|| format!("failed to read dimensions of {}", path.display()))
}
