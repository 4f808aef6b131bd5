//! Seams to the external detector: turning detections into builder input,
//! and holding at most one loaded model per weight family.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::dataset::{BoxXyxy, LabeledSample};

pub use crate::dataset::TrainingInput;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoxXyxy,
    pub class_id: usize,
    pub confidence: f32,
}

/// Black-box object detector.
pub trait Predictor {
    fn predict(&self, image: &Path) -> Result<Vec<Detection>>;
}

/// `Nabi_3.jpg` -> `Nabi`.
pub fn class_from_file_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_string_lossy();
    let class = stem.split('_').next()?;
    (!class.is_empty()).then(|| class.to_string())
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .map(|e| {
                    let ext = e.to_string_lossy().to_ascii_lowercase();
                    IMAGE_EXTENSIONS.contains(&ext.as_str())
                })
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Run the detector over every image in `dir` and keep boxes at or above
/// `min_confidence`. Images without a usable class name or box are skipped.
pub fn collect_samples<P: Predictor + ?Sized>(
    predictor: &P,
    dir: &Path,
    min_confidence: f32,
) -> Result<Vec<LabeledSample>> {
    let mut samples = Vec::new();
    for path in image_files(dir)? {
        let Some(class_name) = class_from_file_name(&path) else {
            continue;
        };
        let detections = match predictor.predict(&path) {
            Ok(d) => d,
            Err(e) => {
                log_warn!("prediction failed for {}: {:#}", path.display(), e);
                continue;
            }
        };
        let boxes: Vec<BoxXyxy> = detections
            .into_iter()
            .filter(|d| d.confidence >= min_confidence)
            .map(|d| d.bbox)
            .collect();
        if boxes.is_empty() {
            continue;
        }
        samples.push(LabeledSample {
            image_path: path,
            class_name,
            boxes,
        });
    }
    log_info!("collected {} labeled samples from {}", samples.len(), dir.display());
    Ok(samples)
}

/// Owned handle to one lazily loaded model.
pub struct ModelSlot<M> {
    family: String,
    model: Mutex<Option<Arc<M>>>,
}

impl<M> ModelSlot<M> {
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            model: Mutex::new(None),
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn is_loaded(&self) -> bool {
        self.model.lock().map(|m| m.is_some()).unwrap_or(false)
    }

    /// Return the loaded model, running `load` under the lock if none is.
    pub fn get_or_load<F>(&self, load: F) -> Result<Arc<M>>
    where
        F: FnOnce() -> Result<M>,
    {
        let mut slot = self
            .model
            .lock()
            .map_err(|_| anyhow!("model slot {} poisoned", self.family))?;
        if let Some(model) = slot.as_ref() {
            return Ok(Arc::clone(model));
        }
        let model = Arc::new(load().with_context(|| format!("failed to load {} model", self.family))?);
        *slot = Some(Arc::clone(&model));
        log_info!("loaded {} model", self.family);
        Ok(model)
    }

    /// Drop the slot's reference. Returns whether a model was loaded.
    pub fn release(&self) -> bool {
        match self.model.lock() {
            Ok(mut slot) => slot.take().is_some(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedPredictor;

    impl Predictor for FixedPredictor {
        fn predict(&self, image: &Path) -> Result<Vec<Detection>> {
            if image.to_string_lossy().contains("broken") {
                anyhow::bail!("cannot decode");
            }
            Ok(vec![
                Detection {
                    bbox: [1.0, 2.0, 3.0, 4.0],
                    class_id: 0,
                    confidence: 0.9,
                },
                Detection {
                    bbox: [5.0, 6.0, 7.0, 8.0],
                    class_id: 0,
                    confidence: 0.3,
                },
            ])
        }
    }

    #[test]
    fn class_comes_from_stem_prefix() {
        assert_eq!(class_from_file_name(Path::new("/u/Nabi_3.jpg")).as_deref(), Some("Nabi"));
        assert_eq!(class_from_file_name(Path::new("/u/Coco.png")).as_deref(), Some("Coco"));
        assert_eq!(class_from_file_name(Path::new("/u/_7.png")), None);
    }

    #[test]
    fn collects_confident_boxes_and_skips_failures() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Nabi_1.jpg", "Coco_2.PNG", "broken_3.jpg", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let samples = collect_samples(&FixedPredictor, dir.path(), 0.5).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].class_name, "Coco");
        assert_eq!(samples[1].class_name, "Nabi");
        assert_eq!(samples[1].boxes, vec![[1.0, 2.0, 3.0, 4.0]]);
    }

    #[test]
    fn slot_loads_once_until_released() {
        let slot: ModelSlot<String> = ModelSlot::new("bbox");
        let loads = AtomicUsize::new(0);
        let load = || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok("weights".to_string())
        };

        let a = slot.get_or_load(load).unwrap();
        let b = slot.get_or_load(load).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        assert!(slot.release());
        assert!(!slot.is_loaded());
        slot.get_or_load(load).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_load_leaves_slot_empty() {
        let slot: ModelSlot<u8> = ModelSlot::new("cls");
        assert!(slot.get_or_load(|| anyhow::bail!("missing weights")).is_err());
        assert!(!slot.is_loaded());
    }
}
