//! Low-level file placement for the trainset builder.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::types::BoxXyxy;

pub const AUG_PREFIX: &str = "aug_";
pub const AUG_EXTENSION: &str = "jpg";

/// How an original image reached its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Destination already was the source file.
    Same,
    Linked,
    Copied,
}

/// `dst` if free, else `stem_1.ext`, `stem_2.ext`, ...
pub fn unique_path(dst: &Path) -> PathBuf {
    free_sibling(dst, |_| false)
}

/// First of `dst`, `stem_1.ext`, `stem_2.ext`, ... that does not exist and is
/// not `taken`.
fn free_sibling(dst: &Path, taken: impl Fn(&Path) -> bool) -> PathBuf {
    let free = |candidate: &Path| !candidate.exists() && !taken(candidate);
    if free(dst) {
        return dst.to_path_buf();
    }
    let parent = dst.parent().unwrap_or_else(|| Path::new(""));
    let stem = dst
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = dst.extension().map(|e| e.to_string_lossy().into_owned());

    (1u32..)
        .map(|n| {
            let name = match &ext {
                Some(ext) => format!("{stem}_{n}.{ext}"),
                None => format!("{stem}_{n}"),
            };
            parent.join(name)
        })
        .find(|candidate| free(candidate))
        .unwrap_or_else(|| dst.to_path_buf())
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Place `src` at `dst` (or a free sibling), hard-linking when possible and
/// copying otherwise. A sibling is only free when its stem has no label in
/// `labels_dir` either, so `a.png` and `a.jpg` never share `a.txt`.
pub fn link_then_copy(src: &Path, dst: &Path, labels_dir: &Path) -> Result<(PathBuf, Placement)> {
    if dst.exists() && same_file(src, dst) {
        return Ok((dst.to_path_buf(), Placement::Same));
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let target = free_sibling(dst, |candidate| label_path_for(labels_dir, candidate).exists());
    let placement = link_or_copy(src, &target, |from, to| fs::hard_link(from, to))?;
    Ok((target, placement))
}

fn link_or_copy(
    src: &Path,
    target: &Path,
    link: impl Fn(&Path, &Path) -> io::Result<()>,
) -> Result<Placement> {
    if link(src, target).is_ok() {
        return Ok(Placement::Linked);
    }
    fs::copy(src, target).with_context(|| {
        format!("failed to copy {} to {}", src.display(), target.display())
    })?;
    Ok(Placement::Copied)
}

/// One line per box: `cls cx cy w h`, normalized by the image size.
pub fn yolo_label_body(boxes: &[BoxXyxy], class_id: usize, width: u32, height: u32) -> String {
    let (w, h) = (width.max(1) as f64, height.max(1) as f64);
    let mut body = String::new();
    for b in boxes {
        let cx = (b[0] + b[2]) / 2.0 / w;
        let cy = (b[1] + b[3]) / 2.0 / h;
        let bw = (b[2] - b[0]) / w;
        let bh = (b[3] - b[1]) / h;
        let _ = writeln!(body, "{class_id} {cx:.6} {cy:.6} {bw:.6} {bh:.6}");
    }
    body
}

pub fn write_yolo_label(
    path: &Path,
    boxes: &[BoxXyxy],
    class_id: usize,
    width: u32,
    height: u32,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, yolo_label_body(boxes, class_id, width, height))
        .with_context(|| format!("failed to write label {}", path.display()))
}

/// Label file path for an image placed in `images_dir`'s sibling `labels_dir`.
pub fn label_path_for(labels_dir: &Path, image_path: &Path) -> PathBuf {
    let stem = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    labels_dir.join(format!("{stem}.txt"))
}

fn aug_sequence(file_name: &str, base: &str) -> Option<u64> {
    file_name
        .strip_prefix(AUG_PREFIX)?
        .strip_suffix(&format!(".{AUG_EXTENSION}"))?
        .strip_prefix(base)?
        .strip_prefix('_')
        .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))?
        .parse()
        .ok()
}

/// Next free `aug_{base}_{seq}` sequence in `dir`: highest existing plus one.
pub fn next_aug_seq(dir: &Path, base: &str) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 1;
    };
    entries
        .flatten()
        .filter_map(|entry| aug_sequence(&entry.file_name().to_string_lossy(), base))
        .max()
        .map_or(1, |max| max + 1)
}

pub fn aug_file_name(base: &str, seq: u64) -> String {
    format!("{AUG_PREFIX}{base}_{seq}.{AUG_EXTENSION}")
}
