use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, Offset, Utc};
use std::{
    fs,
    path::{Path, PathBuf},
};

use super::channel::ClipJob;

const SEGMENT_EXTENSION: &str = "ts";

/// An encoder-produced media chunk, identified by its modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
}

/// Offset of the host's local zone from UTC.
pub fn local_utc_offset() -> Duration {
    Duration::seconds(Local::now().offset().fix().local_minus_utc() as i64)
}

/// All segments whose mtime is within `[start - tolerance, end + tolerance]`, oldest first.
///
/// Files that vanish mid-scan (the encoder rotates its playlist) are skipped.
pub fn scan_segments(
    dir: &Path,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tolerance: Duration,
) -> Result<Vec<SegmentFile>> {
    let lower = start - tolerance;
    let upper = end + tolerance;

    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to list segment dir {}", dir.display()))?;

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        let modified: DateTime<Utc> = modified.into();
        if modified >= lower && modified <= upper {
            found.push(SegmentFile { path, modified });
        }
    }

    found.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    Ok(found)
}

/// Select the segments covering a clip job.
///
/// When the first scan is empty the window is shifted by `local_offset` and
/// scanned once more, which covers an encoder stamping files in a different
/// zone than the event clock.
pub fn resolve_clip_segments(
    dir: &Path,
    job: &ClipJob,
    tolerance: Duration,
    local_offset: Duration,
) -> Result<Vec<SegmentFile>> {
    let found = scan_segments(dir, job.clip_start, job.clip_end, tolerance)?;
    if !found.is_empty() || local_offset.is_zero() {
        return Ok(found);
    }

    scan_segments(
        dir,
        job.clip_start + local_offset,
        job.clip_end + local_offset,
        tolerance,
    )
}

/// Most recent segment names, for "nothing found" diagnostics.
pub fn recent_segment_names(dir: &Path, limit: usize) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.file_name().to_str().map(str::to_owned))
                .filter(|n| n.ends_with(".ts"))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    let skip = names.len().saturating_sub(limit);
    names.split_off(skip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::channel::{ChannelId, CloseReason};
    use std::fs::File;
    use std::time::SystemTime;

    fn touch(dir: &Path, name: &str, at: DateTime<Utc>) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        file.set_modified(SystemTime::from(at)).unwrap();
        path
    }

    fn job(start: DateTime<Utc>, end: DateTime<Utc>) -> ClipJob {
        ClipJob {
            channel: ChannelId::Meal,
            clip_start: start,
            clip_end: end,
            peak_delta_value: 12.0,
            reason: CloseReason::Stable,
        }
    }

    #[test]
    fn selects_segments_within_tolerance_sorted_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Utc::now() - Duration::minutes(10);

        touch(dir.path(), "c.ts", t0 + Duration::seconds(6));
        touch(dir.path(), "a.ts", t0 + Duration::seconds(2));
        touch(dir.path(), "b.ts", t0 - Duration::seconds(1));
        touch(dir.path(), "too_old.ts", t0 - Duration::seconds(5));
        touch(dir.path(), "too_new.ts", t0 + Duration::seconds(20));
        touch(dir.path(), "playlist.m3u8", t0 + Duration::seconds(2));

        let found = scan_segments(
            dir.path(),
            t0,
            t0 + Duration::seconds(5),
            Duration::seconds(2),
        )
        .unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|s| s.path.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["b.ts", "a.ts", "c.ts"]);
    }

    #[test]
    fn falls_back_to_offset_window_once() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Utc::now() - Duration::hours(12);
        let offset = Duration::hours(9);

        touch(dir.path(), "stream_shifted.ts", t0 + offset + Duration::seconds(1));

        let clip = job(t0, t0 + Duration::seconds(3));
        let direct = scan_segments(dir.path(), clip.clip_start, clip.clip_end, Duration::seconds(2))
            .unwrap();
        assert!(direct.is_empty());

        let found =
            resolve_clip_segments(dir.path(), &clip, Duration::seconds(2), offset).unwrap();
        assert_eq!(found.len(), 1);

        let none =
            resolve_clip_segments(dir.path(), &clip, Duration::seconds(2), Duration::zero())
                .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        assert!(scan_segments(&dir.path().join("gone"), now, now, Duration::seconds(2)).is_err());
    }

    #[test]
    fn recent_names_keeps_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        for name in ["s1.ts", "s2.ts", "s3.ts", "list.txt"] {
            touch(dir.path(), name, now);
        }
        assert_eq!(recent_segment_names(dir.path(), 2), vec!["s2.ts", "s3.ts"]);
    }
}
