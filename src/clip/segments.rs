use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

/// A `segment_NNNNN.mp4` file with its modification time as seconds since
/// the Unix epoch.
#[derive(Debug, Clone)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub modified_at: f64,
}

/// Lists `segment_*.mp4` in `segments_dir`, oldest first, excluding the
/// newest file, since `splitmuxsink` may still be writing it.
pub fn list_segments(segments_dir: &Path) -> Vec<SegmentFile> {
    let entries = match fs::read_dir(segments_dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(dir = %segments_dir.display(), error = %e, "failed to list clip segments");
            return Vec::new();
        }
    };

    let mut segments: Vec<SegmentFile> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("segment_") && name.ends_with(".mp4")
        })
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            let modified = metadata.modified().ok()?;
            let modified_at = modified.duration_since(UNIX_EPOCH).ok()?.as_secs_f64();
            Some(SegmentFile {
                path: entry.path(),
                modified_at,
            })
        })
        .collect();

    segments.sort_by(|a, b| a.modified_at.total_cmp(&b.modified_at));

    if segments.len() > 1 {
        segments.pop();
    }

    segments
}

/// Segments at/before `detected_at`, last `count` of them (pre-roll), or
/// segments at/after it, first `count` (post-roll).
pub fn collect_segments(
    segments_dir: &Path,
    before: Option<f64>,
    after: Option<f64>,
    count: usize,
) -> Vec<SegmentFile> {
    let segments = list_segments(segments_dir);

    if let Some(before) = before {
        let mut filtered: Vec<SegmentFile> =
            segments.into_iter().filter(|s| s.modified_at <= before).collect();
        let start = filtered.len().saturating_sub(count);
        return filtered.split_off(start);
    }

    if let Some(after) = after {
        let filtered: Vec<SegmentFile> =
            segments.into_iter().filter(|s| s.modified_at >= after).collect();
        return filtered.into_iter().take(count).collect();
    }

    let start = segments.len().saturating_sub(count);
    segments[start..].to_vec()
}

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::thread::sleep;
    use std::time::Duration;

    fn write_segment(dir: &Path, name: &str) {
        let mut f = File::create(dir.join(name)).unwrap();
        f.write_all(b"fake-mp4").unwrap();
    }

    #[test]
    fn list_segments_excludes_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), "segment_00001.mp4");
        sleep(Duration::from_millis(10));
        write_segment(dir.path(), "segment_00002.mp4");

        let segments = list_segments(dir.path());
        assert_eq!(segments.len(), 1);
        assert!(segments[0].path.ends_with("segment_00001.mp4"));
    }

    #[test]
    fn list_segments_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), "segment_00001.mp4");
        write_segment(dir.path(), "segment_00002.mp4");
        File::create(dir.path().join("notes.txt")).unwrap();

        let segments = list_segments(dir.path());
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn collect_segments_before_takes_last_count() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write_segment(dir.path(), &format!("segment_{i:05}.mp4"));
            sleep(Duration::from_millis(5));
        }
        // leave one more so none are excluded as "newest"
        write_segment(dir.path(), "segment_00005.mp4");

        let collected = collect_segments(dir.path(), Some(now_secs() + 100.0), None, 2);
        assert_eq!(collected.len(), 2);
    }
}
