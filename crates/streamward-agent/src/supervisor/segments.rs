//! Segment activity in a session working directory
//!
//! The uploader deletes segments as it ships them and the segmenter adds new
//! ones, so the directory's own mtime moves on both. The newest file mtime
//! covers filesystems that do not update directory times.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Newest of the directory mtime and the mtimes of the files inside it
pub fn last_activity(dir: &Path) -> Option<DateTime<Utc>> {
    let mut newest = std::fs::metadata(dir).and_then(|m| m.modified()).ok();

    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let modified = entry.metadata().and_then(|m| m.modified()).ok();
            if modified > newest {
                newest = modified;
            }
        }
    }
    newest.map(DateTime::<Utc>::from)
}

/// Time since the last segment activity, floored by the launch time
pub fn segment_age(dir: &Path, launched_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let activity = last_activity(dir).map_or(launched_at, |at| at.max(launched_at));
    (now - activity).to_std().unwrap_or(Duration::ZERO)
}
