//! Done markers for inputs that stay in place after completion.
//!
//! With `on_complete = "preserve"` a finished input never leaves the watch
//! folder, and its lock is released. The marker written next to it carries the
//! fingerprint the job was built from, so any monitor, in this process or
//! another with its own job store, leaves the file alone until it changes.

use crate::scan::done_marker_path;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Contents of a `.done` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneMarker {
    pub job_id: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl DoneMarker {
    pub fn matches(&self, size: u64, modified: Option<DateTime<Utc>>) -> bool {
        self.size == size && self.modified == modified
    }
}

/// Writes the marker for `input` atomically (tmp + rename).
pub fn write_done_marker(input: &Path, marker: &DoneMarker) -> io::Result<PathBuf> {
    let path = done_marker_path(input);
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let json =
        serde_json::to_vec(marker).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Reads the marker for `input`. Missing or unreadable markers count as absent.
pub fn read_done_marker(input: &Path) -> Option<DoneMarker> {
    let path = done_marker_path(input);
    let content = fs::read(&path).ok()?;
    match serde_json::from_slice(&content) {
        Ok(marker) => Some(marker),
        Err(e) => {
            debug!("Ignoring unreadable marker {}: {}", path.display(), e);
            None
        }
    }
}

/// Whether `input` was already finished with exactly this fingerprint.
pub fn is_done(input: &Path, size: u64, modified: Option<DateTime<Utc>>) -> bool {
    read_done_marker(input).is_some_and(|m| m.matches(size, modified))
}
