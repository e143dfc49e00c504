//! Snapshot file handling.
//!
//! Snapshot images live in a configured directory, one file per
//! `(node, term, index)` triple so a leader streaming an old snapshot out and
//! an incoming install can never collide on the same path. Writes go through
//! a temporary file and a rename; the previous image is removed only after
//! the new one is in place.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// File extension for snapshot images.
const SNAPSHOT_EXT: &str = "snap";

/// Deterministic snapshot file name for the given coordinates.
pub fn snapshot_path(dir: &Path, node_id: u32, term: i64, index: i64) -> PathBuf {
    dir.join(format!("node{}_{}_{}.{}", node_id, term, index, SNAPSHOT_EXT))
}

/// Serialize through `write` into `path`, atomically.
///
/// The callback receives a buffered writer over a sibling `.tmp` file; the
/// file only appears under its final name once everything is flushed.
pub fn write_snapshot<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        write(&mut writer)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;

    Ok(())
}

/// Open a snapshot image for reading.
pub fn open_snapshot(path: &Path) -> io::Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

/// Best-effort removal of a superseded snapshot image.
pub fn remove_snapshot(path: &Path) {
    let _ = fs::remove_file(path);
}
