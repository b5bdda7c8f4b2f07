//! Node output directory.
//!
//! Layout below the node directory:
//!   frame_00000.json ... one file per output frame
//!   settling/settling_00000.json ... granular settling snapshots
//!
//! Every file is written to a temp file and renamed into place, so a reader
//! never sees a partial frame and re-writing a frame replaces it whole.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create node directory: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn frame_path(&self, frame: u64) -> PathBuf {
        self.root.join(format!("frame_{frame:05}.json"))
    }

    pub fn snapshot_path(&self, index: u64) -> PathBuf {
        self.root.join("settling").join(format!("settling_{index:05}.json"))
    }

    pub fn write_frame<T: Serialize>(&self, frame: u64, value: &T) -> Result<PathBuf> {
        let path = self.frame_path(frame);
        write_json(&path, value)?;
        Ok(path)
    }

    pub fn write_snapshot<T: Serialize>(&self, index: u64, value: &T) -> Result<PathBuf> {
        let path = self.snapshot_path(index);
        write_json(&path, value)?;
        Ok(path)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("failed to serialize output")?;
    write_atomic(path, &data)
}

/// Write `data` to `path` via a temp file and rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
        file.write_all(data).context("failed to write output")?;
        file.sync_all().context("failed to sync output to disk")?;
    }

    fs::rename(&tmp_path, path).with_context(|| {
        format!("failed to rename {} to {}", tmp_path.display(), path.display())
    })?;
    Ok(())
}
