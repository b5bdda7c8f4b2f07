//! Checkpoint store: terrain snapshots on disk.
//!
//! One file per label in the terrain node directory:
//!   TERRAIN/checkpoint_settled.dat
//!   TERRAIN/checkpoint_end.dat
//!
//! Writes are atomic (temp file, then rename). Reads are mmap-backed and
//! verified against the content hash in the record header before use.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memmap2::Mmap;

use cosim_core::checkpoint::{self, CheckpointRecord};

use crate::node::CosimError;
use crate::output::write_atomic;

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create checkpoint dir: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn path(&self, label: &str) -> PathBuf {
        self.root.join(checkpoint::file_name(label))
    }

    pub fn exists(&self, label: &str) -> bool {
        self.path(label).exists()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a record under its label. Returns the content hash.
    pub fn write(&self, record: &CheckpointRecord) -> Result<[u8; 32]> {
        let path = self.path(&record.label);
        let data = checkpoint::encode(record);
        write_atomic(&path, &data)?;

        let hash = *blake3::hash(&data).as_bytes();
        tracing::info!(
            label = checkpoint::normalize_label(&record.label),
            terrain = %record.terrain,
            state = %record.state.describe(),
            hash = hex::encode(&hash[..8]),
            "checkpoint written"
        );
        Ok(hash)
    }

    /// Load and verify the record stored under `label`.
    pub fn load(&self, label: &str) -> Result<CheckpointRecord, CosimError> {
        let path = self.path(label);
        if !path.exists() {
            return Err(anyhow::anyhow!("checkpoint not found: {}", path.display()).into());
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open checkpoint: {}", path.display()))?;

        // Safety: file is opened read-only and we don't mutate the mmap
        let mmap = unsafe {
            Mmap::map(&file)
                .with_context(|| format!("failed to mmap checkpoint: {}", path.display()))?
        };

        let record = checkpoint::decode(&mmap).map_err(|source| CosimError::Checkpoint {
            label: checkpoint::normalize_label(label).to_string(),
            source,
        })?;

        tracing::info!(
            label = checkpoint::normalize_label(label),
            terrain = %record.terrain,
            state = %record.state.describe(),
            "checkpoint loaded"
        );
        Ok(record)
    }
}
