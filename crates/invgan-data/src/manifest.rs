use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DataError, DataResult};

/// Entry for a single saved checkpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Monotonic save index
    pub index: u64,
    /// Training step counter at save time
    pub step: u64,
    /// Completed epochs at save time
    pub epoch: usize,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
}

/// Index of retained checkpoints, oldest first
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    /// Maximum number of entries retained
    pub keep: usize,
    pub next_index: u64,
    pub checkpoints: Vec<CheckpointEntry>,
}

impl CheckpointManifest {
    pub const FILE_NAME: &'static str = "checkpoints.json";
    pub const ARCHIVE_PREFIX: &'static str = "ckpt-";
    pub const ARCHIVE_EXTENSION: &'static str = "ot";

    pub fn new(keep: usize) -> Self {
        Self {
            version: 1,
            keep: keep.max(1),
            next_index: 0,
            checkpoints: Vec::new(),
        }
    }

    /// File name the next saved checkpoint should use
    pub fn next_file_name(&self) -> String {
        format!("{}{:06}.{}", Self::ARCHIVE_PREFIX, self.next_index, Self::ARCHIVE_EXTENSION)
    }

    /// Whether `file_name` has the archive naming scheme
    pub fn is_archive_name(file_name: &str) -> bool {
        file_name.starts_with(Self::ARCHIVE_PREFIX)
            && file_name.ends_with(&format!(".{}", Self::ARCHIVE_EXTENSION))
    }

    /// Whether `file_name` is one of the retained archives
    pub fn lists(&self, file_name: &str) -> bool {
        self.checkpoints.iter().any(|e| e.file_name == file_name)
    }

    /// Record a freshly written checkpoint.
    ///
    /// Returns the entries evicted by the retention policy; the caller owns
    /// deleting their files.
    pub fn push(&mut self, step: u64, epoch: usize) -> (CheckpointEntry, Vec<CheckpointEntry>) {
        let entry = CheckpointEntry {
            index: self.next_index,
            step,
            epoch,
            file_name: self.next_file_name(),
            created_at: Utc::now(),
        };
        self.next_index += 1;
        self.checkpoints.push(entry.clone());

        let excess = self.checkpoints.len().saturating_sub(self.keep);
        let evicted = self.checkpoints.drain(..excess).collect();
        (entry, evicted)
    }

    /// Most recent checkpoint
    pub fn latest(&self) -> Option<&CheckpointEntry> {
        self.checkpoints.last()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Write atomically: serialize to a sibling temp file, then rename over `path`
    pub fn save(&self, path: &Path) -> DataResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| DataError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| DataError::io(path, e))?;
        Ok(())
    }

    pub fn load(path: &Path) -> DataResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| DataError::io(path, e))?;
        serde_json::from_str(&json).map_err(|source| DataError::Manifest {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the manifest if one exists, `None` for a directory never checkpointed
    pub fn load_if_exists(path: &Path) -> DataResult<Option<Self>> {
        if path.exists() {
            Self::load(path).map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_keeps_most_recent() {
        let mut manifest = CheckpointManifest::new(2);
        let mut evicted_total = Vec::new();
        for step in 0..5u64 {
            let (_, evicted) = manifest.push(step * 10, 0);
            evicted_total.extend(evicted);
        }

        assert_eq!(manifest.len(), 2);
        let kept: Vec<u64> = manifest.checkpoints.iter().map(|e| e.index).collect();
        assert_eq!(kept, vec![3, 4]);
        let gone: Vec<u64> = evicted_total.iter().map(|e| e.index).collect();
        assert_eq!(gone, vec![0, 1, 2]);
        assert_eq!(manifest.latest().unwrap().step, 40);
    }

    #[test]
    fn test_file_names_are_unique_and_ordered() {
        let mut manifest = CheckpointManifest::new(3);
        let (a, _) = manifest.push(1, 0);
        let (b, _) = manifest.push(2, 0);
        assert_eq!(a.file_name, "ckpt-000000.ot");
        assert_eq!(b.file_name, "ckpt-000001.ot");
        assert!(a.file_name < b.file_name);
        assert!(CheckpointManifest::is_archive_name(&a.file_name));
        assert!(!CheckpointManifest::is_archive_name(CheckpointManifest::FILE_NAME));
    }

    #[test]
    fn test_lists_only_retained_archives() {
        let mut manifest = CheckpointManifest::new(1);
        let (first, _) = manifest.push(1, 0);
        let (second, _) = manifest.push(2, 0);
        assert!(!manifest.lists(&first.file_name));
        assert!(manifest.lists(&second.file_name));
    }

    #[test]
    fn test_keep_is_at_least_one() {
        let mut manifest = CheckpointManifest::new(0);
        manifest.push(1, 0);
        manifest.push(2, 0);
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CheckpointManifest::FILE_NAME);

        let mut manifest = CheckpointManifest::new(2);
        manifest.push(7, 1);
        manifest.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = CheckpointManifest::load(&path).unwrap();
        assert_eq!(loaded.next_index, 1);
        assert_eq!(loaded.checkpoints, manifest.checkpoints);
    }

    #[test]
    fn test_missing_manifest_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CheckpointManifest::FILE_NAME);
        assert!(CheckpointManifest::load_if_exists(&path).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_manifest_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CheckpointManifest::FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            CheckpointManifest::load_if_exists(&path),
            Err(DataError::Manifest { .. })
        ));
    }
}
