//! On-disk checkpoints with ring retention.
//!
//! Each save is one libtorch archive holding every named tensor of the
//! session. The archive is written to a temporary file and renamed into
//! place, then the manifest is rewritten, then evicted archives are deleted.
//! A crash at any point leaves the manifest pointing at complete archives;
//! whatever else it leaves behind is deleted the next time the store is opened.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use invgan_data::{CheckpointEntry, CheckpointManifest};
use tch::{Device, Tensor};

use crate::error::{TrainError, TrainResult};

const TMP_SUFFIX: &str = "tmp";

/// Directory of checkpoint archives plus their manifest
pub struct CheckpointStore {
    dir: PathBuf,
    manifest: CheckpointManifest,
}

impl CheckpointStore {
    /// Open (creating if needed) the store in `dir`, retaining `keep` archives
    pub fn open(dir: &Path, keep: usize) -> TrainResult<Self> {
        std::fs::create_dir_all(dir)?;
        let manifest_path = dir.join(CheckpointManifest::FILE_NAME);
        let mut manifest = CheckpointManifest::load_if_exists(&manifest_path)?
            .unwrap_or_else(|| CheckpointManifest::new(keep));
        manifest.keep = keep.max(1);

        let store = Self { dir: dir.to_path_buf(), manifest };
        store.remove_stale_files();
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &CheckpointManifest {
        &self.manifest
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(CheckpointManifest::FILE_NAME)
    }

    pub fn latest(&self) -> Option<&CheckpointEntry> {
        self.manifest.latest()
    }

    pub fn path_of(&self, entry: &CheckpointEntry) -> PathBuf {
        self.dir.join(&entry.file_name)
    }

    /// Archive paths of every retained checkpoint, oldest first
    pub fn paths(&self) -> Vec<PathBuf> {
        self.manifest.checkpoints.iter().map(|e| self.path_of(e)).collect()
    }

    /// Persist `tensors` as a new checkpoint and apply the retention policy
    pub fn save(
        &mut self,
        tensors: &[(String, Tensor)],
        step: u64,
        epoch: usize,
    ) -> TrainResult<CheckpointEntry> {
        let file_name = self.manifest.next_file_name();
        let path = self.dir.join(&file_name);
        let tmp = path.with_extension(TMP_SUFFIX);

        Tensor::save_multi(tensors, &tmp)
            .map_err(|e| TrainError::checkpoint(&tmp, e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| TrainError::checkpoint(&path, e.to_string()))?;

        let mut manifest = self.manifest.clone();
        let (entry, evicted) = manifest.push(step, epoch);
        manifest
            .save(&self.manifest_path())
            .map_err(|e| TrainError::checkpoint(self.manifest_path(), e.to_string()))?;
        self.manifest = manifest;

        for old in evicted {
            let old_path = self.path_of(&old);
            if let Err(e) = std::fs::remove_file(&old_path) {
                tracing::warn!("Failed to delete evicted checkpoint {:?}: {}", old_path, e);
            }
        }

        tracing::debug!("Saved checkpoint {} at step {} ({} tensors)", file_name, step, tensors.len());
        Ok(entry)
    }

    /// Load every tensor of `entry` onto `device`
    pub fn load(&self, entry: &CheckpointEntry, device: Device) -> TrainResult<HashMap<String, Tensor>> {
        let path = self.path_of(entry);
        if !path.exists() {
            return Err(TrainError::restore(&path, "archive listed in manifest is missing"));
        }
        let tensors = Tensor::load_multi_with_device(&path, device)
            .map_err(|e| TrainError::restore(&path, e.to_string()))?;
        Ok(tensors.into_iter().collect())
    }

    /// Load the most recent checkpoint, `None` if nothing was ever saved
    pub fn load_latest(
        &self,
        device: Device,
    ) -> TrainResult<Option<(CheckpointEntry, HashMap<String, Tensor>)>> {
        match self.latest() {
            Some(entry) => {
                let tensors = self.load(entry, device)?;
                Ok(Some((entry.clone(), tensors)))
            }
            None => Ok(None),
        }
    }

    /// Delete interrupted writes and archives the manifest no longer lists
    fn remove_stale_files(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if path.extension().and_then(|e| e.to_str()) == Some(TMP_SUFFIX) {
                tracing::debug!("Removing incomplete checkpoint {:?}", path);
            } else if CheckpointManifest::is_archive_name(&name) && !self.manifest.lists(&name) {
                tracing::info!("Removing checkpoint {:?} not listed in the manifest", path);
            } else {
                continue;
            }
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to delete {:?}: {}", path, e);
            }
        }
    }
}
