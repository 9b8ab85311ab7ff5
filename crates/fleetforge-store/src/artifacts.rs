use crate::layout::ArtifactLayout;
use crate::provenance::{read_provenance, ProvenanceRecord};
use crate::{fsync_dir, StoreError};
use fleetforge_schema::{CommitId, ComponentName};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Staging and promotion of build output into per-revision artifact directories.
///
/// A job writes only into its own staging directory. Only a successful job
/// is promoted, by renaming the staging directory over the final path, so a
/// failed build never touches the artifacts of any earlier build.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    layout: ArtifactLayout,
}

impl ArtifactStore {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Fresh private staging directory for one build job.
    pub fn begin_staging(
        &self,
        component: &ComponentName,
        revision: &CommitId,
    ) -> Result<TempDir, StoreError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{component}-{}-", revision.short()))
            .tempdir_in(self.layout.staging_dir())?;
        Ok(dir)
    }

    /// Whether a build with a valid provenance record exists at `relative`.
    pub fn is_built(&self, relative: &Path) -> bool {
        self.provenance(relative).is_ok()
    }

    pub fn provenance(&self, relative: &Path) -> Result<ProvenanceRecord, StoreError> {
        let dir = self.layout.artifact_dir(relative)?;
        if !dir.is_dir() {
            return Err(StoreError::ArtifactNotFound(dir));
        }
        read_provenance(&dir)
    }

    /// Move a finished staging directory to its artifact path.
    ///
    /// An older build of the same revision is displaced as a whole, together
    /// with its provenance record.
    pub fn promote(&self, staging: TempDir, relative: &Path) -> Result<PathBuf, StoreError> {
        let dest = self.layout.artifact_dir(relative)?;
        let parent = dest
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(relative.to_path_buf()))?
            .to_path_buf();
        fs::create_dir_all(&parent)?;

        let displaced = if dest.exists() {
            debug!("replacing previous build at {}", dest.display());
            let trash = tempfile::Builder::new()
                .prefix(".replaced-")
                .tempdir_in(self.layout.staging_dir())?;
            fs::rename(&dest, trash.path().join("old"))?;
            Some(trash)
        } else {
            None
        };

        if let Err(e) = fs::rename(staging.path(), &dest) {
            if let Some(trash) = displaced {
                let old = trash.path().join("old");
                if let Err(restore) = fs::rename(&old, &dest) {
                    warn!(
                        "could not restore previous build to {}: {restore}; it remains at {}",
                        dest.display(),
                        old.display()
                    );
                    // Left for manual recovery until the next clean_staging.
                    std::mem::forget(trash);
                }
            }
            return Err(e.into());
        }
        fsync_dir(&parent)?;
        // The staging path no longer exists, so its cleanup on drop is a no-op.
        drop(staging);
        drop(displaced);
        Ok(dest)
    }

    /// Copy the log of a failed build out of its staging directory before it is discarded.
    pub fn preserve_log(
        &self,
        log: &Path,
        component: &ComponentName,
        revision: &CommitId,
    ) -> Result<PathBuf, StoreError> {
        let dest = self
            .layout
            .logs_dir()
            .join(format!("{component}-{revision}.log"));
        fs::create_dir_all(self.layout.logs_dir())?;
        fs::copy(log, &dest)?;
        Ok(dest)
    }

    /// Remove leftovers of interrupted runs. Must only run while holding the store lock.
    pub fn clean_staging(&self) -> Result<usize, StoreError> {
        let dir = self.layout.staging_dir();
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            warn!("removing stale staging entry {}", path.display());
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            removed += 1;
        }
        Ok(removed)
    }
}
