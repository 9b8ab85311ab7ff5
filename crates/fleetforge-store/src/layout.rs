use crate::StoreError;
use fleetforge_schema::PlanId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of a Fleetforge store root.
///
/// ```text
/// <root>/version
/// <root>/.lock
/// <root>/artifacts/<component>/<revision>/   (template-controlled)
/// <root>/staging/                            in-flight builds
/// <root>/plans/<plan_id>.toml
/// <root>/reports/<plan_id>-<timestamp>.json
/// <root>/logs/<component>-<revision>.log     logs of failed builds
/// ```
///
/// All subdirectories are created on [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    /// Absolute artifact directory for a path rendered from a component's template.
    pub fn artifact_dir(&self, relative: &Path) -> Result<PathBuf, StoreError> {
        let contained = relative.components().next().is_some()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !contained {
            return Err(StoreError::InvalidPath(relative.to_path_buf()));
        }
        Ok(self.artifacts_dir().join(relative))
    }

    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    #[inline]
    pub fn plans_dir(&self) -> PathBuf {
        self.root.join("plans")
    }

    #[inline]
    pub fn plan_path(&self, plan_id: &PlanId) -> PathBuf {
        self.plans_dir().join(format!("{plan_id}.toml"))
    }

    #[inline]
    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    #[inline]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.artifacts_dir())?;
        fs::create_dir_all(self.staging_dir())?;
        fs::create_dir_all(self.plans_dir())?;
        fs::create_dir_all(self.reports_dir())?;
        fs::create_dir_all(self.logs_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&self.root)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&self.root)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.root.join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
