//! Artifact storage, provenance records, and archiving for Fleetforge.
//!
//! This crate provides the storage layer: `ArtifactLayout` partitions build
//! outputs per component per resolved revision, `ArtifactStore` stages and
//! promotes build output atomically, `ProvenanceRecord` is the write-once
//! evidence persisted next to each artifact, `pack_dir`/`unpack_archive`
//! produce deterministic tar archives, and `verify_store_integrity` audits
//! everything on disk.

pub mod archive;
pub mod artifacts;
pub mod integrity;
pub mod layout;
pub mod provenance;

pub use archive::{pack_dir, pack_dir_to, unpack_archive};
pub use artifacts::ArtifactStore;
pub use integrity::{verify_store_integrity, IntegrityFailure, IntegrityReport};
pub use layout::{ArtifactLayout, STORE_FORMAT_VERSION};
pub use provenance::{
    list_provenance, read_provenance, write_provenance, ProvenanceRecord, PROVENANCE_FILE,
};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee rename durability without it.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{}': expected {expected}, got {actual}", .path.display())]
    IntegrityFailure {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),
    #[error("provenance record not found in {}", .0.display())]
    ProvenanceNotFound(PathBuf),
    #[error("provenance record already exists in {}", .0.display())]
    ProvenanceExists(PathBuf),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("artifact path escapes the store: {}", .0.display())]
    InvalidPath(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_provenance_exists() {
        let e = StoreError::ProvenanceExists(PathBuf::from("/s/artifacts/kernel/abc1234"));
        assert!(e.to_string().contains("kernel/abc1234"));
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 1,
            found: 7,
        };
        let msg = e.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('7'));
    }

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            path: PathBuf::from("provenance.json"),
            expected: "exp".to_owned(),
            actual: "act".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("exp"));
        assert!(msg.contains("act"));
        assert!(msg.contains("provenance.json"));
    }
}
