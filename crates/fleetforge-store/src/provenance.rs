use crate::{fsync_dir, StoreError};
use fleetforge_schema::{BranchName, CatalogName, CommitId, ComponentName, PlanId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const PROVENANCE_FILE: &str = "provenance.json";

/// Durable evidence of which revision of a component was built, when, and by whom.
///
/// One record is written per successful build job, inside the artifact
/// directory. Records are never rewritten: [`write_provenance`] refuses to
/// replace an existing one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvenanceRecord {
    pub component: ComponentName,
    pub revision: CommitId,
    pub branch: BranchName,
    /// The revision came from a branch-tip query rather than a fixed pin.
    pub symbolic: bool,
    pub catalog: CatalogName,
    pub plan_id: PlanId,
    pub built_at: String,
    pub builder: String,
    pub duration_ms: u64,
    /// blake3 checksum over the record without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ProvenanceRecord {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    /// Timestamp in the same RFC 3339 form used by `built_at`.
    pub fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

/// Persist `record` as `<dir>/provenance.json`. Fails if a record already exists.
pub fn write_provenance(dir: &Path, record: &ProvenanceRecord) -> Result<PathBuf, StoreError> {
    let dest = dir.join(PROVENANCE_FILE);

    let mut sealed = record.clone();
    sealed.checksum = Some(sealed.compute_checksum()?);
    let content = serde_json::to_string_pretty(&sealed)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(&dest).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            StoreError::ProvenanceExists(dir.to_path_buf())
        } else {
            StoreError::Io(e.error)
        }
    })?;
    fsync_dir(dir)?;
    Ok(dest)
}

/// Read and verify the record in `dir`.
pub fn read_provenance(dir: &Path) -> Result<ProvenanceRecord, StoreError> {
    let path = dir.join(PROVENANCE_FILE);
    if !path.is_file() {
        return Err(StoreError::ProvenanceNotFound(dir.to_path_buf()));
    }
    let content = fs::read_to_string(&path)?;
    let record: ProvenanceRecord = serde_json::from_str(&content)?;

    let actual = record.compute_checksum()?;
    if record.checksum.as_deref() == Some(actual.as_str()) {
        return Ok(record);
    }
    Err(StoreError::IntegrityFailure {
        path,
        expected: record
            .checksum
            .unwrap_or_else(|| "<missing>".to_owned()),
        actual,
    })
}

/// Every directory below `artifacts_dir` that holds a provenance record,
/// paired with the outcome of reading it. Artifact directories are not
/// descended into.
#[allow(clippy::type_complexity)]
pub fn list_provenance(
    artifacts_dir: &Path,
) -> Result<Vec<(PathBuf, Result<ProvenanceRecord, StoreError>)>, StoreError> {
    let mut results = Vec::new();
    if artifacts_dir.is_dir() {
        walk(artifacts_dir, &mut results)?;
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

#[allow(clippy::type_complexity)]
fn walk(
    dir: &Path,
    out: &mut Vec<(PathBuf, Result<ProvenanceRecord, StoreError>)>,
) -> Result<(), StoreError> {
    if dir.join(PROVENANCE_FILE).exists() {
        out.push((dir.to_path_buf(), read_provenance(dir)));
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            walk(&entry.path(), out)?;
        }
    }
    Ok(())
}
