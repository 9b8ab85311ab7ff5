use crate::AgentError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::error;

/// Where in the update or supervision cycle something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IncidentStage {
    Fetch,
    Verify,
    Install,
    /// The device came back without confirming the new slot.
    Boot,
    /// The agent died while an update was in flight.
    Interrupted,
    Supervision,
}

impl fmt::Display for IncidentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncidentStage::Fetch => write!(f, "fetch"),
            IncidentStage::Verify => write!(f, "verify"),
            IncidentStage::Install => write!(f, "install"),
            IncidentStage::Boot => write!(f, "boot"),
            IncidentStage::Interrupted => write!(f, "interrupted"),
            IncidentStage::Supervision => write!(f, "supervision"),
        }
    }
}

/// A terminal failure, with enough context to reproduce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub occurred_at: String,
    pub stage: IncidentStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub detail: String,
}

impl Incident {
    pub fn new(stage: IncidentStage, detail: impl Into<String>) -> Self {
        Self {
            occurred_at: chrono::Utc::now().to_rfc3339(),
            stage,
            bundle_version: None,
            source: None,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn with_bundle_version(mut self, version: Option<String>) -> Self {
        self.bundle_version = version;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }
}

impl fmt::Display for Incident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", self.stage)?;
        if let Some(v) = &self.bundle_version {
            write!(f, " for bundle {v}")?;
        }
        write!(f, ": {}", self.detail)
    }
}

/// Out-of-band channel for failures the agent cannot recover from itself.
pub trait IncidentReporter: Send + Sync {
    fn report(&self, incident: &Incident) -> Result<(), AgentError>;
}

/// Writes one JSON document per incident into a spool directory that an
/// external crash collector picks up.
#[derive(Debug, Clone)]
pub struct FileIncidentReporter {
    dir: PathBuf,
}

impl FileIncidentReporter {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Incidents currently in the spool, oldest first.
    pub fn list(&self) -> Result<Vec<Incident>, AgentError> {
        let mut paths = Vec::new();
        match fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries {
                    let path = entry?.path();
                    if path.extension().is_some_and(|e| e == "json") {
                        paths.push(path);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        paths.sort();
        paths
            .iter()
            .map(|p| Ok(serde_json::from_str(&fs::read_to_string(p)?)?))
            .collect()
    }
}

impl IncidentReporter for FileIncidentReporter {
    fn report(&self, incident: &Incident) -> Result<(), AgentError> {
        error!("{incident}");
        fs::create_dir_all(&self.dir)?;
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(serde_json::to_string_pretty(incident)?.as_bytes())?;
        tmp.as_file().sync_all()?;
        // Two incidents in the same microsecond must not overwrite each other.
        let mut n = 0u32;
        loop {
            let name = if n == 0 {
                format!("{stamp}-{}.json", incident.stage)
            } else {
                format!("{stamp}-{}-{n}.json", incident.stage)
            };
            match tmp.persist_noclobber(self.dir.join(name)) {
                Ok(_) => return Ok(()),
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    tmp = e.file;
                    n += 1;
                }
                Err(e) => return Err(AgentError::Io(e.error)),
            }
        }
    }
}

/// In-memory reporter for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryIncidentReporter {
    incidents: Mutex<Vec<Incident>>,
}

impl MemoryIncidentReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incidents(&self) -> Vec<Incident> {
        self.incidents
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }
}

impl IncidentReporter for MemoryIncidentReporter {
    fn report(&self, incident: &Incident) -> Result<(), AgentError> {
        if let Ok(mut guard) = self.incidents.lock() {
            guard.push(incident.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_reporter_spools_json() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = FileIncidentReporter::new(&dir.path().join("incidents"));
        assert!(reporter.list().unwrap().is_empty());

        let first = Incident::new(IncidentStage::Verify, "signature does not verify")
            .with_bundle_version(Some("20261018T120000.000000Z".into()))
            .with_source(Some("https://u.example/stable/x.bundle".into()));
        reporter.report(&first).unwrap();
        reporter
            .report(&Incident::new(IncidentStage::Supervision, "crash loop"))
            .unwrap();

        let listed = reporter.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&first));
    }

    #[test]
    fn rapid_reports_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = FileIncidentReporter::new(dir.path());
        for i in 0..20 {
            reporter
                .report(&Incident::new(IncidentStage::Fetch, format!("attempt {i}")))
                .unwrap();
        }
        assert_eq!(reporter.list().unwrap().len(), 20);
    }

    #[test]
    fn display_names_stage_and_version() {
        let incident = Incident::new(IncidentStage::Install, "exit code 4")
            .with_bundle_version(Some("7".into()));
        assert_eq!(incident.to_string(), "install failed for bundle 7: exit code 4");
    }

    #[test]
    fn memory_reporter_keeps_order() {
        let reporter = MemoryIncidentReporter::new();
        reporter.report(&Incident::new(IncidentStage::Fetch, "a")).unwrap();
        reporter.report(&Incident::new(IncidentStage::Boot, "b")).unwrap();
        let stages: Vec<_> = reporter.incidents().iter().map(|i| i.stage).collect();
        assert_eq!(stages, vec![IncidentStage::Fetch, IncidentStage::Boot]);
    }
}
