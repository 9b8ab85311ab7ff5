use crate::lifecycle::validate_transition;
use crate::CoreError;
use fleetforge_schema::{BranchName, CommitId, ComponentName};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One component build at one resolved revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub component: ComponentName,
    pub revision: CommitId,
    pub branch: BranchName,
    pub symbolic: bool,
    /// Declared dependencies. Those absent from the job list are assumed built.
    pub depends_on: Vec<ComponentName>,
    /// Artifact directory relative to the store's artifact root.
    pub output: PathBuf,
    pub status: JobStatus,
}

impl BuildJob {
    pub fn transition(&mut self, to: JobStatus) -> Result<(), CoreError> {
        validate_transition(self.status, to)?;
        self.status = to;
        Ok(())
    }
}

impl fmt::Display for BuildJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.component, self.revision.short())
    }
}
