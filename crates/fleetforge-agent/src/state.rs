use crate::AgentError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const STATE_FILE: &str = "agent-state.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentState {
    #[default]
    Idle,
    Fetching,
    Verifying,
    Installing,
    AwaitingReboot,
    Failed,
}

impl AgentState {
    /// An update was running when this state was recorded.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            AgentState::Fetching | AgentState::Verifying | AgentState::Installing
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Idle => write!(f, "idle"),
            AgentState::Fetching => write!(f, "fetching"),
            AgentState::Verifying => write!(f, "verifying"),
            AgentState::Installing => write!(f, "installing"),
            AgentState::AwaitingReboot => write!(f, "awaiting-reboot"),
            AgentState::Failed => write!(f, "failed"),
        }
    }
}

pub fn validate_transition(from: AgentState, to: AgentState) -> Result<(), AgentError> {
    let valid = matches!(
        (from, to),
        (AgentState::Idle, AgentState::Fetching)
            | (AgentState::Fetching, AgentState::Verifying | AgentState::Failed)
            | (AgentState::Verifying, AgentState::Installing | AgentState::Failed)
            | (
                AgentState::Installing,
                AgentState::AwaitingReboot | AgentState::Failed
            )
            | (AgentState::AwaitingReboot | AgentState::Failed, AgentState::Idle)
    );

    if valid {
        Ok(())
    } else {
        Err(AgentError::InvalidTransition { from, to })
    }
}

/// What the agent remembers across restarts and reboots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub state: AgentState,
    /// Where the current or most recent update came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Last location that was installed or rejected by verification.
    /// Polling skips it; fetch and install failures leave it untouched so
    /// the same bundle is retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled: Option<String>,
    /// Bundle version being installed or awaiting reboot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_version: Option<String>,
    /// Last bundle version confirmed after boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub updated_at: String,
}

impl PersistedState {
    pub fn transition(&mut self, to: AgentState) -> Result<(), AgentError> {
        validate_transition(self.state, to)?;
        self.state = to;
        self.updated_at = chrono::Utc::now().to_rfc3339();
        Ok(())
    }
}

/// `<state_dir>/agent-state.json`, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Saved state, or a fresh idle state on first start.
    pub fn load(&self) -> Result<PersistedState, AgentError> {
        match fs::read_to_string(self.path()) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), AgentError> {
        fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(state)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path()).map_err(|e| AgentError::Io(e.error))?;
        fs::File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}
