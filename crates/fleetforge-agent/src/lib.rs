//! Device-side update agent for Fleetforge bundles.
//!
//! `UpdateAgent` drives one update at a time through
//! `Idle -> Fetching -> Verifying -> Installing -> AwaitingReboot -> Idle`,
//! persisting every transition so a restart knows what happened before it.
//! Fetching, slot installation, and incident reporting sit behind traits
//! (`BundleFetcher`, `SlotInstaller`, `IncidentReporter`). The agent process
//! itself runs under `ProcessSupervisor`, whose `Supervisor` enforces a
//! bounded restart budget and a heartbeat watchdog.

pub mod agent;
pub mod config;
pub mod fetch;
pub mod install;
pub mod report;
pub mod state;
pub mod supervisor;

pub use agent::{AgentSettings, BootCheck, UpdateAgent, UpdateOutcome};
pub use config::{
    load_agent_config, parse_agent_config_str, AgentConfig, BootMode, ConfigError,
    DEFAULT_AGENT_CONFIG,
};
pub use fetch::{fetcher_for, BundleFetcher, FetchError, FileFetcher, HttpFetcher};
pub use install::{CommandInstaller, InstallError, SlotInstaller};
pub use report::{
    FileIncidentReporter, Incident, IncidentReporter, IncidentStage, MemoryIncidentReporter,
};
pub use state::{validate_transition, AgentState, PersistedState, StateStore, STATE_FILE};
pub use supervisor::{
    install_signal_handler, Decision, Heartbeat, Liveness, ProcessSupervisor, RestartPolicy,
    StopSignal, SupervisionExhausted, Supervisor, HEARTBEAT_ENV,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("keyring error: {0}")]
    Keyring(#[from] fleetforge_bundle::KeyError),
    #[error("an update is already in progress")]
    Busy,
    #[error("invalid agent transition: {from} -> {to}")]
    InvalidTransition { from: AgentState, to: AgentState },
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("verification failed: {0}")]
    Verification(#[from] fleetforge_bundle::VerificationError),
    #[error("bundle targets variant '{found}', device runs '{expected}'")]
    VariantMismatch { expected: String, found: String },
    #[error("install failed: {0}")]
    Install(#[from] InstallError),
    #[error(transparent)]
    Exhausted(#[from] SupervisionExhausted),
    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
