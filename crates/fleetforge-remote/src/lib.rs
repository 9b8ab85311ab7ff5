//! Rollout publishing for Fleetforge bundles.
//!
//! This crate pushes a signed bundle to a hawkBit-style management server
//! (software module, artifact, distribution set, channel target filter with
//! auto-assignment, rollout) and summarizes what devices did with it. The
//! server is reached through the `RolloutServer` trait; `HawkbitClient`
//! implements it over HTTP with basic authentication.

pub mod config;
pub mod hawkbit;
pub mod publish;
pub mod status;

pub use config::{PollingSettings, RolloutConfig};
pub use hawkbit::HawkbitClient;
pub use publish::{
    apply_polling_settings, channel_filter_query, publish_bundle, replace_rollout,
    PublishReceipt, PublishRequest,
};
pub use status::{
    channel_status, reassign_latest, recent_action_status, ActionSummary, Reassignment,
    TargetStatus,
};

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rollout config error: {0}")]
    Config(String),
    #[error("unexpected server response: {0}")]
    Protocol(String),
    #[error("bundle error: {0}")]
    Bundle(#[from] fleetforge_bundle::VerificationError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareModule {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "type", default)]
    pub module_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: u64,
    #[serde(default)]
    pub provided_filename: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionSet {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFilter {
    pub id: u64,
    pub name: String,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub controller_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub distribution_set: Option<DistributionSet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub target_filter_query: String,
    #[serde(default)]
    pub status: String,
}

/// Parameters of a new single-group rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutSpec {
    pub name: String,
    pub distribution_id: u64,
    pub target_filter_query: String,
    pub action_type: String,
    /// Start time in Unix milliseconds; `None` leaves the rollout for a manual start.
    pub start_at: Option<i64>,
}

/// One entry of an action's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatus {
    pub id: u64,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub messages: Vec<String>,
}

/// Management operations needed to publish and monitor bundles.
pub trait RolloutServer: Send + Sync {
    fn find_software_module(
        &self,
        name: &str,
        module_type: &str,
    ) -> Result<Option<SoftwareModule>, RemoteError>;

    fn create_software_module(
        &self,
        name: &str,
        version: &str,
        module_type: &str,
    ) -> Result<SoftwareModule, RemoteError>;

    fn list_artifacts(&self, module_id: u64) -> Result<Vec<Artifact>, RemoteError>;

    fn delete_artifact(&self, module_id: u64, artifact_id: u64) -> Result<(), RemoteError>;

    /// Upload the file at `path`, streamed, as `file_name`.
    fn upload_artifact(
        &self,
        module_id: u64,
        file_name: &str,
        path: &Path,
    ) -> Result<Artifact, RemoteError>;

    fn find_distribution_set(&self, name: &str) -> Result<Option<DistributionSet>, RemoteError>;

    /// Most recently created distribution set, if any exist.
    fn latest_distribution_set(&self) -> Result<Option<DistributionSet>, RemoteError>;

    fn create_distribution_set(
        &self,
        name: &str,
        version: &str,
        set_type: &str,
        module_ids: &[u64],
    ) -> Result<DistributionSet, RemoteError>;

    fn list_target_filters(&self) -> Result<Vec<TargetFilter>, RemoteError>;

    fn create_target_filter(&self, name: &str, query: &str) -> Result<TargetFilter, RemoteError>;

    /// Make the filter assign `distribution_id` to every matching target.
    fn set_auto_assign(
        &self,
        filter_id: u64,
        distribution_id: u64,
        action_type: &str,
    ) -> Result<(), RemoteError>;

    fn targets_matching(&self, query: &str) -> Result<Vec<Target>, RemoteError>;

    /// Assign a distribution set to one target directly.
    fn assign_distribution(
        &self,
        controller_id: &str,
        distribution_id: u64,
        action_type: &str,
    ) -> Result<(), RemoteError>;

    /// Force-cancel an open action of a target.
    fn cancel_action(&self, controller_id: &str, action_id: u64) -> Result<(), RemoteError>;

    fn list_rollouts(&self) -> Result<Vec<Rollout>, RemoteError>;

    fn delete_rollout(&self, rollout_id: u64) -> Result<(), RemoteError>;

    fn create_rollout(&self, spec: &RolloutSpec) -> Result<Rollout, RemoteError>;

    /// Set one tenant configuration value (`system/configs/<key>`).
    fn set_system_config(&self, key: &str, value: serde_json::Value) -> Result<(), RemoteError>;

    /// Most recent actions of a target, newest first.
    fn target_actions(&self, controller_id: &str) -> Result<Vec<Action>, RemoteError>;

    /// Status history of one action, newest first.
    fn action_status(
        &self,
        controller_id: &str,
        action_id: u64,
    ) -> Result<Vec<ActionStatus>, RemoteError>;
}
