use crate::publish::{channel_filter_query, AUTO_ASSIGN_ACTION};
use crate::{RemoteError, RolloutServer};
use serde::Serialize;
use tracing::{info, warn};

/// Latest action of a target, flattened for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionSummary {
    pub action_id: u64,
    pub status: String,
    /// `name (version)` of the assigned distribution set.
    pub distribution: String,
    /// Type of the newest status entry (`running`, `finished`, `error`, ...).
    pub latest_type: Option<String>,
    pub message: Option<String>,
}

impl ActionSummary {
    /// Neither finished nor still making progress.
    pub fn needs_attention(&self) -> bool {
        self.status != "finished" && self.latest_type.as_deref() != Some("running")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetStatus {
    pub controller_id: String,
    pub name: String,
    pub action: Option<ActionSummary>,
}

/// Summarize the most recent action of `controller_id`, if it has any.
pub fn recent_action_status(
    server: &dyn RolloutServer,
    controller_id: &str,
) -> Result<Option<ActionSummary>, RemoteError> {
    let Some(action) = server.target_actions(controller_id)?.into_iter().next() else {
        return Ok(None);
    };
    let history = server.action_status(controller_id, action.id)?;
    let latest = history.into_iter().next();
    let distribution = match &action.distribution_set {
        Some(d) => format!("{} ({})", d.name, d.version),
        None => "unknown".to_owned(),
    };
    Ok(Some(ActionSummary {
        action_id: action.id,
        status: if action.status.is_empty() {
            "unknown".to_owned()
        } else {
            action.status
        },
        distribution,
        latest_type: latest.as_ref().map(|s| s.kind.clone()),
        message: latest.and_then(|s| s.messages.into_iter().next()),
    }))
}

/// Status of every target subscribed to `channel`.
pub fn channel_status(
    server: &dyn RolloutServer,
    channel: &str,
) -> Result<Vec<TargetStatus>, RemoteError> {
    let targets = server.targets_matching(&channel_filter_query(channel))?;
    let mut out = Vec::with_capacity(targets.len());
    for target in targets {
        let action = recent_action_status(server, &target.controller_id)?;
        out.push(TargetStatus {
            controller_id: target.controller_id,
            name: target.name,
            action,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reassignment {
    /// `name (version)` of the distribution set that was assigned.
    pub distribution: String,
    pub reassigned: Vec<String>,
    /// Controller id and error of every assignment the server refused.
    pub failed: Vec<(String, String)>,
}

/// Assign the newest distribution set to every device on `channel` whose
/// last action needs attention.
///
/// A refused assignment is recorded and the remaining devices are still
/// tried.
pub fn reassign_latest(
    server: &dyn RolloutServer,
    channel: &str,
) -> Result<Reassignment, RemoteError> {
    let latest = server
        .latest_distribution_set()?
        .ok_or_else(|| RemoteError::NotFound("no distribution sets".to_owned()))?;
    let mut result = Reassignment {
        distribution: format!("{} ({})", latest.name, latest.version),
        reassigned: Vec::new(),
        failed: Vec::new(),
    };
    for target in channel_status(server, channel)? {
        if !target.action.as_ref().is_some_and(ActionSummary::needs_attention) {
            continue;
        }
        match server.assign_distribution(&target.controller_id, latest.id, AUTO_ASSIGN_ACTION) {
            Ok(()) => {
                info!("reassigned {} to {}", result.distribution, target.controller_id);
                result.reassigned.push(target.controller_id);
            }
            Err(e) => {
                warn!("failed to reassign {}: {e}", target.controller_id);
                result.failed.push((target.controller_id, e.to_string()));
            }
        }
    }
    Ok(result)
}
