use crate::{
    DistributionSet, PollingSettings, RemoteError, Rollout, RolloutServer, RolloutSpec,
    SoftwareModule, TargetFilter,
};
use fleetforge_bundle::read_manifest;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

/// Action type used for filter auto-assignment and rollouts.
pub const AUTO_ASSIGN_ACTION: &str = "forced";

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub bundle: PathBuf,
    /// Devices whose `update_channel` attribute equals this get the bundle.
    pub channel: String,
    /// Software module name; one module is reused across releases.
    pub software_module: String,
    /// Distribution set name; defaults to the bundle file name.
    pub distribution: Option<String>,
    pub module_type: String,
    /// Tenant polling configuration to apply before publishing.
    pub polling: Option<PollingSettings>,
    /// Replace the channel's rollout with one for this bundle.
    pub rollout: bool,
    /// Start the rollout immediately instead of leaving it ready.
    pub autostart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub bundle_version: String,
    pub software_module_id: u64,
    pub artifact_id: u64,
    pub distribution_set_id: u64,
    pub distribution_reused: bool,
    pub target_filter_id: u64,
    pub filter_query: String,
    /// `None` when no rollout was requested or no device is on the channel.
    pub rollout_id: Option<u64>,
}

pub fn channel_filter_query(channel: &str) -> String {
    format!("attribute.update_channel == \"{channel}\"")
}

/// Upload a signed bundle and point the channel's target filter at it.
///
/// Steps: find or create the software module, replace its artifacts with the
/// bundle, find or create the distribution set, ensure the channel filter
/// exists, auto-assign the distribution set through that filter, and
/// finally replace the channel's rollout when requested.
pub fn publish_bundle(
    server: &dyn RolloutServer,
    request: &PublishRequest,
) -> Result<PublishReceipt, RemoteError> {
    if request.channel.is_empty() || request.channel.contains('"') {
        return Err(RemoteError::Config(format!(
            "invalid channel name '{}'",
            request.channel
        )));
    }
    let bundle = read_manifest(&request.bundle)?;
    if let Some(polling) = &request.polling {
        apply_polling_settings(server, polling)?;
    }
    let version = bundle.version().to_owned();
    let file_name = request
        .bundle
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| bundle.file_name());

    let module = ensure_software_module(server, request, &version)?;

    for artifact in server.list_artifacts(module.id)? {
        info!(
            "removing artifact {} from module {}",
            artifact.provided_filename.as_deref().unwrap_or("(unnamed)"),
            module.name
        );
        server.delete_artifact(module.id, artifact.id)?;
    }
    let artifact = server.upload_artifact(module.id, &file_name, &request.bundle)?;

    let dist_name = request.distribution.clone().unwrap_or_else(|| file_name.clone());
    let (distribution, distribution_reused) =
        ensure_distribution_set(server, &dist_name, &version, &request.module_type, module.id)?;

    let query = channel_filter_query(&request.channel);
    let filter = ensure_target_filter(server, &request.channel, &query)?;
    server.set_auto_assign(filter.id, distribution.id, AUTO_ASSIGN_ACTION)?;
    let rollout = if request.rollout {
        replace_rollout(server, &file_name, distribution.id, &query, request.autostart)?
    } else {
        None
    };
    info!(
        "bundle {version} published to channel {} as distribution set {}",
        request.channel, distribution.name
    );

    Ok(PublishReceipt {
        bundle_version: version,
        software_module_id: module.id,
        artifact_id: artifact.id,
        distribution_set_id: distribution.id,
        distribution_reused,
        target_filter_id: filter.id,
        filter_query: query,
        rollout_id: rollout.map(|r| r.id),
    })
}

/// Push the tenant's polling interval, overdue threshold and target-token
/// authentication switch.
pub fn apply_polling_settings(
    server: &dyn RolloutServer,
    settings: &PollingSettings,
) -> Result<(), RemoteError> {
    settings.validate()?;
    info!(
        "setting polling time {} (overdue after {})",
        settings.polling_time, settings.polling_overdue_time
    );
    server.set_system_config("pollingTime", settings.polling_time.clone().into())?;
    server.set_system_config(
        "pollingOverdueTime",
        settings.polling_overdue_time.clone().into(),
    )?;
    server.set_system_config(
        "authentication.targettoken.enabled",
        settings.target_token_auth.into(),
    )
}

/// Create a single-group rollout of `distribution_id` over the targets
/// matching `query`, replacing earlier rollouts of the same name or query.
///
/// Open actions of the matching targets are cancelled first so the new
/// rollout is not queued behind a stale one. Returns `None` without touching
/// anything when no target matches.
pub fn replace_rollout(
    server: &dyn RolloutServer,
    name: &str,
    distribution_id: u64,
    query: &str,
    autostart: bool,
) -> Result<Option<Rollout>, RemoteError> {
    let targets = server.targets_matching(query)?;
    if targets.is_empty() {
        warn!("no targets match '{query}', not creating rollout '{name}'");
        return Ok(None);
    }
    for target in &targets {
        for action in server.target_actions(&target.controller_id)? {
            if action.status != "finished" {
                info!(
                    "cancelling action {} on {}",
                    action.id, target.controller_id
                );
                server.cancel_action(&target.controller_id, action.id)?;
            }
        }
    }
    for existing in server.list_rollouts()? {
        if existing.name == name || existing.target_filter_query == query {
            info!("deleting rollout '{}' ({})", existing.name, existing.id);
            server.delete_rollout(existing.id)?;
        }
    }
    let spec = RolloutSpec {
        name: name.to_owned(),
        distribution_id,
        target_filter_query: query.to_owned(),
        action_type: AUTO_ASSIGN_ACTION.to_owned(),
        start_at: autostart.then(|| chrono::Utc::now().timestamp_millis()),
    };
    let rollout = server.create_rollout(&spec)?;
    info!(
        "rollout '{}' created for {} target(s){}",
        rollout.name,
        targets.len(),
        if autostart { ", starting now" } else { "" }
    );
    Ok(Some(rollout))
}

fn ensure_software_module(
    server: &dyn RolloutServer,
    request: &PublishRequest,
    version: &str,
) -> Result<SoftwareModule, RemoteError> {
    if let Some(existing) =
        server.find_software_module(&request.software_module, &request.module_type)?
    {
        info!("using existing software module '{}'", existing.name);
        return Ok(existing);
    }
    server.create_software_module(&request.software_module, version, &request.module_type)
}

fn ensure_distribution_set(
    server: &dyn RolloutServer,
    name: &str,
    version: &str,
    set_type: &str,
    module_id: u64,
) -> Result<(DistributionSet, bool), RemoteError> {
    if let Some(existing) = server.find_distribution_set(name)? {
        warn!("distribution set '{name}' already exists, reusing it");
        return Ok((existing, true));
    }
    let created = server.create_distribution_set(name, version, set_type, &[module_id])?;
    Ok((created, false))
}

fn ensure_target_filter(
    server: &dyn RolloutServer,
    channel: &str,
    query: &str,
) -> Result<TargetFilter, RemoteError> {
    if let Some(existing) = server
        .list_target_filters()?
        .into_iter()
        .find(|f| f.query == query)
    {
        return Ok(existing);
    }
    info!("creating target filter for channel {channel}");
    server.create_target_filter(&format!("channel {channel}"), query)
}


#[cfg(test)]
mod tests {
    use super::fake::FakeServer;
    use super::*;
    use crate::{Action, Target};
    use fleetforge_bundle::{write_key_pair, BundlePackager, PackageRequest};

    fn packaged(dir: &std::path::Path, version: &str) -> PathBuf {
        write_key_pair(&dir.join("k.key"), &dir.join("k.cert"), None).unwrap();
        std::fs::create_dir_all(dir.join("rootfs/etc")).unwrap();
        std::fs::write(dir.join("rootfs/etc/hostname"), "fleet\n").unwrap();
        BundlePackager::new()
            .package(&PackageRequest {
                rootfs: dir.join("rootfs"),
                variant: "stable".into(),
                key: dir.join("k.key"),
                cert: dir.join("k.cert"),
                hook: None,
                version: Some(version.into()),
                output_dir: dir.join("out"),
            })
            .unwrap()
            .path
    }

    fn request(bundle: PathBuf) -> PublishRequest {
        PublishRequest {
            bundle,
            channel: "stable".into(),
            software_module: "fleet-os".into(),
            distribution: None,
            module_type: "os".into(),
            polling: None,
            rollout: false,
            autostart: false,
        }
    }

    fn subscribe(server: &FakeServer, controller_id: &str, channel: &str) {
        server.state.lock().unwrap().targets.push((
            Target {
                controller_id: controller_id.into(),
                name: controller_id.into(),
            },
            channel_filter_query(channel),
        ));
    }

    fn open_action(server: &FakeServer, controller_id: &str, id: u64, status: &str) {
        server
            .state
            .lock()
            .unwrap()
            .actions
            .entry(controller_id.into())
            .or_default()
            .push((
                Action {
                    id,
                    status: status.into(),
                    distribution_set: None,
                },
                Vec::new(),
            ));
    }

    #[test]
    fn first_publish_creates_everything() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = packaged(dir.path(), "41");
        let server = FakeServer::default();

        let receipt = publish_bundle(&server, &request(bundle.clone())).unwrap();
        assert_eq!(receipt.bundle_version, "41");
        assert!(!receipt.distribution_reused);
        assert_eq!(receipt.filter_query, "attribute.update_channel == \"stable\"");

        let st = server.state.lock().unwrap();
        assert_eq!(st.modules.len(), 1);
        let uploaded = &st.artifacts[&receipt.software_module_id];
        assert_eq!(uploaded.len(), 1);
        assert_eq!(uploaded[0].1, std::fs::read(&bundle).unwrap());
        assert_eq!(
            st.distributions[0].0.name,
            bundle.file_name().unwrap().to_string_lossy()
        );
        assert_eq!(st.distributions[0].1, vec![receipt.software_module_id]);
        assert_eq!(
            st.auto_assign[&receipt.target_filter_id],
            (receipt.distribution_set_id, "forced".to_owned())
        );
    }

    #[test]
    fn republish_reuses_module_and_filter_and_replaces_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = packaged(dir.path(), "42");
        let server = FakeServer::default();

        let first = publish_bundle(&server, &request(bundle.clone())).unwrap();
        let second = publish_bundle(&server, &request(bundle)).unwrap();

        assert_eq!(first.software_module_id, second.software_module_id);
        assert_eq!(first.target_filter_id, second.target_filter_id);
        assert_eq!(first.distribution_set_id, second.distribution_set_id);
        assert!(second.distribution_reused);

        let st = server.state.lock().unwrap();
        assert_eq!(st.modules.len(), 1);
        assert_eq!(st.filters.len(), 1);
        let artifacts = &st.artifacts[&first.software_module_id];
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].0.id, second.artifact_id);
    }

    #[test]
    fn explicit_distribution_name_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = packaged(dir.path(), "43");
        let server = FakeServer::default();
        let mut req = request(bundle);
        req.distribution = Some("fleet 43".into());

        publish_bundle(&server, &req).unwrap();
        assert_eq!(
            server.state.lock().unwrap().distributions[0].0.name,
            "fleet 43"
        );
    }

    #[test]
    fn non_bundle_is_rejected_before_contacting_server() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bundle");
        std::fs::write(&path, b"not a bundle").unwrap();
        let server = FakeServer::default();

        assert!(publish_bundle(&server, &request(path)).is_err());
        assert!(server.state.lock().unwrap().modules.is_empty());
    }

    #[test]
    fn quoted_channel_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::default();
        let mut req = request(dir.path().join("x.bundle"));
        req.channel = "a\" or \"b".into();
        assert!(matches!(
            publish_bundle(&server, &req),
            Err(RemoteError::Config(_))
        ));
    }

    #[test]
    fn polling_settings_are_pushed_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = packaged(dir.path(), "44");
        let server = FakeServer::default();
        let mut req = request(bundle);
        req.polling = Some(PollingSettings {
            polling_time: "00:01:00".into(),
            polling_overdue_time: "00:05:00".into(),
            target_token_auth: true,
        });

        let receipt = publish_bundle(&server, &req).unwrap();
        assert_eq!(receipt.rollout_id, None);
        let st = server.state.lock().unwrap();
        assert_eq!(st.config["pollingTime"], "00:01:00");
        assert_eq!(st.config["pollingOverdueTime"], "00:05:00");
        assert_eq!(st.config["authentication.targettoken.enabled"], true);
    }

    #[test]
    fn malformed_polling_settings_abort_publish() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = packaged(dir.path(), "45");
        let server = FakeServer::default();
        let mut req = request(bundle);
        req.polling = Some(PollingSettings {
            polling_time: "1m".into(),
            ..PollingSettings::default()
        });

        assert!(matches!(
            publish_bundle(&server, &req),
            Err(RemoteError::Config(_))
        ));
        let st = server.state.lock().unwrap();
        assert!(st.config.is_empty());
        assert!(st.modules.is_empty());
    }

    #[test]
    fn rollout_replaces_channel_rollout_and_autostarts() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = packaged(dir.path(), "46");
        let server = FakeServer::default();
        subscribe(&server, "dev-1", "stable");
        subscribe(&server, "dev-2", "stable");
        open_action(&server, "dev-1", 900, "pending");
        open_action(&server, "dev-2", 901, "finished");

        let stable = channel_filter_query("stable");
        let beta = channel_filter_query("beta");
        for (name, query) in [("stable-45.bundle", &stable), ("beta-3.bundle", &beta)] {
            server
                .create_rollout(&RolloutSpec {
                    name: name.into(),
                    distribution_id: 1,
                    target_filter_query: query.clone(),
                    action_type: "forced".into(),
                    start_at: None,
                })
                .unwrap();
        }

        let mut req = request(bundle);
        req.rollout = true;
        req.autostart = true;
        let receipt = publish_bundle(&server, &req).unwrap();

        let st = server.state.lock().unwrap();
        assert_eq!(st.cancelled, vec![("dev-1".to_owned(), 900)]);
        let names: Vec<&str> = st.rollouts.iter().map(|(r, _)| r.name.as_str()).collect();
        assert_eq!(names, vec!["beta-3.bundle", "stable-46.bundle"]);
        let (created, spec) = &st.rollouts[1];
        assert_eq!(receipt.rollout_id, Some(created.id));
        assert_eq!(spec.distribution_id, receipt.distribution_set_id);
        assert_eq!(spec.target_filter_query, stable);
        assert!(spec.start_at.is_some());
    }

    #[test]
    fn rollout_without_autostart_is_left_ready() {
        let server = FakeServer::default();
        subscribe(&server, "dev-1", "stable");
        let query = channel_filter_query("stable");

        let rollout = replace_rollout(&server, "stable-47.bundle", 3, &query, false)
            .unwrap()
            .unwrap();
        assert_eq!(rollout.status, "ready");
        assert_eq!(server.state.lock().unwrap().rollouts[0].1.start_at, None);
    }

    #[test]
    fn rollout_skipped_when_channel_has_no_devices() {
        let server = FakeServer::default();
        server
            .create_rollout(&RolloutSpec {
                name: "stable-1.bundle".into(),
                distribution_id: 1,
                target_filter_query: channel_filter_query("stable"),
                action_type: "forced".into(),
                start_at: None,
            })
            .unwrap();

        let created = replace_rollout(
            &server,
            "stable-2.bundle",
            2,
            &channel_filter_query("stable"),
            true,
        )
        .unwrap();
        assert_eq!(created, None);
        assert_eq!(server.state.lock().unwrap().rollouts.len(), 1);
    }
}
