pub mod build;
pub mod keygen;
pub mod package;
pub mod publish;
pub mod resolve;
pub mod status;
pub mod verify;
pub mod verify_store;

use fleetforge_core::Pipeline;
use fleetforge_remote::{HawkbitClient, RolloutConfig};
use fleetforge_schema::{load_project_config, PlanId, ProjectConfig};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_PARTIAL_FAILURE: u8 = 4;
pub const EXIT_PACKAGING_ERROR: u8 = 5;
pub const EXIT_VERIFICATION_ERROR: u8 = 6;

/// Rollout server connection flags shared by `publish` and `status`.
#[derive(Debug, Clone, clap::Args)]
pub struct ServerArgs {
    /// Rollout server URL (overrides ~/.config/fleetforge/rollout.json).
    #[arg(long)]
    pub url: Option<String>,
    /// Management API user.
    #[arg(long, requires = "url")]
    pub user: Option<String>,
    /// Management API password.
    #[arg(long, requires = "url")]
    pub password: Option<String>,
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "succeeded" | "finished" => Style::new().green().apply_to(status).to_string(),
        "running" => Style::new().cyan().bold().apply_to(status).to_string(),
        "skipped" | "pending" => Style::new().yellow().apply_to(status).to_string(),
        "failed" | "error" | "canceled" => Style::new().red().bold().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

pub fn load_config(path: &Path) -> Result<ProjectConfig, String> {
    load_project_config(path).map_err(|e| format!("config error: {e}"))
}

pub fn open_pipeline(path: &Path) -> Result<Pipeline, String> {
    Pipeline::open(load_config(path)?).map_err(|e| e.to_string())
}

/// Plan ids are blake3 hex digests; anything else never names a plan file.
pub fn parse_plan_id(input: &str) -> Result<PlanId, String> {
    if input.is_empty() || !input.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("plan error: '{input}' is not a plan id"));
    }
    Ok(PlanId::new(input.to_ascii_lowercase()))
}

/// Connection flags override the saved rollout config entirely.
pub fn rollout_config(server: &ServerArgs) -> Result<RolloutConfig, String> {
    let config = if let Some(url) = server.url.as_deref() {
        let mut config = RolloutConfig::new(url);
        if let Some(user) = &server.user {
            config.username.clone_from(user);
        }
        if let Some(password) = &server.password {
            config.password.clone_from(password);
        }
        config
    } else {
        RolloutConfig::load_default().map_err(|e| format!("no --url and no rollout config: {e}"))?
    };
    Ok(config)
}

pub fn make_rollout_client(server: &ServerArgs) -> Result<HawkbitClient, String> {
    Ok(HawkbitClient::new(&rollout_config(server)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"plan_id": "abc"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"plan_id\""));
    }

    #[test]
    fn colorize_status_keeps_text() {
        for s in ["succeeded", "failed", "skipped", "running", "finished"] {
            assert!(colorize_status(s).contains(s));
        }
        assert_eq!(colorize_status("unknown"), "unknown");
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_CONFIG_ERROR,
            EXIT_STORE_ERROR,
            EXIT_PARTIAL_FAILURE,
            EXIT_PACKAGING_ERROR,
            EXIT_VERIFICATION_ERROR,
        ];
        let unique: std::collections::BTreeSet<u8> = codes.iter().copied().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn rollout_client_from_url() {
        let server = ServerArgs {
            url: Some("http://localhost:8080".to_owned()),
            user: Some("ci".to_owned()),
            password: None,
        };
        assert!(make_rollout_client(&server).is_ok());
        let config = rollout_config(&server).unwrap();
        assert_eq!(config.username, "ci");
        assert_eq!(config.polling, fleetforge_remote::PollingSettings::default());
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("fleetforge.toml")).unwrap();
        assert_eq!(config.paths.store, dir.path().join(".fleetforge"));
    }

    #[test]
    fn plan_id_must_be_hex() {
        assert!(parse_plan_id("../../etc/passwd").is_err());
        assert!(parse_plan_id("").is_err());
        assert_eq!(parse_plan_id("ABC123").unwrap().as_str(), "abc123");
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("resolving...");
        spin_ok(&pb, "done");
        let pb = spinner("building...");
        spin_fail(&pb, "failed");
    }
}
