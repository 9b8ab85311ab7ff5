use fleetforge_bundle::is_valid_label;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_AGENT_CONFIG: &str = "/etc/fleetforge/agent.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read agent config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse agent config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid channel name '{0}'")]
    InvalidChannel(String),
    #[error("invalid variant '{0}'")]
    InvalidVariant(String),
    #[error("install.command must not be empty")]
    EmptyInstallCommand,
    #[error("install.confirm must not be empty when set")]
    EmptyConfirmCommand,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// How the device came up. Recovery boots never auto-update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    #[default]
    Normal,
    Recovery,
}

/// Agent configuration, generated on the device and re-read at every start.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub boot_mode: BootMode,
    pub channel: String,
    /// Base URL (`http://`, `https://`) or local directory holding channels.
    pub source: String,
    /// Bundles built for another variant are rejected when set.
    #[serde(default)]
    pub variant: Option<String>,
    pub keyring_dir: PathBuf,
    pub state_dir: PathBuf,
    #[serde(default)]
    pub incident_dir: Option<PathBuf>,
    #[serde(default)]
    pub heartbeat_path: Option<PathBuf>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    pub install: InstallSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InstallSection {
    /// Slot installer argv. Placeholders: `{bundle_dir}`, `{rootfs}`,
    /// `{hook}`, `{version}`, `{variant}`.
    pub command: Vec<String>,
    /// Run after a successful boot into the new slot to mark it good.
    #[serde(default)]
    pub confirm: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,
    #[serde(default = "default_watchdog")]
    pub watchdog_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            window_secs: default_window(),
            backoff_secs: default_backoff(),
            watchdog_secs: default_watchdog(),
        }
    }
}

fn default_poll_interval() -> u64 {
    300
}

fn default_max_restarts() -> u32 {
    5
}

fn default_window() -> u64 {
    600
}

fn default_backoff() -> u64 {
    2
}

fn default_watchdog() -> u64 {
    60
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_label(&self.channel) {
            return Err(ConfigError::InvalidChannel(self.channel.clone()));
        }
        if let Some(variant) = &self.variant {
            if !is_valid_label(variant) {
                return Err(ConfigError::InvalidVariant(variant.clone()));
            }
        }
        if self.install.command.is_empty() {
            return Err(ConfigError::EmptyInstallCommand);
        }
        if matches!(&self.install.confirm, Some(c) if c.is_empty()) {
            return Err(ConfigError::EmptyConfirmCommand);
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Zero("poll_interval_secs"));
        }
        if self.supervisor.window_secs == 0 {
            return Err(ConfigError::Zero("supervisor.window_secs"));
        }
        if self.supervisor.watchdog_secs == 0 {
            return Err(ConfigError::Zero("supervisor.watchdog_secs"));
        }
        Ok(())
    }

    /// Rebase every relative path onto `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        rebase(&mut self.keyring_dir);
        rebase(&mut self.state_dir);
        if let Some(dir) = self.incident_dir.as_mut() {
            rebase(dir);
        }
        if let Some(path) = self.heartbeat_path.as_mut() {
            rebase(path);
        }
        if !self.is_remote_source() {
            let mut source = PathBuf::from(&self.source);
            rebase(&mut source);
            self.source = source.to_string_lossy().into_owned();
        }
    }

    pub fn is_remote_source(&self) -> bool {
        is_url(&self.source)
    }

    pub fn incident_dir(&self) -> PathBuf {
        self.incident_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("incidents"))
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.heartbeat_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("heartbeat"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

pub(crate) fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

pub fn parse_agent_config_str(content: &str) -> Result<AgentConfig, ConfigError> {
    let config: AgentConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Load and validate `path`. Relative paths resolve against its directory.
pub fn load_agent_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = parse_agent_config_str(&content)?;
    let base = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    config.resolve_paths(&base);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
channel = "stable"
source = "https://updates.example.com/fleet"
keyring_dir = "/etc/fleetforge/keys"
state_dir = "/var/lib/fleetforge-agent"

[install]
command = ["rauc", "install", "{bundle_dir}/{rootfs}"]
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_agent_config_str(MINIMAL).unwrap();
        assert_eq!(config.boot_mode, BootMode::Normal);
        assert_eq!(config.poll_interval_secs, 300);
        assert_eq!(config.supervisor, SupervisorSection::default());
        assert_eq!(
            config.incident_dir(),
            PathBuf::from("/var/lib/fleetforge-agent/incidents")
        );
        assert!(config.is_remote_source());
    }

    #[test]
    fn recovery_mode_parses() {
        let config =
            parse_agent_config_str(&format!("boot_mode = \"recovery\"\n{MINIMAL}")).unwrap();
        assert_eq!(config.boot_mode, BootMode::Recovery);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(matches!(
            parse_agent_config_str(&format!("retries = 3\n{MINIMAL}")),
            Err(ConfigError::ParseToml(_))
        ));
    }

    #[test]
    fn empty_install_command_rejected() {
        let content = MINIMAL.replace(
            r#"command = ["rauc", "install", "{bundle_dir}/{rootfs}"]"#,
            "command = []",
        );
        assert!(matches!(
            parse_agent_config_str(&content),
            Err(ConfigError::EmptyInstallCommand)
        ));
    }

    #[test]
    fn zero_watchdog_rejected() {
        let content = format!("{MINIMAL}\n[supervisor]\nwatchdog_secs = 0\n");
        assert!(matches!(
            parse_agent_config_str(&content),
            Err(ConfigError::Zero("supervisor.watchdog_secs"))
        ));
    }

    #[test]
    fn bad_channel_rejected() {
        let content = MINIMAL.replace("\"stable\"", "\"../stable\"");
        assert!(matches!(
            parse_agent_config_str(&content),
            Err(ConfigError::InvalidChannel(_))
        ));
    }

    #[test]
    fn relative_paths_resolved_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        fs::write(
            &path,
            r#"
channel = "beta"
source = "channels"
keyring_dir = "keys"
state_dir = "/var/lib/agent"
heartbeat_path = "run/heartbeat"

[install]
command = ["true"]
"#,
        )
        .unwrap();
        let config = load_agent_config(&path).unwrap();
        assert_eq!(config.keyring_dir, dir.path().join("keys"));
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/agent"));
        assert_eq!(config.heartbeat_path(), dir.path().join("run/heartbeat"));
        assert_eq!(PathBuf::from(&config.source), dir.path().join("channels"));
        assert!(!config.is_remote_source());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_agent_config(&dir.path().join("agent.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
