use crate::RemoteError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Connection settings for the rollout server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutConfig {
    pub url: String,
    #[serde(default = "default_user")]
    pub username: String,
    #[serde(default = "default_user")]
    pub password: String,
    /// hawkBit type key for created software modules and distribution sets.
    #[serde(default = "default_type")]
    pub module_type: String,
    /// Tenant settings applied on every publish.
    #[serde(default)]
    pub polling: PollingSettings,
}

/// How often devices poll the server, and whether they authenticate with
/// their per-target token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingSettings {
    /// `HH:MM:SS`.
    #[serde(default = "default_polling_time")]
    pub polling_time: String,
    /// `HH:MM:SS` after which a silent device is reported overdue.
    #[serde(default = "default_polling_overdue_time")]
    pub polling_overdue_time: String,
    #[serde(default = "default_true")]
    pub target_token_auth: bool,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            polling_time: default_polling_time(),
            polling_overdue_time: default_polling_overdue_time(),
            target_token_auth: true,
        }
    }
}

impl PollingSettings {
    pub fn validate(&self) -> Result<(), RemoteError> {
        for (key, value) in [
            ("polling_time", &self.polling_time),
            ("polling_overdue_time", &self.polling_overdue_time),
        ] {
            if !is_hms(value) {
                return Err(RemoteError::Config(format!(
                    "{key} must be HH:MM:SS, got '{value}'"
                )));
            }
        }
        Ok(())
    }
}

fn is_hms(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.bytes().all(|b| b.is_ascii_digit()))
        && parts[1] < "60"
        && parts[2] < "60"
}

fn default_polling_time() -> String {
    "00:00:30".to_owned()
}

fn default_polling_overdue_time() -> String {
    "00:03:00".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_user() -> String {
    "admin".to_owned()
}

fn default_type() -> String {
    "os".to_owned()
}

impl RolloutConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_owned(),
            username: default_user(),
            password: default_user(),
            module_type: default_type(),
            polling: PollingSettings::default(),
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_owned();
        self.password = password.to_owned();
        self
    }

    /// Load config from `~/.config/fleetforge/rollout.json`.
    pub fn load_default() -> Result<Self, RemoteError> {
        Self::load(&default_config_path()?)
    }

    pub fn load(path: &Path) -> Result<Self, RemoteError> {
        let content = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| RemoteError::Config(format!("invalid rollout config: {e}")))?;
        config.url = config.url.trim_end_matches('/').to_owned();
        config.polling.validate()?;
        Ok(config)
    }

    /// Write the config readable by the owner only; it holds a password.
    pub fn save(&self, path: &Path) -> Result<(), RemoteError> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| RemoteError::Serialization(e.to_string()))?;
        fs::write(path, content)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
}

pub fn default_config_path() -> Result<PathBuf, RemoteError> {
    let home = std::env::var("HOME").map_err(|_| RemoteError::Config("HOME not set".to_owned()))?;
    Ok(PathBuf::from(home).join(".config/fleetforge/rollout.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout.json");

        let config =
            RolloutConfig::new("https://hawkbit.example.com:8443/").with_credentials("ci", "s3cret");
        config.save(&path).unwrap();

        let loaded = RolloutConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.url, "https://hawkbit.example.com:8443");
    }

    #[test]
    fn saved_config_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout.json");
        RolloutConfig::new("http://h").save(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout.json");
        fs::write(&path, r#"{"url": "http://h:8080/"}"#).unwrap();
        let config = RolloutConfig::load(&path).unwrap();
        assert_eq!(config.url, "http://h:8080");
        assert_eq!(config.username, "admin");
        assert_eq!(config.module_type, "os");
        assert_eq!(config.polling, PollingSettings::default());
    }

    #[test]
    fn malformed_polling_time_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout.json");
        fs::write(
            &path,
            r#"{"url": "http://h", "polling": {"polling_time": "30s"}}"#,
        )
        .unwrap();
        match RolloutConfig::load(&path) {
            Err(RemoteError::Config(msg)) => assert!(msg.contains("polling_time"), "{msg}"),
            other => panic!("unexpected: {other:?}"),
        }
        let overdue = PollingSettings {
            polling_overdue_time: "00:61:00".into(),
            ..PollingSettings::default()
        };
        assert!(overdue.validate().is_err());
    }

    #[test]
    fn invalid_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            RolloutConfig::load(&path),
            Err(RemoteError::Config(_))
        ));
    }
}
