use crate::types::ComponentName;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PROJECT_CONFIG_FILE: &str = "fleetforge.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read project config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse project config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("build.jobs must be at least 1")]
    ZeroJobs,
    #[error("bundle.variant must not be empty")]
    EmptyVariant,
}

/// Project configuration loaded from `fleetforge.toml`.
///
/// Every section is optional. Relative paths are resolved against the
/// directory containing the config file by [`load_project_config`].
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub signing: SigningSection,
    #[serde(default)]
    pub bundle: BundleSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PathsSection {
    #[serde(default = "default_components")]
    pub components: PathBuf,
    #[serde(default = "default_catalogs")]
    pub catalogs: PathBuf,
    #[serde(default = "default_store")]
    pub store: PathBuf,
    #[serde(default = "default_bundles")]
    pub bundles: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            components: default_components(),
            catalogs: default_catalogs(),
            store: default_store(),
            bundles: default_bundles(),
        }
    }
}

fn default_components() -> PathBuf {
    PathBuf::from("components.toml")
}

fn default_catalogs() -> PathBuf {
    PathBuf::from("catalogs")
}

fn default_store() -> PathBuf {
    PathBuf::from(".fleetforge")
}

fn default_bundles() -> PathBuf {
    PathBuf::from("bundles")
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
    /// Maximum number of builder processes running at once.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// Identity recorded in provenance; defaults to user@host.
    #[serde(default)]
    pub builder_identity: Option<String>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            builder_identity: None,
        }
    }
}

fn default_jobs() -> usize {
    2
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SigningSection {
    #[serde(default)]
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub cert: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BundleSection {
    /// Component whose artifact is the root filesystem.
    #[serde(default)]
    pub rootfs_component: Option<ComponentName>,
    /// Post-install hook script shipped as its own slot.
    #[serde(default)]
    pub hook: Option<PathBuf>,
    #[serde(default)]
    pub variant: Option<String>,
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build.jobs == 0 {
            return Err(ConfigError::ZeroJobs);
        }
        if matches!(&self.bundle.variant, Some(v) if v.trim().is_empty()) {
            return Err(ConfigError::EmptyVariant);
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
        rebase(&mut self.paths.components);
        rebase(&mut self.paths.catalogs);
        rebase(&mut self.paths.store);
        rebase(&mut self.paths.bundles);
        if let Some(key) = self.signing.key.as_mut() {
            rebase(key);
        }
        if let Some(cert) = self.signing.cert.as_mut() {
            rebase(cert);
        }
        if let Some(hook) = self.bundle.hook.as_mut() {
            rebase(hook);
        }
    }
}

pub fn parse_project_config_str(content: &str) -> Result<ProjectConfig, ConfigError> {
    let config: ProjectConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Load `path`, or fall back to defaults when the file does not exist.
/// Paths are resolved against the config file's directory either way.
pub fn load_project_config(path: &Path) -> Result<ProjectConfig, ConfigError> {
    let mut config = if path.exists() {
        parse_project_config_str(&fs::read_to_string(path)?)?
    } else {
        ProjectConfig::default()
    };
    let base = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    config.resolve_paths(&base);
    Ok(config)
}
