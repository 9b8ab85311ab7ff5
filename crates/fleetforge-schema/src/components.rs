//! Declarative component table: what to build, how, and in which order.
//!
//! Adding a component to the image is a data change in `components.toml`:
//!
//! ```toml
//! [[component]]
//! name = "kernel"
//! repo = "https://git.example.com/kernel.git"
//! builder = ["./build/kernel.sh", "{revision}", "{output}"]
//! depends_on = ["bootloader"]
//! ```

use crate::catalog::VersionCatalog;
use crate::types::{BranchName, CommitId, ComponentName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_ARTIFACT_TEMPLATE: &str = "{component}/{revision}";

const COMPONENT_PLACEHOLDER: &str = "{component}";
const REVISION_PLACEHOLDER: &str = "{revision}";
const BRANCH_PLACEHOLDER: &str = "{branch}";
const OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Debug, Error)]
pub enum ComponentTableError {
    #[error("failed to read component table: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse component table: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("component table declares no components")]
    Empty,
    #[error("invalid component name '{0}' (expected lowercase letters, digits, '-')")]
    InvalidName(String),
    #[error("duplicate component '{0}'")]
    Duplicate(String),
    #[error("component '{0}' has an empty builder command")]
    EmptyBuilder(String),
    #[error("component '{0}' has an empty repo")]
    EmptyRepo(String),
    #[error("component '{0}' depends on itself")]
    SelfDependency(String),
    #[error(
        "component '{component}': artifact template '{template}' must contain {{component}} and {{revision}} once each, separated by a non-hex character such as '/'"
    )]
    ArtifactTemplate { component: String, template: String },
    #[error(
        "component '{component}': artifact template '{template}' must be a relative path without '..'"
    )]
    ArtifactEscape { component: String, template: String },
    #[error("catalog '{catalog}' pins unknown component '{component}'")]
    UnknownCatalogComponent { catalog: String, component: String },
    #[error("catalog '{catalog}' has no pin for component '{component}'")]
    UnpinnedComponent { catalog: String, component: String },
}

fn default_branch() -> BranchName {
    BranchName::new(DEFAULT_BRANCH)
}

fn default_artifact() -> String {
    DEFAULT_ARTIFACT_TEMPLATE.to_owned()
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ComponentDef {
    pub name: ComponentName,
    /// Source repository queried for branch tips.
    pub repo: String,
    /// Branch tracked when the catalog does not declare one.
    #[serde(default = "default_branch")]
    pub branch: BranchName,
    /// Builder argv. `{component}`, `{revision}`, `{branch}` and `{output}`
    /// are substituted per job.
    pub builder: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<ComponentName>,
    /// Artifact directory relative to the store's artifact root.
    #[serde(default = "default_artifact")]
    pub artifact: String,
}

impl ComponentDef {
    /// Relative artifact directory for one resolved revision of this component.
    pub fn artifact_path(&self, revision: &CommitId) -> PathBuf {
        PathBuf::from(
            self.artifact
                .replace(COMPONENT_PLACEHOLDER, &self.name)
                .replace(REVISION_PLACEHOLDER, revision),
        )
    }

    /// Concrete builder argv for one job.
    pub fn builder_argv(
        &self,
        revision: &CommitId,
        branch: &BranchName,
        output: &Path,
    ) -> Vec<String> {
        let output = output.to_string_lossy();
        self.builder
            .iter()
            .map(|arg| {
                arg.replace(COMPONENT_PLACEHOLDER, &self.name)
                    .replace(REVISION_PLACEHOLDER, revision)
                    .replace(BRANCH_PLACEHOLDER, branch)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ComponentTableError> {
        let name = self.name.to_string();
        if !self.name.is_valid() {
            return Err(ComponentTableError::InvalidName(name));
        }
        if self.builder.is_empty() || self.builder[0].trim().is_empty() {
            return Err(ComponentTableError::EmptyBuilder(name));
        }
        if self.repo.trim().is_empty() {
            return Err(ComponentTableError::EmptyRepo(name));
        }
        if self.depends_on.contains(&self.name) {
            return Err(ComponentTableError::SelfDependency(name));
        }
        // Partitioning by component and revision is enforced here, by construction.
        if !separates_placeholders(&self.artifact) {
            return Err(ComponentTableError::ArtifactTemplate {
                component: name,
                template: self.artifact.clone(),
            });
        }
        let sample = self.artifact_path(&CommitId::new("0000000"));
        let contained = sample.components().next().is_some()
            && sample.components().all(|c| matches!(c, Component::Normal(_)));
        if !contained {
            return Err(ComponentTableError::ArtifactEscape {
                component: name,
                template: self.artifact.clone(),
            });
        }
        Ok(())
    }
}

/// Revisions are hex, so a non-hex character between the two placeholders
/// keeps every (component, revision) pair on its own path.
fn separates_placeholders(template: &str) -> bool {
    if template.matches(COMPONENT_PLACEHOLDER).count() != 1
        || template.matches(REVISION_PLACEHOLDER).count() != 1
    {
        return false;
    }
    let (Some(c), Some(r)) = (
        template.find(COMPONENT_PLACEHOLDER),
        template.find(REVISION_PLACEHOLDER),
    ) else {
        return false;
    };
    let between = if c < r {
        &template[c + COMPONENT_PLACEHOLDER.len()..r]
    } else {
        &template[r + REVISION_PLACEHOLDER.len()..c]
    };
    between.chars().any(|ch| !ch.is_ascii_hexdigit())
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ComponentTable {
    #[serde(rename = "component", default)]
    pub components: Vec<ComponentDef>,
}

impl ComponentTable {
    pub fn validate(&self) -> Result<(), ComponentTableError> {
        if self.components.is_empty() {
            return Err(ComponentTableError::Empty);
        }
        let mut seen = BTreeSet::new();
        for def in &self.components {
            def.validate()?;
            if !seen.insert(def.name.as_str()) {
                return Err(ComponentTableError::Duplicate(def.name.to_string()));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ComponentDef> {
        self.components.iter().find(|c| c.name == *name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &ComponentName> {
        self.components.iter().map(|c| &c.name)
    }

    /// Check that a catalog pins exactly the components this table declares.
    pub fn check_catalog(&self, catalog: &VersionCatalog) -> Result<(), ComponentTableError> {
        for entry in catalog.entries() {
            if !self.contains(&entry.name) {
                return Err(ComponentTableError::UnknownCatalogComponent {
                    catalog: catalog.name().to_string(),
                    component: entry.name.to_string(),
                });
            }
        }
        for def in &self.components {
            if catalog.get(&def.name).is_none() {
                return Err(ComponentTableError::UnpinnedComponent {
                    catalog: catalog.name().to_string(),
                    component: def.name.to_string(),
                });
            }
        }
        Ok(())
    }
}

pub fn parse_component_table_str(content: &str) -> Result<ComponentTable, ComponentTableError> {
    let table: ComponentTable = toml::from_str(content)?;
    table.validate()?;
    Ok(table)
}

pub fn load_component_table(path: &Path) -> Result<ComponentTable, ComponentTableError> {
    let content = fs::read_to_string(path)?;
    parse_component_table_str(&content)
}
