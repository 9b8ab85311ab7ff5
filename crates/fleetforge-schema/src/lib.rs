//! Catalog parsing, component tables, resolved plans, and project configuration for Fleetforge.
//!
//! This crate defines the schema layer: flat version catalog files
//! (`VersionCatalog`), the declarative component table (`ComponentTable`),
//! fully resolved build plans (`ResolvedPlan`) with their deterministic
//! identity, and the project configuration file (`ProjectConfig`).

pub mod catalog;
pub mod components;
pub mod config;
pub mod plan;
pub mod types;

pub use catalog::{
    catalog_key_for, component_name_for_key, is_commit_id, load_catalog, parse_catalog_file,
    parse_catalog_str, CatalogError, ComponentSpec, RevisionPin, VersionCatalog, HEAD_SENTINEL,
};
pub use components::{
    load_component_table, parse_component_table_str, ComponentDef, ComponentTable,
    ComponentTableError, DEFAULT_ARTIFACT_TEMPLATE, DEFAULT_BRANCH,
};
pub use config::{
    load_project_config, parse_project_config_str, BuildSection, BundleSection, ConfigError,
    PathsSection, ProjectConfig, SigningSection, PROJECT_CONFIG_FILE,
};
pub use plan::{PinOrigin, PlanError, ResolvedComponent, ResolvedPlan, PLAN_VERSION};
pub use types::{BranchName, CatalogName, CommitId, ComponentName, PlanId};
