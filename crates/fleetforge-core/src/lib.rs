//! Version resolution and build orchestration for Fleetforge.
//!
//! This crate ties the schema and store layers together: `VersionResolver`
//! turns a catalog plus overrides into a `ResolvedPlan`, `BuildGraph` orders
//! the plan into `BuildJob`s, and `BuildOrchestrator` runs one external
//! builder per job with failure fencing, cancellation, and provenance.
//! `Pipeline` is the facade the CLI drives.

pub mod builder;
pub mod concurrency;
pub mod graph;
pub mod job;
pub mod lifecycle;
pub mod orchestrator;
pub mod pipeline;
pub mod resolve;

pub use builder::{BuildJobError, BuildRequest, CommandBuilder, ComponentBuilder, BUILD_LOG};
pub use concurrency::{install_signal_handler, CancelToken, StoreLock};
pub use graph::{BuildGraph, CycleError, GraphError, Selection};
pub use job::{BuildJob, JobStatus};
pub use lifecycle::validate_transition;
pub use orchestrator::{
    BuildOrchestrator, BuildReport, FailedComponent, JobOutcome, PipelineStatus,
};
pub use pipeline::{default_builder_identity, Pipeline};
pub use resolve::{BranchTipSource, GitRemoteTips, Overrides, ResolutionError, VersionResolver};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(#[from] fleetforge_schema::ConfigError),
    #[error("component table error: {0}")]
    ComponentTable(#[from] fleetforge_schema::ComponentTableError),
    #[error("plan error: {0}")]
    Plan(#[from] fleetforge_schema::PlanError),
    #[error("store error: {0}")]
    Store(#[from] fleetforge_store::StoreError),
    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("store at {0} is locked by another pipeline")]
    StoreBusy(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<fleetforge_schema::CatalogError> for CoreError {
    fn from(e: fleetforge_schema::CatalogError) -> Self {
        CoreError::Resolution(ResolutionError::Catalog(e))
    }
}
