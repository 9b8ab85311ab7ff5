use crate::builder::ComponentBuilder;
use crate::concurrency::{CancelToken, StoreLock};
use crate::graph::{BuildGraph, Selection};
use crate::job::BuildJob;
use crate::orchestrator::{BuildOrchestrator, BuildReport};
use crate::resolve::{BranchTipSource, Overrides, VersionResolver};
use crate::CoreError;
use fleetforge_schema::{
    load_catalog, load_component_table, ComponentTable, PlanId, ProjectConfig, ResolvedPlan,
    VersionCatalog,
};
use fleetforge_store::{
    verify_store_integrity, ArtifactLayout, ArtifactStore, IntegrityReport, StoreError,
};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Entry point tying a project configuration to its component table and store.
///
/// Opening a pipeline validates the component table and its dependency graph
/// up front, so every later operation works on a known-good DAG.
pub struct Pipeline {
    config: ProjectConfig,
    table: ComponentTable,
    graph: BuildGraph,
    store: ArtifactStore,
}

impl Pipeline {
    pub fn open(config: ProjectConfig) -> Result<Self, CoreError> {
        let table = load_component_table(&config.paths.components)?;
        let graph = BuildGraph::from_table(&table)?;
        let layout = ArtifactLayout::new(&config.paths.store);
        layout.initialize()?;
        debug!(
            "opened pipeline: {} component(s), store {}",
            table.components.len(),
            layout.root().display()
        );
        Ok(Self {
            config,
            table,
            graph,
            store: ArtifactStore::new(layout),
        })
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn table(&self) -> &ComponentTable {
        &self.table
    }

    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn layout(&self) -> &ArtifactLayout {
        self.store.layout()
    }

    pub fn load_catalog(&self, name: &str) -> Result<VersionCatalog, CoreError> {
        let catalog = load_catalog(&self.config.paths.catalogs, name)?;
        self.table
            .check_catalog(&catalog)
            .map_err(|e| CoreError::Resolution(e.into()))?;
        Ok(catalog)
    }

    /// Resolve `catalog` and persist the plan under `plans/<plan_id>.toml`.
    pub fn resolve(
        &self,
        catalog: &VersionCatalog,
        overrides: &Overrides,
        tips: &dyn BranchTipSource,
    ) -> Result<(ResolvedPlan, PathBuf), CoreError> {
        let plan = VersionResolver::new(&self.table, tips).resolve(catalog, overrides)?;
        let path = self.layout().plan_path(&plan.plan_id);
        plan.write_to_file(&path)?;
        info!(
            "resolved catalog '{}' to plan {}",
            plan.catalog,
            plan.plan_id.short()
        );
        Ok((plan, path))
    }

    pub fn load_plan(&self, plan_id: &PlanId) -> Result<ResolvedPlan, CoreError> {
        Ok(ResolvedPlan::read_from_file(self.layout().plan_path(plan_id))?)
    }

    /// Order the jobs for one run. Scoped selections stop at dependencies whose
    /// artifact for the planned revision already exists.
    pub fn plan_jobs(
        &self,
        plan: &ResolvedPlan,
        selection: &Selection,
    ) -> Result<Vec<BuildJob>, CoreError> {
        let is_built = |c: &fleetforge_schema::ResolvedComponent| {
            self.table
                .get(&c.name)
                .is_some_and(|def| self.store.is_built(&def.artifact_path(&c.commit)))
        };
        Ok(self.graph.order(plan, selection, &is_built)?)
    }

    /// Build `selection` from `plan` while holding the store lock.
    ///
    /// Returns the report and the path it was written to. Job failures are
    /// reported in the returned report, not as an error.
    pub fn build(
        &self,
        plan: &ResolvedPlan,
        selection: &Selection,
        builder: &dyn ComponentBuilder,
        cancel: CancelToken,
    ) -> Result<(BuildReport, PathBuf), CoreError> {
        let lock_path = self.layout().lock_file();
        let _lock = StoreLock::try_acquire(&lock_path)?
            .ok_or_else(|| CoreError::StoreBusy(self.layout().root().display().to_string()))?;

        let stale = self.store.clean_staging()?;
        if stale > 0 {
            warn!("removed {stale} stale staging entries from an interrupted run");
        }

        let jobs = self.plan_jobs(plan, selection)?;
        let report = BuildOrchestrator::new(&self.store, &self.table, plan, builder)
            .with_jobs(self.config.build.jobs)
            .with_cancel(cancel)
            .execute(jobs)?;
        let path = report.write_to(&self.layout().reports_dir())?;
        debug!("build report written to {}", path.display());
        Ok((report, path))
    }

    /// Artifact directory of `component` at the revision recorded in `plan`.
    pub fn artifact_dir(
        &self,
        plan: &ResolvedPlan,
        component: &str,
    ) -> Result<PathBuf, CoreError> {
        let entry = plan
            .get(component)
            .ok_or_else(|| crate::GraphError::NotInPlan(component.to_owned()))?;
        let def = self
            .table
            .get(component)
            .ok_or_else(|| crate::GraphError::UnknownComponent(component.to_owned()))?;
        let relative = def.artifact_path(&entry.commit);
        let dir = self.layout().artifact_dir(&relative)?;
        if !self.store.is_built(&relative) {
            return Err(StoreError::ArtifactNotFound(dir).into());
        }
        Ok(dir)
    }

    pub fn verify_store(&self) -> Result<IntegrityReport, CoreError> {
        Ok(verify_store_integrity(self.layout())?)
    }
}

/// Provenance identity for builds run from this machine: `user@host`.
pub fn default_builder_identity() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_owned());
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_owned())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned());
    format!("{user}@{host}")
}
