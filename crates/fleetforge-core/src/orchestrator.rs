//! Parallel execution of ordered build jobs with failure fencing.
//!
//! The orchestrator owns every [`BuildJob`] for the duration of a run. A job
//! starts once all of its in-run dependencies have succeeded; a failed job
//! skips only its transitive dependents. Each job builds into a private
//! staging directory that is promoted to the per-revision artifact path only
//! after its provenance record has been written, so a failing or cancelled
//! job cannot touch any other build's output.

use crate::builder::{BuildJobError, BuildRequest, ComponentBuilder, BUILD_LOG};
use crate::concurrency::CancelToken;
use crate::job::{BuildJob, JobStatus};
use crate::CoreError;
use fleetforge_schema::{
    CatalogName, CommitId, ComponentName, ComponentTable, PlanId, ResolvedPlan,
};
use fleetforge_store::{write_provenance, ArtifactStore, ProvenanceRecord, PROVENANCE_FILE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedComponent {
    pub component: ComponentName,
    pub revision: CommitId,
}

impl fmt::Display for FailedComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.component, self.revision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PipelineStatus {
    Succeeded,
    PartialFailure { failed: Vec<FailedComponent> },
    Cancelled,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Succeeded => write!(f, "succeeded"),
            PipelineStatus::PartialFailure { failed } => {
                let names: Vec<String> = failed.iter().map(ToString::to_string).collect();
                write!(f, "partial failure: {}", names.join(", "))
            }
            PipelineStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final state of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub component: ComponentName,
    pub revision: CommitId,
    pub symbolic: bool,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<PathBuf>,
}

impl JobOutcome {
    fn skipped(job: &BuildJob, detail: String) -> Self {
        Self {
            component: job.component.clone(),
            revision: job.revision.clone(),
            symbolic: job.symbolic,
            status: JobStatus::Skipped,
            detail: Some(detail),
            duration_ms: 0,
            artifact: None,
            provenance: None,
            log: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub plan_id: PlanId,
    pub catalog: CatalogName,
    pub started_at: String,
    pub finished_at: String,
    pub status: PipelineStatus,
    /// One entry per job, in build order.
    pub jobs: Vec<JobOutcome>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }

    pub fn outcome(&self, component: &str) -> Option<&JobOutcome> {
        self.jobs.iter().find(|j| j.component == *component)
    }

    /// Persist as `<dir>/<plan_id>-<timestamp>.json`.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, CoreError> {
        fs::create_dir_all(dir)?;
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let dest = dir.join(format!("{}-{stamp}.json", self.plan_id));
        let content = serde_json::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| CoreError::Io(e.error))?;
        Ok(dest)
    }
}

struct JobResult {
    status: JobStatus,
    detail: Option<String>,
    duration_ms: u64,
    artifact: Option<PathBuf>,
    log: Option<PathBuf>,
}

struct JobFailure {
    detail: String,
    log: Option<PathBuf>,
}

impl JobFailure {
    fn new(detail: impl fmt::Display) -> Self {
        Self {
            detail: detail.to_string(),
            log: None,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// A build must leave something besides its own log in the output directory.
fn ensure_output(dir: &Path) -> Result<(), BuildJobError> {
    for entry in fs::read_dir(dir)? {
        if entry?.file_name() != BUILD_LOG {
            return Ok(());
        }
    }
    Err(BuildJobError::EmptyOutput)
}

pub struct BuildOrchestrator<'a> {
    store: &'a ArtifactStore,
    table: &'a ComponentTable,
    plan: &'a ResolvedPlan,
    builder: &'a dyn ComponentBuilder,
    jobs: usize,
    cancel: CancelToken,
}

impl<'a> BuildOrchestrator<'a> {
    pub fn new(
        store: &'a ArtifactStore,
        table: &'a ComponentTable,
        plan: &'a ResolvedPlan,
        builder: &'a dyn ComponentBuilder,
    ) -> Self {
        Self {
            store,
            table,
            plan,
            builder,
            jobs: 1,
            cancel: CancelToken::new(),
        }
    }

    /// Maximum number of builds running at once (at least one).
    #[must_use]
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `jobs`, which must be in dependency order as produced by `BuildGraph::order`.
    pub fn execute(&self, mut jobs: Vec<BuildJob>) -> Result<BuildReport, CoreError> {
        let started_at = chrono::Utc::now().to_rfc3339();
        info!(
            "executing {} build job(s) for plan {} ({} parallel)",
            jobs.len(),
            self.plan.plan_id.short(),
            self.jobs
        );

        let index: HashMap<ComponentName, usize> = jobs
            .iter()
            .enumerate()
            .map(|(i, j)| (j.component.clone(), i))
            .collect();
        let mut outcomes: Vec<Option<JobOutcome>> = vec![None; jobs.len()];
        let (tx, rx) = mpsc::channel::<(usize, JobResult)>();

        std::thread::scope(|scope| -> Result<(), CoreError> {
            let mut running = 0usize;
            loop {
                let cancelled = self.cancel.is_cancelled();
                for i in 0..jobs.len() {
                    if jobs[i].status != JobStatus::Pending {
                        continue;
                    }
                    let reason = if cancelled {
                        Some("cancelled".to_owned())
                    } else {
                        jobs[i]
                            .depends_on
                            .iter()
                            .filter_map(|d| index.get(d).map(|&k| &jobs[k]))
                            .find(|dep| {
                                matches!(dep.status, JobStatus::Failed | JobStatus::Skipped)
                            })
                            .map(|dep| format!("dependency {dep} did not build"))
                    };
                    if let Some(reason) = reason {
                        debug!("skipping {}: {reason}", jobs[i]);
                        jobs[i].transition(JobStatus::Skipped)?;
                        outcomes[i] = Some(JobOutcome::skipped(&jobs[i], reason));
                    }
                }

                for i in 0..jobs.len() {
                    if cancelled || running >= self.jobs {
                        break;
                    }
                    let ready = jobs[i].status == JobStatus::Pending
                        && jobs[i].depends_on.iter().all(|d| {
                            index
                                .get(d)
                                .map_or(true, |&k| jobs[k].status == JobStatus::Succeeded)
                        });
                    if !ready {
                        continue;
                    }
                    jobs[i].transition(JobStatus::Running)?;
                    running += 1;
                    let job = jobs[i].clone();
                    let tx = tx.clone();
                    scope.spawn(move || {
                        let result = self.run_job(&job);
                        let _ = tx.send((i, result));
                    });
                }

                if running == 0 {
                    break;
                }
                let (i, result) = rx.recv().map_err(|e| {
                    CoreError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
                })?;
                running -= 1;
                jobs[i].transition(result.status)?;
                let provenance = result.artifact.as_ref().map(|a| a.join(PROVENANCE_FILE));
                outcomes[i] = Some(JobOutcome {
                    component: jobs[i].component.clone(),
                    revision: jobs[i].revision.clone(),
                    symbolic: jobs[i].symbolic,
                    status: result.status,
                    detail: result.detail,
                    duration_ms: result.duration_ms,
                    artifact: result.artifact,
                    provenance,
                    log: result.log,
                });
            }
            Ok(())
        })?;

        let outcomes: Vec<JobOutcome> = outcomes
            .into_iter()
            .zip(&jobs)
            .map(|(o, job)| {
                o.unwrap_or_else(|| JobOutcome::skipped(job, "not scheduled".to_owned()))
            })
            .collect();

        let failed: Vec<FailedComponent> = outcomes
            .iter()
            .filter(|o| o.status == JobStatus::Failed)
            .map(|o| FailedComponent {
                component: o.component.clone(),
                revision: o.revision.clone(),
            })
            .collect();
        let status = if self.cancel.is_cancelled() {
            PipelineStatus::Cancelled
        } else if failed.is_empty() {
            PipelineStatus::Succeeded
        } else {
            PipelineStatus::PartialFailure { failed }
        };
        info!("build finished: {status}");

        Ok(BuildReport {
            plan_id: self.plan.plan_id.clone(),
            catalog: self.plan.catalog.clone(),
            started_at,
            finished_at: chrono::Utc::now().to_rfc3339(),
            status,
            jobs: outcomes,
        })
    }

    fn run_job(&self, job: &BuildJob) -> JobResult {
        let started = Instant::now();
        info!("building {job}");
        match self.build_one(job, started) {
            Ok(artifact) => {
                let duration_ms = elapsed_ms(started);
                info!("built {job} in {duration_ms} ms");
                let log = artifact.join(BUILD_LOG);
                JobResult {
                    status: JobStatus::Succeeded,
                    detail: None,
                    duration_ms,
                    log: log.is_file().then_some(log),
                    artifact: Some(artifact),
                }
            }
            Err(failure) => {
                warn!("{job} failed: {}", failure.detail);
                JobResult {
                    status: JobStatus::Failed,
                    detail: Some(failure.detail),
                    duration_ms: elapsed_ms(started),
                    artifact: None,
                    log: failure.log,
                }
            }
        }
    }

    fn build_one(&self, job: &BuildJob, started: Instant) -> Result<PathBuf, JobFailure> {
        let def = self.table.get(&job.component).ok_or_else(|| {
            JobFailure::new(format!("component '{}' is not in the table", job.component))
        })?;
        let staging = self
            .store
            .begin_staging(&job.component, &job.revision)
            .map_err(JobFailure::new)?;
        let log_path = staging.path().join(BUILD_LOG);

        let request = BuildRequest {
            job,
            def,
            output_dir: staging.path(),
            log_path: &log_path,
        };
        let built = self
            .builder
            .build(&request, &self.cancel)
            .and_then(|()| ensure_output(staging.path()));
        if let Err(e) = built {
            return Err(JobFailure {
                detail: e.to_string(),
                log: self.keep_log(&log_path, job),
            });
        }

        let record = ProvenanceRecord {
            component: job.component.clone(),
            revision: job.revision.clone(),
            branch: job.branch.clone(),
            symbolic: job.symbolic,
            catalog: self.plan.catalog.clone(),
            plan_id: self.plan.plan_id.clone(),
            built_at: ProvenanceRecord::now(),
            builder: self.builder.identity(),
            duration_ms: elapsed_ms(started),
            checksum: None,
        };
        write_provenance(staging.path(), &record).map_err(JobFailure::new)?;
        self.store
            .promote(staging, &job.output)
            .map_err(JobFailure::new)
    }

    fn keep_log(&self, log: &Path, job: &BuildJob) -> Option<PathBuf> {
        if !log.is_file() {
            return None;
        }
        match self.store.preserve_log(log, &job.component, &job.revision) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("could not keep build log for {job}: {e}");
                None
            }
        }
    }
}
