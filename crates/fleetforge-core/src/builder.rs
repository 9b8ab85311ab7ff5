use crate::concurrency::CancelToken;
use crate::job::BuildJob;
use fleetforge_schema::ComponentDef;
use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the per-job log inside the staging directory.
pub const BUILD_LOG: &str = "build.log";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum BuildJobError {
    #[error("failed to start builder '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("builder exited with {0}")]
    Exited(String),
    #[error("cancelled")]
    Cancelled,
    #[error("builder produced no output")]
    EmptyOutput,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a builder needs to run one job.
pub struct BuildRequest<'a> {
    pub job: &'a BuildJob,
    pub def: &'a ComponentDef,
    /// Private staging directory; the builder writes its artifact here.
    pub output_dir: &'a Path,
    pub log_path: &'a Path,
}

/// Runs the external build for one component.
///
/// Implementations must write only into `output_dir` and must return promptly
/// once `cancel` is set.
pub trait ComponentBuilder: Send + Sync {
    fn build(&self, request: &BuildRequest<'_>, cancel: &CancelToken)
        -> Result<(), BuildJobError>;

    /// Identity recorded in provenance.
    fn identity(&self) -> String;
}

/// Builder that executes the component's configured argv as a child process.
pub struct CommandBuilder {
    identity: String,
    grace: Duration,
}

impl CommandBuilder {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            grace: Duration::from_secs(5),
        }
    }

    /// Time a cancelled builder gets between SIGTERM and SIGKILL.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn terminate(&self, child: &mut Child) -> Result<(), BuildJobError> {
        let pid = child.id();
        match i32::try_from(pid) {
            Ok(pid_i32) => {
                debug!("sending SIGTERM to builder pid {pid}");
                // SAFETY: kill() with a valid pid and signal is safe; pid validated via i32::try_from above.
                #[allow(unsafe_code)]
                let ret = unsafe { libc::kill(pid_i32, libc::SIGTERM) };
                if ret != 0 {
                    let errno = std::io::Error::last_os_error();
                    if errno.raw_os_error() != Some(libc::ESRCH) {
                        warn!("failed to send SIGTERM to pid {pid}: {errno}");
                    }
                }
            }
            Err(_) => warn!("invalid builder pid {pid}: exceeds i32 range"),
        }

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        warn!("builder pid {pid} did not exit after SIGTERM, killing");
        let _ = child.kill();
        child.wait()?;
        Ok(())
    }
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_owned(),
    }
}

impl ComponentBuilder for CommandBuilder {
    fn build(
        &self,
        request: &BuildRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<(), BuildJobError> {
        let job = request.job;
        let argv = request
            .def
            .builder_argv(&job.revision, &job.branch, request.output_dir);
        let Some((program, args)) = argv.split_first() else {
            return Err(BuildJobError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
            });
        };

        let log = File::create(request.log_path)?;
        let stderr = log.try_clone()?;
        debug!("spawning {job}: {}", argv.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .env("FLEETFORGE_COMPONENT", job.component.as_str())
            .env("FLEETFORGE_REVISION", job.revision.as_str())
            .env("FLEETFORGE_BRANCH", job.branch.as_str())
            .env("FLEETFORGE_OUTPUT", request.output_dir)
            .env("FLEETFORGE_SYMBOLIC", if job.symbolic { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| BuildJobError::Spawn {
                program: program.clone(),
                source,
            })?;

        loop {
            if let Some(status) = child.try_wait()? {
                return if status.success() {
                    Ok(())
                } else {
                    Err(BuildJobError::Exited(describe(status)))
                };
            }
            if cancel.is_cancelled() {
                self.terminate(&mut child)?;
                return Err(BuildJobError::Cancelled);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use fleetforge_schema::{parse_component_table_str, BranchName, CommitId, ComponentName};

    fn def(builder: &str) -> ComponentDef {
        let table = parse_component_table_str(&format!(
            "[[component]]\nname = \"kernel\"\nrepo = \"r\"\nbuilder = {builder}\n"
        ))
        .unwrap();
        table.components[0].clone()
    }

    fn job() -> BuildJob {
        BuildJob {
            component: ComponentName::new("kernel"),
            revision: CommitId::new("abc123"),
            branch: BranchName::new("main"),
            symbolic: false,
            depends_on: vec![],
            output: "kernel/abc123".into(),
            status: JobStatus::Running,
        }
    }

    fn run(builder: &str, cancel: &CancelToken) -> (tempfile::TempDir, Result<(), BuildJobError>) {
        let dir = tempfile::tempdir().unwrap();
        let def = def(builder);
        let job = job();
        let log = dir.path().join(BUILD_LOG);
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let request = BuildRequest {
            job: &job,
            def: &def,
            output_dir: &out,
            log_path: &log,
        };
        let result = CommandBuilder::new("test")
            .with_grace(Duration::from_millis(200))
            .build(&request, cancel);
        (dir, result)
    }

    #[test]
    fn successful_builder_writes_output_and_log() {
        let (dir, result) = run(
            r#"["sh", "-c", "echo building $FLEETFORGE_COMPONENT@{revision}; echo data > {output}/image"]"#,
            &CancelToken::new(),
        );
        result.unwrap();
        let log = std::fs::read_to_string(dir.path().join(BUILD_LOG)).unwrap();
        assert!(log.contains("building kernel@abc123"));
        assert!(dir.path().join("out/image").is_file());
    }

    #[test]
    fn failing_builder_reports_exit_code() {
        let (dir, result) = run(r#"["sh", "-c", "echo boom >&2; exit 3"]"#, &CancelToken::new());
        match result {
            Err(BuildJobError::Exited(msg)) => assert_eq!(msg, "exit code 3"),
            other => panic!("expected exit failure, got {other:?}"),
        }
        let log = std::fs::read_to_string(dir.path().join(BUILD_LOG)).unwrap();
        assert!(log.contains("boom"));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let (_dir, result) = run(r#"["/nonexistent/fleetforge-builder"]"#, &CancelToken::new());
        assert!(matches!(result, Err(BuildJobError::Spawn { .. })));
    }

    #[test]
    fn cancellation_stops_running_builder() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let started = Instant::now();
        let (_dir, result) = run(r#"["sleep", "30"]"#, &cancel);
        handle.join().unwrap();
        assert!(matches!(result, Err(BuildJobError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
