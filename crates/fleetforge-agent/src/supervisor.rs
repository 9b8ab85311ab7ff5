//! Bounded-retry supervision of the agent process.
//!
//! [`Supervisor`] is the decision logic alone: it is fed exits and heartbeats
//! with explicit timestamps and answers whether to restart, when, and whether
//! the child is still alive. [`ProcessSupervisor`] applies those decisions to
//! a real child process that proves liveness by rewriting a heartbeat file.

use crate::config::SupervisorSection;
use crate::report::{Incident, IncidentReporter, IncidentStage};
use crate::state::{AgentState, StateStore};
use crate::AgentError;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming the heartbeat file a supervised child must touch.
pub const HEARTBEAT_ENV: &str = "FLEETFORGE_HEARTBEAT";

/// Backoff doubles per restart in the window, up to this factor.
const MAX_BACKOFF_FACTOR: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed within `window` before escalating.
    pub max_restarts: u32,
    pub window: Duration,
    /// Delay before the first restart in a window.
    pub backoff: Duration,
    /// Longest tolerated silence between heartbeats.
    pub watchdog: Duration,
}

impl From<&SupervisorSection> for RestartPolicy {
    fn from(s: &SupervisorSection) -> Self {
        Self {
            max_restarts: s.max_restarts,
            window: Duration::from_secs(s.window_secs),
            backoff: Duration::from_secs(s.backoff_secs),
            watchdog: Duration::from_secs(s.watchdog_secs),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("agent failed {restarts} time(s) within {}s, giving up; last exit: {last_exit}", .window.as_secs())]
pub struct SupervisionExhausted {
    pub restarts: u32,
    pub window: Duration,
    pub last_exit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Restart { delay: Duration },
    Escalate(SupervisionExhausted),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Unresponsive { silent_for: Duration },
}

/// Restart budget and watchdog bookkeeping.
#[derive(Debug, Clone)]
pub struct Supervisor {
    policy: RestartPolicy,
    restarts: VecDeque<Instant>,
    last_seen: Option<Instant>,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            restarts: VecDeque::new(),
            last_seen: None,
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// A new child was started; the watchdog counts from here.
    pub fn on_start(&mut self, now: Instant) {
        self.last_seen = Some(now);
    }

    pub fn on_heartbeat(&mut self, now: Instant) {
        self.last_seen = Some(now);
    }

    pub fn check_liveness(&self, now: Instant) -> Liveness {
        match self.last_seen {
            Some(seen) => {
                let silent_for = now.saturating_duration_since(seen);
                if silent_for > self.policy.watchdog {
                    Liveness::Unresponsive { silent_for }
                } else {
                    Liveness::Alive
                }
            }
            None => Liveness::Alive,
        }
    }

    /// Restarts counted against the budget as of `now`.
    pub fn restarts_in_window(&mut self, now: Instant) -> u32 {
        while let Some(&first) = self.restarts.front() {
            if now.saturating_duration_since(first) >= self.policy.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.len() as u32
    }

    /// The child exited or was killed for `reason`.
    pub fn on_exit(&mut self, now: Instant, reason: &str) -> Decision {
        self.last_seen = None;
        let recent = self.restarts_in_window(now);
        if recent >= self.policy.max_restarts {
            return Decision::Escalate(SupervisionExhausted {
                restarts: recent + 1,
                window: self.policy.window,
                last_exit: reason.to_owned(),
            });
        }
        let factor = 1u32
            .checked_shl(recent)
            .unwrap_or(MAX_BACKOFF_FACTOR)
            .min(MAX_BACKOFF_FACTOR);
        self.restarts.push_back(now);
        Decision::Restart {
            delay: self.policy.backoff.saturating_mul(factor),
        }
    }
}

/// Shared stop flag, set from a signal handler.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, returning early once stopped.
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}

/// Wire Ctrl-C to `signal`. A second Ctrl-C exits immediately.
pub fn install_signal_handler(signal: StopSignal) {
    let _ = ctrlc::set_handler(move || {
        if signal.is_stopped() {
            std::process::exit(130);
        }
        signal.stop();
    });
}

/// Liveness proof written by a supervised process.
#[derive(Debug)]
pub struct Heartbeat {
    path: PathBuf,
    seq: u64,
}

impl Heartbeat {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            seq: 0,
        }
    }

    /// Heartbeat requested by a supervising parent, if any.
    pub fn from_env() -> Option<Self> {
        std::env::var_os(HEARTBEAT_ENV).map(|p| Self::new(Path::new(&p)))
    }

    pub fn beat(&mut self) -> std::io::Result<()> {
        self.seq += 1;
        fs::write(
            &self.path,
            format!("{} {}\n", std::process::id(), self.seq),
        )
    }

    /// Beat every `interval` on a background thread until `stop` is set.
    /// Beats keep coming while the caller is blocked in a long fetch or
    /// slot install.
    pub fn spawn(
        mut self,
        interval: Duration,
        stop: StopSignal,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("heartbeat".into())
            .spawn(move || {
                while !stop.is_stopped() {
                    if let Err(e) = self.beat() {
                        warn!("failed to write heartbeat {}: {e}", self.path.display());
                    }
                    stop.sleep(interval);
                }
            })
    }
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "killed by a signal".to_owned(),
    }
}

/// Runs a child command under a [`Supervisor`].
pub struct ProcessSupervisor<'a> {
    argv: Vec<String>,
    heartbeat: PathBuf,
    policy: RestartPolicy,
    reporter: &'a dyn IncidentReporter,
    state_dir: Option<PathBuf>,
    grace: Duration,
    poll: Duration,
}

impl<'a> ProcessSupervisor<'a> {
    pub fn new(
        argv: Vec<String>,
        heartbeat: &Path,
        policy: RestartPolicy,
        reporter: &'a dyn IncidentReporter,
    ) -> Self {
        Self {
            argv,
            heartbeat: heartbeat.to_path_buf(),
            policy,
            reporter,
            state_dir: None,
            grace: Duration::from_secs(5),
            poll: Duration::from_millis(200),
        }
    }

    /// Time an unresponsive child gets between SIGTERM and SIGKILL.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Agent state directory. While the persisted state says a slot is being
    /// written, a silent child is left running instead of being killed.
    #[must_use]
    pub fn with_state_dir(mut self, dir: &Path) -> Self {
        self.state_dir = Some(dir.to_path_buf());
        self
    }

    fn install_in_progress(&self) -> bool {
        self.state_dir.as_deref().is_some_and(|dir| {
            matches!(StateStore::new(dir).load(), Ok(s) if s.state == AgentState::Installing)
        })
    }

    fn spawn(&self) -> Result<Child, AgentError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(AgentError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty supervised command",
            )));
        };
        if let Some(parent) = self.heartbeat.parent() {
            fs::create_dir_all(parent)?;
        }
        let _ = fs::remove_file(&self.heartbeat);
        let child = Command::new(program)
            .args(args)
            .env(HEARTBEAT_ENV, &self.heartbeat)
            .stdin(Stdio::null())
            .spawn()?;
        debug!("started supervised pid {}", child.id());
        Ok(child)
    }

    fn terminate(&self, child: &mut Child) -> Result<(), AgentError> {
        let pid = child.id();
        match i32::try_from(pid) {
            Ok(pid_i32) => {
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
            Err(_) => warn!("invalid child pid {pid}: exceeds i32 range"),
        }
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(self.poll.min(Duration::from_millis(50)));
        }
        warn!("pid {pid} did not exit after SIGTERM, killing");
        let _ = child.kill();
        child.wait()?;
        Ok(())
    }

    /// Supervise until the child exits cleanly, `stop` is set, or the
    /// restart budget is exhausted. Exhaustion is reported as an incident
    /// and returned as [`AgentError::Exhausted`].
    pub fn run(&self, stop: &StopSignal) -> Result<(), AgentError> {
        let mut supervisor = Supervisor::new(self.policy);
        loop {
            let mut child = self.spawn()?;
            supervisor.on_start(Instant::now());
            let mut last_beat: Option<String> = None;
            let mut holding = false;

            let reason = loop {
                if let Some(status) = child.try_wait()? {
                    if status.success() {
                        info!("supervised process exited cleanly");
                        return Ok(());
                    }
                    break describe(status);
                }
                if stop.is_stopped() {
                    info!("stopping supervised process");
                    self.terminate(&mut child)?;
                    return Ok(());
                }
                let now = Instant::now();
                if let Ok(content) = fs::read_to_string(&self.heartbeat) {
                    if last_beat.as_deref() != Some(content.as_str()) {
                        supervisor.on_heartbeat(now);
                        last_beat = Some(content);
                    }
                }
                match supervisor.check_liveness(now) {
                    Liveness::Unresponsive { silent_for } if self.install_in_progress() => {
                        if !holding {
                            warn!(
                                "no heartbeat for {}ms during slot install, waiting for it",
                                silent_for.as_millis()
                            );
                            holding = true;
                        }
                    }
                    Liveness::Unresponsive { silent_for } => {
                        warn!(
                            "no heartbeat for {}ms, restarting agent",
                            silent_for.as_millis()
                        );
                        self.terminate(&mut child)?;
                        break format!("unresponsive for {}ms", silent_for.as_millis());
                    }
                    Liveness::Alive => holding = false,
                }
                std::thread::sleep(self.poll);
            };

            match supervisor.on_exit(Instant::now(), &reason) {
                Decision::Restart { delay } => {
                    warn!(
                        "agent failed ({reason}), restarting in {}ms",
                        delay.as_millis()
                    );
                    stop.sleep(delay);
                    if stop.is_stopped() {
                        return Ok(());
                    }
                }
                Decision::Escalate(exhausted) => {
                    let incident = Incident::new(IncidentStage::Supervision, exhausted.to_string());
                    if let Err(e) = self.reporter.report(&incident) {
                        warn!("failed to report supervision exhaustion: {e}");
                    }
                    return Err(exhausted.into());
                }
            }
        }
    }
}
