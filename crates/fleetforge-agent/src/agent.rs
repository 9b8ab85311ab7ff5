//! The update driver: fetch, verify, install, confirm boot.
//!
//! Every step is recorded in the persisted state before it starts, so a
//! restart after a crash knows whether an update was interrupted or is
//! waiting for its reboot. Verification is fail-closed: nothing reaches the
//! installer unless the whole bundle checked out against the keyring.

use crate::config::BootMode;
use crate::fetch::BundleFetcher;
use crate::install::SlotInstaller;
use crate::report::{Incident, IncidentReporter, IncidentStage};
use crate::state::{AgentState, PersistedState, StateStore};
use crate::AgentError;
use fleetforge_bundle::{extract_bundle, read_manifest, Keyring};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of a completed update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Installed into the inactive slot; takes effect after reboot.
    Installed { version: String },
    /// The channel's newest bundle was already handled.
    UpToDate,
}

/// What the agent found about the previous run when it started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootCheck {
    Clean,
    /// The pending bundle booted and was marked good.
    Confirmed { version: String },
    /// The device came up in recovery instead of the pending bundle.
    Rejected { version: Option<String> },
    /// A previous update died in the given state.
    Interrupted { state: AgentState },
}

/// Parameters that are fixed for the agent's lifetime.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub boot_mode: BootMode,
    /// Bundles for any other variant are rejected when set.
    pub variant: Option<String>,
    pub state_dir: PathBuf,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// On-device update agent. One update runs at a time; concurrent requests
/// are rejected with [`AgentError::Busy`].
pub struct UpdateAgent<'a> {
    settings: AgentSettings,
    keyring: Keyring,
    installer: &'a dyn SlotInstaller,
    reporter: &'a dyn IncidentReporter,
    store: StateStore,
    state: Mutex<PersistedState>,
    busy: AtomicBool,
}

impl<'a> UpdateAgent<'a> {
    pub fn new(
        settings: AgentSettings,
        keyring: Keyring,
        installer: &'a dyn SlotInstaller,
        reporter: &'a dyn IncidentReporter,
    ) -> Result<Self, AgentError> {
        let store = StateStore::new(&settings.state_dir);
        let state = store.load()?;
        if keyring.is_empty() {
            warn!("keyring is empty; every bundle will be rejected");
        }
        Ok(Self {
            settings,
            keyring,
            installer,
            reporter,
            store,
            state: Mutex::new(state),
            busy: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> PersistedState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PersistedState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn update_state(
        &self,
        f: impl FnOnce(&mut PersistedState) -> Result<(), AgentError>,
    ) -> Result<(), AgentError> {
        let mut guard = self.lock_state();
        let mut next = guard.clone();
        f(&mut next)?;
        self.store.save(&next)?;
        *guard = next;
        Ok(())
    }

    fn transition(&self, to: AgentState) -> Result<(), AgentError> {
        debug!("agent state -> {to}");
        self.update_state(|s| s.transition(to))
    }

    fn report(&self, incident: &Incident) {
        if let Err(e) = self.reporter.report(incident) {
            warn!("failed to report incident ({incident}): {e}");
        }
    }

    /// Reconcile persisted state left by the previous run. Call once at start.
    pub fn confirm_boot(&self) -> Result<BootCheck, AgentError> {
        let previous = self.state();
        match previous.state {
            AgentState::Idle => Ok(BootCheck::Clean),
            AgentState::AwaitingReboot => {
                let version = previous.pending_version.clone();
                if self.settings.boot_mode == BootMode::Recovery {
                    let detail = "device booted into recovery; pending bundle not confirmed";
                    self.report(
                        &Incident::new(IncidentStage::Boot, detail)
                            .with_bundle_version(version.clone())
                            .with_source(previous.source.clone()),
                    );
                    self.update_state(|s| {
                        s.transition(AgentState::Idle)?;
                        s.pending_version = None;
                        s.last_error = Some(detail.to_owned());
                        Ok(())
                    })?;
                    return Ok(BootCheck::Rejected { version });
                }
                if let Err(e) = self.installer.confirm_boot() {
                    self.report(
                        &Incident::new(IncidentStage::Boot, e.to_string())
                            .with_bundle_version(version)
                            .with_source(previous.source),
                    );
                    return Err(e.into());
                }
                let version = version.unwrap_or_default();
                self.update_state(|s| {
                    s.transition(AgentState::Idle)?;
                    s.installed_version = s.pending_version.take();
                    s.last_error = None;
                    Ok(())
                })?;
                info!("confirmed boot into bundle {version}");
                Ok(BootCheck::Confirmed { version })
            }
            interrupted if interrupted.is_in_flight() => {
                let detail = format!("agent stopped while {interrupted}");
                self.report(
                    &Incident::new(IncidentStage::Interrupted, detail.clone())
                        .with_bundle_version(previous.pending_version.clone())
                        .with_source(previous.source.clone()),
                );
                self.update_state(|s| {
                    s.transition(AgentState::Failed)?;
                    s.transition(AgentState::Idle)?;
                    s.pending_version = None;
                    s.last_error = Some(detail);
                    Ok(())
                })?;
                Ok(BootCheck::Interrupted { state: interrupted })
            }
            _ => {
                self.transition(AgentState::Idle)?;
                Ok(BootCheck::Clean)
            }
        }
    }

    /// Install the newest bundle on `channel` unless it was already handled.
    pub fn poll(
        &self,
        fetcher: &dyn BundleFetcher,
        channel: &str,
    ) -> Result<UpdateOutcome, AgentError> {
        let Some(location) = fetcher.latest(channel)? else {
            debug!("channel '{channel}' has no bundle");
            return Ok(UpdateOutcome::UpToDate);
        };
        if self.state().handled.as_deref() == Some(location.as_str()) {
            debug!("{location} already handled");
            return Ok(UpdateOutcome::UpToDate);
        }
        self.request_update(fetcher, &location)
    }

    /// Fetch, verify, and install the bundle at `location`.
    ///
    /// On any failure the bundle is discarded, an incident is reported, and
    /// the agent returns to idle with the running slot untouched.
    pub fn request_update(
        &self,
        fetcher: &dyn BundleFetcher,
        location: &str,
    ) -> Result<UpdateOutcome, AgentError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(AgentError::Busy);
        }
        let _guard = InFlight(&self.busy);

        let current = self.state().state;
        if current != AgentState::Idle {
            return Err(AgentError::InvalidTransition {
                from: current,
                to: AgentState::Fetching,
            });
        }

        self.update_state(|s| {
            s.transition(AgentState::Fetching)?;
            s.source = Some(location.to_owned());
            s.pending_version = None;
            Ok(())
        })?;
        info!("fetching {location}");

        let work = match self.work_dir() {
            Ok(dir) => dir,
            Err(e) => return Err(self.fail(IncidentStage::Fetch, None, e)),
        };
        let download = work.path().join("bundle");
        if let Err(e) = fetcher.fetch(location, &download) {
            return Err(self.fail(IncidentStage::Fetch, None, e.into()));
        }

        // Unverified, for incident context only.
        let claimed = read_manifest(&download)
            .ok()
            .map(|b| b.version().to_owned());
        if let Err(e) = self.transition(AgentState::Verifying) {
            return Err(self.fail(IncidentStage::Verify, claimed, e));
        }
        let verified = match self.verify(&download, &work.path().join("slots")) {
            Ok(v) => v,
            Err(e) => return Err(self.fail(IncidentStage::Verify, claimed, e)),
        };
        let version = verified.bundle.version().to_owned();
        let _ = fs::remove_file(&download);

        let installing = self.update_state(|s| {
            s.transition(AgentState::Installing)?;
            s.pending_version = Some(version.clone());
            Ok(())
        });
        if let Err(e) = installing {
            return Err(self.fail(IncidentStage::Install, Some(version), e));
        }
        info!("installing bundle {version}");
        if let Err(e) = self.installer.install(&verified) {
            return Err(self.fail(IncidentStage::Install, Some(version), e.into()));
        }

        let installed = self.update_state(|s| {
            s.transition(AgentState::AwaitingReboot)?;
            s.handled = Some(location.to_owned());
            s.last_error = None;
            Ok(())
        });
        if let Err(e) = installed {
            return Err(self.fail(IncidentStage::Install, Some(version), e));
        }
        info!("bundle {version} installed, awaiting reboot");
        Ok(UpdateOutcome::Installed { version })
    }

    fn work_dir(&self) -> Result<tempfile::TempDir, AgentError> {
        fs::create_dir_all(&self.settings.state_dir)?;
        Ok(tempfile::Builder::new()
            .prefix("update-")
            .tempdir_in(&self.settings.state_dir)?)
    }

    fn verify(
        &self,
        bundle: &Path,
        dest: &Path,
    ) -> Result<fleetforge_bundle::VerifiedBundle, AgentError> {
        let verified = extract_bundle(bundle, &self.keyring, dest)?;
        if let Some(expected) = &self.settings.variant {
            if &verified.bundle.manifest.variant != expected {
                return Err(AgentError::VariantMismatch {
                    expected: expected.clone(),
                    found: verified.bundle.manifest.variant.clone(),
                });
            }
        }
        Ok(verified)
    }

    /// Record a failed stage, report it, and reset to idle.
    ///
    /// A bundle rejected by verification is remembered as handled; anything
    /// else leaves the location eligible for the next poll.
    fn fail(&self, stage: IncidentStage, version: Option<String>, err: AgentError) -> AgentError {
        let detail = err.to_string();
        let rejected = matches!(
            err,
            AgentError::Verification(_) | AgentError::VariantMismatch { .. }
        );
        let source = self.state().source;
        let reset = self.update_state(|s| {
            s.transition(AgentState::Failed)?;
            s.last_error = Some(format!("{stage}: {detail}"));
            s.pending_version = None;
            if rejected {
                s.handled = s.source.clone();
            }
            Ok(())
        });
        if let Err(e) = reset {
            warn!("failed to record {stage} failure: {e}");
        }
        self.report(
            &Incident::new(stage, detail.clone())
                .with_bundle_version(version)
                .with_source(source),
        );
        if let Err(e) = self.transition(AgentState::Idle) {
            warn!("failed to reset agent state: {e}");
            // Unpersisted; a restart reports the update as interrupted.
            let mut state = self.lock_state();
            state.state = AgentState::Idle;
            state.pending_version = None;
            state.last_error = Some(format!("{stage}: {detail}"));
        }
        err
    }
}
