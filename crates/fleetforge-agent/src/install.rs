use fleetforge_bundle::{VerifiedBundle, HOOK_SLOT, ROOTFS_SLOT};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("'{program}' exited with {status}: {stderr}")]
    Exited {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("bundle has no '{0}' slot")]
    MissingSlot(String),
}

/// Hands verified payloads to the device's dual-bank updater.
///
/// The updater owns slot switching and rollback; implementations must leave
/// the running slot untouched whenever they return an error.
pub trait SlotInstaller: Send + Sync {
    fn install(&self, bundle: &VerifiedBundle) -> Result<(), InstallError>;

    /// Mark the currently booted slot as good.
    fn confirm_boot(&self) -> Result<(), InstallError>;
}

/// Installer that runs configured commands.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    command: Vec<String>,
    confirm: Option<Vec<String>>,
}

impl CommandInstaller {
    pub fn new(command: Vec<String>, confirm: Option<Vec<String>>) -> Self {
        Self { command, confirm }
    }

    fn argv(&self, bundle: &VerifiedBundle) -> Result<Vec<String>, InstallError> {
        let rootfs = bundle
            .bundle
            .manifest
            .slot(ROOTFS_SLOT)
            .ok_or_else(|| InstallError::MissingSlot(ROOTFS_SLOT.to_owned()))?;
        let hook = bundle
            .bundle
            .manifest
            .slot(HOOK_SLOT)
            .map(|s| s.filename.as_str())
            .unwrap_or_default();
        let dir = bundle.dir.to_string_lossy();
        Ok(self
            .command
            .iter()
            .map(|arg| {
                arg.replace("{bundle_dir}", &dir)
                    .replace("{rootfs}", &rootfs.filename)
                    .replace("{hook}", hook)
                    .replace("{version}", bundle.bundle.version())
                    .replace("{variant}", &bundle.bundle.manifest.variant)
            })
            .collect())
    }
}

fn run(argv: &[String], env: &[(&str, String)]) -> Result<(), InstallError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(InstallError::Spawn {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
        });
    };
    debug!("running {}", argv.join(" "));
    let output = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .output()
        .map_err(|source| InstallError::Spawn {
            program: program.clone(),
            source,
        })?;
    if output.status.success() {
        return Ok(());
    }
    let status = match output.status.code() {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_owned(),
    };
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
    Err(InstallError::Exited {
        program: program.clone(),
        status,
        stderr: tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
    })
}

impl SlotInstaller for CommandInstaller {
    fn install(&self, bundle: &VerifiedBundle) -> Result<(), InstallError> {
        let argv = self.argv(bundle)?;
        let env = [
            ("FLEETFORGE_BUNDLE_DIR", bundle.dir.to_string_lossy().into_owned()),
            ("FLEETFORGE_BUNDLE_VERSION", bundle.bundle.version().to_owned()),
            ("FLEETFORGE_VARIANT", bundle.bundle.manifest.variant.clone()),
        ];
        run(&argv, &env)
    }

    fn confirm_boot(&self) -> Result<(), InstallError> {
        match &self.confirm {
            Some(argv) => run(argv, &[]),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetforge_bundle::{BundleManifest, SecretKey, SlotEntry, BUNDLE_FORMAT_VERSION};
    use std::path::Path;

    fn verified(dir: &Path, hook: bool) -> VerifiedBundle {
        let key = SecretKey::generate(None);
        let mut slots = vec![SlotEntry {
            name: ROOTFS_SLOT.into(),
            filename: "rootfs.tar".into(),
            hash: "0".repeat(64),
            size: 1,
            hook: None,
        }];
        if hook {
            slots[0].hook = Some(HOOK_SLOT.into());
            slots.push(SlotEntry {
                name: HOOK_SLOT.into(),
                filename: "post-install.sh".into(),
                hash: "0".repeat(64),
                size: 1,
                hook: None,
            });
        }
        let bundle = BundleManifest {
            format_version: BUNDLE_FORMAT_VERSION,
            bundle_version: "42".into(),
            variant: "kiosk".into(),
            slots,
            signing_key_fingerprint: key.fingerprint(),
        }
        .sign(&key)
        .unwrap();
        VerifiedBundle {
            bundle,
            dir: dir.to_path_buf(),
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn placeholders_and_env_reach_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("installed");
        let installer = CommandInstaller::new(
            sh(&format!(
                "echo {{rootfs}} {{hook}} {{version}} {{variant}} $FLEETFORGE_BUNDLE_VERSION > {}",
                out.display()
            )),
            None,
        );
        installer.install(&verified(dir.path(), true)).unwrap();
        assert_eq!(
            std::fs::read_to_string(out).unwrap(),
            "rootfs.tar post-install.sh 42 kiosk 42\n"
        );
    }

    #[test]
    fn failing_installer_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let installer = CommandInstaller::new(sh("echo no space left >&2; exit 4"), None);
        match installer.install(&verified(dir.path(), false)) {
            Err(InstallError::Exited { status, stderr, .. }) => {
                assert_eq!(status, "exit code 4");
                assert_eq!(stderr, "no space left");
            }
            other => panic!("expected exit failure, got {other:?}"),
        }
    }

    #[test]
    fn confirm_is_optional() {
        assert!(CommandInstaller::new(sh("true"), None).confirm_boot().is_ok());
        let failing = CommandInstaller::new(sh("true"), Some(sh("exit 1")));
        assert!(matches!(
            failing.confirm_boot(),
            Err(InstallError::Exited { .. })
        ));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let installer = CommandInstaller::new(vec!["/nonexistent/updater".into()], None);
        assert!(matches!(
            installer.install(&verified(dir.path(), false)),
            Err(InstallError::Spawn { .. })
        ));
    }
}
