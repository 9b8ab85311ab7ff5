//! CLI subprocess integration tests.
//!
//! These tests invoke the `fleetforge` binary against a throwaway project
//! and check exit codes, stdout content, and JSON output.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const COMPONENTS: &str = r#"
[[component]]
name = "bootloader"
repo = "https://git.example.com/bootloader.git"
builder = ["sh", "-c", "echo {component}@{revision} > {output}/boot.img"]

[[component]]
name = "kernel"
repo = "https://git.example.com/kernel.git"
builder = ["sh", "-c", "echo $FLEETFORGE_REVISION > {output}/vmlinuz"]

[[component]]
name = "rootfs"
repo = "https://git.example.com/rootfs.git"
builder = ["sh", "-c", "mkdir -p {output}/etc && echo ID=fleet > {output}/etc/os-release"]
depends_on = ["bootloader", "kernel"]

[[component]]
name = "ui-shell"
repo = "https://git.example.com/ui.git"
builder = ["sh", "-c", "echo ui > {output}/ui.bin"]
"#;

const CONFIG: &str = r#"
[build]
jobs = 2
builder_identity = "ci@test"

[signing]
key = "release.key"
cert = "release.cert"

[bundle]
rootfs_component = "rootfs"
variant = "stable"
"#;

const CATALOG: &str = "BOOTLOADER_REV=a1b2c3d\nKERNEL_REV=abc123\nROOTFS_REV=0123456789abcdef\nUI_SHELL_REV=beef01\n";

struct Project {
    dir: tempfile::TempDir,
}

impl Project {
    fn new() -> Self {
        Self::with_components(COMPONENTS)
    }

    fn with_components(components: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("fleetforge.toml"), CONFIG).unwrap();
        fs::write(dir.path().join("components.toml"), components).unwrap();
        fs::create_dir_all(dir.path().join("catalogs")).unwrap();
        fs::write(dir.path().join("catalogs/nightly.env"), CATALOG).unwrap();
        Self { dir }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_fleetforge"))
            .current_dir(self.dir.path())
            .args(args)
            .output()
            .unwrap()
    }

    fn run_json(&self, args: &[&str]) -> (Option<i32>, serde_json::Value) {
        let mut full = vec!["--json"];
        full.extend_from_slice(args);
        let output = self.run(&full);
        let value = serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
            panic!(
                "invalid JSON ({e}); stdout: {} stderr: {}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )
        });
        (output.status.code(), value)
    }
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn bundles_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "bundle"))
        .collect()
}

#[test]
fn cli_version_and_help() {
    let project = Project::new();
    let output = project.run(&["--version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("fleetforge"));

    let output = project.run(&["--help"]);
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for cmd in ["resolve", "build", "package", "verify", "publish", "verify-store"] {
        assert!(help.contains(cmd), "help must list '{cmd}'");
    }
}

#[test]
fn resolve_is_stable_and_applies_overrides() {
    let project = Project::new();
    let (code, first) = project.run_json(&["resolve", "nightly"]);
    assert_eq!(code, Some(0));
    let (_, second) = project.run_json(&["resolve", "nightly"]);
    assert_eq!(first["plan_id"], second["plan_id"]);
    assert_eq!(first["reproducible"], true);

    let (code, overridden) =
        project.run_json(&["resolve", "nightly", "--override", "kernel=def456"]);
    assert_eq!(code, Some(0));
    assert_ne!(overridden["plan_id"], first["plan_id"]);
    let kernel = overridden["components"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == "kernel")
        .unwrap();
    assert_eq!(kernel["commit"], "def456");
    assert_eq!(kernel["origin"], "override");
}

#[test]
fn resolution_errors_exit_2() {
    let project = Project::new();
    let output = project.run(&["resolve", "nightly", "--override", "nosuch=abc123"]);
    assert_eq!(output.status.code(), Some(2), "{}", stderr(&output));

    let output = project.run(&["resolve", "missing-catalog"]);
    assert_eq!(output.status.code(), Some(2), "{}", stderr(&output));

    let output = project.run(&["build", "nightly", "--component", "nosuch"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("unknown component 'nosuch'"));
}

#[test]
fn partial_failure_exits_4_and_names_component() {
    let failing_kernel = COMPONENTS.replace(
        "echo $FLEETFORGE_REVISION > {output}/vmlinuz",
        "echo broken >&2; exit 3",
    );
    let project = Project::with_components(&failing_kernel);

    let (code, out) = project.run_json(&["build", "nightly"]);
    assert_eq!(code, Some(4));
    let report = &out["report"];
    assert_eq!(report["status"]["kind"], "partial-failure");
    assert_eq!(report["status"]["failed"][0]["component"], "kernel");

    let status_of = |name: &str| {
        report["jobs"]
            .as_array()
            .unwrap()
            .iter()
            .find(|j| j["component"] == name)
            .unwrap()["status"]
            .clone()
    };
    assert_eq!(status_of("bootloader"), "succeeded");
    assert_eq!(status_of("kernel"), "failed");
    assert_eq!(status_of("rootfs"), "skipped");
    assert_eq!(status_of("ui-shell"), "succeeded");
}

#[test]
fn scoped_build_covers_target_and_unbuilt_dependencies() {
    let project = Project::new();
    let (code, out) = project.run_json(&["build", "nightly", "--component", "kernel"]);
    assert_eq!(code, Some(0));
    let jobs: Vec<&str> = out["report"]["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["component"].as_str().unwrap())
        .collect();
    assert_eq!(jobs, vec!["kernel"]);

    let (code, out) = project.run_json(&["build", "nightly", "-c", "rootfs"]);
    assert_eq!(code, Some(0));
    let jobs: Vec<&str> = out["report"]["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["component"].as_str().unwrap())
        .collect();
    assert_eq!(jobs, vec!["bootloader", "rootfs"]);
}

#[test]
fn package_without_key_exits_5_and_writes_nothing() {
    let project = Project::new();
    fs::create_dir_all(project.path("rootfs/etc")).unwrap();
    fs::write(project.path("rootfs/etc/os-release"), "ID=fleet\n").unwrap();

    let output = project.run(&["package", "--rootfs", "rootfs"]);
    assert_eq!(output.status.code(), Some(5), "{}", stderr(&output));
    assert!(stderr(&output).contains("signing key not found"));
    assert!(bundles_in(&project.path("bundles")).is_empty());
}

#[test]
fn keygen_build_package_publish_verify() {
    let project = Project::new();
    let output = project.run(&["keygen", "--subject", "release"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(project.path("release.key").is_file());

    // A second keygen must not clobber the key.
    assert!(!project.run(&["keygen"]).status.success());

    let (code, resolved) = project.run_json(&["resolve", "nightly"]);
    assert_eq!(code, Some(0));
    let plan_id = resolved["plan_id"].as_str().unwrap().to_owned();

    let (code, _) = project.run_json(&["build", "nightly", "--plan", &plan_id]);
    assert_eq!(code, Some(0));

    let (code, packaged) = project.run_json(&[
        "package",
        "--plan",
        &plan_id,
        "--bundle-version",
        "2026.10.1",
        "--channel",
        "stable",
    ]);
    assert_eq!(code, Some(0));
    assert_eq!(packaged["bundle_version"], "2026.10.1");
    assert_eq!(packaged["variant"], "stable");
    assert_eq!(
        fs::read_to_string(project.path("bundles/channels/stable/LATEST")).unwrap(),
        "stable-2026.10.1.bundle\n"
    );

    let bundle = packaged["path"].as_str().unwrap().to_owned();
    let (code, verified) = project.run_json(&["verify", &bundle]);
    assert_eq!(code, Some(0));
    assert_eq!(verified["valid"], true);

    // A certificate the bundle was not signed with is rejected.
    let output = project.run(&[
        "keygen",
        "--key",
        "other.key",
        "--cert",
        "other.cert",
    ]);
    assert!(output.status.success());
    let output = project.run(&["verify", &bundle, "--cert", "other.cert"]);
    assert_eq!(output.status.code(), Some(6), "{}", stderr(&output));

    let (code, store) = project.run_json(&["verify-store"]);
    assert_eq!(code, Some(0));
    assert_eq!(store["failed"], 0);
}

#[test]
fn tampered_bundle_fails_verification() {
    let project = Project::new();
    assert!(project.run(&["keygen"]).status.success());
    fs::create_dir_all(project.path("rootfs/etc")).unwrap();
    fs::write(project.path("rootfs/etc/os-release"), "ID=fleet\n").unwrap();

    let (code, packaged) = project.run_json(&["package", "--rootfs", "rootfs"]);
    assert_eq!(code, Some(0));
    let bundle = PathBuf::from(packaged["path"].as_str().unwrap());

    let mut bytes = fs::read(&bundle).unwrap();
    let at = bytes.windows(8).position(|w| w == b"ID=fleet").unwrap();
    bytes[at] = b'X';
    fs::write(&bundle, bytes).unwrap();

    let output = project.run(&["verify", bundle.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(6));
    assert!(stderr(&output).contains("verification failed"));
}

#[test]
fn cyclic_component_table_exits_2() {
    let cyclic = COMPONENTS.replace(
        "name = \"bootloader\"\nrepo = \"https://git.example.com/bootloader.git\"",
        "name = \"bootloader\"\nrepo = \"https://git.example.com/bootloader.git\"\ndepends_on = [\"rootfs\"]",
    );
    let project = Project::with_components(&cyclic);
    let output = project.run(&["resolve", "nightly"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("dependency cycle"));
}

#[test]
fn rollout_flags_are_offered() {
    let project = Project::new();
    let output = project.run(&["publish", "--help"]);
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    assert!(help.contains("--no-rollout") && help.contains("--autostart"));

    let output = project.run(&["status", "--help"]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("--reassign"));

    let output = project.run(&[
        "publish",
        "x.bundle",
        "--channel",
        "stable",
        "--no-rollout",
        "--autostart",
    ]);
    assert_eq!(output.status.code(), Some(2), "{}", stderr(&output));
}
