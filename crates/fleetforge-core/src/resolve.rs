use fleetforge_schema::{
    is_commit_id, BranchName, CatalogError, CommitId, ComponentDef, ComponentName, ComponentTable,
    ComponentTableError, PinOrigin, ResolvedComponent, ResolvedPlan, RevisionPin, VersionCatalog,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Table(#[from] ComponentTableError),
    #[error("invalid override '{0}', expected <component>=<revision>")]
    MalformedOverride(String),
    #[error("ambiguous override revision '{revision}' for {component}, expected a commit id or HEAD")]
    AmbiguousOverride { component: String, revision: String },
    #[error("duplicate override for {0}")]
    DuplicateOverride(String),
    #[error("override names unknown component '{0}'")]
    UnknownOverride(String),
    #[error("branch '{branch}' of {component} not found in {repo}")]
    UnknownBranch {
        component: String,
        branch: String,
        repo: String,
    },
    #[error("cannot query branch tip of {component} from {repo}: {reason}")]
    Unreachable {
        component: String,
        repo: String,
        reason: String,
    },
    #[error("branch tip query for {component} returned malformed commit '{value}'")]
    MalformedTip { component: String, value: String },
}

/// Per-build revision overrides. An override always wins over the catalog pin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pins: BTreeMap<ComponentName, RevisionPin>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `component=revision` pairs as given on the command line.
    pub fn parse<S: AsRef<str>>(pairs: &[S]) -> Result<Self, ResolutionError> {
        let mut overrides = Overrides::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (name, revision) = pair
                .split_once('=')
                .map(|(n, r)| (n.trim(), r.trim()))
                .filter(|(n, r)| !n.is_empty() && !r.is_empty())
                .ok_or_else(|| ResolutionError::MalformedOverride(pair.to_owned()))?;
            let pin =
                RevisionPin::parse(revision).ok_or_else(|| ResolutionError::AmbiguousOverride {
                    component: name.to_owned(),
                    revision: revision.to_owned(),
                })?;
            overrides.insert(ComponentName::new(name), pin)?;
        }
        Ok(overrides)
    }

    pub fn insert(
        &mut self,
        component: ComponentName,
        pin: RevisionPin,
    ) -> Result<(), ResolutionError> {
        if self.pins.contains_key(&component) {
            return Err(ResolutionError::DuplicateOverride(component.into_inner()));
        }
        self.pins.insert(component, pin);
        Ok(())
    }

    pub fn get(&self, component: &ComponentName) -> Option<&RevisionPin> {
        self.pins.get(component)
    }

    pub fn names(&self) -> impl Iterator<Item = &ComponentName> {
        self.pins.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

/// Answers "which commit does this branch point at right now".
pub trait BranchTipSource: Send + Sync {
    fn branch_tip(
        &self,
        component: &ComponentDef,
        branch: &BranchName,
    ) -> Result<CommitId, ResolutionError>;
}

/// Queries branch tips with `git ls-remote`.
#[derive(Debug, Clone)]
pub struct GitRemoteTips {
    git: PathBuf,
}

impl Default for GitRemoteTips {
    fn default() -> Self {
        Self {
            git: PathBuf::from("git"),
        }
    }
}

impl GitRemoteTips {
    pub fn with_git(git: impl Into<PathBuf>) -> Self {
        Self { git: git.into() }
    }
}

impl BranchTipSource for GitRemoteTips {
    fn branch_tip(
        &self,
        component: &ComponentDef,
        branch: &BranchName,
    ) -> Result<CommitId, ResolutionError> {
        let refname = format!("refs/heads/{branch}");
        debug!("git ls-remote {} {refname}", component.repo);
        let output = Command::new(&self.git)
            .arg("ls-remote")
            .arg(&component.repo)
            .arg(&refname)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|e| ResolutionError::Unreachable {
                component: component.name.to_string(),
                repo: component.repo.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ResolutionError::Unreachable {
                component: component.name.to_string(),
                repo: component.repo.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| l.split_whitespace().nth(1) == Some(refname.as_str()))
            .ok_or_else(|| ResolutionError::UnknownBranch {
                component: component.name.to_string(),
                branch: branch.to_string(),
                repo: component.repo.clone(),
            })?;
        let sha = line.split_whitespace().next().unwrap_or_default();
        if sha.len() != 40 || !is_commit_id(sha) {
            return Err(ResolutionError::MalformedTip {
                component: component.name.to_string(),
                value: sha.to_owned(),
            });
        }
        Ok(CommitId::new(sha.to_ascii_lowercase()))
    }
}

/// Turns a catalog plus overrides into a concrete plan.
///
/// Resolution is a pure function of its inputs for catalogs without branch-tip
/// pins. Every entry whose commit came from a tip query is flagged `symbolic`.
pub struct VersionResolver<'a> {
    table: &'a ComponentTable,
    tips: &'a dyn BranchTipSource,
}

impl<'a> VersionResolver<'a> {
    pub fn new(table: &'a ComponentTable, tips: &'a dyn BranchTipSource) -> Self {
        Self { table, tips }
    }

    pub fn resolve(
        &self,
        catalog: &VersionCatalog,
        overrides: &Overrides,
    ) -> Result<ResolvedPlan, ResolutionError> {
        self.table.check_catalog(catalog)?;
        if let Some(unknown) = overrides.names().find(|n| catalog.get(n).is_none()) {
            return Err(ResolutionError::UnknownOverride(unknown.to_string()));
        }

        let mut components = Vec::with_capacity(catalog.len());
        for spec in catalog.entries() {
            let def = self.table.get(&spec.name).ok_or_else(|| {
                ComponentTableError::UnknownCatalogComponent {
                    catalog: catalog.name().to_string(),
                    component: spec.name.to_string(),
                }
            })?;
            let branch = spec.branch.clone().unwrap_or_else(|| def.branch.clone());
            let (pin, overridden) = match overrides.get(&spec.name) {
                Some(pin) => (pin, true),
                None => (&spec.pin, false),
            };

            let (commit, origin) = match pin {
                RevisionPin::Commit(id) if overridden => (id.clone(), PinOrigin::Override),
                RevisionPin::Commit(id) => (id.clone(), PinOrigin::Catalog),
                RevisionPin::BranchTip => {
                    let commit = self.tips.branch_tip(def, &branch)?;
                    info!("resolved {} {branch}@HEAD to {}", spec.name, commit.short());
                    let origin = if overridden {
                        PinOrigin::Override
                    } else {
                        PinOrigin::BranchTip
                    };
                    (commit, origin)
                }
            };

            components.push(ResolvedComponent {
                name: spec.name.clone(),
                branch,
                commit,
                origin,
                symbolic: pin.is_symbolic(),
            });
        }

        let plan = ResolvedPlan::new(
            catalog.name().clone(),
            catalog.digest().to_owned(),
            components,
        );
        let symbolic = plan.symbolic_components().count();
        if symbolic > 0 {
            warn!(
                "plan {} is not reproducible: {symbolic} component(s) resolved from branch tips",
                plan.plan_id.short()
            );
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetforge_schema::{parse_catalog_str, parse_component_table_str};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TABLE: &str = r#"
[[component]]
name = "bootloader"
repo = "git://example/u-boot"
builder = ["true"]

[[component]]
name = "kernel"
repo = "git://example/linux"
branch = "lts"
builder = ["true"]

[[component]]
name = "ui-shell"
repo = "git://example/shell"
builder = ["true"]
"#;

    /// Tip source backed by a fixed map; counts queries.
    struct FixedTips {
        tips: BTreeMap<String, String>,
        queries: AtomicUsize,
    }

    impl FixedTips {
        fn new(entries: &[(&str, &str)]) -> Self {
            Self {
                tips: entries
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
                queries: AtomicUsize::new(0),
            }
        }
    }

    impl BranchTipSource for FixedTips {
        fn branch_tip(
            &self,
            component: &ComponentDef,
            branch: &BranchName,
        ) -> Result<CommitId, ResolutionError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let key = format!("{}:{branch}", component.name);
            self.tips
                .get(&key)
                .map(|c| CommitId::new(c.clone()))
                .ok_or_else(|| ResolutionError::UnknownBranch {
                    component: component.name.to_string(),
                    branch: branch.to_string(),
                    repo: component.repo.clone(),
                })
        }
    }

    fn table() -> ComponentTable {
        parse_component_table_str(TABLE).unwrap()
    }

    #[test]
    fn catalog_pin_is_used_without_override() {
        let catalog = parse_catalog_str(
            "nightly",
            "BOOTLOADER_REV=aaa1111\nKERNEL_REV=abc123\nUI_SHELL_REV=bbb2222\n",
        )
        .unwrap();
        let tips = FixedTips::new(&[]);
        let table = table();
        let plan = VersionResolver::new(&table, &tips)
            .resolve(&catalog, &Overrides::new())
            .unwrap();
        let kernel = plan.get("kernel").unwrap();
        assert_eq!(kernel.commit.as_str(), "abc123");
        assert_eq!(kernel.origin, PinOrigin::Catalog);
        assert_eq!(kernel.branch.as_str(), "lts");
        assert!(!kernel.symbolic);
        assert_eq!(tips.queries.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn override_wins_over_head() {
        let catalog = parse_catalog_str(
            "nightly",
            "BOOTLOADER_REV=aaa1111\nKERNEL_REV=HEAD\nUI_SHELL_REV=bbb2222\n",
        )
        .unwrap();
        let tips = FixedTips::new(&[]);
        let table = table();
        let overrides = Overrides::parse(&["kernel=def456"]).unwrap();
        let plan = VersionResolver::new(&table, &tips)
            .resolve(&catalog, &overrides)
            .unwrap();
        let kernel = plan.get("kernel").unwrap();
        assert_eq!(kernel.commit.as_str(), "def456");
        assert_eq!(kernel.origin, PinOrigin::Override);
        assert!(!kernel.symbolic);
        assert_eq!(tips.queries.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn head_is_resolved_and_flagged() {
        let sha = "0123456789abcdef0123456789abcdef01234567";
        let catalog = parse_catalog_str(
            "nightly",
            "BOOTLOADER_REV=aaa1111\nKERNEL_REV=abc1234\nUI_SHELL_BRANCH=develop\nUI_SHELL_REV=HEAD\n",
        )
        .unwrap();
        let tips = FixedTips::new(&[("ui-shell:develop", sha)]);
        let table = table();
        let plan = VersionResolver::new(&table, &tips)
            .resolve(&catalog, &Overrides::new())
            .unwrap();
        let shell = plan.get("ui-shell").unwrap();
        assert_eq!(shell.commit.as_str(), sha);
        assert_eq!(shell.origin, PinOrigin::BranchTip);
        assert!(shell.symbolic);
        assert!(!plan.is_reproducible());
    }

    #[test]
    fn head_override_forces_tip_query() {
        let sha = "fedcba9876543210fedcba9876543210fedcba98";
        let catalog = parse_catalog_str(
            "nightly",
            "BOOTLOADER_REV=aaa1111\nKERNEL_REV=abc1234\nUI_SHELL_REV=bbb2222\n",
        )
        .unwrap();
        let tips = FixedTips::new(&[("kernel:lts", sha)]);
        let table = table();
        let overrides = Overrides::parse(&["kernel=HEAD"]).unwrap();
        let plan = VersionResolver::new(&table, &tips)
            .resolve(&catalog, &overrides)
            .unwrap();
        let kernel = plan.get("kernel").unwrap();
        assert_eq!(kernel.commit.as_str(), sha);
        assert_eq!(kernel.origin, PinOrigin::Override);
        assert!(kernel.symbolic);
    }

    #[test]
    fn failed_tip_query_is_an_error() {
        let catalog = parse_catalog_str(
            "nightly",
            "BOOTLOADER_REV=aaa1111\nKERNEL_REV=HEAD\nUI_SHELL_REV=bbb2222\n",
        )
        .unwrap();
        let tips = FixedTips::new(&[]);
        let table = table();
        let err = VersionResolver::new(&table, &tips)
            .resolve(&catalog, &Overrides::new())
            .unwrap_err();
        assert!(matches!(err, ResolutionError::UnknownBranch { .. }));
    }

    #[test]
    fn unknown_override_fails_fast() {
        let catalog = parse_catalog_str(
            "nightly",
            "BOOTLOADER_REV=aaa1111\nKERNEL_REV=HEAD\nUI_SHELL_REV=bbb2222\n",
        )
        .unwrap();
        let tips = FixedTips::new(&[]);
        let table = table();
        let overrides = Overrides::parse(&["kernal=def456"]).unwrap();
        let err = VersionResolver::new(&table, &tips)
            .resolve(&catalog, &overrides)
            .unwrap_err();
        assert!(matches!(err, ResolutionError::UnknownOverride(ref n) if n == "kernal"));
        // Nothing was queried before the typo was caught.
        assert_eq!(tips.queries.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fully_pinned_resolution_is_pure() {
        let catalog = parse_catalog_str(
            "beta",
            "BOOTLOADER_REV=aaa1111\nKERNEL_REV=abc1234\nUI_SHELL_REV=bbb2222\n",
        )
        .unwrap();
        let tips = FixedTips::new(&[]);
        let table = table();
        let overrides = Overrides::parse(&["ui-shell=ccc3333"]).unwrap();
        let resolver = VersionResolver::new(&table, &tips);
        let a = resolver.resolve(&catalog, &overrides).unwrap();
        let b = resolver.resolve(&catalog, &overrides).unwrap();
        assert_eq!(a, b);
        assert!(a.is_reproducible());
    }

    #[test]
    fn catalog_table_mismatch_is_an_error() {
        let catalog = parse_catalog_str("beta", "BOOTLOADER_REV=aaa1111\n").unwrap();
        let tips = FixedTips::new(&[]);
        let table = table();
        let err = VersionResolver::new(&table, &tips)
            .resolve(&catalog, &Overrides::new())
            .unwrap_err();
        assert!(matches!(err, ResolutionError::Table(_)));
    }

    #[test]
    fn override_parsing() {
        assert!(matches!(
            Overrides::parse(&["kernel"]),
            Err(ResolutionError::MalformedOverride(_))
        ));
        assert!(matches!(
            Overrides::parse(&["kernel="]),
            Err(ResolutionError::MalformedOverride(_))
        ));
        assert!(matches!(
            Overrides::parse(&["kernel=main"]),
            Err(ResolutionError::AmbiguousOverride { .. })
        ));
        assert!(matches!(
            Overrides::parse(&["kernel=abc1234", "kernel=def5678"]),
            Err(ResolutionError::DuplicateOverride(_))
        ));
        let parsed = Overrides::parse(&[" kernel = abc1234 "]).unwrap();
        assert_eq!(
            parsed.get(&ComponentName::new("kernel")),
            Some(&RevisionPin::Commit(CommitId::new("abc1234")))
        );
    }

    #[test]
    fn git_tips_unreachable_when_git_missing() {
        let table = table();
        let tips = GitRemoteTips::with_git("/nonexistent/git-binary");
        let err = tips
            .branch_tip(table.get("kernel").unwrap(), &BranchName::new("lts"))
            .unwrap_err();
        assert!(matches!(err, ResolutionError::Unreachable { .. }));
    }
}
