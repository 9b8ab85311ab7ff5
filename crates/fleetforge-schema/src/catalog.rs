use crate::types::{BranchName, CatalogName, CommitId, ComponentName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Reserved revision value meaning "resolve to the branch tip at build time".
pub const HEAD_SENTINEL: &str = "HEAD";

const REV_SUFFIX: &str = "_REV";
const BRANCH_SUFFIX: &str = "_BRANCH";
const CATALOG_EXTENSION: &str = "env";
const MIN_COMMIT_LEN: usize = 6;
const MAX_COMMIT_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("invalid catalog name '{0}'")]
    InvalidName(String),
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: duplicate key '{key}'")]
    DuplicateKey { line: usize, key: String },
    #[error(
        "line {line}: ambiguous revision '{value}' for {key}, expected a commit id (6-40 hex chars) or HEAD"
    )]
    AmbiguousRevision {
        line: usize,
        key: String,
        value: String,
    },
    #[error("line {line}: empty branch for {key}")]
    EmptyBranch { line: usize, key: String },
    #[error("component '{0}' declares a branch but no revision")]
    MissingRevision(String),
    #[error("catalog '{0}' pins no components")]
    Empty(String),
}

/// How a catalog entry pins its source revision.
///
/// The `HEAD` sentinel of the file format never survives parsing: it becomes
/// [`RevisionPin::BranchTip`], so the reproducibility hazard is visible in the type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevisionPin {
    /// A fixed, immutable commit.
    Commit(CommitId),
    /// Whatever the tracked branch points at when the plan is resolved.
    BranchTip,
}

impl RevisionPin {
    /// Parse a revision value: `HEAD` or a hex commit id. Anything else is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        if value == HEAD_SENTINEL {
            return Some(RevisionPin::BranchTip);
        }
        if is_commit_id(value) {
            return Some(RevisionPin::Commit(CommitId::new(value.to_ascii_lowercase())));
        }
        None
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, RevisionPin::BranchTip)
    }

    pub fn commit(&self) -> Option<&CommitId> {
        match self {
            RevisionPin::Commit(id) => Some(id),
            RevisionPin::BranchTip => None,
        }
    }
}

impl fmt::Display for RevisionPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevisionPin::Commit(id) => f.write_str(id),
            RevisionPin::BranchTip => f.write_str(HEAD_SENTINEL),
        }
    }
}

/// Whether `value` looks like a (possibly abbreviated) hex commit id.
pub fn is_commit_id(value: &str) -> bool {
    (MIN_COMMIT_LEN..=MAX_COMMIT_LEN).contains(&value.len())
        && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// One pinned component within a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: ComponentName,
    /// Branch declared by the catalog; the component table's default applies otherwise.
    pub branch: Option<BranchName>,
    pub pin: RevisionPin,
}

/// A named, immutable set of component pins for one image configuration.
///
/// Entries keep the order in which the catalog file first mentions each
/// component. That order is the tie-break for independent build jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCatalog {
    name: CatalogName,
    entries: Vec<ComponentSpec>,
    digest: String,
}

impl VersionCatalog {
    pub fn name(&self) -> &CatalogName {
        &self.name
    }

    pub fn entries(&self) -> &[ComponentSpec] {
        &self.entries
    }

    pub fn get(&self, component: &str) -> Option<&ComponentSpec> {
        self.entries.iter().find(|e| e.name == *component)
    }

    /// Declaration index of a component, used for deterministic ordering.
    pub fn position(&self, component: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == *component)
    }

    /// Blake3 digest over the canonical form of every entry.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when no entry tracks a branch tip, i.e. resolution is reproducible.
    pub fn is_fully_pinned(&self) -> bool {
        self.entries.iter().all(|e| !e.pin.is_symbolic())
    }

    pub fn symbolic_components(&self) -> impl Iterator<Item = &ComponentName> {
        self.entries
            .iter()
            .filter(|e| e.pin.is_symbolic())
            .map(|e| &e.name)
    }
}

fn compute_digest(name: &CatalogName, entries: &[ComponentSpec]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(format!("catalog:{name}").as_bytes());
    for entry in entries {
        hasher.update(format!("component:{}", entry.name).as_bytes());
        if let Some(branch) = &entry.branch {
            hasher.update(format!("branch:{branch}").as_bytes());
        }
        hasher.update(format!("rev:{}", entry.pin).as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Map a catalog key prefix (`UI_SHELL`) to its component name (`ui-shell`).
pub fn component_name_for_key(prefix: &str) -> Option<ComponentName> {
    let well_formed = !prefix.is_empty()
        && !prefix.starts_with('_')
        && !prefix.ends_with('_')
        && !prefix.contains("__")
        && prefix
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if !well_formed {
        return None;
    }
    Some(ComponentName::new(
        prefix.to_ascii_lowercase().replace('_', "-"),
    ))
}

/// Inverse of [`component_name_for_key`]: the key prefix a component uses in catalog files.
pub fn catalog_key_for(component: &ComponentName) -> String {
    component.to_ascii_uppercase().replace('-', "_")
}

fn validate_catalog_name(name: &str) -> Result<CatalogName, CatalogError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(CatalogName::new(name))
    } else {
        Err(CatalogError::InvalidName(name.to_owned()))
    }
}

fn syntax(line: usize, message: impl Into<String>) -> CatalogError {
    CatalogError::Syntax {
        line,
        message: message.into(),
    }
}

/// Extract the value part of a `KEY=value` line, honoring quotes and trailing comments.
fn split_value(raw: &str) -> Result<&str, &'static str> {
    let raw = raw.trim();
    let (value, rest) = match raw.chars().next() {
        Some(quote @ ('"' | '\'')) => {
            let inner = &raw[1..];
            let end = inner.find(quote).ok_or("unterminated quoted value")?;
            (&inner[..end], &inner[end + 1..])
        }
        _ => match raw.find(char::is_whitespace) {
            Some(end) => (&raw[..end], &raw[end..]),
            None => (raw, ""),
        },
    };
    let rest = rest.trim_start();
    if rest.is_empty() || rest.starts_with('#') {
        Ok(value)
    } else {
        Err("unexpected text after value")
    }
}

/// Parse catalog file content. `name` is the image configuration identifier.
pub fn parse_catalog_str(name: &str, content: &str) -> Result<VersionCatalog, CatalogError> {
    let name = validate_catalog_name(name)?;

    let mut order: Vec<ComponentName> = Vec::new();
    let mut revisions: BTreeMap<ComponentName, RevisionPin> = BTreeMap::new();
    let mut branches: BTreeMap<ComponentName, BranchName> = BTreeMap::new();
    let mut seen_keys: BTreeSet<String> = BTreeSet::new();

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map_or(line, str::trim_start);

        let (key, raw_value) = line
            .split_once('=')
            .ok_or_else(|| syntax(line_no, "expected KEY=\"value\""))?;
        let key = key.trim();
        let value = split_value(raw_value).map_err(|msg| syntax(line_no, msg))?;

        if !seen_keys.insert(key.to_owned()) {
            return Err(CatalogError::DuplicateKey {
                line: line_no,
                key: key.to_owned(),
            });
        }

        let (prefix, is_revision) = if let Some(prefix) = key.strip_suffix(REV_SUFFIX) {
            (prefix, true)
        } else if let Some(prefix) = key.strip_suffix(BRANCH_SUFFIX) {
            (prefix, false)
        } else {
            return Err(syntax(
                line_no,
                format!("key '{key}' must end in {REV_SUFFIX} or {BRANCH_SUFFIX}"),
            ));
        };
        let component = component_name_for_key(prefix)
            .ok_or_else(|| syntax(line_no, format!("invalid component key '{key}'")))?;
        if !order.contains(&component) {
            order.push(component.clone());
        }

        if is_revision {
            let pin = RevisionPin::parse(value).ok_or_else(|| CatalogError::AmbiguousRevision {
                line: line_no,
                key: key.to_owned(),
                value: value.to_owned(),
            })?;
            revisions.insert(component, pin);
        } else {
            if value.is_empty() {
                return Err(CatalogError::EmptyBranch {
                    line: line_no,
                    key: key.to_owned(),
                });
            }
            branches.insert(component, BranchName::new(value));
        }
    }

    let mut entries = Vec::with_capacity(order.len());
    for component in order {
        let pin = revisions
            .remove(&component)
            .ok_or_else(|| CatalogError::MissingRevision(component.to_string()))?;
        let branch = branches.remove(&component);
        entries.push(ComponentSpec {
            name: component,
            branch,
            pin,
        });
    }
    if entries.is_empty() {
        return Err(CatalogError::Empty(name.into_inner()));
    }

    let digest = compute_digest(&name, &entries);
    Ok(VersionCatalog {
        name,
        entries,
        digest,
    })
}

/// Parse a catalog file; the catalog name is the file stem.
pub fn parse_catalog_file(path: &Path) -> Result<VersionCatalog, CatalogError> {
    if !path.is_file() {
        return Err(CatalogError::NotFound(path.to_path_buf()));
    }
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CatalogError::InvalidName(path.display().to_string()))?;
    let content = fs::read_to_string(path)?;
    parse_catalog_str(name, &content)
}

/// Load the catalog for image configuration `name` from `dir/<name>.env`.
pub fn load_catalog(dir: &Path, name: &str) -> Result<VersionCatalog, CatalogError> {
    validate_catalog_name(name)?;
    parse_catalog_file(&dir.join(format!("{name}.{CATALOG_EXTENSION}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NIGHTLY: &str = r#"
# nightly image
export BOOTLOADER_REV="9f8e7d6c5b4a"
BOOTLOADER_BRANCH="v2024.04"
KERNEL_REV="abc123"
UI_SHELL_BRANCH='develop'
UI_SHELL_REV=HEAD   # tracks develop
"#;

    #[test]
    fn parses_entries_in_declaration_order() {
        let catalog = parse_catalog_str("nightly", NIGHTLY).unwrap();
        assert_eq!(catalog.name().as_str(), "nightly");
        let names: Vec<&str> = catalog.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["bootloader", "kernel", "ui-shell"]);
        assert_eq!(catalog.position("ui-shell"), Some(2));
    }

    #[test]
    fn head_becomes_branch_tip() {
        let catalog = parse_catalog_str("nightly", NIGHTLY).unwrap();
        let shell = catalog.get("ui-shell").unwrap();
        assert_eq!(shell.pin, RevisionPin::BranchTip);
        assert_eq!(shell.branch.as_ref().unwrap().as_str(), "develop");
        assert!(!catalog.is_fully_pinned());
        let symbolic: Vec<&ComponentName> = catalog.symbolic_components().collect();
        assert_eq!(symbolic.len(), 1);
    }

    #[test]
    fn commit_pins_are_kept() {
        let catalog = parse_catalog_str("nightly", NIGHTLY).unwrap();
        let kernel = catalog.get("kernel").unwrap();
        assert_eq!(kernel.pin.commit().unwrap().as_str(), "abc123");
        assert!(kernel.branch.is_none());
    }

    #[test]
    fn uppercase_commit_is_normalized() {
        let catalog = parse_catalog_str("beta", "KERNEL_REV=ABCDEF12\n").unwrap();
        assert_eq!(
            catalog.get("kernel").unwrap().pin,
            RevisionPin::Commit(CommitId::new("abcdef12"))
        );
    }

    #[test]
    fn ambiguous_revision_rejected() {
        for bad in ["main", "latest", "v1.2.3", "abc", "head", ""] {
            let content = format!("KERNEL_REV=\"{bad}\"\n");
            let err = parse_catalog_str("beta", &content).unwrap_err();
            assert!(
                matches!(err, CatalogError::AmbiguousRevision { line: 1, .. }),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn duplicate_key_rejected() {
        let err = parse_catalog_str("beta", "KERNEL_REV=abc123\nKERNEL_REV=def456\n").unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateKey { line: 2, .. }));
    }

    #[test]
    fn branch_without_revision_rejected() {
        let err = parse_catalog_str("beta", "KERNEL_REV=abc123\nFIRMWARE_BRANCH=main\n").unwrap_err();
        assert!(matches!(err, CatalogError::MissingRevision(ref c) if c == "firmware"));
    }

    #[test]
    fn unknown_suffix_rejected() {
        let err = parse_catalog_str("beta", "KERNEL_VERSION=abc123\n").unwrap_err();
        assert!(matches!(err, CatalogError::Syntax { line: 1, .. }));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let err = parse_catalog_str("beta", "KERNEL_REV=\"abc123\" extra\n").unwrap_err();
        assert!(matches!(err, CatalogError::Syntax { .. }));
        let err = parse_catalog_str("beta", "KERNEL_REV=\"abc123\n").unwrap_err();
        assert!(matches!(err, CatalogError::Syntax { .. }));
    }

    #[test]
    fn empty_catalog_rejected() {
        let err = parse_catalog_str("beta", "# nothing here\n\n").unwrap_err();
        assert!(matches!(err, CatalogError::Empty(_)));
    }

    #[test]
    fn invalid_catalog_name_rejected() {
        assert!(matches!(
            parse_catalog_str("../etc", "KERNEL_REV=abc123"),
            Err(CatalogError::InvalidName(_))
        ));
        assert!(matches!(
            parse_catalog_str("", "KERNEL_REV=abc123"),
            Err(CatalogError::InvalidName(_))
        ));
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let a = parse_catalog_str("nightly", NIGHTLY).unwrap();
        let b = parse_catalog_str("nightly", NIGHTLY).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let changed = NIGHTLY.replace("abc123", "abc124");
        let c = parse_catalog_str("nightly", &changed).unwrap();
        assert_ne!(a.digest(), c.digest());

        let renamed = parse_catalog_str("beta", NIGHTLY).unwrap();
        assert_ne!(a.digest(), renamed.digest());
    }

    #[test]
    fn key_mapping_roundtrips() {
        let name = component_name_for_key("UI_SHELL").unwrap();
        assert_eq!(name.as_str(), "ui-shell");
        assert_eq!(catalog_key_for(&name), "UI_SHELL");
        assert!(component_name_for_key("_KERNEL").is_none());
        assert!(component_name_for_key("KER__NEL").is_none());
        assert!(component_name_for_key("kernel").is_none());
        assert!(component_name_for_key("").is_none());
    }

    #[test]
    fn load_catalog_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("nightly.env"), NIGHTLY).unwrap();
        let catalog = load_catalog(dir.path(), "nightly").unwrap();
        assert_eq!(catalog.len(), 3);

        let missing = load_catalog(dir.path(), "beta").unwrap_err();
        assert!(matches!(missing, CatalogError::NotFound(_)));
    }
}
