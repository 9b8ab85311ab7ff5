use crate::types::{BranchName, CatalogName, CommitId, ComponentName, PlanId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const PLAN_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("plan file parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("plan file serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unsupported plan_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("plan id mismatch: plan has '{stored}', recomputed '{computed}'")]
    PlanIdMismatch { stored: String, computed: String },
}

/// Where the concrete commit of a plan entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PinOrigin {
    /// The catalog pinned an exact commit.
    Catalog,
    /// A per-build override supplied the revision.
    Override,
    /// The branch tip was queried at resolution time.
    BranchTip,
}

impl fmt::Display for PinOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinOrigin::Catalog => write!(f, "catalog"),
            PinOrigin::Override => write!(f, "override"),
            PinOrigin::BranchTip => write!(f, "branch-tip"),
        }
    }
}

/// One fully resolved component. `commit` is always concrete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedComponent {
    pub name: ComponentName,
    pub branch: BranchName,
    pub commit: CommitId,
    pub origin: PinOrigin,
    /// Set when the commit was obtained by querying a branch tip, so
    /// re-resolving later may yield a different commit.
    pub symbolic: bool,
}

/// A concrete, symbolic-free revision set ready to build.
///
/// The plan_id is computed from the catalog identity and the resolved
/// (component, commit) pairs only. No timestamp is recorded, so resolving a
/// fully pinned catalog twice produces byte-identical plans.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub plan_version: u32,
    pub plan_id: PlanId,
    pub catalog: CatalogName,
    pub catalog_digest: String,
    /// Entries in catalog declaration order.
    pub components: Vec<ResolvedComponent>,
}

impl ResolvedPlan {
    pub fn new(
        catalog: CatalogName,
        catalog_digest: String,
        components: Vec<ResolvedComponent>,
    ) -> Self {
        let plan = ResolvedPlan {
            plan_version: PLAN_VERSION,
            plan_id: PlanId::new(String::new()), // computed below
            catalog,
            catalog_digest,
            components,
        };
        let plan_id = plan.compute_plan_id();
        ResolvedPlan { plan_id, ..plan }
    }

    pub fn compute_plan_id(&self) -> PlanId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(format!("catalog:{}", self.catalog).as_bytes());
        hasher.update(format!("catalog_digest:{}", self.catalog_digest).as_bytes());
        for c in &self.components {
            hasher.update(format!("component:{}@{}", c.name, c.commit).as_bytes());
        }
        PlanId::new(hasher.finalize().to_hex().to_string())
    }

    /// Verify that the stored plan_id matches the recomputed one.
    pub fn verify_integrity(&self) -> Result<(), PlanError> {
        if self.plan_version != PLAN_VERSION {
            return Err(PlanError::UnsupportedVersion(self.plan_version));
        }
        let computed = self.compute_plan_id();
        if self.plan_id != computed {
            return Err(PlanError::PlanIdMismatch {
                stored: self.plan_id.to_string(),
                computed: computed.into_inner(),
            });
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedComponent> {
        self.components.iter().find(|c| c.name == *name)
    }

    /// Declaration index of a component, used as the ordering tie-break.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.components.iter().position(|c| c.name == *name)
    }

    /// True when every commit came from a fixed pin.
    pub fn is_reproducible(&self) -> bool {
        self.components.iter().all(|c| !c.symbolic)
    }

    pub fn symbolic_components(&self) -> impl Iterator<Item = &ResolvedComponent> {
        self.components.iter().filter(|c| c.symbolic)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), PlanError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| PlanError::Io(e.error))?;
        // Fsync parent directory to ensure rename durability on power loss.
        if let Ok(f) = fs::File::open(dir) {
            let _ = f.sync_all();
        }
        Ok(())
    }

    /// Read a plan and reject it if its identity no longer matches its content.
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let content = fs::read_to_string(path)?;
        let plan: ResolvedPlan = toml::from_str(&content)?;
        plan.verify_integrity()?;
        Ok(plan)
    }
}
