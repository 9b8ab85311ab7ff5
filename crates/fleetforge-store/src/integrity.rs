use crate::layout::ArtifactLayout;
use crate::provenance::list_provenance;
use crate::StoreError;
use fleetforge_schema::ResolvedPlan;
use std::fs;

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub artifacts_checked: usize,
    pub artifacts_passed: usize,
    pub plans_checked: usize,
    pub plans_passed: usize,
    pub failed: Vec<IntegrityFailure>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
pub struct IntegrityFailure {
    pub path: String,
    pub reason: String,
}

/// Verify every provenance record and stored plan under the store root.
pub fn verify_store_integrity(layout: &ArtifactLayout) -> Result<IntegrityReport, StoreError> {
    let mut report = IntegrityReport::default();

    // Provenance records (embedded checksum)
    for (dir, outcome) in list_provenance(&layout.artifacts_dir())? {
        report.artifacts_checked += 1;
        match outcome {
            Ok(_) => report.artifacts_passed += 1,
            Err(StoreError::IntegrityFailure { actual, .. }) => {
                report.failed.push(IntegrityFailure {
                    path: dir.display().to_string(),
                    reason: format!("provenance checksum mismatch: got {actual}"),
                });
            }
            Err(e) => {
                report.failed.push(IntegrityFailure {
                    path: dir.display().to_string(),
                    reason: format!("provenance read error: {e}"),
                });
            }
        }
    }

    // Plans (plan_id recomputed from content)
    let plans_dir = layout.plans_dir();
    if plans_dir.is_dir() {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&plans_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "toml") {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            report.plans_checked += 1;
            match ResolvedPlan::read_from_file(&path) {
                Ok(plan) if path.file_stem().is_some_and(|s| *s == *plan.plan_id) => {
                    report.plans_passed += 1;
                }
                Ok(plan) => report.failed.push(IntegrityFailure {
                    path: path.display().to_string(),
                    reason: format!("plan file name does not match plan id {}", plan.plan_id),
                }),
                Err(e) => report.failed.push(IntegrityFailure {
                    path: path.display().to_string(),
                    reason: format!("plan verification failed: {e}"),
                }),
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::{write_provenance, ProvenanceRecord, PROVENANCE_FILE};
    use fleetforge_schema::{
        BranchName, CatalogName, CommitId, ComponentName, PinOrigin, PlanId, ResolvedComponent,
    };

    fn record() -> ProvenanceRecord {
        ProvenanceRecord {
            component: ComponentName::new("kernel"),
            revision: CommitId::new("abc1234"),
            branch: BranchName::new("main"),
            symbolic: false,
            catalog: CatalogName::new("nightly"),
            plan_id: PlanId::new("a".repeat(64)),
            built_at: ProvenanceRecord::now(),
            builder: "test".to_owned(),
            duration_ms: 1,
            checksum: None,
        }
    }

    fn plan() -> ResolvedPlan {
        ResolvedPlan::new(
            CatalogName::new("nightly"),
            "d".repeat(64),
            vec![ResolvedComponent {
                name: ComponentName::new("kernel"),
                branch: BranchName::new("main"),
                commit: CommitId::new("abc1234"),
                origin: PinOrigin::Catalog,
                symbolic: false,
            }],
        )
    }

    fn populated() -> (tempfile::TempDir, ArtifactLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        layout.initialize().unwrap();
        let artifact = layout.artifacts_dir().join("kernel/abc1234");
        fs::create_dir_all(&artifact).unwrap();
        write_provenance(&artifact, &record()).unwrap();
        let plan = plan();
        plan.write_to_file(layout.plan_path(&plan.plan_id)).unwrap();
        (dir, layout)
    }

    #[test]
    fn clean_store_passes_integrity() {
        let (_dir, layout) = populated();
        let report = verify_store_integrity(&layout).unwrap();
        assert_eq!(report.artifacts_checked, 1);
        assert_eq!(report.artifacts_passed, 1);
        assert_eq!(report.plans_checked, 1);
        assert_eq!(report.plans_passed, 1);
        assert!(report.is_clean());
    }

    #[test]
    fn corrupted_provenance_detected() {
        let (_dir, layout) = populated();
        let path = layout
            .artifacts_dir()
            .join("kernel/abc1234")
            .join(PROVENANCE_FILE);
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("\"test\"", "\"forged\"")).unwrap();

        let report = verify_store_integrity(&layout).unwrap();
        assert_eq!(report.artifacts_passed, 0);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.contains("checksum mismatch"));
    }

    #[test]
    fn renamed_plan_detected() {
        let (_dir, layout) = populated();
        let plan = plan();
        fs::rename(
            layout.plan_path(&plan.plan_id),
            layout.plans_dir().join("other.toml"),
        )
        .unwrap();
        let report = verify_store_integrity(&layout).unwrap();
        assert_eq!(report.plans_checked, 1);
        assert_eq!(report.plans_passed, 0);
        assert!(!report.is_clean());
    }

    #[test]
    fn empty_store_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        layout.initialize().unwrap();
        let report = verify_store_integrity(&layout).unwrap();
        assert_eq!(report.artifacts_checked, 0);
        assert!(report.is_clean());
    }
}
