use super::{json_pretty, open_pipeline, EXIT_STORE_ERROR, EXIT_SUCCESS};
use std::path::Path;

pub fn run(config_path: &Path, json: bool) -> Result<u8, String> {
    let pipeline = open_pipeline(config_path)?;
    let report = pipeline.verify_store().map_err(|e| e.to_string())?;

    if json {
        let payload = serde_json::json!({
            "artifacts_checked": report.artifacts_checked,
            "artifacts_passed": report.artifacts_passed,
            "plans_checked": report.plans_checked,
            "plans_passed": report.plans_passed,
            "failed": report.failed.len(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "store integrity: {}/{} artifacts, {}/{} plans passed",
            report.artifacts_passed,
            report.artifacts_checked,
            report.plans_passed,
            report.plans_checked
        );
        for f in &report.failed {
            println!("  FAIL {}: {}", f.path, f.reason);
        }
    }

    if report.is_clean() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_STORE_ERROR)
    }
}
