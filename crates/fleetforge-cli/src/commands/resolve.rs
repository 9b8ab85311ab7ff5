use super::{json_pretty, open_pipeline, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use fleetforge_core::{GitRemoteTips, Overrides};
use std::path::Path;

pub fn run(
    config_path: &Path,
    catalog_name: &str,
    overrides: &[String],
    json: bool,
) -> Result<u8, String> {
    let pipeline = open_pipeline(config_path)?;
    let overrides = Overrides::parse(overrides).map_err(|e| format!("resolution error: {e}"))?;
    let catalog = pipeline
        .load_catalog(catalog_name)
        .map_err(|e| e.to_string())?;

    let pb = (!json).then(|| spinner(&format!("resolving catalog '{catalog_name}'...")));
    let (plan, path) = match pipeline.resolve(&catalog, &overrides, &GitRemoteTips::default()) {
        Ok(r) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "catalog resolved");
            }
            r
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "resolution failed");
            }
            return Err(e.to_string());
        }
    };

    if json {
        let payload = serde_json::json!({
            "plan_id": plan.plan_id,
            "plan_path": path,
            "reproducible": plan.is_reproducible(),
            "components": plan.components,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("plan {} ({})", plan.plan_id.short(), plan.catalog);
    for c in &plan.components {
        let marker = if c.symbolic { " *" } else { "" };
        println!(
            "  {:<20} {} [{}] {}{marker}",
            c.name.as_str(),
            c.commit,
            c.branch,
            c.origin
        );
    }
    if !plan.is_reproducible() {
        eprintln!(
            "warning: entries marked * were resolved from branch tips; this plan is not reproducible"
        );
    }
    println!("plan_id: {}", plan.plan_id);
    println!("written to {}", path.display());
    Ok(EXIT_SUCCESS)
}
