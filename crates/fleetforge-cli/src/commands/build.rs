use super::{
    colorize_status, json_pretty, open_pipeline, parse_plan_id, spin_fail, spin_ok, spinner, EXIT_FAILURE,
    EXIT_PARTIAL_FAILURE, EXIT_SUCCESS,
};
use fleetforge_core::{
    default_builder_identity, install_signal_handler, CancelToken, CommandBuilder, GitRemoteTips,
    Overrides, Pipeline, PipelineStatus, Selection,
};
use fleetforge_schema::{ComponentName, ResolvedPlan};
use std::path::Path;

fn selection(pipeline: &Pipeline, components: &[String]) -> Result<Selection, String> {
    if components.is_empty() {
        return Ok(Selection::All);
    }
    let mut names = Vec::with_capacity(components.len());
    for name in components {
        if !pipeline.table().contains(name) {
            let known: Vec<&str> = pipeline.table().names().map(ComponentName::as_str).collect();
            return Err(format!(
                "unknown component '{name}' (known: {})",
                known.join(", ")
            ));
        }
        names.push(ComponentName::new(name.as_str()));
    }
    Ok(Selection::Only(names))
}

fn plan_for(
    pipeline: &Pipeline,
    catalog_name: &str,
    overrides: &[String],
    plan_id: Option<&str>,
) -> Result<ResolvedPlan, String> {
    if let Some(id) = plan_id {
        let plan = pipeline
            .load_plan(&parse_plan_id(id)?)
            .map_err(|e| e.to_string())?;
        if plan.catalog.as_str() != catalog_name {
            return Err(format!(
                "plan error: plan {} was resolved from catalog '{}', not '{catalog_name}'",
                plan.plan_id.short(),
                plan.catalog
            ));
        }
        return Ok(plan);
    }
    let overrides = Overrides::parse(overrides).map_err(|e| format!("resolution error: {e}"))?;
    let catalog = pipeline
        .load_catalog(catalog_name)
        .map_err(|e| e.to_string())?;
    let (plan, _) = pipeline
        .resolve(&catalog, &overrides, &GitRemoteTips::default())
        .map_err(|e| e.to_string())?;
    Ok(plan)
}

pub fn run(
    config_path: &Path,
    catalog_name: &str,
    components: &[String],
    overrides: &[String],
    plan_id: Option<&str>,
    json: bool,
) -> Result<u8, String> {
    let pipeline = open_pipeline(config_path)?;
    let selection = selection(&pipeline, components)?;
    let plan = plan_for(&pipeline, catalog_name, overrides, plan_id)?;
    for c in plan.symbolic_components() {
        tracing::warn!(
            "{} resolved from branch {} to {}; this build is not reproducible",
            c.name,
            c.branch,
            c.commit
        );
    }

    let identity = pipeline
        .config()
        .build
        .builder_identity
        .clone()
        .unwrap_or_else(default_builder_identity);
    let builder = CommandBuilder::new(identity);
    let cancel = CancelToken::new();
    install_signal_handler(cancel.clone());

    let pb = (!json).then(|| spinner(&format!("building plan {}...", plan.plan_id.short())));
    let (report, report_path) = match pipeline.build(&plan, &selection, &builder, cancel) {
        Ok(r) => r,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build aborted");
            }
            return Err(e.to_string());
        }
    };
    if let Some(ref pb) = pb {
        if report.is_success() {
            spin_ok(pb, "build succeeded");
        } else {
            spin_fail(pb, &format!("build {}", report.status));
        }
    }

    if json {
        let payload = serde_json::json!({
            "report_path": report_path,
            "report": report,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        for job in &report.jobs {
            let detail = job
                .detail
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default();
            println!(
                "  {:<20} {:<12} {}{detail}",
                job.component.as_str(),
                job.revision.short(),
                colorize_status(&job.status.to_string())
            );
        }
        println!("report: {}", report_path.display());
    }

    match &report.status {
        PipelineStatus::Succeeded => Ok(EXIT_SUCCESS),
        PipelineStatus::PartialFailure { failed } => {
            let names: Vec<String> = failed.iter().map(ToString::to_string).collect();
            eprintln!("error: build failed for {}", names.join(", "));
            Ok(EXIT_PARTIAL_FAILURE)
        }
        PipelineStatus::Cancelled => {
            eprintln!("error: build cancelled");
            Ok(EXIT_FAILURE)
        }
    }
}
