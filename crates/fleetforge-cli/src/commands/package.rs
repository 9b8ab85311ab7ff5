use super::{
    json_pretty, load_config, parse_plan_id, spin_fail, spin_ok, spinner, EXIT_SUCCESS,
};
use fleetforge_bundle::{publish_to_channel, BundlePackager, PackageRequest};
use fleetforge_core::Pipeline;
use fleetforge_schema::ProjectConfig;
use std::path::{Path, PathBuf};

/// Directory under the bundle output directory that holds update channels.
pub const CHANNELS_DIR: &str = "channels";

#[derive(Debug, Clone, Default)]
pub struct PackageArgs {
    pub plan: Option<String>,
    pub rootfs: Option<PathBuf>,
    pub version: Option<String>,
    pub variant: Option<String>,
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub hook: Option<PathBuf>,
    pub channel: Option<String>,
}

/// Rootfs path and the plan's catalog name, when packaging from a plan.
fn rootfs_source(
    config: &ProjectConfig,
    args: &PackageArgs,
) -> Result<(PathBuf, Option<String>), String> {
    if let Some(rootfs) = &args.rootfs {
        return Ok((rootfs.clone(), None));
    }
    let Some(plan_id) = args.plan.as_deref() else {
        return Err("either --plan or --rootfs is required".to_owned());
    };
    let component = config
        .bundle
        .rootfs_component
        .clone()
        .ok_or("config error: bundle.rootfs_component is not set")?;
    let pipeline = Pipeline::open(config.clone()).map_err(|e| e.to_string())?;
    let plan = pipeline
        .load_plan(&parse_plan_id(plan_id)?)
        .map_err(|e| e.to_string())?;
    let dir = pipeline
        .artifact_dir(&plan, &component)
        .map_err(|e| e.to_string())?;
    Ok((dir, Some(plan.catalog.into_inner())))
}

pub fn run(config_path: &Path, args: &PackageArgs, json: bool) -> Result<u8, String> {
    let config = load_config(config_path)?;
    let key = args
        .key
        .clone()
        .or_else(|| config.signing.key.clone())
        .ok_or("packaging error: no signing key (set signing.key or pass --key)")?;
    let cert = args
        .cert
        .clone()
        .or_else(|| config.signing.cert.clone())
        .ok_or("packaging error: no signing certificate (set signing.cert or pass --cert)")?;

    let (rootfs, catalog) = rootfs_source(&config, args)?;
    let variant = args
        .variant
        .clone()
        .or_else(|| config.bundle.variant.clone())
        .or(catalog)
        .ok_or("config error: no variant (set bundle.variant or pass --variant)")?;

    let request = PackageRequest {
        rootfs,
        variant,
        key,
        cert,
        hook: args.hook.clone().or_else(|| config.bundle.hook.clone()),
        version: args.version.clone(),
        output_dir: config.paths.bundles.clone(),
    };

    let pb = (!json).then(|| spinner("packaging bundle..."));
    let packaged = match BundlePackager::new().package(&request) {
        Ok(p) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "bundle signed");
            }
            p
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "packaging failed");
            }
            return Err(format!("packaging error: {e}"));
        }
    };

    let published = match args.channel.as_deref() {
        Some(channel) => Some(
            publish_to_channel(
                &config.paths.bundles.join(CHANNELS_DIR),
                channel,
                &packaged.path,
            )
            .map_err(|e| format!("packaging error: {e}"))?,
        ),
        None => None,
    };

    let manifest = &packaged.bundle.manifest;
    if json {
        let payload = serde_json::json!({
            "path": packaged.path,
            "bundle_version": manifest.bundle_version,
            "variant": manifest.variant,
            "signing_key": manifest.signing_key_fingerprint,
            "slots": manifest.slots,
            "channel": args.channel,
            "published": published,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "bundle {} ({}) -> {}",
            manifest.bundle_version,
            manifest.variant,
            packaged.path.display()
        );
        for slot in &manifest.slots {
            println!("  {:<14} {} {} bytes", slot.name, slot.hash, slot.size);
        }
        if let (Some(channel), Some(path)) = (args.channel.as_deref(), published.as_ref()) {
            println!("published to channel {channel}: {}", path.display());
        }
    }
    Ok(EXIT_SUCCESS)
}
