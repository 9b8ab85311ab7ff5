use super::{json_pretty, rollout_config, ServerArgs, EXIT_SUCCESS};
use fleetforge_bundle::read_manifest;
use fleetforge_remote::{publish_bundle, HawkbitClient, PublishRequest};
use std::path::Path;

pub struct PublishArgs {
    pub software_module: Option<String>,
    pub distribution: Option<String>,
    pub rollout: bool,
    pub autostart: bool,
}

pub fn run(
    bundle: &Path,
    channel: &str,
    args: PublishArgs,
    server: &ServerArgs,
    json: bool,
) -> Result<u8, String> {
    let software_module = match args.software_module {
        Some(name) => name,
        None => read_manifest(bundle)
            .map_err(|e| format!("verification failed: {e}"))?
            .manifest
            .variant,
    };
    let config = rollout_config(server)?;
    let client = HawkbitClient::new(&config);
    let receipt = publish_bundle(
        &client,
        &PublishRequest {
            bundle: bundle.to_path_buf(),
            channel: channel.to_owned(),
            software_module,
            distribution: args.distribution,
            module_type: "os".to_owned(),
            polling: Some(config.polling),
            rollout: args.rollout,
            autostart: args.autostart,
        },
    )
    .map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&receipt)?);
    } else {
        println!(
            "published bundle {} to channel '{channel}'",
            receipt.bundle_version
        );
        println!(
            "  distribution set {}{}",
            receipt.distribution_set_id,
            if receipt.distribution_reused {
                " (reused)"
            } else {
                ""
            }
        );
        println!("  target filter {}: {}", receipt.target_filter_id, receipt.filter_query);
        match receipt.rollout_id {
            Some(id) if args.autostart => println!("  rollout {id} started"),
            Some(id) => println!("  rollout {id} ready"),
            None if args.rollout => println!("  no devices on channel, rollout skipped"),
            None => {}
        }
    }
    Ok(EXIT_SUCCESS)
}
