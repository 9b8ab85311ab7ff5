use super::{json_pretty, load_config, EXIT_SUCCESS};
use fleetforge_bundle::{verify_bundle, Certificate, Keyring};
use std::path::{Path, PathBuf};

fn trusted_keys(
    config_path: &Path,
    certs: &[PathBuf],
    keyring_dir: Option<&Path>,
) -> Result<Keyring, String> {
    let mut keyring = match keyring_dir {
        Some(dir) => Keyring::load_dir(dir).map_err(|e| format!("verification failed: {e}"))?,
        None => Keyring::new(),
    };
    let mut paths = certs.to_vec();
    if paths.is_empty() && keyring_dir.is_none() {
        let config = load_config(config_path)?;
        paths.extend(config.signing.cert);
    }
    for path in &paths {
        keyring.add(Certificate::load(path).map_err(|e| format!("verification failed: {e}"))?);
    }
    if keyring.is_empty() {
        return Err(
            "verification failed: no trusted certificates (pass --cert or --keyring)".to_owned(),
        );
    }
    Ok(keyring)
}

pub fn run(
    config_path: &Path,
    bundle: &Path,
    certs: &[PathBuf],
    keyring_dir: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let keyring = trusted_keys(config_path, certs, keyring_dir)?;
    let verified =
        verify_bundle(bundle, &keyring).map_err(|e| format!("verification failed: {e}"))?;
    let manifest = &verified.manifest;

    if json {
        let payload = serde_json::json!({
            "bundle": bundle,
            "valid": true,
            "bundle_version": manifest.bundle_version,
            "variant": manifest.variant,
            "format_version": manifest.format_version,
            "signing_key": verified.signature.key_fingerprint,
            "slots": manifest.slots,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "bundle {} ({}) is valid, signed by {}",
            manifest.bundle_version, manifest.variant, verified.signature.key_fingerprint
        );
        for slot in &manifest.slots {
            let hook = slot
                .hook
                .as_deref()
                .map(|h| format!(" hook={h}"))
                .unwrap_or_default();
            println!("  {:<14} {}{hook}", slot.name, slot.hash);
        }
    }
    Ok(EXIT_SUCCESS)
}
