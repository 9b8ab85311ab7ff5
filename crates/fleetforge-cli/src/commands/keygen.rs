use super::{json_pretty, load_config, EXIT_SUCCESS};
use fleetforge_bundle::write_key_pair;
use std::path::{Path, PathBuf};

pub const DEFAULT_KEY_FILE: &str = "fleetforge.key";
pub const DEFAULT_CERT_FILE: &str = "fleetforge.cert";

pub fn run(
    config_path: &Path,
    key: Option<PathBuf>,
    cert: Option<PathBuf>,
    subject: Option<String>,
    json: bool,
) -> Result<u8, String> {
    let config = load_config(config_path)?;
    let key = key
        .or(config.signing.key)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_FILE));
    let cert = cert
        .or(config.signing.cert)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CERT_FILE));

    let certificate = write_key_pair(&key, &cert, subject).map_err(|e| e.to_string())?;

    if json {
        let payload = serde_json::json!({
            "key": key,
            "cert": cert,
            "fingerprint": certificate.fingerprint(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("signing key:  {}", key.display());
        println!("certificate:  {}", cert.display());
        println!("fingerprint:  {}", certificate.fingerprint());
        println!("keep the key private; distribute the certificate to devices");
    }
    Ok(EXIT_SUCCESS)
}
