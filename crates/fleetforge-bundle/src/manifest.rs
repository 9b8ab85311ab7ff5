use crate::keys::{SecretKey, KEY_ALGORITHM};
use chrono::{TimeZone, Utc};
use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

pub const BUNDLE_FORMAT_VERSION: u32 = 1;
/// First entry of every bundle archive.
pub const MANIFEST_FILE: &str = "manifest.json";
pub const BUNDLE_EXTENSION: &str = "bundle";

/// One named payload inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotEntry {
    pub name: String,
    /// Archive member holding the payload.
    pub filename: String,
    /// blake3 hex digest of the payload.
    pub hash: String,
    pub size: u64,
    /// Name of the slot holding this slot's post-install hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
}

/// The signed part of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleManifest {
    pub format_version: u32,
    pub bundle_version: String,
    pub variant: String,
    pub slots: Vec<SlotEntry>,
    pub signing_key_fingerprint: String,
}

impl BundleManifest {
    /// Exact bytes covered by the signature.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn slot(&self, name: &str) -> Option<&SlotEntry> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn sign(self, key: &SecretKey) -> Result<UpdateBundle, serde_json::Error> {
        let signature = key.signing_key().sign(&self.canonical_bytes()?);
        let signature = SignatureBlock {
            algorithm: KEY_ALGORITHM.to_owned(),
            key_fingerprint: key.fingerprint(),
            value: hex::encode(signature.to_bytes()),
        };
        Ok(UpdateBundle {
            manifest: self,
            signature,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignatureBlock {
    pub algorithm: String,
    pub key_fingerprint: String,
    /// Hex-encoded signature over [`BundleManifest::canonical_bytes`].
    pub value: String,
}

/// Contents of `manifest.json`: the manifest and its trailing signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateBundle {
    pub manifest: BundleManifest,
    pub signature: SignatureBlock,
}

impl UpdateBundle {
    pub fn version(&self) -> &str {
        &self.manifest.bundle_version
    }

    /// Archive file name: `<variant>-<version>.bundle`.
    pub fn file_name(&self) -> String {
        bundle_file_name(&self.manifest.variant, &self.manifest.bundle_version)
    }
}

pub fn bundle_file_name(variant: &str, version: &str) -> String {
    format!("{variant}-{version}.{BUNDLE_EXTENSION}")
}

/// Bundle versions and variants end up in file names and URLs.
pub fn is_valid_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && !value.starts_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'))
}

static LAST_VERSION_MICROS: AtomicI64 = AtomicI64::new(0);

/// UTC timestamp identifier (`YYYYMMDDTHHMMSS.ffffffZ`), strictly increasing
/// within this process even when called twice in the same microsecond.
pub fn next_bundle_version() -> String {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_VERSION_MICROS.load(Ordering::SeqCst);
    let micros = loop {
        let candidate = now.max(last + 1);
        match LAST_VERSION_MICROS.compare_exchange(
            last,
            candidate,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => break candidate,
            Err(actual) => last = actual,
        }
    };
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    match Utc.timestamp_opt(secs, nanos).single() {
        Some(ts) => ts.format("%Y%m%dT%H%M%S%.6fZ").to_string(),
        None => Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string(),
    }
}
