//! Fail-closed bundle verification.
//!
//! The manifest signature is checked against the keyring before any payload
//! is read. Payloads are then hashed as they stream out of the archive; when
//! extracting, the caller must discard the destination on any error.

use crate::keys::{Keyring, KEY_ALGORITHM};
use crate::manifest::{is_valid_label, UpdateBundle, BUNDLE_FORMAT_VERSION, MANIFEST_FILE};
use ed25519_dalek::Signature;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("cannot read bundle: {0}")]
    Io(#[from] std::io::Error),
    #[error("bundle does not start with manifest.json")]
    MissingManifest,
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),
    #[error("unsupported bundle format version {0}")]
    UnsupportedFormat(u32),
    #[error("unsupported signature algorithm '{0}'")]
    UnsupportedAlgorithm(String),
    #[error("signature names key {signature} but manifest names {manifest}")]
    FingerprintMismatch { signature: String, manifest: String },
    #[error("unknown signing key {0}")]
    UnknownKey(String),
    #[error("manifest signature does not verify")]
    BadSignature,
    #[error("slot '{0}' is missing from the bundle")]
    MissingSlot(String),
    #[error("slot '{slot}' hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        slot: String,
        expected: String,
        actual: String,
    },
    #[error("slot '{slot}' size mismatch: expected {expected}, got {actual}")]
    SizeMismatch {
        slot: String,
        expected: u64,
        actual: u64,
    },
    #[error("payload '{0}' is not listed in the manifest")]
    UnlistedPayload(String),
    #[error("payload '{0}' appears more than once")]
    DuplicatePayload(String),
    #[error("slot '{slot}' references unknown hook slot '{hook}'")]
    DanglingHook { slot: String, hook: String },
}

/// A bundle whose payloads passed verification and were extracted to `dir`.
#[derive(Debug, Clone)]
pub struct VerifiedBundle {
    pub bundle: UpdateBundle,
    pub dir: PathBuf,
}

impl VerifiedBundle {
    pub fn slot_path(&self, name: &str) -> Option<PathBuf> {
        self.bundle
            .manifest
            .slot(name)
            .map(|s| self.dir.join(&s.filename))
    }
}

/// Read the manifest without checking anything beyond its syntax.
pub fn read_manifest(path: &Path) -> Result<UpdateBundle, VerificationError> {
    let mut ar = tar::Archive::new(File::open(path)?);
    let mut entries = ar.entries()?;
    let first = entries.next().ok_or(VerificationError::MissingManifest)??;
    parse_manifest_entry(first)
}

/// Verify signature and every slot of the bundle at `path`.
pub fn verify_bundle(path: &Path, keyring: &Keyring) -> Result<UpdateBundle, VerificationError> {
    read_bundle(path, keyring, None)
}

/// Verify the bundle at `path` and write its payloads into `dest`.
pub fn extract_bundle(
    path: &Path,
    keyring: &Keyring,
    dest: &Path,
) -> Result<VerifiedBundle, VerificationError> {
    fs::create_dir_all(dest)?;
    let bundle = read_bundle(path, keyring, Some(dest))?;
    Ok(VerifiedBundle {
        bundle,
        dir: dest.to_path_buf(),
    })
}

fn parse_manifest_entry<R: Read>(
    mut entry: tar::Entry<'_, R>,
) -> Result<UpdateBundle, VerificationError> {
    if entry.path()?.to_string_lossy() != MANIFEST_FILE {
        return Err(VerificationError::MissingManifest);
    }
    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    serde_json::from_str(&content).map_err(|e| VerificationError::MalformedManifest(e.to_string()))
}

fn check_signature(bundle: &UpdateBundle, keyring: &Keyring) -> Result<(), VerificationError> {
    let manifest = &bundle.manifest;
    let signature = &bundle.signature;
    if manifest.format_version != BUNDLE_FORMAT_VERSION {
        return Err(VerificationError::UnsupportedFormat(manifest.format_version));
    }
    if signature.algorithm != KEY_ALGORITHM {
        return Err(VerificationError::UnsupportedAlgorithm(
            signature.algorithm.clone(),
        ));
    }
    if signature.key_fingerprint != manifest.signing_key_fingerprint {
        return Err(VerificationError::FingerprintMismatch {
            signature: signature.key_fingerprint.clone(),
            manifest: manifest.signing_key_fingerprint.clone(),
        });
    }
    let cert = keyring
        .get(&signature.key_fingerprint)
        .ok_or_else(|| VerificationError::UnknownKey(signature.key_fingerprint.clone()))?;

    let raw = hex::decode(&signature.value).map_err(|_| VerificationError::BadSignature)?;
    let sig = Signature::from_slice(&raw).map_err(|_| VerificationError::BadSignature)?;
    let message = manifest
        .canonical_bytes()
        .map_err(|e| VerificationError::MalformedManifest(e.to_string()))?;
    cert.verifying_key()
        .verify_strict(&message, &sig)
        .map_err(|_| VerificationError::BadSignature)
}

fn check_structure(bundle: &UpdateBundle) -> Result<(), VerificationError> {
    let mut names = BTreeSet::new();
    let mut files = BTreeSet::new();
    for slot in &bundle.manifest.slots {
        if !names.insert(slot.name.as_str()) {
            return Err(VerificationError::MalformedManifest(format!(
                "duplicate slot '{}'",
                slot.name
            )));
        }
        if !is_valid_label(&slot.filename)
            || slot.filename == MANIFEST_FILE
            || !files.insert(slot.filename.as_str())
        {
            return Err(VerificationError::MalformedManifest(format!(
                "invalid file name '{}' for slot '{}'",
                slot.filename, slot.name
            )));
        }
    }
    for slot in &bundle.manifest.slots {
        if let Some(hook) = &slot.hook {
            if !names.contains(hook.as_str()) || hook == &slot.name {
                return Err(VerificationError::DanglingHook {
                    slot: slot.name.clone(),
                    hook: hook.clone(),
                });
            }
        }
    }
    Ok(())
}

fn read_bundle(
    path: &Path,
    keyring: &Keyring,
    dest: Option<&Path>,
) -> Result<UpdateBundle, VerificationError> {
    let mut ar = tar::Archive::new(File::open(path)?);
    let mut entries = ar.entries()?;
    let first = entries.next().ok_or(VerificationError::MissingManifest)??;
    let bundle = parse_manifest_entry(first)?;

    check_signature(&bundle, keyring)?;
    check_structure(&bundle)?;
    debug!(
        "manifest of {} verified with key {}",
        bundle.file_name(),
        bundle.signature.key_fingerprint
    );

    let mut seen = BTreeSet::new();
    for entry in entries {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let slot = bundle
            .manifest
            .slots
            .iter()
            .find(|s| s.filename == name)
            .filter(|_| entry.header().entry_type().is_file())
            .ok_or_else(|| VerificationError::UnlistedPayload(name.clone()))?;
        if !seen.insert(name.clone()) {
            return Err(VerificationError::DuplicatePayload(name));
        }

        let mut out = match dest {
            Some(dir) => Some(File::create(dir.join(&slot.filename))?),
            None => None,
        };
        let mut hasher = blake3::Hasher::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = entry.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
            if let Some(out) = out.as_mut() {
                out.write_all(&buf[..n])?;
            }
        }
        if let Some(out) = out {
            out.sync_all()?;
        }

        if size != slot.size {
            return Err(VerificationError::SizeMismatch {
                slot: slot.name.clone(),
                expected: slot.size,
                actual: size,
            });
        }
        let actual = hasher.finalize().to_hex().to_string();
        if actual != slot.hash {
            return Err(VerificationError::HashMismatch {
                slot: slot.name.clone(),
                expected: slot.hash.clone(),
                actual,
            });
        }
    }

    if let Some(missing) = bundle
        .manifest
        .slots
        .iter()
        .find(|s| !seen.contains(&s.filename))
    {
        return Err(VerificationError::MissingSlot(missing.name.clone()));
    }
    Ok(bundle)
}
