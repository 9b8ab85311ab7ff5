//! ed25519 signing material and the device keyring.
//!
//! Both files are small TOML documents with hex-encoded key bytes. A key's
//! fingerprint is the blake3 hex digest of its public key, and is what a
//! bundle names to say which certificate verifies it.

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

pub const KEY_ALGORITHM: &str = "ed25519";
/// Extension of certificate files picked up by [`Keyring::load_dir`].
pub const CERT_EXTENSION: &str = "cert";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("failed to serialize key material: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unsupported key algorithm '{0}' (expected ed25519)")]
    UnsupportedAlgorithm(String),
    #[error("invalid key encoding in {}: {message}", .path.display())]
    Encoding { path: PathBuf, message: String },
    #[error("refusing to overwrite existing {}", .0.display())]
    AlreadyExists(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> KeyError + '_ {
    move |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Blake3 hex digest of a public key.
pub fn fingerprint(key: &VerifyingKey) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SecretKeyFile {
    algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CertificateFile {
    algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    public_key: String,
}

/// Public half of a signing key, as distributed to devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub subject: Option<String>,
    key: VerifyingKey,
}

impl Certificate {
    pub fn new(key: VerifyingKey, subject: Option<String>) -> Self {
        Self { subject, key }
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.key
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.key)
    }

    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let content = fs::read_to_string(path).map_err(io_err(path))?;
        let file: CertificateFile = toml::from_str(&content).map_err(|e| KeyError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        check_algorithm(&file.algorithm)?;
        let bytes = decode_32(path, &file.public_key)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|e| KeyError::Encoding {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self {
            subject: file.subject,
            key,
        })
    }

    fn to_toml(&self) -> Result<String, KeyError> {
        Ok(toml::to_string_pretty(&CertificateFile {
            algorithm: KEY_ALGORITHM.to_owned(),
            subject: self.subject.clone(),
            public_key: hex::encode(self.key.as_bytes()),
        })?)
    }
}

/// Private signing key loaded from disk.
pub struct SecretKey {
    pub subject: Option<String>,
    key: SigningKey,
}

impl SecretKey {
    pub fn generate(subject: Option<String>) -> Self {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self { subject, key }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    pub fn certificate(&self) -> Certificate {
        Certificate::new(self.key.verifying_key(), self.subject.clone())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.key.verifying_key())
    }

    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let content = fs::read_to_string(path).map_err(io_err(path))?;
        let file: SecretKeyFile = toml::from_str(&content).map_err(|e| KeyError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        check_algorithm(&file.algorithm)?;
        let bytes = decode_32(path, &file.secret_key)?;
        Ok(Self {
            subject: file.subject,
            key: SigningKey::from_bytes(&bytes),
        })
    }

    fn to_toml(&self) -> Result<String, KeyError> {
        Ok(toml::to_string_pretty(&SecretKeyFile {
            algorithm: KEY_ALGORITHM.to_owned(),
            subject: self.subject.clone(),
            secret_key: hex::encode(self.key.to_bytes()),
        })?)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("subject", &self.subject)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

fn check_algorithm(algorithm: &str) -> Result<(), KeyError> {
    if algorithm == KEY_ALGORITHM {
        Ok(())
    } else {
        Err(KeyError::UnsupportedAlgorithm(algorithm.to_owned()))
    }
}

fn decode_32(path: &Path, value: &str) -> Result<[u8; 32], KeyError> {
    let bytes = hex::decode(value.trim()).map_err(|e| KeyError::Encoding {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| KeyError::Encoding {
        path: path.to_path_buf(),
        message: format!("expected 32 key bytes, found {}", bytes.len()),
    })
}

/// Write `content` to `dest` atomically, failing if `dest` already exists.
fn write_new(dest: &Path, content: &str, mode: u32) -> Result<(), KeyError> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(io_err(&dir))?;
    let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err(&dir))?;
    tmp.write_all(content.as_bytes()).map_err(io_err(dest))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .map_err(io_err(dest))?;
    tmp.as_file().sync_all().map_err(io_err(dest))?;
    tmp.persist_noclobber(dest).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            KeyError::AlreadyExists(dest.to_path_buf())
        } else {
            KeyError::Io {
                path: dest.to_path_buf(),
                source: e.error,
            }
        }
    })?;
    Ok(())
}

/// Generate a new key pair and write it to `key_path` and `cert_path`.
///
/// Neither file may exist yet. Returns the new certificate.
pub fn write_key_pair(
    key_path: &Path,
    cert_path: &Path,
    subject: Option<String>,
) -> Result<Certificate, KeyError> {
    for path in [key_path, cert_path] {
        if path.exists() {
            return Err(KeyError::AlreadyExists(path.to_path_buf()));
        }
    }
    let secret = SecretKey::generate(subject);
    let cert = secret.certificate();
    write_new(key_path, &secret.to_toml()?, 0o600)?;
    write_new(cert_path, &cert.to_toml()?, 0o644)?;
    debug!(
        "generated signing key {} at {}",
        cert.fingerprint(),
        key_path.display()
    );
    Ok(cert)
}

/// Trusted certificates, indexed by fingerprint.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    certs: BTreeMap<String, Certificate>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cert: Certificate) {
        self.certs.insert(cert.fingerprint(), cert);
    }

    pub fn get(&self, fingerprint: &str) -> Option<&Certificate> {
        self.certs.get(fingerprint)
    }

    pub fn fingerprints(&self) -> impl Iterator<Item = &str> {
        self.certs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Load every `*.cert` file in `dir`. Unparseable files are skipped with a warning.
    pub fn load_dir(dir: &Path) -> Result<Self, KeyError> {
        let mut ring = Self::new();
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(io_err(dir))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == CERT_EXTENSION))
            .collect();
        paths.sort();
        for path in paths {
            match Certificate::load(&path) {
                Ok(cert) => ring.add(cert),
                Err(e) => warn!("ignoring certificate {}: {e}", path.display()),
            }
        }
        Ok(ring)
    }
}

impl FromIterator<Certificate> for Keyring {
    fn from_iter<I: IntoIterator<Item = Certificate>>(iter: I) -> Self {
        let mut ring = Self::new();
        for cert in iter {
            ring.add(cert);
        }
        ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_pair_round_trips_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("release.key");
        let cert_path = dir.path().join("release.cert");
        let cert = write_key_pair(&key_path, &cert_path, Some("release".into())).unwrap();

        let secret = SecretKey::load(&key_path).unwrap();
        let loaded = Certificate::load(&cert_path).unwrap();
        assert_eq!(loaded, cert);
        assert_eq!(secret.fingerprint(), cert.fingerprint());
        assert_eq!(loaded.subject.as_deref(), Some("release"));
        assert_eq!(cert.fingerprint().len(), 64);

        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn key_pair_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("release.key");
        let cert_path = dir.path().join("release.cert");
        write_key_pair(&key_path, &cert_path, None).unwrap();
        let before = fs::read_to_string(&key_path).unwrap();

        assert!(matches!(
            write_key_pair(&key_path, &cert_path, None),
            Err(KeyError::AlreadyExists(_))
        ));
        assert_eq!(fs::read_to_string(&key_path).unwrap(), before);
    }

    #[test]
    fn wrong_algorithm_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.cert");
        fs::write(
            &path,
            format!("algorithm = \"rsa\"\npublic_key = \"{}\"\n", "00".repeat(32)),
        )
        .unwrap();
        assert!(matches!(
            Certificate::load(&path),
            Err(KeyError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn short_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.key");
        fs::write(&path, "algorithm = \"ed25519\"\nsecret_key = \"abcd\"\n").unwrap();
        assert!(matches!(
            SecretKey::load(&path),
            Err(KeyError::Encoding { .. })
        ));
    }

    #[test]
    fn keyring_loads_cert_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_key_pair(&dir.path().join("a.key"), &dir.path().join("a.cert"), None).unwrap();
        let b = write_key_pair(&dir.path().join("b.key"), &dir.path().join("b.cert"), None).unwrap();
        fs::write(dir.path().join("broken.cert"), "not toml [").unwrap();

        let ring = Keyring::load_dir(dir.path()).unwrap();
        assert_eq!(ring.len(), 2);
        assert!(ring.get(&a.fingerprint()).is_some());
        assert!(ring.get(&b.fingerprint()).is_some());
    }
}
