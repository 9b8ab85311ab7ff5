//! Assembling a root filesystem and optional hook into a signed bundle.
//!
//! All preconditions are checked before any payload is read: signing key,
//! certificate, their pairing, then the rootfs artifact, then the hook. The
//! archive is written to a temporary file next to its destination and only
//! persisted once complete, so a failed run leaves nothing behind.

use crate::keys::{Certificate, KeyError, SecretKey};
use crate::manifest::{
    bundle_file_name, is_valid_label, next_bundle_version, BundleManifest, SlotEntry,
    UpdateBundle, BUNDLE_FORMAT_VERSION, MANIFEST_FILE,
};
use fleetforge_store::{pack_dir_to, StoreError};
use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const ROOTFS_SLOT: &str = "rootfs";
pub const HOOK_SLOT: &str = "post-install";
/// Archive member used when the rootfs artifact is a directory.
pub const ROOTFS_TAR: &str = "rootfs.tar";

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("signing key not found: {}", .0.display())]
    MissingKey(PathBuf),
    #[error("signing certificate not found: {}", .0.display())]
    MissingCertificate(PathBuf),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("signing key {key} does not match certificate {cert}")]
    KeyCertificateMismatch { key: String, cert: String },
    #[error("rootfs artifact not found: {}", .0.display())]
    MissingRootfs(PathBuf),
    #[error("rootfs artifact is empty: {}", .0.display())]
    EmptyRootfs(PathBuf),
    #[error("post-install hook not found: {}", .0.display())]
    MissingHook(PathBuf),
    #[error("invalid bundle version '{0}'")]
    InvalidVersion(String),
    #[error("invalid variant '{0}'")]
    InvalidVariant(String),
    #[error("archive error: {0}")]
    Archive(#[from] StoreError),
    #[error("packaging I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Inputs for one packaging run.
#[derive(Debug, Clone)]
pub struct PackageRequest {
    /// A directory tree (packed as a tar slot) or a single image file.
    pub rootfs: PathBuf,
    pub variant: String,
    pub key: PathBuf,
    pub cert: PathBuf,
    pub hook: Option<PathBuf>,
    /// Defaults to a timestamp identifier.
    pub version: Option<String>,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PackagedBundle {
    pub path: PathBuf,
    pub bundle: UpdateBundle,
}

enum Payload {
    /// Packed rootfs, deleted with the payload.
    Scratch(NamedTempFile),
    File(PathBuf),
}

/// Hashes and counts everything written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
    size: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            size: 0,
        }
    }

    fn finish(mut self) -> std::io::Result<(String, u64)> {
        self.inner.flush()?;
        Ok((self.hasher.finalize().to_hex().to_string(), self.size))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct PendingSlot {
    entry: SlotEntry,
    payload: Payload,
}

fn hash_file(path: &Path) -> Result<(String, u64), std::io::Error> {
    let mut file = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize().to_hex().to_string(), size))
}

fn file_slot(name: &str, path: &Path) -> Result<PendingSlot, PackagingError> {
    let (hash, size) = hash_file(path)?;
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .filter(|f| is_valid_label(f) && f != MANIFEST_FILE)
        .unwrap_or_else(|| format!("{name}.img"));
    Ok(PendingSlot {
        entry: SlotEntry {
            name: name.to_owned(),
            filename,
            hash,
            size,
            hook: None,
        },
        payload: Payload::File(path.to_path_buf()),
    })
}

/// Directory rootfs trees are packed into a scratch file under `scratch_dir`.
fn rootfs_slot(rootfs: &Path, scratch_dir: &Path) -> Result<PendingSlot, PackagingError> {
    let meta = fs::metadata(rootfs).map_err(|_| PackagingError::MissingRootfs(rootfs.into()))?;
    if meta.is_dir() {
        if fs::read_dir(rootfs)?.next().is_none() {
            return Err(PackagingError::EmptyRootfs(rootfs.into()));
        }
        fs::create_dir_all(scratch_dir)?;
        let mut scratch = tempfile::Builder::new()
            .prefix(".rootfs-")
            .tempfile_in(scratch_dir)?;
        let (hash, size) = pack_dir_to(
            rootfs,
            HashingWriter::new(BufWriter::new(scratch.as_file_mut())),
        )?
        .finish()?;
        debug!("packed {} into {size} byte(s)", rootfs.display());
        Ok(PendingSlot {
            entry: SlotEntry {
                name: ROOTFS_SLOT.to_owned(),
                filename: ROOTFS_TAR.to_owned(),
                hash,
                size,
                hook: None,
            },
            payload: Payload::Scratch(scratch),
        })
    } else {
        if meta.len() == 0 {
            return Err(PackagingError::EmptyRootfs(rootfs.into()));
        }
        file_slot(ROOTFS_SLOT, rootfs)
    }
}

fn header(size: u64, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_entry_type(tar::EntryType::Regular);
    header
}

/// Builds signed update bundles.
#[derive(Debug, Default, Clone, Copy)]
pub struct BundlePackager;

impl BundlePackager {
    pub fn new() -> Self {
        Self
    }

    pub fn package(&self, request: &PackageRequest) -> Result<PackagedBundle, PackagingError> {
        // Signing material first; nothing else is touched until it checks out.
        if !request.key.is_file() {
            return Err(PackagingError::MissingKey(request.key.clone()));
        }
        if !request.cert.is_file() {
            return Err(PackagingError::MissingCertificate(request.cert.clone()));
        }
        let secret = SecretKey::load(&request.key)?;
        let cert = Certificate::load(&request.cert)?;
        if secret.fingerprint() != cert.fingerprint() {
            return Err(PackagingError::KeyCertificateMismatch {
                key: secret.fingerprint(),
                cert: cert.fingerprint(),
            });
        }

        if !is_valid_label(&request.variant) {
            return Err(PackagingError::InvalidVariant(request.variant.clone()));
        }
        let version = match &request.version {
            Some(v) if is_valid_label(v) => v.clone(),
            Some(v) => return Err(PackagingError::InvalidVersion(v.clone())),
            None => next_bundle_version(),
        };

        let mut slots = vec![rootfs_slot(&request.rootfs, &request.output_dir)?];
        if let Some(hook) = &request.hook {
            if !hook.is_file() {
                return Err(PackagingError::MissingHook(hook.clone()));
            }
            let mut hook_slot = file_slot(HOOK_SLOT, hook)?;
            if hook_slot.entry.filename == slots[0].entry.filename {
                hook_slot.entry.filename = format!("{HOOK_SLOT}.sh");
            }
            slots[0].entry.hook = Some(HOOK_SLOT.to_owned());
            slots.push(hook_slot);
        }

        let manifest = BundleManifest {
            format_version: BUNDLE_FORMAT_VERSION,
            bundle_version: version,
            variant: request.variant.clone(),
            slots: slots.iter().map(|s| s.entry.clone()).collect(),
            signing_key_fingerprint: cert.fingerprint(),
        };
        let bundle = manifest.sign(&secret)?;
        debug!(
            "signed manifest for {} with key {}",
            bundle.file_name(),
            &bundle.signature.key_fingerprint[..12]
        );

        fs::create_dir_all(&request.output_dir)?;
        let dest = request
            .output_dir
            .join(bundle_file_name(&bundle.manifest.variant, bundle.version()));
        let mut tmp = NamedTempFile::new_in(&request.output_dir)?;
        {
            let mut ar = tar::Builder::new(tmp.as_file_mut());
            let manifest_json = serde_json::to_vec_pretty(&bundle)?;
            let mut h = header(manifest_json.len() as u64, 0o644);
            ar.append_data(&mut h, MANIFEST_FILE, manifest_json.as_slice())?;
            for slot in &slots {
                let mode = if slot.entry.name == HOOK_SLOT { 0o755 } else { 0o644 };
                let mut h = header(slot.entry.size, mode);
                match &slot.payload {
                    Payload::Scratch(file) => {
                        ar.append_data(&mut h, &slot.entry.filename, file.reopen()?)?;
                    }
                    Payload::File(path) => {
                        let file = fs::File::open(path)?;
                        ar.append_data(&mut h, &slot.entry.filename, file)?;
                    }
                }
            }
            ar.finish()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| PackagingError::Io(e.error))?;

        info!(
            "packaged {} ({} slot(s))",
            dest.display(),
            bundle.manifest.slots.len()
        );
        warn!(
            "the root filesystem must already contain the trust certificate {} for devices \
             to verify later bundles; packaging does not check this",
            bundle.manifest.signing_key_fingerprint
        );
        Ok(PackagedBundle { path: dest, bundle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::write_key_pair;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            write_key_pair(
                &dir.path().join("release.key"),
                &dir.path().join("release.cert"),
                None,
            )
            .unwrap();
            let rootfs = dir.path().join("rootfs");
            fs::create_dir_all(rootfs.join("etc")).unwrap();
            fs::write(rootfs.join("etc/os-release"), "ID=fleet\n").unwrap();
            Self { dir }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }

        fn request(&self) -> PackageRequest {
            PackageRequest {
                rootfs: self.path("rootfs"),
                variant: "nightly".into(),
                key: self.path("release.key"),
                cert: self.path("release.cert"),
                hook: None,
                version: Some("1.0.0".into()),
                output_dir: self.path("out"),
            }
        }
    }

    #[test]
    fn missing_key_reported_before_rootfs() {
        let fx = Fixture::new();
        let request = PackageRequest {
            key: fx.path("absent.key"),
            rootfs: fx.path("no-such-rootfs"),
            ..fx.request()
        };
        let err = BundlePackager::new().package(&request).unwrap_err();
        assert!(matches!(err, PackagingError::MissingKey(_)));
        assert!(!fx.path("out").exists());
    }

    #[test]
    fn missing_certificate_reported() {
        let fx = Fixture::new();
        let request = PackageRequest {
            cert: fx.path("absent.cert"),
            ..fx.request()
        };
        assert!(matches!(
            BundlePackager::new().package(&request),
            Err(PackagingError::MissingCertificate(_))
        ));
    }

    #[test]
    fn mismatched_certificate_rejected() {
        let fx = Fixture::new();
        write_key_pair(&fx.path("other.key"), &fx.path("other.cert"), None).unwrap();
        let request = PackageRequest {
            cert: fx.path("other.cert"),
            ..fx.request()
        };
        assert!(matches!(
            BundlePackager::new().package(&request),
            Err(PackagingError::KeyCertificateMismatch { .. })
        ));
    }

    #[test]
    fn empty_rootfs_never_packaged() {
        let fx = Fixture::new();
        fs::create_dir(fx.path("empty")).unwrap();
        let request = PackageRequest {
            rootfs: fx.path("empty"),
            ..fx.request()
        };
        assert!(matches!(
            BundlePackager::new().package(&request),
            Err(PackagingError::EmptyRootfs(_))
        ));
        assert!(fs::read_dir(fx.path("out"))
            .map(|mut d| d.next().is_none())
            .unwrap_or(true));
    }

    #[test]
    fn missing_rootfs_rejected() {
        let fx = Fixture::new();
        let request = PackageRequest {
            rootfs: fx.path("nope"),
            ..fx.request()
        };
        assert!(matches!(
            BundlePackager::new().package(&request),
            Err(PackagingError::MissingRootfs(_))
        ));
    }

    #[test]
    fn missing_hook_rejected() {
        let fx = Fixture::new();
        let request = PackageRequest {
            hook: Some(fx.path("hook.sh")),
            ..fx.request()
        };
        assert!(matches!(
            BundlePackager::new().package(&request),
            Err(PackagingError::MissingHook(_))
        ));
    }

    #[test]
    fn hook_becomes_its_own_slot() {
        let fx = Fixture::new();
        fs::write(fx.path("hook.sh"), "#!/bin/sh\nsync\n").unwrap();
        let request = PackageRequest {
            hook: Some(fx.path("hook.sh")),
            ..fx.request()
        };
        let packaged = BundlePackager::new().package(&request).unwrap();
        let m = &packaged.bundle.manifest;
        assert_eq!(m.slots.len(), 2);
        assert_eq!(m.slot(ROOTFS_SLOT).unwrap().hook.as_deref(), Some(HOOK_SLOT));
        let hook = m.slot(HOOK_SLOT).unwrap();
        assert_eq!(hook.filename, "hook.sh");
        assert_eq!(hook.hash, blake3::hash(b"#!/bin/sh\nsync\n").to_hex().to_string());
    }

    #[test]
    fn image_file_rootfs_copied_as_is() {
        let fx = Fixture::new();
        fs::write(fx.path("rootfs.ext4"), vec![7u8; 4096]).unwrap();
        let request = PackageRequest {
            rootfs: fx.path("rootfs.ext4"),
            ..fx.request()
        };
        let packaged = BundlePackager::new().package(&request).unwrap();
        let slot = packaged.bundle.manifest.slot(ROOTFS_SLOT).unwrap();
        assert_eq!(slot.filename, "rootfs.ext4");
        assert_eq!(slot.size, 4096);
    }

    #[test]
    fn explicit_version_repackaging_yields_identical_manifest() {
        let fx = Fixture::new();
        let first = BundlePackager::new().package(&fx.request()).unwrap();
        let second = BundlePackager::new()
            .package(&PackageRequest {
                output_dir: fx.path("out2"),
                ..fx.request()
            })
            .unwrap();
        assert_eq!(first.bundle, second.bundle);
        assert_eq!(
            first.path.file_name().unwrap().to_string_lossy(),
            "nightly-1.0.0.bundle"
        );
    }

    #[test]
    fn default_versions_are_distinct_and_ordered() {
        let fx = Fixture::new();
        let request = PackageRequest {
            version: None,
            ..fx.request()
        };
        let a = BundlePackager::new().package(&request).unwrap();
        let b = BundlePackager::new().package(&request).unwrap();
        assert!(a.bundle.version() < b.bundle.version());
        assert_ne!(a.path, b.path);
    }

    #[test]
    fn directory_rootfs_is_streamed_and_scratch_removed() {
        let fx = Fixture::new();
        fs::write(fx.path("rootfs/etc/blob"), vec![0xa5u8; 300 * 1024]).unwrap();
        let packaged = BundlePackager::new().package(&fx.request()).unwrap();

        let slot = packaged.bundle.manifest.slot(ROOTFS_SLOT).unwrap();
        let expected = fleetforge_store::pack_dir(&fx.path("rootfs")).unwrap();
        assert_eq!(slot.size, expected.len() as u64);
        assert_eq!(slot.hash, blake3::hash(&expected).to_hex().to_string());

        let left: Vec<_> = fs::read_dir(fx.path("out"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(left, vec!["nightly-1.0.0.bundle".to_owned()]);
    }

    #[test]
    fn invalid_version_rejected() {
        let fx = Fixture::new();
        let request = PackageRequest {
            version: Some("../evil".into()),
            ..fx.request()
        };
        assert!(matches!(
            BundlePackager::new().package(&request),
            Err(PackagingError::InvalidVersion(_))
        ));
    }
}
