//! Signed update bundles for Fleetforge.
//!
//! A bundle is a tar archive whose first member, `manifest.json`, lists every
//! payload slot with its blake3 hash and size and carries an ed25519
//! signature over that list. `BundlePackager` produces bundles from a built
//! root filesystem, `verify_bundle`/`extract_bundle` check them fail-closed
//! against a `Keyring` of trusted certificates. `publish_to_channel` lays
//! bundles out for device agents to poll.

pub mod channel;
pub mod keys;
pub mod manifest;
pub mod packager;
pub mod verify;

pub use channel::{
    latest_in_channel, parse_latest_pointer, publish_to_channel, ChannelError, LATEST_POINTER,
};
pub use keys::{fingerprint, write_key_pair, Certificate, KeyError, Keyring, SecretKey};
pub use manifest::{
    bundle_file_name, is_valid_label, next_bundle_version, BundleManifest, SignatureBlock,
    SlotEntry, UpdateBundle, BUNDLE_EXTENSION, BUNDLE_FORMAT_VERSION, MANIFEST_FILE,
};
pub use packager::{
    BundlePackager, PackageRequest, PackagedBundle, PackagingError, HOOK_SLOT, ROOTFS_SLOT,
};
pub use verify::{extract_bundle, read_manifest, verify_bundle, VerificationError, VerifiedBundle};
