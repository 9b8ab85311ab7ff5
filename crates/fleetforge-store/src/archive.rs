//! Deterministic tar archiving of artifact directories.
//!
//! Entries are sorted by path and carry zeroed mtime/uid/gid, so packing the
//! same tree twice yields byte-identical archives and identical slot hashes.

use crate::StoreError;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Pack a directory tree into an in-memory tar archive.
pub fn pack_dir(source_dir: &Path) -> Result<Vec<u8>, StoreError> {
    pack_dir_to(source_dir, Vec::new())
}

/// Stream the tar archive of a directory tree into `out`, returning it once
/// the archive is finished. File contents are never held in memory whole.
pub fn pack_dir_to<W: Write>(source_dir: &Path, out: W) -> Result<W, StoreError> {
    if !source_dir.is_dir() {
        return Err(StoreError::ArtifactNotFound(source_dir.to_path_buf()));
    }
    let mut entries = collect_entries(source_dir, source_dir)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut ar = tar::Builder::new(out);
    ar.follow_symlinks(false);

    for (rel_path, full_path) in &entries {
        let ft = match full_path.symlink_metadata() {
            Ok(m) => m.file_type(),
            Err(e) => {
                warn!("skipping {rel_path}: metadata error: {e}");
                continue;
            }
        };

        if ft.is_file() {
            append_file(&mut ar, rel_path, full_path)?;
        } else if ft.is_dir() {
            append_dir(&mut ar, rel_path, full_path)?;
        } else if ft.is_symlink() {
            append_symlink(&mut ar, rel_path, full_path)?;
        } else {
            warn!("skipping unsupported file type: {rel_path}");
        }
    }

    Ok(ar.into_inner()?)
}

/// Extract a tar archive into a target directory.
pub fn unpack_archive(tar_data: &[u8], target_dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(target_dir)?;
    let mut ar = tar::Archive::new(tar_data);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);
    ar.unpack(target_dir)?;
    Ok(())
}

/// Recursively collect (relative_path, full_path) pairs from a directory tree.
fn collect_entries(root: &Path, current: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    let mut result = Vec::new();
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let full = entry.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| StoreError::Io(std::io::Error::other(format!("path strip: {e}"))))?
            .to_string_lossy()
            .to_string();

        let meta = full.symlink_metadata()?;
        if meta.is_dir() {
            result.push((rel.clone(), full.clone()));
            result.extend(collect_entries(root, &full)?);
        } else {
            result.push((rel, full));
        }
    }
    Ok(result)
}

fn make_header(full_path: &Path, entry_type: tar::EntryType) -> Result<tar::Header, StoreError> {
    let meta = full_path.symlink_metadata()?;
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(meta.permissions().mode());
    Ok(header)
}

fn append_file<W: Write>(
    ar: &mut tar::Builder<W>,
    rel_path: &str,
    full_path: &Path,
) -> Result<(), StoreError> {
    let file = fs::File::open(full_path)?;
    let mut header = make_header(full_path, tar::EntryType::Regular)?;
    header.set_size(file.metadata()?.len());
    header.set_cksum();
    ar.append_data(&mut header, rel_path, file)?;
    Ok(())
}

fn append_dir<W: Write>(
    ar: &mut tar::Builder<W>,
    rel_path: &str,
    full_path: &Path,
) -> Result<(), StoreError> {
    let mut header = make_header(full_path, tar::EntryType::Directory)?;
    header.set_size(0);
    header.set_cksum();
    let path = if rel_path.ends_with('/') {
        rel_path.to_owned()
    } else {
        format!("{rel_path}/")
    };
    ar.append_data(&mut header, &path, &[] as &[u8])?;
    Ok(())
}

fn append_symlink<W: Write>(
    ar: &mut tar::Builder<W>,
    rel_path: &str,
    full_path: &Path,
) -> Result<(), StoreError> {
    let target = fs::read_link(full_path)?;
    let mut header = make_header(full_path, tar::EntryType::Symlink)?;
    header.set_size(0);
    header.set_cksum();
    ar.append_link(&mut header, rel_path, &target)?;
    Ok(())
}
