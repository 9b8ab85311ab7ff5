//! Static channel layout shared by publishers and device agents.
//!
//! A channel is a directory `<root>/<channel>/` holding bundle files and a
//! `LATEST` pointer naming the newest one. The same tree can be served over
//! plain HTTP.

use crate::manifest::is_valid_label;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

/// File inside a channel directory naming the newest bundle.
pub const LATEST_POINTER: &str = "LATEST";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel name '{0}'")]
    InvalidChannel(String),
    #[error("not a bundle file: {}", .0.display())]
    NotABundle(PathBuf),
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn channel_dir(root: &Path, channel: &str) -> Result<PathBuf, ChannelError> {
    if !is_valid_label(channel) {
        return Err(ChannelError::InvalidChannel(channel.to_owned()));
    }
    Ok(root.join(channel))
}

/// Copy `bundle` into the channel and point `LATEST` at it.
///
/// The pointer is replaced atomically, so readers see either the previous
/// bundle or the new one, never a partial name.
pub fn publish_to_channel(
    root: &Path,
    channel: &str,
    bundle: &Path,
) -> Result<PathBuf, ChannelError> {
    let dir = channel_dir(root, channel)?;
    let name = bundle
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| is_valid_label(n))
        .ok_or_else(|| ChannelError::NotABundle(bundle.to_path_buf()))?
        .to_owned();
    fs::create_dir_all(&dir)?;

    let dest = dir.join(&name);
    if dest != bundle {
        let mut tmp = NamedTempFile::new_in(&dir)?;
        std::io::copy(&mut fs::File::open(bundle)?, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| ChannelError::Io(e.error))?;
    }

    let mut pointer = NamedTempFile::new_in(&dir)?;
    writeln!(pointer, "{name}")?;
    pointer.as_file().sync_all()?;
    pointer
        .persist(dir.join(LATEST_POINTER))
        .map_err(|e| ChannelError::Io(e.error))?;
    fs::File::open(&dir)?.sync_all()?;

    info!("published {name} to channel '{channel}'");
    Ok(dest)
}

/// Parse the content of a `LATEST` pointer. Empty or unsafe names yield `None`.
pub fn parse_latest_pointer(content: &str) -> Option<&str> {
    let name = content.trim();
    is_valid_label(name).then_some(name)
}

/// Bundle currently named by the channel's pointer, if any.
pub fn latest_in_channel(root: &Path, channel: &str) -> Result<Option<PathBuf>, ChannelError> {
    let dir = channel_dir(root, channel)?;
    let content = match fs::read_to_string(dir.join(LATEST_POINTER)) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(parse_latest_pointer(&content).map(|name| dir.join(name)))
}
