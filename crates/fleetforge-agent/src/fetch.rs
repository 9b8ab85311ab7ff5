//! Getting bundles onto the device.
//!
//! A source is a tree of channels (`<source>/<channel>/LATEST` plus bundle
//! files), served over HTTP or mounted locally. Fetchers only move bytes;
//! nothing fetched is trusted until it has been verified.

use crate::config::is_url;
use fleetforge_bundle::{latest_in_channel, parse_latest_pointer, ChannelError, LATEST_POINTER};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed channel pointer at {0}")]
    BadPointer(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("fetch I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Locates and downloads bundles.
pub trait BundleFetcher: Send + Sync {
    /// Location of the newest bundle on `channel`, if the channel has one.
    fn latest(&self, channel: &str) -> Result<Option<String>, FetchError>;

    /// Download the bundle at `location` to `dest`.
    fn fetch(&self, location: &str, dest: &Path) -> Result<(), FetchError>;
}

/// Fetcher for a channel tree served over HTTP(S).
pub struct HttpFetcher {
    base: String,
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_owned(),
            agent: ureq::Agent::new_with_defaults(),
        }
    }

    fn get(&self, url: &str) -> Result<Option<ureq::http::Response<ureq::Body>>, FetchError> {
        match self.agent.get(url).call() {
            Ok(resp) => Ok(Some(resp)),
            Err(ureq::Error::StatusCode(404)) => Ok(None),
            Err(ureq::Error::StatusCode(code)) => {
                Err(FetchError::Http(format!("HTTP {code} for {url}")))
            }
            Err(e) => Err(FetchError::Http(e.to_string())),
        }
    }
}

impl BundleFetcher for HttpFetcher {
    fn latest(&self, channel: &str) -> Result<Option<String>, FetchError> {
        let url = format!("{}/{channel}/{LATEST_POINTER}", self.base);
        debug!("GET {url}");
        let Some(resp) = self.get(&url)? else {
            return Ok(None);
        };
        let mut body = String::new();
        resp.into_body()
            .into_reader()
            .read_to_string(&mut body)
            .map_err(|e| FetchError::Http(e.to_string()))?;
        let name = parse_latest_pointer(&body).ok_or(FetchError::BadPointer(url))?;
        Ok(Some(format!("{}/{channel}/{name}", self.base)))
    }

    fn fetch(&self, location: &str, dest: &Path) -> Result<(), FetchError> {
        debug!("GET {location}");
        let resp = self
            .get(location)?
            .ok_or_else(|| FetchError::NotFound(location.to_owned()))?;
        let mut reader = resp.into_body().into_reader();
        let mut file = fs::File::create(dest)?;
        std::io::copy(&mut reader, &mut file)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Fetcher for a locally mounted channel tree (USB stick, NFS, test fixtures).
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl BundleFetcher for FileFetcher {
    fn latest(&self, channel: &str) -> Result<Option<String>, FetchError> {
        Ok(latest_in_channel(&self.root, channel)?
            .map(|path| path.to_string_lossy().into_owned()))
    }

    fn fetch(&self, location: &str, dest: &Path) -> Result<(), FetchError> {
        let src = Path::new(location);
        if !src.is_file() {
            return Err(FetchError::NotFound(location.to_owned()));
        }
        fs::copy(src, dest)?;
        Ok(())
    }
}

/// Fetcher matching the form of `source`: HTTP for URLs, files otherwise.
pub fn fetcher_for(source: &str) -> Box<dyn BundleFetcher> {
    if is_url(source) {
        Box::new(HttpFetcher::new(source))
    } else {
        Box::new(FileFetcher::new(Path::new(source)))
    }
}
