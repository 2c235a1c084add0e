//! Blocking HTTP downloads with mirror fallback and hash verification.

use crate::backoff::Backoff;
use crate::cancel::Cancellation;
use crate::error::{Error, Result};
use crate::hash::{Hash, HashAlgorithm};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-request timeout for downloads.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Downloads files, trying each mirror in order.
#[derive(Debug, Clone)]
pub struct Fetcher {
    agent: ureq::Agent,
    backoff: Backoff,
    cancel: Cancellation,
}

/// Outcome of a single mirror attempt.
enum Attempt {
    Success(Hash),
    TransientFailure(Error),
    FatalFailure(Error),
}

impl Fetcher {
    pub fn new(backoff: Backoff, cancel: Cancellation) -> Self {
        Self::with_timeout(backoff, cancel, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(backoff: Backoff, cancel: Cancellation, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            agent,
            backoff,
            cancel,
        }
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    /// Ask the server for an ETag that looks like an MD5 digest.
    pub fn etag_hash(&self, url: &str) -> Option<Hash> {
        if !is_remote(url) {
            return None;
        }
        let response = self.agent.head(url).call().ok()?;
        let etag = response.headers().get("etag")?.to_str().ok()?;
        let etag = etag.trim().trim_start_matches("W/").trim_matches('"');
        if etag.len() == HashAlgorithm::Md5.hex_len() {
            Hash::parse(etag).ok()
        } else {
            None
        }
    }

    /// Download `urls` (first success wins) into `dest`.
    ///
    /// With an expected hash the bytes are verified before `dest` is
    /// replaced; without one the SHA-256 of the download is returned. When
    /// every mirror fails the shared backoff is paused once.
    pub fn fetch(&self, urls: &[String], dest: &Path, expected: Option<&Hash>) -> Result<Hash> {
        if let Some(hash) = expected
            && dest.exists()
            && hash.verify_file(dest).is_ok()
        {
            log::debug!("{} already present with hash {hash}", dest.display());
            return Ok(hash.clone());
        }

        let mut last = None;
        for url in urls {
            self.cancel.check()?;
            match self.fetch_one(url, dest, expected) {
                Attempt::Success(hash) => return Ok(hash),
                Attempt::TransientFailure(err) => {
                    log::warn!("download of {url} failed: {err}");
                    last = Some(err);
                }
                Attempt::FatalFailure(err) => return Err(err),
            }
        }

        self.backoff.pause(&self.cancel)?;
        Err(Error::AllMirrorsFailed {
            urls: urls.to_vec(),
            last: last.map_or_else(|| "no URLs given".to_string(), |e| e.to_string()),
        })
    }

    fn fetch_one(&self, url: &str, dest: &Path, expected: Option<&Hash>) -> Attempt {
        let dir = dest.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        if let Err(e) = fs::create_dir_all(&dir) {
            return Attempt::FatalFailure(Error::io(&dir, e));
        }
        let mut tmp = match tempfile::Builder::new().prefix(".download-").tempfile_in(&dir) {
            Ok(tmp) => tmp,
            Err(e) => return Attempt::FatalFailure(Error::io(&dir, e)),
        };

        log::info!("downloading {url}");
        let copied = if is_remote(url) {
            match self.agent.get(url).call() {
                Ok(mut response) => {
                    let mut reader = response.body_mut().as_reader();
                    io::copy(&mut reader, tmp.as_file_mut()).map_err(|e| Error::io(tmp.path(), e))
                }
                Err(e) => return Attempt::TransientFailure(Error::http(url, e)),
            }
        } else {
            let local = url.strip_prefix("file://").unwrap_or(url);
            fs::File::open(local)
                .and_then(|mut f| io::copy(&mut f, tmp.as_file_mut()))
                .map_err(|e| Error::io(local, e))
        };
        if let Err(e) = copied {
            return Attempt::TransientFailure(e);
        }

        let algorithm = expected.map_or(HashAlgorithm::Sha256, |h| h.algorithm);
        let actual = match Hash::of_file(algorithm, tmp.path()) {
            Ok(h) => h,
            Err(e) => return Attempt::FatalFailure(e),
        };
        if let Some(hash) = expected
            && *hash != actual
        {
            return Attempt::FatalFailure(Error::HashMismatch {
                path: PathBuf::from(url),
                expected: hash.hex().to_string(),
                actual: actual.hex().to_string(),
            });
        }

        match tmp.persist(dest) {
            Ok(_) => Attempt::Success(actual),
            Err(e) => Attempt::FatalFailure(Error::io(dest, e.error)),
        }
    }
}

/// Whether a URL needs the network.
pub fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> Fetcher {
        Fetcher::new(Backoff::default(), Cancellation::new())
    }

    #[test]
    fn test_fetch_local_file_with_hash() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"payload").unwrap();
        let dest = dir.path().join("out/dest.bin");
        let hash = Hash::of_bytes(HashAlgorithm::Sha256, b"payload");

        let got = fetcher()
            .fetch(&[src.display().to_string()], &dest, Some(&hash))
            .unwrap();
        assert_eq!(got, hash);
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
    }

    #[test]
    fn test_fetch_rejects_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"payload").unwrap();
        let dest = dir.path().join("dest.bin");
        let wrong = Hash::of_bytes(HashAlgorithm::Sha256, b"other");

        let err = fetcher()
            .fetch(&[format!("file://{}", src.display())], &dest, Some(&wrong))
            .unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_fetch_falls_through_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("good");
        fs::write(&src, b"ok").unwrap();
        let dest = dir.path().join("dest");
        let urls = vec![
            dir.path().join("missing").display().to_string(),
            src.display().to_string(),
        ];
        let hash = fetcher().fetch(&urls, &dest, None).unwrap();
        assert_eq!(hash, Hash::of_bytes(HashAlgorithm::Sha256, b"ok"));
    }

    #[test]
    fn test_is_remote() {
        assert!(is_remote("https://dl.k8s.io/kubelet"));
        assert!(!is_remote("/opt/kubelet"));
        assert!(!is_remote("file:///opt/kubelet"));
    }
}
