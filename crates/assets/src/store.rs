//! Content-addressed cache of downloaded assets.
//!
//! Downloads land in `<cache>/<hash>_<sanitized-url>`. Tarballs are also
//! unpacked into `<cache>/extracted/<basename>` and every member is
//! registered as a child asset that remembers the archive it came from.
//! A `.<basename>.origin` stamp beside the directory records which cache
//! file it was unpacked from, so a new version under the same name replaces
//! the old contents.

use crate::error::{Error, Result};
use crate::fetch::{Fetcher, is_remote};
use crate::hash::Hash;
use crate::resource::{AssetResource, FileResource, ResourceRef, Source};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

/// A registered asset.
#[derive(Debug, Clone)]
pub struct Asset {
    /// Basename used for lookups.
    pub key: String,
    /// Original URL, local path, or path inside the parent archive.
    pub asset_path: String,
    pub resource: ResourceRef,
    pub source: Option<Source>,
}

/// Parsed form of an asset id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetId {
    /// A file already on this machine.
    Local(PathBuf),
    /// One or more mirror URLs, optionally with a known hash.
    Remote { hash: Option<Hash>, urls: Vec<String> },
}

impl AssetId {
    /// Parse `hash@url1,url2`, `url1,url2`, or a local path.
    pub fn parse(id: &str) -> Result<Self> {
        let id = id.trim();
        if id.is_empty() {
            return Err(Error::InvalidAssetId(id.to_string()));
        }

        let (hash, rest) = match id.split_once('@') {
            Some((prefix, rest)) if !prefix.contains('/') && !prefix.contains(':') => {
                (Some(Hash::parse(prefix)?), rest)
            }
            _ => (None, id),
        };

        let urls: Vec<String> = rest
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if urls.is_empty() {
            return Err(Error::InvalidAssetId(id.to_string()));
        }

        if hash.is_none() && urls.len() == 1 && !urls[0].contains("://") {
            return Ok(Self::Local(PathBuf::from(&urls[0])));
        }
        Ok(Self::Remote { hash, urls })
    }
}

/// The asset cache.
#[derive(Debug)]
pub struct AssetStore {
    cache_dir: PathBuf,
    fetcher: Fetcher,
    assets: Mutex<Vec<Asset>>,
}

impl AssetStore {
    pub fn new(cache_dir: impl Into<PathBuf>, fetcher: Fetcher) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            fetcher,
            assets: Mutex::new(Vec::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Fetch (or locate) an asset and register it plus any archive members.
    pub fn add(&self, id: &str) -> Result<()> {
        match AssetId::parse(id)? {
            AssetId::Local(path) => self.add_local(&path),
            AssetId::Remote { hash, urls } => self.add_remote(hash, &urls),
        }
    }

    fn add_local(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(Error::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "asset file not found"),
            ));
        }
        let key = basename(&path.to_string_lossy());
        self.register(Asset {
            key: key.clone(),
            asset_path: path.display().to_string(),
            resource: Arc::new(FileResource::new(path)),
            source: None,
        });
        if is_archive(&key) {
            self.extract(path, &key, None)?;
        }
        Ok(())
    }

    fn add_remote(&self, hash: Option<Hash>, urls: &[String]) -> Result<()> {
        let primary = &urls[0];
        let key = basename(primary);
        let hash = hash.or_else(|| self.fetcher.etag_hash(primary));

        let local = match &hash {
            Some(hash) => {
                let dest = self.cache_path(hash, primary);
                self.fetcher.fetch(urls, &dest, Some(hash))?;
                (dest, hash.clone())
            }
            None => {
                let staging = self.cache_dir.join(format!(".unhashed_{}", sanitize(primary)));
                let computed = self.fetcher.fetch(urls, &staging, None)?;
                let dest = self.cache_path(&computed, primary);
                fs::rename(&staging, &dest).map_err(|e| Error::io(&dest, e))?;
                (dest, computed)
            }
        };
        let (path, hash) = local;

        let source = Source::Url {
            url: primary.clone(),
            hash,
        };
        self.register(Asset {
            key: key.clone(),
            asset_path: primary.clone(),
            resource: Arc::new(AssetResource::new(&path, source.clone())),
            source: Some(source.clone()),
        });
        if is_archive(&key) {
            self.extract(&path, &key, Some(source))?;
        }
        Ok(())
    }

    /// Find exactly one asset by key, optionally narrowed by asset-path suffix.
    pub fn find(&self, key: &str, asset_path: &str) -> Result<Option<ResourceRef>> {
        let assets = self.assets.lock().unwrap_or_else(|e| e.into_inner());
        let matches: Vec<&Asset> = assets
            .iter()
            .filter(|a| a.key == key)
            .filter(|a| asset_path.is_empty() || a.asset_path.ends_with(asset_path))
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(one.resource.clone())),
            many => Err(Error::Ambiguous {
                key: key.to_string(),
                asset_path: asset_path.to_string(),
                count: many.len(),
            }),
        }
    }

    /// Snapshot of everything registered so far.
    pub fn assets(&self) -> Vec<Asset> {
        self.assets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn register(&self, asset: Asset) {
        log::debug!("added asset {} ({})", asset.key, asset.asset_path);
        self.assets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(asset);
    }

    fn cache_path(&self, hash: &Hash, url: &str) -> PathBuf {
        self.cache_dir.join(format!("{}_{}", hash.hex(), sanitize(url)))
    }

    fn extract(&self, archive: &Path, key: &str, parent: Option<Source>) -> Result<()> {
        let extracted = self.cache_dir.join("extracted");
        let target = extracted.join(key);
        let stamp = extracted.join(format!(".{key}.origin"));
        let origin = archive.display().to_string();

        let current = fs::read_to_string(&stamp).is_ok_and(|s| s == origin);
        if target.exists() && !current {
            log::debug!("replacing stale extraction {}", target.display());
            fs::remove_dir_all(&target).map_err(|e| Error::io(&target, e))?;
        }
        if !target.exists() {
            fs::create_dir_all(&extracted).map_err(|e| Error::io(&extracted, e))?;
            let tmp = tempfile::Builder::new()
                .prefix(".extract-")
                .tempdir_in(&extracted)
                .map_err(|e| Error::io(&extracted, e))?;

            let file = File::open(archive).map_err(|e| Error::io(archive, e))?;
            tar::Archive::new(GzDecoder::new(file))
                .unpack(tmp.path())
                .map_err(|e| Error::Extraction {
                    path: archive.to_path_buf(),
                    message: e.to_string(),
                })?;

            // Another producer may have won the race; its copy is identical.
            if let Err(e) = fs::rename(tmp.path(), &target)
                && !target.exists()
            {
                return Err(Error::io(&target, e));
            }
            fs::write(&stamp, &origin).map_err(|e| Error::io(&stamp, e))?;
        }

        for entry in WalkDir::new(&target).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Extraction {
                path: target.clone(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let member = entry
                .path()
                .strip_prefix(&target)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let child_key = entry.file_name().to_string_lossy().into_owned();
            let (resource, source): (ResourceRef, Option<Source>) = match &parent {
                Some(parent) => {
                    let source = Source::Extract {
                        parent: Box::new(parent.clone()),
                        member: member.clone(),
                    };
                    (
                        Arc::new(AssetResource::new(entry.path(), source.clone())),
                        Some(source),
                    )
                }
                None => (Arc::new(FileResource::new(entry.path())), None),
            };
            self.register(Asset {
                key: child_key,
                asset_path: member,
                resource,
                source,
            });
        }
        Ok(())
    }
}

fn is_archive(name: &str) -> bool {
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Last path segment of a URL or path, without query string.
fn basename(url: &str) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

/// Make a URL safe to use as a file name.
fn sanitize(url: &str) -> String {
    url.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::cancel::Cancellation;
    use crate::hash::HashAlgorithm;
    use crate::resource::as_string;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn store(dir: &Path) -> AssetStore {
        AssetStore::new(
            dir.join("cache"),
            Fetcher::new(Backoff::default(), Cancellation::new()),
        )
    }

    fn write_tarball(path: &Path, members: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, contents) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_parse_asset_ids() {
        let hash = "a".repeat(64);
        match AssetId::parse(&format!("{hash}@https://a/x.tgz,https://b/x.tgz")).unwrap() {
            AssetId::Remote { hash: Some(h), urls } => {
                assert_eq!(h.hex(), hash);
                assert_eq!(urls.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            AssetId::parse("/opt/bin/tool").unwrap(),
            AssetId::Local(PathBuf::from("/opt/bin/tool"))
        );
        assert!(matches!(
            AssetId::parse("https://a/x").unwrap(),
            AssetId::Remote { hash: None, .. }
        ));
        assert!(AssetId::parse("  ").is_err());
        assert!(AssetId::parse("xyz@https://a/x").is_err());
    }

    #[test]
    fn test_sanitize_and_basename() {
        assert_eq!(
            sanitize("https://dl.k8s.io/v1/kubelet"),
            "https___dl.k8s.io_v1_kubelet"
        );
        assert_eq!(basename("https://dl.k8s.io/v1/kubelet?x=1"), "kubelet");
        assert_eq!(basename("/opt/cni.tgz"), "cni.tgz");
    }

    #[test]
    fn test_add_remote_file_url_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("kubectl");
        fs::write(&src, "binary").unwrap();
        let hash = Hash::of_bytes(HashAlgorithm::Sha256, b"binary");
        let store = store(dir.path());

        store
            .add(&format!("{}@file://{}", hash.hex(), src.display()))
            .unwrap();

        let found = store.find("kubectl", "").unwrap().unwrap();
        assert_eq!(as_string(found.as_ref()).unwrap(), "binary");
        assert!(matches!(found.source(), Some(Source::Url { .. })));
        let cached = store.cache_dir().join(format!(
            "{}_{}",
            hash.hex(),
            sanitize(&format!("file://{}", src.display()))
        ));
        assert!(cached.exists());
    }

    #[test]
    fn test_archive_members_become_assets() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = dir.path().join("cni.tgz");
        write_tarball(&tarball, &[("bin/bridge", "bridge"), ("bin/loopback", "lo")]);
        let hash = Hash::of_file(HashAlgorithm::Sha256, &tarball).unwrap();
        let store = store(dir.path());

        store
            .add(&format!("{}@file://{}", hash.hex(), tarball.display()))
            .unwrap();

        let bridge = store.find("bridge", "bin/bridge").unwrap().unwrap();
        assert_eq!(as_string(bridge.as_ref()).unwrap(), "bridge");
        match bridge.source() {
            Some(Source::Extract { member, parent }) => {
                assert_eq!(member, "bin/bridge");
                assert!(matches!(*parent, Source::Url { .. }));
            }
            other => panic!("unexpected source {other:?}"),
        }
        assert!(store.cache_dir().join("extracted/cni.tgz/bin/bridge").is_file());
        assert!(store.find("missing", "").unwrap().is_none());
    }

    #[test]
    fn test_new_archive_version_replaces_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = dir.path().join("v1");
        let v2 = dir.path().join("v2");
        fs::create_dir_all(&v1).unwrap();
        fs::create_dir_all(&v2).unwrap();
        write_tarball(&v1.join("tools.tgz"), &[("old", "1")]);
        write_tarball(&v2.join("tools.tgz"), &[("new", "2")]);

        let first = store(dir.path());
        let h1 = Hash::of_file(HashAlgorithm::Sha256, &v1.join("tools.tgz")).unwrap();
        first
            .add(&format!("{}@file://{}", h1.hex(), v1.join("tools.tgz").display()))
            .unwrap();
        assert!(first.cache_dir().join("extracted/tools.tgz/old").is_file());

        let second = store(dir.path());
        let h2 = Hash::of_file(HashAlgorithm::Sha256, &v2.join("tools.tgz")).unwrap();
        second
            .add(&format!("{}@file://{}", h2.hex(), v2.join("tools.tgz").display()))
            .unwrap();
        let extracted = second.cache_dir().join("extracted/tools.tgz");
        assert!(extracted.join("new").is_file());
        assert!(!extracted.join("old").exists());
        assert!(second.find("old", "").unwrap().is_none());
        assert!(second.find("new", "").unwrap().is_some());
    }

    #[test]
    fn test_find_rejects_ambiguous_matches() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("tool"), "1").unwrap();
        fs::write(b.join("tool"), "2").unwrap();
        let store = store(dir.path());
        store.add(&a.join("tool").display().to_string()).unwrap();
        store.add(&b.join("tool").display().to_string()).unwrap();

        assert!(matches!(
            store.find("tool", ""),
            Err(Error::Ambiguous { count: 2, .. })
        ));
        let narrowed = store.find("tool", "b/tool").unwrap().unwrap();
        assert_eq!(as_string(narrowed.as_ref()).unwrap(), "2");
    }
}
