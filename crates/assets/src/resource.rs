//! Re-openable byte sources.
//!
//! A [`Resource`] is what a task writes to disk or compares against disk.
//! Resources are shared between tasks via [`ResourceRef`] and can be opened
//! any number of times.

use crate::error::{Error, Result};
use crate::hash::Hash;
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Block size used when comparing resources.
const COMPARE_BLOCK_SIZE: usize = 8 * 1024;

/// Where a resource's bytes originally came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Downloaded from a URL with a known hash.
    Url { url: String, hash: Hash },
    /// A member of an archive which itself has a source.
    Extract { parent: Box<Source>, member: String },
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Url { url, hash } => write!(f, "{url} ({}:{hash})", hash.algorithm),
            Source::Extract { parent, member } => write!(f, "{member} in {parent}"),
        }
    }
}

/// A lazy, re-openable byte source.
pub trait Resource: Send + Sync + fmt::Debug {
    /// Open a fresh reader over the resource.
    fn open(&self) -> Result<Box<dyn Read + Send>>;

    /// Origin of the bytes, if they came from a download.
    fn source(&self) -> Option<Source> {
        None
    }

    /// Key of the task that produces this resource, if any.
    fn task_dependency(&self) -> Option<String> {
        None
    }

    /// Whether the bytes are available yet.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Shared handle to a resource.
pub type ResourceRef = Arc<dyn Resource>;

/// In-memory text.
#[derive(Debug, Clone)]
pub struct StringResource(Arc<str>);

impl StringResource {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    /// Wrap as a shared resource.
    pub fn shared(s: impl Into<String>) -> ResourceRef {
        Arc::new(Self::new(s))
    }
}

impl Resource for StringResource {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.0.as_bytes().to_vec())))
    }
}

/// In-memory bytes.
#[derive(Debug, Clone)]
pub struct BytesResource(Arc<[u8]>);

impl BytesResource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(data.into()))
    }

    /// Wrap as a shared resource.
    pub fn shared(data: impl Into<Vec<u8>>) -> ResourceRef {
        Arc::new(Self::new(data))
    }
}

impl Resource for BytesResource {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.0.to_vec())))
    }
}

/// A file on the local filesystem, read on each open.
#[derive(Debug, Clone)]
pub struct FileResource {
    path: PathBuf,
}

impl FileResource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Resource for FileResource {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        Ok(Box::new(file))
    }
}

/// A cached file that remembers where it was downloaded from.
#[derive(Debug, Clone)]
pub struct AssetResource {
    path: PathBuf,
    source: Source,
}

impl AssetResource {
    pub fn new(path: impl Into<PathBuf>, source: Source) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }

    /// Location in the local cache.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Resource for AssetResource {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        Ok(Box::new(file))
    }

    fn source(&self) -> Option<Source> {
        Some(self.source.clone())
    }
}

/// A resource whose bytes are produced by another task when it renders.
///
/// Until [`TaskDependentResource::set`] is called the resource is not ready
/// and opening it fails with [`Error::NotReady`].
#[derive(Debug, Clone)]
pub struct TaskDependentResource {
    task: String,
    inner: Arc<RwLock<Option<ResourceRef>>>,
}

impl TaskDependentResource {
    /// Create a placeholder for output of the task with the given key.
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Publish the produced bytes.
    pub fn set(&self, resource: ResourceRef) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(resource);
    }

    /// The produced resource, if any.
    pub fn get(&self) -> Option<ResourceRef> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Share this placeholder as a resource.
    pub fn shared(&self) -> ResourceRef {
        Arc::new(self.clone())
    }
}

impl Resource for TaskDependentResource {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        match self.get() {
            Some(resource) => resource.open(),
            None => Err(Error::NotReady(self.task.clone())),
        }
    }

    fn source(&self) -> Option<Source> {
        self.get().and_then(|r| r.source())
    }

    fn task_dependency(&self) -> Option<String> {
        Some(self.task.clone())
    }

    fn is_ready(&self) -> bool {
        self.get().is_some()
    }
}

/// Read a resource fully into memory.
pub fn as_bytes(resource: &dyn Resource) -> Result<Vec<u8>> {
    let mut reader = resource.open()?;
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .map_err(|e| Error::io(PathBuf::new(), e))?;
    Ok(buf)
}

/// Read a resource fully into a string, replacing invalid UTF-8.
pub fn as_string(resource: &dyn Resource) -> Result<String> {
    let bytes = as_bytes(resource)?;
    Ok(String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
}

/// Compare two resources block by block.
pub fn resources_match(a: &dyn Resource, b: &dyn Resource) -> Result<bool> {
    let mut ra = a.open()?;
    let mut rb = b.open()?;
    let mut buf_a = vec![0u8; COMPARE_BLOCK_SIZE];
    let mut buf_b = vec![0u8; COMPARE_BLOCK_SIZE];

    loop {
        let na = read_block(&mut ra, &mut buf_a).map_err(|e| Error::io(PathBuf::new(), e))?;
        let nb = read_block(&mut rb, &mut buf_b).map_err(|e| Error::io(PathBuf::new(), e))?;
        if na != nb || buf_a[..na] != buf_b[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

// Fill the buffer unless the stream ends first, so short reads don't
// misalign the two sides.
fn read_block(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;

    #[test]
    fn test_resource_matches_itself() {
        let r = StringResource::new("hello world");
        assert!(resources_match(&r, &r).unwrap());

        let big = BytesResource::new(vec![7u8; COMPARE_BLOCK_SIZE * 3 + 5]);
        assert!(resources_match(&big, &big).unwrap());
    }

    #[test]
    fn test_resources_differ_in_length_and_content() {
        let a = StringResource::new("abc");
        let b = StringResource::new("abcd");
        let c = StringResource::new("abd");
        assert!(!resources_match(&a, &b).unwrap());
        assert!(!resources_match(&a, &c).unwrap());
    }

    #[test]
    fn test_file_and_string_resources_compare() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, "payload").unwrap();
        let file = FileResource::new(&path);
        assert!(resources_match(&file, &StringResource::new("payload")).unwrap());
        assert_eq!(as_string(&file).unwrap(), "payload");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let file = FileResource::new("/nonexistent/nodeup/file");
        assert!(resources_match(&file, &StringResource::new("")).is_err());
    }

    #[test]
    fn test_task_dependent_resource() {
        let pending = TaskDependentResource::new("IssueCert/kubelet");
        assert!(!pending.is_ready());
        assert_eq!(pending.task_dependency().as_deref(), Some("IssueCert/kubelet"));
        assert!(matches!(pending.open(), Err(Error::NotReady(_))));

        pending.set(StringResource::shared("cert"));
        assert!(pending.is_ready());
        assert_eq!(as_bytes(&pending).unwrap(), b"cert");
    }

    #[test]
    fn test_asset_resource_exposes_source() {
        let hash = Hash::of_bytes(HashAlgorithm::Sha256, b"x");
        let source = Source::Url {
            url: "https://example.com/x".to_string(),
            hash,
        };
        let asset = AssetResource::new("/cache/x", source.clone());
        assert_eq!(asset.source(), Some(source));
        assert!(StringResource::new("x").source().is_none());
    }
}
