//! # assets
//!
//! Byte sources and downloaded files for node tasks.
//!
//! This crate provides:
//! - [`Resource`]: a re-openable byte source (string, bytes, file, cached
//!   asset, or output of another task)
//! - [`AssetStore`]: a hash-addressed download cache that also unpacks
//!   tarballs and registers their members
//! - [`Backoff`]: the shared exponential pause after failed downloads
//! - [`Cancellation`]: a cooperative cancel flag honored by every wait
//!
//! ## Example
//!
//! ```no_run
//! use assets::{AssetStore, Backoff, Cancellation, Fetcher};
//!
//! let fetcher = Fetcher::new(Backoff::default(), Cancellation::new());
//! let store = AssetStore::new("/var/cache/nodeup", fetcher);
//! store.add("https://example.com/cni-plugins.tgz").unwrap();
//! let bridge = store.find("bridge", "").unwrap();
//! ```

pub mod backoff;
pub mod cancel;
pub mod error;
pub mod fetch;
pub mod hash;
pub mod resource;
pub mod store;

pub use backoff::{Backoff, BackoffConfig};
pub use cancel::Cancellation;
pub use error::{Error, ErrorCategory, Result};
pub use fetch::Fetcher;
pub use hash::{Hash, HashAlgorithm};
pub use resource::{
    AssetResource, BytesResource, FileResource, Resource, ResourceRef, Source, StringResource,
    TaskDependentResource, as_bytes, as_string, resources_match,
};
pub use store::{Asset, AssetId, AssetStore};
