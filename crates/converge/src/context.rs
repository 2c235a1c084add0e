//! Everything a task can reach while it runs.

use crate::error::EngineError;
use crate::target::Target;
use crate::task::{Lifecycle, TaskMap};
use assets::{AssetStore, Backoff, Cancellation, Fetcher};
use keystore::{Keystore, SecretReader};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

pub const TAG_DEBIAN_FAMILY: &str = "_debian_family";
pub const TAG_REDHAT_FAMILY: &str = "_redhat_family";
pub const TAG_SYSTEMD: &str = "_systemd";

/// Cloud the node runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProviderId {
    Aws,
    Gce,
    Azure,
    Openstack,
    #[default]
    Metal,
}

impl fmt::Display for CloudProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Aws => "aws",
            Self::Gce => "gce",
            Self::Azure => "azure",
            Self::Openstack => "openstack",
            Self::Metal => "metal",
        };
        f.write_str(s)
    }
}

/// Cloud handle exposed to tasks.
pub trait Cloud: Send + Sync + fmt::Debug {
    fn provider_id(&self) -> CloudProviderId;

    /// Region or zone, when the provider has one.
    fn region(&self) -> Option<String> {
        None
    }
}

/// Long-lived collaborators shared by every task.
#[derive(Clone)]
pub struct Services {
    pub keystore: Option<Arc<dyn Keystore>>,
    pub secrets: Option<Arc<dyn SecretReader>>,
    pub assets: Option<Arc<AssetStore>>,
    pub cloud: Option<Arc<dyn Cloud>>,
    /// Facts about the host such as its OS family.
    pub tags: BTreeSet<String>,
    pub cancel: Cancellation,
    pub backoff: Backoff,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            keystore: None,
            secrets: None,
            assets: None,
            cloud: None,
            tags: BTreeSet::new(),
            cancel: Cancellation::new(),
            backoff: Backoff::default(),
        }
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("keystore", &self.keystore.is_some())
            .field("secrets", &self.secrets.is_some())
            .field("assets", &self.assets)
            .field("cloud", &self.cloud)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// A fetcher sharing this run's backoff and cancellation.
    pub fn fetcher(&self) -> Fetcher {
        Fetcher::new(self.backoff.clone(), self.cancel.clone())
    }
}

/// Per-run view handed to every task method.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub target: &'a Target,
    pub tasks: &'a TaskMap,
    pub services: &'a Services,
    pub check_existing: bool,
    pub lifecycle_overrides: &'a BTreeMap<String, Lifecycle>,
}

impl<'a> Context<'a> {
    pub fn keystore(&self) -> Result<&'a dyn Keystore, EngineError> {
        self.services
            .keystore
            .as_deref()
            .ok_or(EngineError::NotConfigured("keystore"))
    }

    pub fn secrets(&self) -> Result<&'a dyn SecretReader, EngineError> {
        self.services
            .secrets
            .as_deref()
            .ok_or(EngineError::NotConfigured("secret store"))
    }

    pub fn assets(&self) -> Result<&'a AssetStore, EngineError> {
        self.services
            .assets
            .as_deref()
            .ok_or(EngineError::NotConfigured("asset store"))
    }

    pub fn cloud_provider(&self) -> Option<CloudProviderId> {
        self.services.cloud.as_ref().map(|c| c.provider_id())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.services.tags.contains(tag)
    }

    pub fn cancel(&self) -> &'a Cancellation {
        &self.services.cancel
    }
}
