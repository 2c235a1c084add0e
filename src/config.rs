use crate::flags::{KubeApiServerConfig, KubeletConfig};
use crate::tasks::{ContainerRuntime, FileType};
use anyhow::{Context, Result, bail};
use converge::{CloudProviderId, Lifecycle};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const SYSTEM_CONFIG: &str = "/etc/nodeup/config.toml";
const DEFAULT_CACHE_DIR: &str = "/var/cache/nodeup";
const DEFAULT_STATE_DIR: &str = "/var/lib/nodeup";

/// Per-user config path, used before the system one.
pub fn user_config() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("nodeup").join("config.toml"))
}

/// The config file to load when none is given.
pub fn default_config_path() -> PathBuf {
    user_config()
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Debian,
    Rhel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeystoreBackend {
    #[default]
    Memory,
    Fs,
    ConfigServer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeystoreConfig {
    pub backend: KeystoreBackend,
    /// Keystore directory for `fs`; directory of keyset YAML documents for
    /// `config-server`.
    pub path: Option<PathBuf>,
    /// Create a CA keyset with this name when it does not exist yet.
    pub ensure_ca: Option<String>,
}

/// The slice of the cluster spec the node needs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    pub cloud_provider: Option<CloudProviderId>,
    pub master_internal_name: Option<String>,
    pub service_cluster_ip_range: Option<String>,
    pub non_masquerade_cidr: Option<String>,
    pub networking: Option<String>,
    pub etcd_clusters: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootstrapConfig {
    pub server: String,
    pub token_file: Option<PathBuf>,
}

/// Where a file's bytes come from. Exactly one should be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContentSource {
    /// Inline text.
    pub contents: Option<String>,
    /// A file on this machine.
    pub source: Option<PathBuf>,
    /// Key of a registered asset, optionally `key@path-suffix`.
    pub asset: Option<String>,
    /// Output of another task, e.g. `IssueCert/kubelet/cert`.
    pub from: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileDecl {
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: Option<FileType>,
    #[serde(flatten)]
    pub content: ContentSource,
    pub mode: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub symlink: Option<String>,
    pub if_not_exists: bool,
    pub on_change_execute: Vec<Vec<String>>,
    pub after_files: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageDecl {
    pub name: String,
    pub version: Option<String>,
    pub source: Option<String>,
    pub hash: Option<String>,
}

/// A unit given verbatim or built from common directives.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceDecl {
    pub name: String,
    pub definition: Option<String>,
    pub description: Option<String>,
    pub documentation: Option<String>,
    pub after: Vec<String>,
    pub wants: Vec<String>,
    pub environment_file: Vec<String>,
    pub exec_start_pre: Vec<Vec<String>>,
    pub exec_start: Vec<String>,
    pub restart: Option<String>,
    pub restart_sec: Option<String>,
    pub kill_mode: Option<String>,
    pub wanted_by: Option<String>,
    pub running: Option<bool>,
    pub enabled: Option<bool>,
    pub manage_state: Option<bool>,
    pub smart_restart: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveDecl {
    pub name: String,
    pub source: String,
    pub hash: Option<String>,
    pub target_dir: String,
    pub strip_components: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BindMountDecl {
    pub source: String,
    pub mountpoint: String,
    pub options: Vec<String>,
    pub recursive: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountDiskDecl {
    pub name: String,
    pub device: String,
    pub mountpoint: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertType {
    #[default]
    Client,
    Server,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IssueCertDecl {
    pub name: String,
    pub signer: String,
    #[serde(rename = "type")]
    pub cert_type: CertType,
    pub common_name: String,
    pub organization: Vec<String>,
    pub alternate_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadImageDecl {
    pub name: String,
    pub sources: Vec<String>,
    pub hash: Option<String>,
    pub runtime: ContainerRuntime,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PullImageDecl {
    pub image: String,
    pub runtime: ContainerRuntime,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostRecordDecl {
    pub hostname: String,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostsDecl {
    pub name: String,
    pub path: Option<String>,
    pub records: Vec<HostRecordDecl>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChattrDecl {
    pub file: String,
    pub flags: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserDecl {
    pub name: String,
    pub uid: Option<u32>,
    pub group: Option<String>,
    pub shell: Option<String>,
    pub home: Option<String>,
    pub system: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroupDecl {
    pub name: String,
    pub gid: Option<u32>,
    pub system: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AptSourceDecl {
    pub name: String,
    pub line: String,
    pub keyring: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KubeConfigDecl {
    pub name: String,
    /// API server URL; `https://<master_internal_name>` when unset.
    pub server: Option<String>,
    /// Task outputs in the same form as [`ContentSource::from`].
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootstrapClientDecl {
    pub name: String,
    pub certs: Vec<String>,
    pub keypair_ids: BTreeMap<String, String>,
    pub include_node_config: bool,
    pub challenge_host: Option<String>,
    pub after_services: Vec<String>,
}

/// The node configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub cache_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub os_family: Option<OsFamily>,
    pub check_existing: Option<bool>,
    pub jobs: Option<usize>,
    pub lifecycle_overrides: BTreeMap<String, Lifecycle>,
    /// Asset ids (`hash@url,url`, `url` or a local path) to fetch up front.
    pub assets: Vec<String>,
    pub keystore: KeystoreConfig,
    pub cluster: ClusterConfig,
    pub bootstrap: Option<BootstrapConfig>,

    pub file: Vec<FileDecl>,
    pub package: Vec<PackageDecl>,
    pub service: Vec<ServiceDecl>,
    pub archive: Vec<ArchiveDecl>,
    pub bind_mount: Vec<BindMountDecl>,
    pub mount_disk: Vec<MountDiskDecl>,
    pub issue_cert: Vec<IssueCertDecl>,
    pub load_image: Vec<LoadImageDecl>,
    pub pull_image: Vec<PullImageDecl>,
    pub hosts: Vec<HostsDecl>,
    pub chattr: Vec<ChattrDecl>,
    pub user: Vec<UserDecl>,
    pub group: Vec<GroupDecl>,
    pub apt_source: Vec<AptSourceDecl>,
    pub kubeconfig: Vec<KubeConfigDecl>,
    pub prefix: Vec<String>,
    pub update_packages: bool,
    pub bootstrap_client: Option<BootstrapClientDecl>,

    pub kube_apiserver: Option<KubeApiServerConfig>,
    pub kubelet: Option<KubeletConfig>,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }

    pub fn check_existing(&self) -> bool {
        self.check_existing.unwrap_or(true)
    }

    /// Declared family, or a guess from release files on this host.
    pub fn os_family(&self) -> Option<OsFamily> {
        self.os_family.or_else(|| {
            if Path::new("/etc/debian_version").exists() {
                Some(OsFamily::Debian)
            } else if Path::new("/etc/redhat-release").exists() {
                Some(OsFamily::Rhel)
            } else {
                None
            }
        })
    }

    fn validate(&self) -> Result<()> {
        if self.jobs == Some(0) {
            bail!("jobs: must be at least 1");
        }
        for (i, file) in self.file.iter().enumerate() {
            if file.path.is_empty() {
                bail!("file[{i}].path: must not be empty");
            }
            let c = &file.content;
            let sources = [c.contents.is_some(), c.source.is_some(), c.asset.is_some(), c.from.is_some()]
                .into_iter()
                .filter(|set| *set)
                .count();
            if sources > 1 {
                bail!("file[{i}] ({}): set only one of contents, source, asset, from", file.path);
            }
        }
        for (i, service) in self.service.iter().enumerate() {
            if service.name.is_empty() {
                bail!("service[{i}].name: must not be empty");
            }
            if service.definition.is_some() && !service.exec_start.is_empty() {
                bail!("service[{i}] ({}): set either definition or exec_start", service.name);
            }
        }
        for (i, archive) in self.archive.iter().enumerate() {
            if archive.target_dir.is_empty() {
                bail!("archive[{i}].target_dir: must not be empty");
            }
        }
        for (i, cert) in self.issue_cert.iter().enumerate() {
            if cert.signer.is_empty() {
                bail!("issue_cert[{i}].signer: must not be empty");
            }
        }
        if self.bootstrap_client.is_some() && self.bootstrap.is_none() {
            bail!("bootstrap: required when bootstrap_client is set");
        }
        if self.keystore.backend != KeystoreBackend::Memory && self.keystore.path.is_none() {
            bail!("keystore.path: required for the {:?} backend", self.keystore.backend);
        }
        Ok(())
    }
}
