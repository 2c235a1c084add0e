//! Turns a [`NodeConfig`] into the services and task graph for one run.

use crate::bootstrap::{BootstrapTransport, HttpTransport};
use crate::config::{
    BootstrapClientDecl, CertType, ContentSource, KeystoreBackend, NodeConfig, OsFamily,
    ServiceDecl,
};
use crate::systemd::{Manifest, escape_command};
use crate::tasks::{
    AptSource, Archive, BindMount, BootstrapClient, Chattr, File, Group, HostRecord, IssueCert,
    KubeConfig, LoadImage, MountDisk, Package, Prefix, PullImage, Service, UpdateEtcHosts,
    UpdatePackages, User,
};
use anyhow::{Context as _, Result, bail};
use assets::{AssetStore, Cancellation, FileResource, ResourceRef, StringResource};
use converge::{
    Cloud, CloudProviderId, Delta as _, Services, TAG_DEBIAN_FAMILY, TAG_REDHAT_FAMILY, TAG_SYSTEMD, TaskMap,
};
use keystore::{
    CertificateUsage, ConfigServerKeystore, FsKeystore, Keystore, MemoryKeystore, SecretReader,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

const SYSTEMD_RUNTIME_DIR: &str = "/run/systemd/system";

/// Cloud identity taken from the cluster config.
#[derive(Debug)]
struct ConfiguredCloud(CloudProviderId);

impl Cloud for ConfiguredCloud {
    fn provider_id(&self) -> CloudProviderId {
        self.0
    }
}

/// Host facts used to pick package and service behavior.
pub fn host_tags(config: &NodeConfig) -> Vec<String> {
    let mut tags = Vec::new();
    match config.os_family() {
        Some(OsFamily::Debian) => tags.push(TAG_DEBIAN_FAMILY.to_string()),
        Some(OsFamily::Rhel) => tags.push(TAG_REDHAT_FAMILY.to_string()),
        None => log::warn!("unable to determine OS family; package tasks will fail"),
    }
    if Path::new(SYSTEMD_RUNTIME_DIR).exists() {
        tags.push(TAG_SYSTEMD.to_string());
    }
    tags
}

fn config_server_keystore(dir: &Path) -> Result<ConfigServerKeystore> {
    let mut documents = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Could not read {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "yaml" || ext == "yml") {
            documents.push(
                fs::read_to_string(&path).with_context(|| format!("Could not read {}", path.display()))?,
            );
        }
    }
    Ok(ConfigServerKeystore::from_yaml_documents(documents.iter().map(String::as_str))?)
}

/// Keystore, secrets, asset store and host tags for a run.
pub fn build_services(config: &NodeConfig, cancel: Cancellation) -> Result<Services> {
    let mut services = Services {
        cancel,
        tags: host_tags(config).into_iter().collect(),
        ..Default::default()
    };

    let keystore = &config.keystore;
    match keystore.backend {
        KeystoreBackend::Memory => {
            let store = Arc::new(MemoryKeystore::new());
            services.keystore = Some(store.clone() as Arc<dyn Keystore>);
            services.secrets = Some(store as Arc<dyn SecretReader>);
        }
        KeystoreBackend::Fs => {
            let path = keystore.path.as_deref().context("keystore.path is required")?;
            let store = Arc::new(FsKeystore::new(path));
            services.keystore = Some(store.clone() as Arc<dyn Keystore>);
            services.secrets = Some(store as Arc<dyn SecretReader>);
        }
        KeystoreBackend::ConfigServer => {
            let path = keystore.path.as_deref().context("keystore.path is required")?;
            services.keystore = Some(Arc::new(config_server_keystore(path)?));
        }
    }
    if let (Some(name), Some(store)) = (&keystore.ensure_ca, &services.keystore) {
        store.ensure_ca(name)?;
    }

    services.assets = Some(Arc::new(AssetStore::new(
        config.cache_dir().join("assets"),
        services.fetcher(),
    )));
    services.cloud = config
        .cluster
        .cloud_provider
        .map(|id| Arc::new(ConfiguredCloud(id)) as Arc<dyn Cloud>);
    Ok(services)
}

/// Fetch every configured asset into the store.
pub fn add_assets(config: &NodeConfig, services: &Services) -> Result<()> {
    let Some(store) = &services.assets else {
        return Ok(());
    };
    for id in &config.assets {
        log::info!("adding asset {id}");
        store.add(id).with_context(|| format!("error adding asset {id}"))?;
    }
    Ok(())
}

/// Unit file text for a service declaration.
pub fn service_definition(decl: &ServiceDecl) -> String {
    if let Some(definition) = &decl.definition {
        return definition.clone();
    }
    let mut manifest = Manifest::new();
    if let Some(description) = &decl.description {
        manifest.set("Unit", "Description", description.as_str());
    }
    if let Some(documentation) = &decl.documentation {
        manifest.set("Unit", "Documentation", documentation.as_str());
    }
    for after in &decl.after {
        manifest.set("Unit", "After", after.as_str());
    }
    for wants in &decl.wants {
        manifest.set("Unit", "Wants", wants.as_str());
    }
    for file in &decl.environment_file {
        manifest.set("Service", "EnvironmentFile", file.as_str());
    }
    for pre in &decl.exec_start_pre {
        manifest.set("Service", "ExecStartPre", escape_command(pre.as_slice()));
    }
    if !decl.exec_start.is_empty() {
        manifest.set("Service", "ExecStart", escape_command(decl.exec_start.as_slice()));
    }
    manifest.set("Service", "Restart", decl.restart.as_deref().unwrap_or("always"));
    manifest.set("Service", "RestartSec", decl.restart_sec.as_deref().unwrap_or("2s"));
    if let Some(kill_mode) = &decl.kill_mode {
        manifest.set("Service", "KillMode", kill_mode.as_str());
    }
    manifest.set(
        "Install",
        "WantedBy",
        decl.wanted_by.as_deref().unwrap_or("multi-user.target"),
    );
    manifest.render()
}

/// Resources other tasks publish, by reference string.
#[derive(Debug, Default)]
struct Outputs(BTreeMap<String, ResourceRef>);

impl Outputs {
    fn add(&mut self, reference: String, resource: ResourceRef) {
        self.0.insert(reference, resource);
    }

    fn get(&self, reference: &str) -> Result<ResourceRef> {
        match self.0.get(reference) {
            Some(resource) => Ok(resource.clone()),
            None => bail!("unknown task output {reference:?}"),
        }
    }
}

fn content(source: &ContentSource, outputs: &Outputs, services: &Services) -> Result<Option<ResourceRef>> {
    if let Some(text) = &source.contents {
        return Ok(Some(StringResource::shared(text.as_str())));
    }
    if let Some(path) = &source.source {
        return Ok(Some(Arc::new(FileResource::new(path))));
    }
    if let Some(asset) = &source.asset {
        let (key, suffix) = asset.split_once('@').unwrap_or((asset.as_str(), ""));
        let store = services.assets.as_ref().context("no asset store configured")?;
        let found = store.find(key, suffix)?;
        return found.map(Some).with_context(|| format!("asset {asset:?} not found"));
    }
    if let Some(reference) = &source.from {
        return outputs.get(reference).map(Some);
    }
    Ok(None)
}

fn bootstrap_transport(config: &NodeConfig) -> Result<Arc<dyn BootstrapTransport>> {
    let Some(bootstrap) = &config.bootstrap else {
        bail!("bootstrap: required when bootstrap_client is set");
    };
    let token = match &bootstrap.token_file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Could not read bootstrap token {}", path.display()))?,
        None => String::new(),
    };
    Ok(Arc::new(HttpTransport::new(&bootstrap.server, &token)))
}

fn bootstrap_client(
    decl: &BootstrapClientDecl,
    transport: Arc<dyn BootstrapTransport>,
    outputs: &mut Outputs,
) -> Result<BootstrapClient> {
    let name = if decl.name.is_empty() { "bootstrap" } else { decl.name.as_str() };
    let certs: Vec<&str> = decl.certs.iter().map(String::as_str).collect();
    let mut task = BootstrapClient::new(name, &certs, transport);
    task.keypair_ids.clone_from(&decl.keypair_ids);
    task.include_node_config = decl.include_node_config;
    task.challenge_host.clone_from(&decl.challenge_host);
    task.after_services.clone_from(&decl.after_services);
    for cert in &decl.certs {
        outputs.add(format!("{}/{name}/{cert}/cert", BootstrapClient::KIND), task.cert(cert)?);
        outputs.add(format!("{}/{name}/{cert}/key", BootstrapClient::KIND), task.key(cert)?);
    }
    outputs.add(format!("{}/{name}/node-config", BootstrapClient::KIND), task.node_config()?);
    Ok(task)
}

/// Build the task graph for a config.
pub fn build_tasks(config: &NodeConfig, services: &Services) -> Result<TaskMap> {
    build_tasks_with(config, services, None)
}

/// Like [`build_tasks`], with an explicit bootstrap transport.
pub fn build_tasks_with(
    config: &NodeConfig,
    services: &Services,
    transport: Option<Arc<dyn BootstrapTransport>>,
) -> Result<TaskMap> {
    let mut tasks = TaskMap::default();
    let mut outputs = Outputs::default();
    let markers = config.state_dir().join("markers");

    for decl in &config.issue_cert {
        let usage = match decl.cert_type {
            CertType::Client => CertificateUsage::Client,
            CertType::Server => CertificateUsage::Server,
        };
        let common_name = if decl.common_name.is_empty() { &decl.name } else { &decl.common_name };
        let mut task = IssueCert::new(&decl.name, &decl.signer, usage, common_name);
        task.organization.clone_from(&decl.organization);
        task.alternate_names.clone_from(&decl.alternate_names);
        outputs.add(format!("{}/{}/cert", IssueCert::KIND, decl.name), task.cert()?);
        outputs.add(format!("{}/{}/key", IssueCert::KIND, decl.name), task.key()?);
        outputs.add(format!("{}/{}/ca", IssueCert::KIND, decl.name), task.ca()?);
        tasks.insert(task)?;
    }

    if let Some(decl) = &config.bootstrap_client {
        let transport = match transport {
            Some(transport) => transport,
            None => bootstrap_transport(config)?,
        };
        tasks.insert(bootstrap_client(decl, transport, &mut outputs)?)?;
    }

    for decl in &config.kubeconfig {
        let server = match (&decl.server, &config.cluster.master_internal_name) {
            (Some(server), _) => server.clone(),
            (None, Some(master)) => format!("https://{master}"),
            (None, None) => bail!("kubeconfig {}: server is required without cluster.master_internal_name", decl.name),
        };
        let mut task = KubeConfig::new(&decl.name, &server);
        let resolve = |r: &Option<String>| r.as_deref().map(|r| outputs.get(r)).transpose();
        task.ca = resolve(&decl.ca)?;
        task.cert = resolve(&decl.cert)?;
        task.key = resolve(&decl.key)?;
        outputs.add(format!("{}/{}", KubeConfig::KIND, decl.name), task.output()?);
        tasks.insert(task)?;
    }

    for decl in &config.file {
        let mut task = File {
            path: decl.path.clone(),
            file_type: decl.file_type,
            contents: content(&decl.content, &outputs, services)
                .with_context(|| format!("file {}", decl.path))?,
            mode: decl.mode.clone(),
            owner: decl.owner.clone(),
            group: decl.group.clone(),
            symlink: decl.symlink.clone(),
            if_not_exists: decl.if_not_exists,
            on_change_execute: decl.on_change_execute.clone(),
            after_files: decl.after_files.clone(),
        };
        if task.file_type.is_none() && task.symlink.is_some() {
            task.file_type = Some(crate::tasks::FileType::Symlink);
        }
        tasks.insert(task)?;
    }

    if config.update_packages {
        tasks.insert(UpdatePackages::new())?;
    }
    for decl in &config.package {
        let mut task = Package::new(&decl.name);
        task.version.clone_from(&decl.version);
        task.source.clone_from(&decl.source);
        task.hash.clone_from(&decl.hash);
        tasks.insert(task)?;
    }

    for decl in &config.service {
        let task = Service {
            name: decl.name.clone(),
            definition: Some(service_definition(decl)),
            running: decl.running,
            enabled: decl.enabled,
            manage_state: decl.manage_state,
            smart_restart: decl.smart_restart,
        }
        .with_defaults();
        tasks.insert(task)?;
    }

    for decl in &config.archive {
        let mut task = Archive::new(&decl.name, &decl.source, &decl.target_dir, &markers);
        task.hash.clone_from(&decl.hash);
        task.strip_components = decl.strip_components;
        tasks.insert(task)?;
    }

    for decl in &config.bind_mount {
        tasks.insert(BindMount {
            source: decl.source.clone(),
            mountpoint: decl.mountpoint.clone(),
            options: decl.options.clone(),
            recursive: decl.recursive,
        })?;
    }

    for decl in &config.mount_disk {
        tasks.insert(MountDisk::new(&decl.name, &decl.device, &decl.mountpoint))?;
    }

    for decl in &config.load_image {
        let mut task = LoadImage::new(&decl.name, decl.sources.clone(), decl.hash.as_deref(), &markers);
        task.runtime = decl.runtime;
        tasks.insert(task)?;
    }

    for decl in &config.pull_image {
        tasks.insert(PullImage::new(&decl.image, decl.runtime))?;
    }

    for decl in &config.hosts {
        let records = decl
            .records
            .iter()
            .map(|r| HostRecord {
                hostname: r.hostname.clone(),
                addresses: r.addresses.clone(),
            })
            .collect();
        let name = if decl.name.is_empty() { "hosts" } else { decl.name.as_str() };
        let mut task = UpdateEtcHosts::new(name, records);
        task.path.clone_from(&decl.path);
        tasks.insert(task)?;
    }

    for decl in &config.chattr {
        tasks.insert(Chattr::new(&decl.file, &decl.flags))?;
    }

    for decl in &config.group {
        tasks.insert(Group {
            name: decl.name.clone(),
            gid: decl.gid,
            system: decl.system,
        })?;
    }
    for decl in &config.user {
        tasks.insert(User {
            name: decl.name.clone(),
            uid: decl.uid,
            group: decl.group.clone(),
            shell: decl.shell.clone(),
            home: decl.home.clone(),
            system: decl.system,
        })?;
    }

    for decl in &config.apt_source {
        let mut task = AptSource::new(&decl.name, &decl.line);
        task.keyring.clone_from(&decl.keyring);
        tasks.insert(task)?;
    }

    for prefix in &config.prefix {
        tasks.insert(Prefix::new(prefix))?;
    }

    log::debug!("built {} tasks", tasks.len());
    Ok(tasks)
}
