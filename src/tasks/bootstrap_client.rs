use crate::bootstrap::{
    BOOTSTRAP_API_VERSION, BootstrapRequest, BootstrapTransport, CHALLENGE_PORT, Challenge,
    ChallengeResponder, new_challenge_secret, sha256_hex,
};
use crate::tasks::Service;
use anyhow::{Context as _, Result, bail};
use assets::{ResourceRef, StringResource, TaskDependentResource};
use converge::{Changes, Context, Delta, Field, LocalTarget, TaskKey, TaskMap};
use keystore::PrivateKey;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Key and certificate placeholders for one requested certificate.
#[derive(Debug, Clone)]
pub struct BootstrapCert {
    pub key: TaskDependentResource,
    pub cert: TaskDependentResource,
}

/// Requests node certificates from the bootstrap controller.
#[derive(Debug, Clone, Default)]
pub struct BootstrapClient {
    pub name: String,
    /// Keyset name to the primary id the node already has.
    pub keypair_ids: BTreeMap<String, String>,
    pub include_node_config: bool,
    /// Address the controller can reach the challenge responder on; no
    /// responder runs when unset.
    pub challenge_host: Option<String>,
    /// Services that must be running before the request is sent.
    pub after_services: Vec<String>,
    pub transport: Option<Arc<dyn BootstrapTransport>>,
    certs: BTreeMap<String, BootstrapCert>,
    node_config: Option<TaskDependentResource>,
}

impl BootstrapClient {
    pub fn new(name: &str, cert_names: &[&str], transport: Arc<dyn BootstrapTransport>) -> Self {
        let task = format!("{}/{name}", Self::KIND);
        Self {
            name: name.to_string(),
            transport: Some(transport),
            certs: cert_names
                .iter()
                .map(|cert| {
                    let outputs = BootstrapCert {
                        key: TaskDependentResource::new(task.as_str()),
                        cert: TaskDependentResource::new(task.as_str()),
                    };
                    ((*cert).to_string(), outputs)
                })
                .collect(),
            node_config: Some(TaskDependentResource::new(task.as_str())),
            ..Default::default()
        }
    }

    fn outputs(&self, cert: &str) -> Result<&BootstrapCert> {
        self.certs
            .get(cert)
            .with_context(|| format!("bootstrap client {} does not request certificate {cert}", self.name))
    }

    pub fn cert(&self, name: &str) -> Result<ResourceRef> {
        Ok(self.outputs(name)?.cert.shared())
    }

    pub fn key(&self, name: &str) -> Result<ResourceRef> {
        Ok(self.outputs(name)?.key.shared())
    }

    /// Node configuration returned by the controller.
    pub fn node_config(&self) -> Result<ResourceRef> {
        self.node_config
            .as_ref()
            .map(TaskDependentResource::shared)
            .with_context(|| format!("bootstrap client {} has no node config output", self.name))
    }

    fn bootstrap(&self, ctx: &Context<'_>) -> Result<()> {
        let Some(transport) = &self.transport else {
            bail!("bootstrap client {} has no transport", self.name);
        };

        let mut request = BootstrapRequest {
            api_version: BOOTSTRAP_API_VERSION.to_string(),
            keypair_ids: self.keypair_ids.clone(),
            include_node_config: self.include_node_config,
            ..Default::default()
        };
        let mut keys = BTreeMap::new();
        for name in self.certs.keys() {
            let key = PrivateKey::generate().with_context(|| format!("error generating key for {name}"))?;
            request.certs.insert(name.clone(), key.public_key_pem()?);
            keys.insert(name.clone(), key);
        }

        let _responder = match &self.challenge_host {
            Some(host) => {
                let secret = new_challenge_secret();
                request.challenge = Some(Challenge {
                    endpoint: format!("{host}:{CHALLENGE_PORT}"),
                    secret_hash: sha256_hex(secret.as_bytes()),
                });
                let listen = format!("0.0.0.0:{CHALLENGE_PORT}");
                Some(ChallengeResponder::start(&listen, secret, ctx.cancel().clone())?)
            }
            None => None,
        };

        let response = transport.query(&request)?;
        for (name, outputs) in &self.certs {
            let Some(cert) = response.certs.get(name) else {
                bail!("bootstrap response did not include certificate {name}");
            };
            let Some(key) = keys.get(name) else {
                bail!("no key generated for certificate {name}");
            };
            outputs.key.set(Arc::new(StringResource::new(key.to_pem()?)));
            outputs.cert.set(Arc::new(StringResource::new(cert.clone())));
        }
        if let (Some(config), Some(output)) = (response.node_config, &self.node_config) {
            output.set(Arc::new(StringResource::new(config)));
        }
        log::info!("bootstrap client {} received {} certificates", self.name, self.certs.len());
        Ok(())
    }
}

impl Delta for BootstrapClient {
    const KIND: &'static str = "BootstrapClient";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            Field::new("Certs", self.certs.keys().cloned().collect::<Vec<_>>()),
            Field::new("KeypairIds", self.keypair_ids.clone()),
        ]
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        let mut deps = Vec::new();
        for service in &self.after_services {
            super::push_if_present(&mut deps, TaskKey::new(Service::KIND, service.as_str()), tasks);
        }
        Some(deps)
    }

    /// Certificates are requested on every run.
    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        Ok(None)
    }

    fn render_local(
        &self,
        _target: &LocalTarget,
        ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        self.bootstrap(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::tests::RecordingTransport;
    use crate::tasks::testing::context;
    use converge::{CloudInitTarget, Services, Target};

    #[test]
    fn test_bootstrap_populates_resources() {
        let transport = Arc::new(RecordingTransport::default());
        let mut task = BootstrapClient::new("node", &["kubelet", "kube-proxy"], transport.clone());
        task.keypair_ids.insert("ca".into(), "123".into());

        let target = Target::Local(LocalTarget::new("/tmp", "/tmp"));
        let tasks = TaskMap::default();
        let services = Services::default();
        let ctx = context(&target, &tasks, &services);

        let cert = task.cert("kubelet").unwrap();
        assert!(!cert.is_ready());
        assert_eq!(cert.task_dependency().as_deref(), Some("BootstrapClient/node"));

        task.bootstrap(&ctx).unwrap();
        assert_eq!(assets::as_string(cert.as_ref()).unwrap(), "CERT FOR kubelet");
        assert!(assets::as_string(task.key("kube-proxy").unwrap().as_ref()).unwrap().contains("PRIVATE KEY"));

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.api_version, BOOTSTRAP_API_VERSION);
        assert!(request.certs["kubelet"].contains("PUBLIC KEY"));
        assert_eq!(request.keypair_ids["ca"], "123");
        assert!(request.challenge.is_none());
    }

    #[test]
    fn test_unknown_cert_is_an_error() {
        let task = BootstrapClient::new("node", &["kubelet"], Arc::new(RecordingTransport::default()));
        assert!(task.cert("etcd").is_err());
    }

    #[test]
    fn test_depends_on_listed_services() {
        let mut tasks = TaskMap::default();
        tasks.insert(Service::new("protokube.service", "[Unit]\n")).unwrap();
        tasks.insert(Service::new("kubelet.service", "[Unit]\n")).unwrap();
        let mut task = BootstrapClient::new("node", &["kubelet"], Arc::new(RecordingTransport::default()));
        task.after_services = vec!["protokube.service".into()];
        assert_eq!(task.dependencies(&tasks).unwrap(), vec![TaskKey::new("Service", "protokube.service")]);
    }

    #[test]
    fn test_cloud_init_is_unmapped() {
        let task = BootstrapClient::new("node", &["kubelet"], Arc::new(RecordingTransport::default()));
        let target = Target::DryRun(converge::DryRunTarget::new());
        let tasks = TaskMap::default();
        let services = Services::default();
        let ctx = context(&target, &tasks, &services);
        let err = task
            .render_cloud_init(&CloudInitTarget::new(), &ctx, None, &Changes::default())
            .unwrap_err();
        assert!(err.to_string().contains("BootstrapClient"));
    }
}
