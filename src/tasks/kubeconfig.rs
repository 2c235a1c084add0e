use super::resource_dependency;
use anyhow::{Context as _, Result};
use assets::{ResourceRef, StringResource, TaskDependentResource, as_bytes};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use converge::{Changes, CloudInitTarget, Context, Delta, Field, LocalTarget, TaskKey, TaskMap};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<Named<ClusterEntry>>,
    users: Vec<Named<UserEntry>>,
    contexts: Vec<Named<ContextEntry>>,
    #[serde(rename = "current-context")]
    current_context: String,
}

#[derive(Debug, Serialize)]
struct Named<T> {
    name: String,
    #[serde(flatten)]
    inner: T,
}

#[derive(Debug, Serialize)]
struct ClusterEntry {
    cluster: ClusterData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterData {
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_authority_data: Option<String>,
    server: String,
}

#[derive(Debug, Serialize)]
struct UserEntry {
    user: UserData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct UserData {
    #[serde(skip_serializing_if = "Option::is_none")]
    client_certificate_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_key_data: Option<String>,
}

#[derive(Debug, Serialize)]
struct ContextEntry {
    context: ContextData,
}

#[derive(Debug, Serialize)]
struct ContextData {
    cluster: String,
    user: String,
}

/// A kubeconfig built from certificate resources.
///
/// The rendered document is published through [`KubeConfig::output`] for
/// a `File` task to write.
#[derive(Debug, Clone, Default)]
pub struct KubeConfig {
    pub name: String,
    pub server: String,
    pub ca: Option<ResourceRef>,
    pub cert: Option<ResourceRef>,
    pub key: Option<ResourceRef>,
    output: Option<TaskDependentResource>,
}

impl KubeConfig {
    pub fn new(name: &str, server: &str) -> Self {
        Self {
            name: name.to_string(),
            server: server.to_string(),
            output: Some(TaskDependentResource::new(format!("{}/{name}", Self::KIND))),
            ..Default::default()
        }
    }

    pub fn output(&self) -> Result<ResourceRef> {
        self.output
            .as_ref()
            .map(TaskDependentResource::shared)
            .with_context(|| format!("kubeconfig {} was not constructed with an output", self.name))
    }

    fn encoded(resource: Option<&ResourceRef>) -> Result<Option<String>> {
        resource
            .map(|r| as_bytes(r.as_ref()).map(|data| STANDARD.encode(data)))
            .transpose()
            .map_err(Into::into)
    }

    /// The kubeconfig YAML.
    pub fn build(&self) -> Result<String> {
        let cluster = "local".to_string();
        let user = self.name.clone();
        let context = format!("{}-context", self.name);
        let document = Document {
            api_version: "v1",
            kind: "Config",
            clusters: vec![Named {
                name: cluster.clone(),
                inner: ClusterEntry {
                    cluster: ClusterData {
                        certificate_authority_data: Self::encoded(self.ca.as_ref())?,
                        server: self.server.clone(),
                    },
                },
            }],
            users: vec![Named {
                name: user.clone(),
                inner: UserEntry {
                    user: UserData {
                        client_certificate_data: Self::encoded(self.cert.as_ref())?,
                        client_key_data: Self::encoded(self.key.as_ref())?,
                    },
                },
            }],
            contexts: vec![Named {
                name: context.clone(),
                inner: ContextEntry {
                    context: ContextData { cluster, user },
                },
            }],
            current_context: context,
        };
        Ok(serde_yaml::to_string(&document)?)
    }

    fn publish(&self) -> Result<()> {
        let yaml = self
            .build()
            .with_context(|| format!("error building kubeconfig {}", self.name))?;
        if let Some(output) = &self.output {
            output.set(Arc::new(StringResource::new(yaml)));
        }
        Ok(())
    }
}

impl Delta for KubeConfig {
    const KIND: &'static str = "KubeConfig";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            Field::new("Server", self.server.as_str()),
            Field::opt("CA", self.ca.clone()),
            Field::opt("Cert", self.cert.clone()),
            Field::opt("Key", self.key.clone()),
        ]
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        let mut deps: Vec<TaskKey> = [&self.ca, &self.cert, &self.key]
            .into_iter()
            .filter_map(|r| resource_dependency(r.as_ref(), tasks))
            .collect();
        deps.sort();
        deps.dedup();
        Some(deps)
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        Ok(None)
    }

    fn render_local(
        &self,
        _target: &LocalTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        self.publish()
    }

    fn render_cloud_init(
        &self,
        _target: &CloudInitTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        self.publish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::IssueCert;
    use keystore::CertificateUsage;

    #[test]
    fn test_build_yaml() {
        let mut config = KubeConfig::new("kubelet", "https://api.internal:443");
        config.ca = Some(StringResource::shared("CA"));
        config.cert = Some(StringResource::shared("CERT"));
        config.key = Some(StringResource::shared("KEY"));

        let yaml = config.build().unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["apiVersion"], "v1");
        assert_eq!(parsed["kind"], "Config");
        assert_eq!(parsed["current-context"], "kubelet-context");
        assert_eq!(parsed["clusters"][0]["cluster"]["server"], "https://api.internal:443");
        assert_eq!(
            parsed["clusters"][0]["cluster"]["certificate-authority-data"],
            STANDARD.encode("CA")
        );
        assert_eq!(parsed["users"][0]["user"]["client-key-data"], STANDARD.encode("KEY"));
        assert_eq!(parsed["contexts"][0]["context"]["user"], "kubelet");
    }

    #[test]
    fn test_output_published_on_render() {
        let config = KubeConfig::new("proxy", "https://api.internal");
        let output = config.output().unwrap();
        assert!(!output.is_ready());
        config.publish().unwrap();
        assert!(assets::as_string(output.as_ref()).unwrap().contains("proxy-context"));
    }

    #[test]
    fn test_depends_on_cert_producer() {
        let cert = IssueCert::new("kubelet", "ca", CertificateUsage::Client, "kubelet");
        let mut config = KubeConfig::new("kubelet", "https://api.internal");
        config.cert = Some(cert.cert().unwrap());
        config.key = Some(cert.key().unwrap());
        config.ca = Some(cert.ca().unwrap());

        let mut tasks = TaskMap::default();
        tasks.insert(cert).unwrap();
        assert_eq!(config.dependencies(&tasks).unwrap(), vec![TaskKey::new("IssueCert", "kubelet")]);
    }
}
