use anyhow::{Context as _, Result};
use assets::{ResourceRef, StringResource, TaskDependentResource};
use converge::{Changes, CloudInitTarget, Context, Delta, Field, LocalTarget};
use keystore::{CertificateRequest, CertificateUsage, Error as KeystoreError, KeystoreReader};
use std::sync::Arc;
use std::time::Duration;

const BASE_VALIDITY_HOURS: u64 = 455 * 24;
const VALIDITY_SPREAD_HOURS: u64 = 30 * 24;

/// The certificate, key and CA bundle an [`IssueCert`] produces.
#[derive(Debug, Clone)]
pub struct CertOutputs {
    pub cert: TaskDependentResource,
    pub key: TaskDependentResource,
    pub ca: TaskDependentResource,
}

impl CertOutputs {
    fn new(task: &str) -> Self {
        Self {
            cert: TaskDependentResource::new(task),
            key: TaskDependentResource::new(task),
            ca: TaskDependentResource::new(task),
        }
    }
}

/// Sign a fresh certificate with a keyset from the keystore.
#[derive(Debug, Clone, Default)]
pub struct IssueCert {
    pub name: String,
    /// Keyset whose primary item signs the certificate.
    pub signer: String,
    pub usage: Option<CertificateUsage>,
    pub common_name: String,
    pub organization: Vec<String>,
    pub alternate_names: Vec<String>,
    outputs: Option<CertOutputs>,
}

impl IssueCert {
    pub fn new(name: &str, signer: &str, usage: CertificateUsage, common_name: &str) -> Self {
        Self {
            name: name.to_string(),
            signer: signer.to_string(),
            usage: Some(usage),
            common_name: common_name.to_string(),
            outputs: Some(CertOutputs::new(&format!("{}/{name}", Self::KIND))),
            ..Default::default()
        }
    }

    fn outputs(&self) -> Result<&CertOutputs> {
        self.outputs
            .as_ref()
            .with_context(|| format!("certificate task {} was not constructed with outputs", self.name))
    }

    pub fn cert(&self) -> Result<ResourceRef> {
        Ok(self.outputs()?.cert.shared())
    }

    pub fn key(&self) -> Result<ResourceRef> {
        Ok(self.outputs()?.key.shared())
    }

    pub fn ca(&self) -> Result<ResourceRef> {
        Ok(self.outputs()?.ca.shared())
    }

    fn usage_name(&self) -> Option<&'static str> {
        self.usage.map(|u| match u {
            CertificateUsage::Server => "server",
            CertificateUsage::Client => "client",
            CertificateUsage::Ca => "ca",
        })
    }

    fn issue(&self, ctx: &Context<'_>) -> Result<()> {
        let outputs = self.outputs()?;
        let keystore = ctx.keystore()?;
        let (signer_cert, signer_key) = keystore
            .find_primary_keypair(&self.signer)?
            .ok_or_else(|| KeystoreError::KeysetNotFound(self.signer.clone()))?;
        let bundle = keystore
            .find_keyset(&self.signer)?
            .map(|k| k.ca_bundle_pem())
            .unwrap_or_else(|| signer_cert.pem().to_string());

        let hours = cert_validity_hours(&interface_addresses());
        let request = CertificateRequest {
            common_name: self.common_name.clone(),
            organization: self.organization.clone(),
            alternate_names: self.alternate_names.clone(),
            usage: self.usage.unwrap_or_default(),
            validity: Some(Duration::from_secs(hours * 3600)),
            serial: None,
        };
        log::info!("issuing certificate {} signed by {} valid for {hours}h", self.name, self.signer);
        let (cert, key) = keystore::sign_new_certificate(&request, None, Some((&signer_cert, &signer_key)))
            .with_context(|| format!("error signing certificate {}", self.name))?;

        outputs.cert.set(Arc::new(StringResource::new(cert.pem())));
        outputs.key.set(Arc::new(StringResource::new(key.to_pem()?)));
        outputs.ca.set(Arc::new(StringResource::new(bundle)));
        Ok(())
    }
}

/// 32-bit FNV-1.
pub fn fnv1_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= u32::from(*byte);
    }
    hash
}

/// Certificate lifetime for a node with the given `ip/prefix` addresses.
///
/// Nodes spread over a month so their certificates do not all expire at
/// once, while certificates on one node expire together.
pub fn cert_validity_hours(addresses: &[String]) -> u64 {
    let mut sorted = addresses.to_vec();
    sorted.sort();
    let spread = u64::from(fnv1_32(sorted.concat().as_bytes())) % VALIDITY_SPREAD_HOURS;
    BASE_VALIDITY_HOURS + spread
}

/// Every interface address as `ip/prefix`.
fn interface_addresses() -> Vec<String> {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            log::warn!("unable to list interface addresses: {e}");
            return Vec::new();
        }
    };
    let mut out = Vec::new();
    for ifaddr in addrs {
        let (Some(address), Some(netmask)) = (ifaddr.address, ifaddr.netmask) else {
            continue;
        };
        if let (Some(ip), Some(mask)) = (address.as_sockaddr_in(), netmask.as_sockaddr_in()) {
            out.push(format!("{}/{}", ip.ip(), mask.ip().to_bits().count_ones()));
        } else if let (Some(ip), Some(mask)) = (address.as_sockaddr_in6(), netmask.as_sockaddr_in6()) {
            out.push(format!("{}/{}", ip.ip(), mask.ip().to_bits().count_ones()));
        }
    }
    out
}

impl Delta for IssueCert {
    const KIND: &'static str = "IssueCert";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            Field::new("Signer", self.signer.as_str()),
            Field::opt("Type", self.usage_name()),
            Field::new("CommonName", self.common_name.as_str()),
            Field::new("Organization", self.organization.clone()),
            Field::new("AlternateNames", self.alternate_names.clone()),
        ]
    }

    /// Certificates are issued on every run.
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
        self.issue(ctx)
    }

    fn render_cloud_init(
        &self,
        _target: &CloudInitTarget,
        ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        self.issue(ctx)
    }
}
