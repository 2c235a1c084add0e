//! Certificates, RSA private keys, serial numbers and signing.

use crate::error::{Error, Result};
use num_bigint::BigUint;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    string::Ia5String,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// RSA modulus size for generated keys.
pub const RSA_KEY_BITS: usize = 2048;

/// Default certificate lifetime.
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// How far certificates are backdated to tolerate clock skew.
const BACKDATE: Duration = Duration::from_secs(48 * 60 * 60);

/// Build a serial from a timestamp: `(nanos << 32) | random32`.
///
/// Later timestamps always produce larger serials, which is what keyset
/// item ordering relies on.
pub fn pki_serial(unix_nanos: u128) -> BigUint {
    let random: u32 = rand::random();
    (BigUint::from(unix_nanos) << 32u32) | BigUint::from(random)
}

/// Serial for the current instant.
pub fn now_serial() -> BigUint {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    pki_serial(nanos)
}

/// A parsed X.509 certificate. Immutable once constructed.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    pem: String,
    der: Vec<u8>,
    serial: BigUint,
    common_name: String,
    not_after: i64,
    is_ca: bool,
}

impl Certificate {
    /// Parse the first `CERTIFICATE` block of a PEM document.
    pub fn from_pem(data: &str) -> Result<Self> {
        let blocks = pem::parse_many(data.as_bytes())
            .map_err(|e| Error::InvalidCertificate(format!("bad PEM: {e}")))?;
        let block = blocks
            .into_iter()
            .find(|b| b.tag() == "CERTIFICATE")
            .ok_or_else(|| Error::InvalidCertificate("no CERTIFICATE block".to_string()))?;
        Self::from_der(block.contents())
    }

    /// Parse a DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        let serial = BigUint::from_bytes_be(cert.tbs_certificate.raw_serial());
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();
        let not_after = cert.validity().not_after.timestamp();
        let is_ca = cert.is_ca();
        let pem = pem::encode_config(
            &pem::Pem::new("CERTIFICATE", der.to_vec()),
            pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        );
        Ok(Self {
            pem,
            der: der.to_vec(),
            serial,
            common_name,
            not_after,
            is_ca,
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn serial(&self) -> &BigUint {
        &self.serial
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Expiry as a unix timestamp.
    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("common_name", &self.common_name)
            .field("serial", &self.serial.to_string())
            .field("is_ca", &self.is_ca)
            .finish_non_exhaustive()
    }
}

/// An RSA private key.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    key: RsaPrivateKey,
}

impl PrivateKey {
    /// Generate a fresh RSA-2048 key.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| Error::InvalidKey(format!("key generation failed: {e}")))?;
        Ok(Self { key })
    }

    /// Parse a PKCS1 (`RSA PRIVATE KEY`) or PKCS8 (`PRIVATE KEY`) PEM block.
    pub fn from_pem(data: &str) -> Result<Self> {
        let block = pem::parse(data.as_bytes()).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let key = match block.tag() {
            "RSA PRIVATE KEY" => RsaPrivateKey::from_pkcs1_der(block.contents())
                .map_err(|e| Error::InvalidKey(e.to_string()))?,
            "PRIVATE KEY" => RsaPrivateKey::from_pkcs8_der(block.contents())
                .map_err(|e| Error::InvalidKey(e.to_string()))?,
            other => {
                return Err(Error::InvalidKey(format!(
                    "unsupported PEM block type {other:?}"
                )));
            }
        };
        Ok(Self { key })
    }

    /// PKCS1 PEM, the format keys are persisted in.
    pub fn to_pem(&self) -> Result<String> {
        self.key
            .to_pkcs1_pem(LineEnding::LF)
            .map(|s| s.to_string())
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }

    /// SubjectPublicKeyInfo PEM of the public half.
    pub fn public_key_pem(&self) -> Result<String> {
        RsaPublicKey::from(&self.key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }

    fn to_key_pair(&self) -> Result<KeyPair> {
        let pkcs8 = self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        KeyPair::from_pem(&pkcs8).map_err(|e| Error::InvalidKey(e.to_string()))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// What a certificate will be used for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CertificateUsage {
    #[default]
    Server,
    Client,
    Ca,
}

/// Parameters for a new certificate.
#[derive(Debug, Clone, Default)]
pub struct CertificateRequest {
    pub common_name: String,
    /// Organizations; only the first is encoded in the subject.
    pub organization: Vec<String>,
    /// DNS names and IP addresses.
    pub alternate_names: Vec<String>,
    pub usage: CertificateUsage,
    /// Lifetime from now; defaults to ten years.
    pub validity: Option<Duration>,
    /// Serial; a random 128-bit value when unset.
    pub serial: Option<BigUint>,
}

impl CertificateRequest {
    /// A self-signed CA request for the given common name.
    pub fn ca(common_name: &str) -> Self {
        Self {
            common_name: common_name.to_string(),
            usage: CertificateUsage::Ca,
            ..Self::default()
        }
    }
}

/// Sign a new certificate.
///
/// A fresh key is generated when `key` is `None`. Without a `signer` the
/// certificate is self-signed.
pub fn sign_new_certificate(
    request: &CertificateRequest,
    key: Option<PrivateKey>,
    signer: Option<(&Certificate, &PrivateKey)>,
) -> Result<(Certificate, PrivateKey)> {
    if request.common_name.is_empty() {
        return Err(Error::Signing("common name is required".to_string()));
    }
    let key = match key {
        Some(key) => key,
        None => PrivateKey::generate()?,
    };
    let key_pair = key.to_key_pair()?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(request.common_name.clone()),
    );
    if let Some(org) = request.organization.first() {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
    }
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    let validity = request.validity.unwrap_or(DEFAULT_VALIDITY);
    params.not_before = now - time::Duration::seconds(BACKDATE.as_secs() as i64);
    params.not_after = now + time::Duration::seconds(validity.as_secs() as i64);

    let serial = request
        .serial
        .clone()
        .unwrap_or_else(|| BigUint::from(rand::random::<u128>() | 1));
    params.serial_number = Some(SerialNumber::from_slice(&serial.to_bytes_be()));

    match request.usage {
        CertificateUsage::Ca => {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        }
        CertificateUsage::Server => {
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        }
        CertificateUsage::Client => {
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        }
    }

    params.subject_alt_names = request
        .alternate_names
        .iter()
        .map(|san| {
            if let Ok(ip) = san.parse::<IpAddr>() {
                Ok(SanType::IpAddress(ip))
            } else {
                Ia5String::try_from(san.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| Error::Signing(format!("invalid DNS name {san:?}: {e}")))
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let signed = match signer {
        None => params.self_signed(&key_pair),
        Some((ca_cert, ca_key)) => {
            let ca_key_pair = ca_key.to_key_pair()?;
            let issuer = Issuer::from_ca_cert_pem(ca_cert.pem(), &ca_key_pair)
                .map_err(|e| Error::Signing(format!("failed to load issuer: {e}")))?;
            params.signed_by(&key_pair, &issuer)
        }
    }
    .map_err(|e| Error::Signing(e.to_string()))?;

    // Round-trip so callers only ever see certificates we can parse.
    let certificate = Certificate::from_pem(&signed.pem())?;
    Ok((certificate, key))
}
