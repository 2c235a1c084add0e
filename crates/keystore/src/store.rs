//! Keystore interfaces shared by every backend.

use crate::backend::FsKeystore;
use crate::error::{Error, Result};
use crate::keyset::Keyset;
use crate::pki::{Certificate, CertificateRequest, PrivateKey, sign_new_certificate};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::path::Path;

/// Name of the cluster CA keyset.
pub const CA_KEYSET: &str = "ca";

/// Older names keysets used to be stored under, tried once on a miss.
const LEGACY_KEYSET_NAMES: &[(&str, &str)] =
    &[("service-account", "master"), ("kubernetes-ca", CA_KEYSET)];

/// The legacy name for a keyset, if it has one.
pub fn legacy_keyset_name(name: &str) -> Option<&'static str> {
    LEGACY_KEYSET_NAMES
        .iter()
        .find(|(current, _)| *current == name)
        .map(|(_, legacy)| *legacy)
}

/// Look a keyset up by name, falling back to its legacy name.
pub(crate) fn find_with_legacy(
    name: &str,
    mut lookup: impl FnMut(&str) -> Result<Option<Keyset>>,
) -> Result<Option<Keyset>> {
    if let Some(keyset) = lookup(name)? {
        return Ok(Some(keyset));
    }
    let Some(legacy) = legacy_keyset_name(name) else {
        return Ok(None);
    };
    log::debug!("keyset {name:?} not found, trying legacy name {legacy:?}");
    Ok(lookup(legacy)?.map(|mut keyset| {
        keyset.legacy_format = true;
        keyset
    }))
}

/// Read access to keysets.
pub trait KeystoreReader: Send + Sync {
    /// Find a keyset by name.
    fn find_keyset(&self, name: &str) -> Result<Option<Keyset>>;

    /// The primary certificate and key of a keyset.
    fn find_primary_keypair(&self, name: &str) -> Result<Option<(Certificate, PrivateKey)>> {
        let Some(keyset) = self.find_keyset(name)? else {
            return Ok(None);
        };
        let Some(primary) = keyset.primary() else {
            return Ok(None);
        };
        match &primary.private_key {
            Some(key) => Ok(Some((primary.certificate.clone(), key.clone()))),
            None => Err(Error::invalid_keyset(name, "primary item has no private key")),
        }
    }
}

/// An SSH public key registered for a user name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCredential {
    pub name: String,
    /// Colon-separated MD5 fingerprint.
    pub id: String,
    pub public_key: String,
}

impl SshCredential {
    pub fn new(name: &str, public_key: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            id: ssh_fingerprint(public_key)?,
            public_key: public_key.trim().to_string(),
        })
    }
}

/// MD5 fingerprint of an OpenSSH public key line, as `aa:bb:...`.
pub fn ssh_fingerprint(public_key: &str) -> Result<String> {
    let data = public_key
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::InvalidSshKey("expected '<type> <base64> [comment]'".to_string()))?;
    let decoded = STANDARD
        .decode(data)
        .map_err(|e| Error::InvalidSshKey(e.to_string()))?;
    let digest = Md5::digest(&decoded);
    Ok(digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

/// Full keystore with mutation.
///
/// Read-only backends implement this too and fail every write with
/// [`Error::ReadOnly`].
pub trait Keystore: KeystoreReader {
    fn store_keyset(&self, name: &str, keyset: &Keyset) -> Result<()>;

    /// Every keyset by name.
    fn list_keysets(&self) -> Result<BTreeMap<String, Keyset>>;

    /// Register an SSH public key, returning its fingerprint.
    fn add_ssh_public_key(&self, name: &str, public_key: &str) -> Result<String>;

    fn ssh_credentials(&self) -> Result<Vec<SshCredential>>;

    fn delete_ssh_credential(&self, name: &str, id: &str) -> Result<()>;

    /// Copy every keyset and SSH credential into a filesystem keystore.
    fn mirror_to(&self, path: &Path) -> Result<()> {
        let dest = FsKeystore::new(path);
        for (name, keyset) in self.list_keysets()? {
            log::debug!("mirroring keyset {name} to {}", path.display());
            dest.store_keyset(&name, &keyset)?;
        }
        for credential in self.ssh_credentials()? {
            dest.add_ssh_public_key(&credential.name, &credential.public_key)?;
        }
        Ok(())
    }

    /// Create a self-signed CA keyset unless one already exists.
    fn ensure_ca(&self, name: &str) -> Result<Keyset> {
        if let Some(existing) = self.find_keyset(name)? {
            return Ok(existing);
        }
        log::info!("creating CA keyset {name}");
        let (cert, key) = sign_new_certificate(&CertificateRequest::ca("kubernetes"), None, None)?;
        let keyset = Keyset::new(cert, key)?;
        self.store_keyset(name, &keyset)?;
        Ok(keyset)
    }
}

/// Opaque secret bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub data: Vec<u8>,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Read access to secrets.
pub trait SecretReader: Send + Sync {
    fn find_secret(&self, id: &str) -> Result<Option<Secret>>;

    /// Like [`SecretReader::find_secret`] but missing is an error.
    fn secret(&self, id: &str) -> Result<Secret> {
        self.find_secret(id)?
            .ok_or_else(|| Error::SecretNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_names_single_hop() {
        assert_eq!(legacy_keyset_name("service-account"), Some("master"));
        assert_eq!(legacy_keyset_name("kubernetes-ca"), Some("ca"));
        assert_eq!(legacy_keyset_name("ca"), None);
    }

    #[test]
    fn test_find_with_legacy_marks_keyset() {
        let mut asked = Vec::new();
        let found = find_with_legacy("service-account", |name| {
            asked.push(name.to_string());
            Ok((name == "master").then(Keyset::default))
        })
        .unwrap()
        .unwrap();
        assert!(found.legacy_format);
        assert_eq!(asked, vec!["service-account", "master"]);

        let missing = find_with_legacy("etcd", |_| Ok(None)).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_ssh_fingerprint() {
        let key = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQAB user@host";
        let fp = ssh_fingerprint(key).unwrap();
        assert_eq!(fp.split(':').count(), 16);
        assert!(ssh_fingerprint("garbage").is_err());
    }
}
