//! Read-only keystore holding keysets delivered by the config server.

use crate::error::{Error, Result};
use crate::keyset::Keyset;
use crate::store::{Keystore, KeystoreReader, SshCredential, find_with_legacy};
use std::collections::BTreeMap;

/// Keysets handed to the node at bootstrap; writes are rejected.
#[derive(Debug, Default)]
pub struct ConfigServerKeystore {
    keysets: BTreeMap<String, Keyset>,
}

impl ConfigServerKeystore {
    pub fn new(keysets: BTreeMap<String, Keyset>) -> Self {
        Self { keysets }
    }

    /// Build from a set of YAML keyset documents.
    pub fn from_yaml_documents<'a>(documents: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut keysets = BTreeMap::new();
        for document in documents {
            let (name, keyset) = Keyset::from_yaml(document)?;
            keysets.insert(name, keyset);
        }
        Ok(Self { keysets })
    }
}

impl KeystoreReader for ConfigServerKeystore {
    fn find_keyset(&self, name: &str) -> Result<Option<Keyset>> {
        find_with_legacy(name, |n| Ok(self.keysets.get(n).cloned()))
    }
}

impl Keystore for ConfigServerKeystore {
    fn store_keyset(&self, name: &str, _keyset: &Keyset) -> Result<()> {
        Err(Error::ReadOnly(format!("store keyset {name:?}")))
    }

    fn list_keysets(&self) -> Result<BTreeMap<String, Keyset>> {
        Ok(self.keysets.clone())
    }

    fn add_ssh_public_key(&self, name: &str, _public_key: &str) -> Result<String> {
        Err(Error::ReadOnly(format!("add SSH public key for {name:?}")))
    }

    fn ssh_credentials(&self) -> Result<Vec<SshCredential>> {
        Ok(Vec::new())
    }

    fn delete_ssh_credential(&self, name: &str, _id: &str) -> Result<()> {
        Err(Error::ReadOnly(format!("delete SSH credential for {name:?}")))
    }
}
