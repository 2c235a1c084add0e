//! Keystore backed by keyset objects stored in the cluster API.
//!
//! The API client itself is an external collaborator behind [`KeysetApi`].

use crate::error::Result;
use crate::keyset::{Keyset, KeysetDocument};
use crate::store::{CA_KEYSET, Keystore, KeystoreReader, SshCredential, find_with_legacy};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// SSH credential object as stored in the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCredentialDocument {
    pub name: String,
    pub public_key: String,
}

/// Minimal client surface for keyset objects.
pub trait KeysetApi: Send + Sync {
    fn get_keyset(&self, name: &str) -> Result<Option<KeysetDocument>>;
    fn put_keyset(&self, document: &KeysetDocument) -> Result<()>;
    fn list_keysets(&self) -> Result<Vec<KeysetDocument>>;
    fn list_ssh_credentials(&self) -> Result<Vec<SshCredentialDocument>>;
    fn put_ssh_credential(&self, document: &SshCredentialDocument) -> Result<()>;
    fn delete_ssh_credential(&self, name: &str, public_key: &str) -> Result<()>;
}

/// Keystore that reads and writes through a [`KeysetApi`].
pub struct ApiServerKeystore<C> {
    client: C,
    ca_cache: Mutex<Option<Keyset>>,
}

impl<C: KeysetApi> ApiServerKeystore<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            ca_cache: Mutex::new(None),
        }
    }

    fn fetch(&self, name: &str) -> Result<Option<Keyset>> {
        self.client
            .get_keyset(name)?
            .map(|doc| Keyset::from_document(&doc))
            .transpose()
    }
}

impl<C: KeysetApi> KeystoreReader for ApiServerKeystore<C> {
    fn find_keyset(&self, name: &str) -> Result<Option<Keyset>> {
        find_with_legacy(name, |n| {
            if n != CA_KEYSET {
                return self.fetch(n);
            }
            let mut cache = self.ca_cache.lock().unwrap_or_else(|e| e.into_inner());
            if cache.is_none() {
                *cache = self.fetch(n)?;
            }
            Ok(cache.clone())
        })
    }
}

impl<C: KeysetApi> Keystore for ApiServerKeystore<C> {
    fn store_keyset(&self, name: &str, keyset: &Keyset) -> Result<()> {
        keyset.validate(name)?;
        let mut cache = self.ca_cache.lock().unwrap_or_else(|e| e.into_inner());
        self.client.put_keyset(&keyset.to_document(name)?)?;
        if name == CA_KEYSET {
            *cache = Some(keyset.clone());
        }
        Ok(())
    }

    fn list_keysets(&self) -> Result<BTreeMap<String, Keyset>> {
        self.client
            .list_keysets()?
            .iter()
            .map(|doc| Ok((doc.metadata.name.clone(), Keyset::from_document(doc)?)))
            .collect()
    }

    fn add_ssh_public_key(&self, name: &str, public_key: &str) -> Result<String> {
        let credential = SshCredential::new(name, public_key)?;
        self.client.put_ssh_credential(&SshCredentialDocument {
            name: name.to_string(),
            public_key: credential.public_key,
        })?;
        Ok(credential.id)
    }

    fn ssh_credentials(&self) -> Result<Vec<SshCredential>> {
        self.client
            .list_ssh_credentials()?
            .iter()
            .map(|doc| SshCredential::new(&doc.name, &doc.public_key))
            .collect()
    }

    fn delete_ssh_credential(&self, name: &str, id: &str) -> Result<()> {
        for credential in self.ssh_credentials()? {
            if credential.name == name && credential.id == id {
                return self
                    .client
                    .delete_ssh_credential(name, &credential.public_key);
            }
        }
        Err(crate::error::Error::Item(format!(
            "no SSH credential {id} for {name}"
        )))
    }
}
