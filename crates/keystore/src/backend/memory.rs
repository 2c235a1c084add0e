//! In-memory keystore, used for tests and single-pass generation.

use crate::error::{Error, Result};
use crate::keyset::Keyset;
use crate::store::{Keystore, KeystoreReader, Secret, SecretReader, SshCredential, find_with_legacy};
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryKeystore {
    keysets: RwLock<BTreeMap<String, Keyset>>,
    ssh: RwLock<Vec<SshCredential>>,
    secrets: RwLock<BTreeMap<String, Secret>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_secret(&self, id: &str, data: impl Into<Vec<u8>>) {
        self.secrets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), Secret { data: data.into() });
    }
}

impl KeystoreReader for MemoryKeystore {
    fn find_keyset(&self, name: &str) -> Result<Option<Keyset>> {
        let keysets = self.keysets.read().unwrap_or_else(|e| e.into_inner());
        find_with_legacy(name, |n| Ok(keysets.get(n).cloned()))
    }
}

impl Keystore for MemoryKeystore {
    fn store_keyset(&self, name: &str, keyset: &Keyset) -> Result<()> {
        keyset.validate(name)?;
        self.keysets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), keyset.clone());
        Ok(())
    }

    fn list_keysets(&self) -> Result<BTreeMap<String, Keyset>> {
        Ok(self
            .keysets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn add_ssh_public_key(&self, name: &str, public_key: &str) -> Result<String> {
        let credential = SshCredential::new(name, public_key)?;
        let id = credential.id.clone();
        let mut ssh = self.ssh.write().unwrap_or_else(|e| e.into_inner());
        ssh.retain(|c| !(c.name == name && c.id == id));
        ssh.push(credential);
        Ok(id)
    }

    fn ssh_credentials(&self) -> Result<Vec<SshCredential>> {
        Ok(self.ssh.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn delete_ssh_credential(&self, name: &str, id: &str) -> Result<()> {
        let mut ssh = self.ssh.write().unwrap_or_else(|e| e.into_inner());
        let before = ssh.len();
        ssh.retain(|c| !(c.name == name && c.id == id));
        if ssh.len() == before {
            return Err(Error::Item(format!("no SSH credential {id} for {name}")));
        }
        Ok(())
    }
}

impl SecretReader for MemoryKeystore {
    fn find_secret(&self, id: &str) -> Result<Option<Secret>> {
        Ok(self
            .secrets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQAB admin@example";

    #[test]
    fn test_ssh_credentials_add_and_delete() {
        let store = MemoryKeystore::new();
        let id = store.add_ssh_public_key("admin", KEY).unwrap();
        assert_eq!(store.ssh_credentials().unwrap().len(), 1);
        // Re-adding the same key does not duplicate it.
        store.add_ssh_public_key("admin", KEY).unwrap();
        assert_eq!(store.ssh_credentials().unwrap().len(), 1);

        store.delete_ssh_credential("admin", &id).unwrap();
        assert!(store.ssh_credentials().unwrap().is_empty());
        assert!(store.delete_ssh_credential("admin", &id).is_err());
    }

    #[test]
    fn test_secrets() {
        let store = MemoryKeystore::new();
        assert!(store.find_secret("token").unwrap().is_none());
        assert!(store.secret("token").is_err());
        store.store_secret("token", "abc");
        assert_eq!(store.secret("token").unwrap().data, b"abc");
    }

    #[test]
    fn test_missing_keyset() {
        let store = MemoryKeystore::new();
        assert!(store.find_keyset("ca").unwrap().is_none());
        assert!(store.find_primary_keypair("ca").unwrap().is_none());
        assert!(store.store_keyset("ca", &Keyset::default()).is_err());
    }
}
