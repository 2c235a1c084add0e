//! Keystore backed by a directory tree.
//!
//! Layout under the base path:
//! - `pki/<name>/keyset.yaml`
//! - `ssh/public/<name>/<fingerprint-without-colons>`
//! - `secrets/<id>`

use crate::error::{Error, Result};
use crate::keyset::Keyset;
use crate::store::{
    CA_KEYSET, Keystore, KeystoreReader, Secret, SecretReader, SshCredential, find_with_legacy,
};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const KEYSET_FILE: &str = "keyset.yaml";

#[derive(Debug)]
pub struct FsKeystore {
    base: PathBuf,
    ca_cache: Mutex<Option<Keyset>>,
}

impl FsKeystore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            ca_cache: Mutex::new(None),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn keyset_path(&self, name: &str) -> PathBuf {
        self.base.join("pki").join(name).join(KEYSET_FILE)
    }

    fn ssh_dir(&self) -> PathBuf {
        self.base.join("ssh").join("public")
    }

    fn secret_path(&self, id: &str) -> PathBuf {
        self.base.join("secrets").join(id)
    }

    fn read_keyset(&self, name: &str) -> Result<Option<Keyset>> {
        let path = self.keyset_path(name);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path, e)),
        };
        let (_, keyset) = Keyset::from_yaml(&data)?;
        Ok(Some(keyset))
    }

    /// Store a secret, replacing any previous value.
    pub fn store_secret(&self, id: &str, data: &[u8]) -> Result<()> {
        write_atomic(&self.secret_path(id), data)
    }
}

impl KeystoreReader for FsKeystore {
    fn find_keyset(&self, name: &str) -> Result<Option<Keyset>> {
        if name == CA_KEYSET {
            let mut cache = self.ca_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.as_ref() {
                return Ok(Some(cached.clone()));
            }
            let found = self.read_keyset(name)?;
            cache.clone_from(&found);
            return Ok(found);
        }
        find_with_legacy(name, |n| {
            if n == CA_KEYSET {
                self.find_keyset(n)
            } else {
                self.read_keyset(n)
            }
        })
    }
}

impl Keystore for FsKeystore {
    fn store_keyset(&self, name: &str, keyset: &Keyset) -> Result<()> {
        keyset.validate(name)?;
        let yaml = keyset.to_yaml(name)?;
        // Hold the cache lock across the write so readers never see a
        // stale CA after it returns.
        let mut cache = self.ca_cache.lock().unwrap_or_else(|e| e.into_inner());
        write_atomic(&self.keyset_path(name), yaml.as_bytes())?;
        if name == CA_KEYSET {
            *cache = Some(keyset.clone());
        }
        Ok(())
    }

    fn list_keysets(&self) -> Result<BTreeMap<String, Keyset>> {
        let dir = self.base.join("pki");
        let mut keysets = BTreeMap::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(keysets),
            Err(e) => return Err(Error::io(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(keyset) = self.read_keyset(&name)? {
                keysets.insert(name, keyset);
            }
        }
        Ok(keysets)
    }

    fn add_ssh_public_key(&self, name: &str, public_key: &str) -> Result<String> {
        let credential = SshCredential::new(name, public_key)?;
        let path = self
            .ssh_dir()
            .join(name)
            .join(credential.id.replace(':', ""));
        write_atomic(&path, credential.public_key.as_bytes())?;
        Ok(credential.id)
    }

    fn ssh_credentials(&self) -> Result<Vec<SshCredential>> {
        let dir = self.ssh_dir();
        let mut credentials = Vec::new();
        let users = match fs::read_dir(&dir) {
            Ok(users) => users,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(credentials),
            Err(e) => return Err(Error::io(dir, e)),
        };
        for user in users {
            let user = user.map_err(|e| Error::io(&dir, e))?;
            let name = user.file_name().to_string_lossy().into_owned();
            for key in fs::read_dir(user.path()).map_err(|e| Error::io(user.path(), e))? {
                let key = key.map_err(|e| Error::io(user.path(), e))?;
                let data = fs::read_to_string(key.path()).map_err(|e| Error::io(key.path(), e))?;
                credentials.push(SshCredential::new(&name, &data)?);
            }
        }
        credentials.sort_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id)));
        Ok(credentials)
    }

    fn delete_ssh_credential(&self, name: &str, id: &str) -> Result<()> {
        let path = self.ssh_dir().join(name).join(id.replace(':', ""));
        fs::remove_file(&path).map_err(|e| Error::io(path, e))
    }
}

impl SecretReader for FsKeystore {
    fn find_secret(&self, id: &str) -> Result<Option<Secret>> {
        let path = self.secret_path(id);
        match fs::read(&path) {
            Ok(data) => Ok(Some(Secret { data })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::io(path, io::Error::other("path has no parent")))?;
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    tmp.write_all(data).map_err(|e| Error::io(path, e))?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryKeystore;
    use crate::pki::{CertificateRequest, sign_new_certificate};

    fn ca_keyset() -> Keyset {
        let (cert, key) =
            sign_new_certificate(&CertificateRequest::ca("kubernetes"), None, None).unwrap();
        Keyset::new(cert, key).unwrap()
    }

    #[test]
    fn test_store_and_find_keyset() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsKeystore::new(dir.path());
        let keyset = ca_keyset();

        store.store_keyset("ca", &keyset).unwrap();
        assert!(dir.path().join("pki/ca/keyset.yaml").exists());

        // A fresh instance reads it back from disk.
        let reopened = FsKeystore::new(dir.path());
        assert_eq!(reopened.find_keyset("ca").unwrap(), Some(keyset.clone()));
        let (cert, _) = reopened.find_primary_keypair("ca").unwrap().unwrap();
        assert_eq!(&cert, &keyset.primary().unwrap().certificate);

        // Legacy lookup: kubernetes-ca falls back to ca.
        let legacy = reopened.find_keyset("kubernetes-ca").unwrap().unwrap();
        assert!(legacy.legacy_format);
    }

    #[test]
    fn test_mirror_copies_everything() {
        let source = MemoryKeystore::new();
        source.store_keyset("ca", &ca_keyset()).unwrap();
        source
            .add_ssh_public_key("admin", "ssh-rsa AAAAB3NzaC1yc2EAAAADAQAB admin")
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        source.mirror_to(dir.path()).unwrap();

        let mirror = FsKeystore::new(dir.path());
        assert_eq!(mirror.list_keysets().unwrap().len(), 1);
        assert_eq!(mirror.ssh_credentials().unwrap(), source.ssh_credentials().unwrap());
    }

    #[test]
    fn test_secrets_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsKeystore::new(dir.path());
        assert!(store.find_secret("kube").unwrap().is_none());
        store.store_secret("kube", b"token").unwrap();
        assert_eq!(store.secret("kube").unwrap().data, b"token");
    }
}
