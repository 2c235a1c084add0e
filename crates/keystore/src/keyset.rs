//! Keysets: certificate/key items keyed by serial with one primary.
//!
//! Item ids are decimal big integers and always increase over time, so the
//! newest item sorts last. When a primary is added with an older serial it
//! is given the id just above the current primary to keep that ordering.

use crate::error::{Error, Result};
use crate::pki::{Certificate, PrivateKey, now_serial};
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group/version written into keyset documents.
pub const KEYSET_API_VERSION: &str = "kops.k8s.io/v1alpha2";

/// One certificate (and optionally its key) in a keyset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysetItem {
    pub id: String,
    pub certificate: Certificate,
    pub private_key: Option<PrivateKey>,
    pub distrust_timestamp: Option<DateTime<Utc>>,
}

impl KeysetItem {
    pub fn is_distrusted(&self) -> bool {
        self.distrust_timestamp.is_some()
    }

    fn numeric_id(&self) -> Option<BigUint> {
        self.id.parse().ok()
    }
}

/// A set of items with a designated primary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyset {
    /// Found under a legacy name.
    pub legacy_format: bool,
    items: BTreeMap<String, KeysetItem>,
    primary: Option<String>,
}

impl Keyset {
    /// Create a keyset whose only item is the primary.
    pub fn new(certificate: Certificate, key: PrivateKey) -> Result<Self> {
        let mut keyset = Self::default();
        keyset.add_item(certificate, Some(key), true)?;
        Ok(keyset)
    }

    /// Add an item and return its id.
    ///
    /// A secondary keeps its certificate serial as id. A primary whose
    /// serial lies in the future gets the current-time serial instead, and
    /// one that would sort at or below the existing primary gets the
    /// existing primary's id plus one.
    pub fn add_item(
        &mut self,
        certificate: Certificate,
        key: Option<PrivateKey>,
        primary: bool,
    ) -> Result<String> {
        if primary && key.is_none() {
            return Err(Error::Item(
                "primary keyset item requires a private key".to_string(),
            ));
        }

        let mut id = certificate.serial().clone();
        if primary {
            let now = now_serial();
            if id > now {
                log::debug!("serial {id} is in the future, using {now}");
                id = now;
            }
            if let Some(current) = self.primary().and_then(KeysetItem::numeric_id)
                && id <= current
            {
                id = current + 1u32;
            }
        }

        let id = id.to_string();
        self.items.insert(
            id.clone(),
            KeysetItem {
                id: id.clone(),
                certificate,
                private_key: key,
                distrust_timestamp: None,
            },
        );
        if primary {
            self.primary = Some(id.clone());
        }
        Ok(id)
    }

    pub fn primary(&self) -> Option<&KeysetItem> {
        self.primary.as_ref().and_then(|id| self.items.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&KeysetItem> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in ascending id order; unparsable ids sort first.
    pub fn items(&self) -> Vec<&KeysetItem> {
        let mut items: Vec<&KeysetItem> = self.items.values().collect();
        items.sort_by_key(|i| i.numeric_id());
        items
    }

    /// Make an existing trusted item with a key the primary.
    pub fn set_primary(&mut self, id: &str) -> Result<()> {
        let item = self
            .items
            .get(id)
            .ok_or_else(|| Error::Item(format!("no keyset item with id {id}")))?;
        if item.is_distrusted() {
            return Err(Error::Item(format!("item {id} is distrusted")));
        }
        if item.private_key.is_none() {
            return Err(Error::Item(format!("item {id} has no private key")));
        }
        self.primary = Some(id.to_string());
        Ok(())
    }

    /// Stop trusting a non-primary item.
    pub fn distrust(&mut self, id: &str, at: DateTime<Utc>) -> Result<()> {
        if self.primary.as_deref() == Some(id) {
            return Err(Error::Item(format!("cannot distrust primary item {id}")));
        }
        let item = self
            .items
            .get_mut(id)
            .ok_or_else(|| Error::Item(format!("no keyset item with id {id}")))?;
        item.distrust_timestamp = Some(at);
        Ok(())
    }

    /// Remove a non-primary item.
    pub fn remove_item(&mut self, id: &str) -> Result<KeysetItem> {
        if self.primary.as_deref() == Some(id) {
            return Err(Error::Item(format!("cannot remove primary item {id}")));
        }
        self.items
            .remove(id)
            .ok_or_else(|| Error::Item(format!("no keyset item with id {id}")))
    }

    /// Certificates that are still trusted, primary first.
    pub fn trusted_certificates(&self) -> Vec<&Certificate> {
        let primary = self.primary();
        let mut certs: Vec<&Certificate> = primary.map(|p| &p.certificate).into_iter().collect();
        for item in self.items() {
            if item.is_distrusted() || primary.is_some_and(|p| p.id == item.id) {
                continue;
            }
            certs.push(&item.certificate);
        }
        certs
    }

    /// Concatenated PEM of [`Keyset::trusted_certificates`].
    pub fn ca_bundle_pem(&self) -> String {
        self.trusted_certificates()
            .iter()
            .map(|c| c.pem())
            .collect::<String>()
    }

    /// Check the keyset invariants.
    pub fn validate(&self, name: &str) -> Result<()> {
        for item in self.items.values() {
            if !item.is_distrusted() && item.numeric_id().is_none() {
                return Err(Error::invalid_keyset(
                    name,
                    format!("item id {:?} is not an integer", item.id),
                ));
            }
        }
        let primary = self
            .primary()
            .ok_or_else(|| Error::invalid_keyset(name, "no primary item"))?;
        if primary.is_distrusted() {
            return Err(Error::invalid_keyset(name, "primary item is distrusted"));
        }
        Ok(())
    }

    /// Serialize into the on-disk document form.
    pub fn to_document(&self, name: &str) -> Result<KeysetDocument> {
        let mut keys = Vec::with_capacity(self.items.len());
        for item in self.items() {
            keys.push(KeyDocument {
                id: item.id.clone(),
                public_material: item.certificate.pem().to_string(),
                private_material: item.private_key.as_ref().map(PrivateKey::to_pem).transpose()?,
                distrust_timestamp: item.distrust_timestamp,
            });
        }
        Ok(KeysetDocument {
            api_version: KEYSET_API_VERSION.to_string(),
            kind: "Keyset".to_string(),
            metadata: Metadata {
                name: name.to_string(),
            },
            spec: KeysetSpec {
                kind: "Keypair".to_string(),
                primary_id: self.primary.clone().unwrap_or_default(),
                keys,
            },
        })
    }

    /// Load and validate a document.
    pub fn from_document(document: &KeysetDocument) -> Result<Self> {
        let name = &document.metadata.name;
        if document.kind != "Keyset" {
            return Err(Error::invalid_keyset(
                name,
                format!("unexpected kind {:?}", document.kind),
            ));
        }
        let mut keyset = Self::default();
        for key in &document.spec.keys {
            let certificate = Certificate::from_pem(&key.public_material)?;
            let private_key = key
                .private_material
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(PrivateKey::from_pem)
                .transpose()?;
            keyset.items.insert(
                key.id.clone(),
                KeysetItem {
                    id: key.id.clone(),
                    certificate,
                    private_key,
                    distrust_timestamp: key.distrust_timestamp,
                },
            );
        }
        if !document.spec.primary_id.is_empty() {
            keyset.primary = Some(document.spec.primary_id.clone());
        }
        keyset.validate(name)?;
        Ok(keyset)
    }

    pub fn to_yaml(&self, name: &str) -> Result<String> {
        serde_yaml::to_string(&self.to_document(name)?).map_err(|e| Error::Serialization {
            what: format!("keyset {name}"),
            message: e.to_string(),
        })
    }

    pub fn from_yaml(data: &str) -> Result<(String, Self)> {
        let document: KeysetDocument =
            serde_yaml::from_str(data).map_err(|e| Error::Serialization {
                what: "keyset document".to_string(),
                message: e.to_string(),
            })?;
        let keyset = Self::from_document(&document)?;
        Ok((document.metadata.name, keyset))
    }
}

/// Persisted keyset document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysetDocument {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: KeysetSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysetSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub primary_id: String,
    #[serde(default)]
    pub keys: Vec<KeyDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDocument {
    pub id: String,
    pub public_material: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_material: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distrust_timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{CertificateRequest, sign_new_certificate};
    use std::sync::OnceLock;

    fn key() -> PrivateKey {
        static KEY: OnceLock<PrivateKey> = OnceLock::new();
        KEY.get_or_init(|| PrivateKey::generate().unwrap()).clone()
    }

    fn cert_with_serial(serial: &str) -> Certificate {
        let request = CertificateRequest {
            serial: Some(serial.parse().unwrap()),
            ..CertificateRequest::ca("kubernetes")
        };
        sign_new_certificate(&request, Some(key()), None).unwrap().0
    }

    #[test]
    fn test_new_keyset_uses_serial_as_id() {
        let keyset = Keyset::new(cert_with_serial("1000"), key()).unwrap();
        assert_eq!(keyset.primary().unwrap().id, "1000");
        assert!(keyset.validate("ca").is_ok());
    }

    #[test]
    fn test_insert_primary_before_existing_primary() {
        let after = cert_with_serial("6952335996080054816494652246");
        let mut keyset = Keyset::new(after, key()).unwrap();

        let id = keyset
            .add_item(cert_with_serial("1234567"), Some(key()), true)
            .unwrap();

        assert_eq!(keyset.len(), 2);
        assert_eq!(id, "6952335996080054816494652247");
        assert_eq!(keyset.primary().unwrap().id, id);
        assert!(keyset.get("6952335996080054816494652246").is_some());
    }

    #[test]
    fn test_newer_primary_keeps_old_ids() {
        let mut keyset = Keyset::new(cert_with_serial("100"), key()).unwrap();
        keyset.add_item(cert_with_serial("50"), None, false).unwrap();

        let now = now_serial().to_string();
        let id = keyset.add_item(cert_with_serial(&now), Some(key()), true).unwrap();

        assert_eq!(id, now);
        assert_eq!(keyset.primary().unwrap().id, now);
        assert!(keyset.get("100").is_some());
        assert!(keyset.get("50").is_some());
        let ids: Vec<&str> = keyset.items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["50", "100", now.as_str()]);
    }

    #[test]
    fn test_future_serial_replaced_with_current_serial() {
        let future = (now_serial() * 4u32).to_string();
        let mut keyset = Keyset::default();
        let id = keyset
            .add_item(cert_with_serial(&future), Some(key()), true)
            .unwrap();
        let id: BigUint = id.parse().unwrap();
        assert_ne!(id.to_string(), future);
        assert!(id <= now_serial() + (BigUint::from(1u64) << 32u32));
    }

    #[test]
    fn test_primary_requires_key() {
        let mut keyset = Keyset::default();
        assert!(keyset.add_item(cert_with_serial("7"), None, true).is_err());
        assert!(keyset.add_item(cert_with_serial("7"), None, false).is_ok());
        assert!(keyset.validate("x").is_err());
    }

    #[test]
    fn test_distrust_and_bundle() {
        let mut keyset = Keyset::new(cert_with_serial("10"), key()).unwrap();
        keyset.add_item(cert_with_serial("5"), None, false).unwrap();
        assert_eq!(keyset.trusted_certificates().len(), 2);
        assert!(keyset.distrust("10", Utc::now()).is_err());

        keyset.distrust("5", Utc::now()).unwrap();
        assert_eq!(keyset.trusted_certificates().len(), 1);
        assert_eq!(
            keyset.ca_bundle_pem(),
            keyset.primary().unwrap().certificate.pem()
        );
        assert!(keyset.remove_item("10").is_err());
        assert!(keyset.remove_item("5").is_ok());
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut keyset = Keyset::new(cert_with_serial("20"), key()).unwrap();
        keyset.add_item(cert_with_serial("3"), None, false).unwrap();

        let yaml = keyset.to_yaml("ca").unwrap();
        assert!(yaml.contains("kind: Keyset"));
        assert!(yaml.contains("primaryId: '20'") || yaml.contains("primaryId: \"20\""));

        let (name, loaded) = Keyset::from_yaml(&yaml).unwrap();
        assert_eq!(name, "ca");
        assert_eq!(loaded, keyset);
    }

    #[test]
    fn test_document_without_valid_primary_is_rejected() {
        let keyset = Keyset::new(cert_with_serial("20"), key()).unwrap();
        let mut document = keyset.to_document("ca").unwrap();
        document.spec.primary_id = "999".to_string();
        assert!(Keyset::from_document(&document).is_err());
    }
}
