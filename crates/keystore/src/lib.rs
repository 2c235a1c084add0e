//! # keystore
//!
//! Certificate authority material for node bootstrap.
//!
//! This crate provides:
//! - [`Keyset`]: certificate/key items ordered by serial with one primary,
//!   supporting rotation (add, promote, distrust, remove)
//! - [`sign_new_certificate`]: RSA-2048 certificate issuance
//! - [`Keystore`] / [`KeystoreReader`] / [`SecretReader`]: storage traits
//!   with in-memory, filesystem, API-server and read-only backends
//!
//! ## Example
//!
//! ```no_run
//! use keystore::{FsKeystore, Keystore, KeystoreReader};
//!
//! let store = FsKeystore::new("/srv/state");
//! store.ensure_ca("ca").unwrap();
//! let (cert, _key) = store.find_primary_keypair("ca").unwrap().unwrap();
//! println!("CA serial {}", cert.serial());
//! ```

pub mod backend;
pub mod error;
pub mod keyset;
pub mod pki;
pub mod store;

pub use backend::{
    ApiServerKeystore, ConfigServerKeystore, FsKeystore, KeysetApi, MemoryKeystore,
    SshCredentialDocument,
};
pub use error::{Error, ErrorCategory, Result};
pub use keyset::{Keyset, KeysetDocument, KeysetItem};
pub use num_bigint::BigUint;
pub use pki::{
    Certificate, CertificateRequest, CertificateUsage, PrivateKey, now_serial, pki_serial,
    sign_new_certificate,
};
pub use store::{
    CA_KEYSET, Keystore, KeystoreReader, Secret, SecretReader, SshCredential, legacy_keyset_name,
};
