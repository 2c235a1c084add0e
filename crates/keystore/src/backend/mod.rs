//! Keystore backends.
//!
//! All backends share the read interface; only some accept writes.

mod api;
mod config_server;
mod fs;
mod memory;

pub use api::{ApiServerKeystore, KeysetApi, SshCredentialDocument};
pub use config_server::ConfigServerKeystore;
pub use fs::FsKeystore;
pub use memory::MemoryKeystore;
