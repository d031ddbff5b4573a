//! Porthole Keystore
//!
//! Ephemeral keypair minting and state-directory path utilities.
//!
//! Every bastion session is authorized by a fresh ED25519 keypair that lives
//! exactly as long as the session: the public half is submitted with the
//! session create call, the private half signs the SSH handshake, and the
//! key bytes are zeroed when the tunnel tears down. Nothing here ever
//! touches disk.

mod keypair;
mod paths;

pub use keypair::EphemeralKey;
pub use paths::{audit_dir, cache_dir, config_dir, expand_path, state_dir};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Key encoding failed: {0}")]
    Encoding(#[from] ssh_key::Error),

    #[error("No home directory available to derive state paths")]
    NoHomeDir,
}

pub type Result<T> = std::result::Result<T, KeystoreError>;
