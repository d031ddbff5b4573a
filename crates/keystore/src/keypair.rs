use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use ssh_key::public::{Ed25519PublicKey, KeyData, PublicKey};
use ssh_key::HashAlg;
use zeroize::Zeroizing;

use crate::Result;

/// Comment attached to the exported public key so sessions are attributable
/// in bastion-side listings.
const KEY_COMMENT: &str = "porthole-ephemeral";

/// A session-scoped ED25519 keypair.
///
/// The signing key zeroes itself on drop; `seed()` hands out copies wrapped
/// in [`Zeroizing`] so the transport layer cannot leak them either.
pub struct EphemeralKey {
    signing: SigningKey,
    created_at: DateTime<Utc>,
}

impl EphemeralKey {
    /// Mint a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            created_at: Utc::now(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The 32-byte private seed, for building the SSH signer.
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Raw public key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    fn ssh_public(&self) -> PublicKey {
        let key = Ed25519PublicKey::from(&self.signing.verifying_key());
        PublicKey::new(KeyData::Ed25519(key), KEY_COMMENT)
    }

    /// Public half in the one-line OpenSSH format the bastion accepts:
    /// `ssh-ed25519 <base64> porthole-ephemeral`.
    pub fn public_openssh(&self) -> Result<String> {
        Ok(self.ssh_public().to_openssh()?)
    }

    /// `SHA256:<base64>` fingerprint of the public half, matching what the
    /// bastion reports back on the session record.
    pub fn fingerprint(&self) -> String {
        self.ssh_public().fingerprint(HashAlg::Sha256).to_string()
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never reveal key material through Debug.
        f.debug_struct("EphemeralKey")
            .field("fingerprint", &self.fingerprint())
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique() {
        let a = EphemeralKey::generate();
        let b = EphemeralKey::generate();
        assert_ne!(a.public_bytes(), b.public_bytes());
        assert_ne!(*a.seed(), *b.seed());
    }

    #[test]
    fn test_openssh_format() {
        let key = EphemeralKey::generate();
        let line = key.public_openssh().unwrap();
        assert!(line.starts_with("ssh-ed25519 "), "got: {line}");
        assert!(line.ends_with(KEY_COMMENT));
        // Single line, three space-separated fields.
        assert_eq!(line.lines().count(), 1);
        assert_eq!(line.split_whitespace().count(), 3);
    }

    #[test]
    fn test_fingerprint_shape_and_stability() {
        let key = EphemeralKey::generate();
        let fp = key.fingerprint();
        assert!(fp.starts_with("SHA256:"), "got: {fp}");
        assert_eq!(fp, key.fingerprint());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let key = EphemeralKey::generate();
        let seed_b64 = {
            use std::fmt::Write;
            let mut s = String::new();
            for b in key.seed().iter() {
                let _ = write!(s, "{b:02x}");
            }
            s
        };
        let debug = format!("{key:?}");
        assert!(!debug.contains(&seed_b64));
        assert!(debug.contains("fingerprint"));
    }
}
