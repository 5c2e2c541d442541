//! SSH key pair generation

use rand::thread_rng;
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use ssh_key::public::{KeyData, RsaPublicKey};
use ssh_key::PublicKey;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Modulus size of generated keys
pub const RSA_BITS: usize = 4096;

/// A freshly generated key pair
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// Public key in OpenSSH authorized-keys format
    pub public_key: Vec<u8>,
    /// Private key as PKCS#1 PEM
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &String::from_utf8_lossy(&self.public_key))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Source of SSH key pairs for new clusters
///
/// Every call must return a new pair. Tests substitute a fixed pair so that
/// rendered output is stable.
#[cfg_attr(test, automock)]
pub trait KeyGenerator: Send + Sync {
    /// Generate a key pair
    fn generate(&self) -> Result<KeyPair>;
}

/// Generates RSA key pairs
#[derive(Clone, Debug)]
pub struct RsaKeyGenerator {
    bits: usize,
}

impl Default for RsaKeyGenerator {
    fn default() -> Self {
        Self { bits: RSA_BITS }
    }
}

impl RsaKeyGenerator {
    /// Generator for keys of a different size
    pub fn with_bits(bits: usize) -> Self {
        Self { bits }
    }
}

impl KeyGenerator for RsaKeyGenerator {
    fn generate(&self) -> Result<KeyPair> {
        let private = RsaPrivateKey::new(&mut thread_rng(), self.bits)
            .map_err(|e| Error::internal_with_context("ssh keys", format!("failed to generate RSA key: {}", e)))?;

        let public = RsaPublicKey::try_from(&private.to_public_key())
            .map_err(|e| Error::internal_with_context("ssh keys", format!("failed to encode public key: {}", e)))?;
        let public_key = PublicKey::new(KeyData::Rsa(public), "")
            .to_openssh()
            .map_err(|e| Error::internal_with_context("ssh keys", format!("failed to encode public key: {}", e)))?;

        let private_key = private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| Error::internal_with_context("ssh keys", format!("failed to encode private key: {}", e)))?;

        Ok(KeyPair {
            public_key: public_key.into_bytes(),
            private_key: private_key.as_bytes().to_vec(),
        })
    }
}
