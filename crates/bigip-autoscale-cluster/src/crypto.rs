//! Payload encryption for the mailbox and temporary credential generation

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

#[cfg(test)]
use mockall::automock;

use bigip_autoscale_common::{Credentials, Error};

/// Random bytes in a temporary username (hex encoded)
pub const TEMP_USERNAME_BYTES: usize = 10;

/// Random bytes in a temporary password (base64 encoded)
pub const TEMP_PASSWORD_BYTES: usize = 24;

/// The local private key and the passphrase protecting it
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    /// PEM-encoded encrypted private key
    pub pem: String,
    /// Passphrase for `pem`
    pub passphrase: String,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey").finish_non_exhaustive()
    }
}

/// Encrypts payloads for a peer and decrypts payloads addressed to us
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PayloadCipher: Send + Sync {
    /// Load the local private key and its passphrase
    async fn load_private_key(&self) -> Result<PrivateKey, Error>;

    /// PEM public key matching the local private key
    async fn local_public_key(&self) -> Result<String, Error>;

    /// Encrypt `plaintext` for the holder of `public_key`
    async fn encrypt(&self, public_key: &str, plaintext: &str) -> Result<String, Error>;

    /// Decrypt `ciphertext` with the local private key
    async fn decrypt(&self, key: &PrivateKey, ciphertext: &str) -> Result<String, Error>;
}

/// Generate a temporary admin account
///
/// The username is 10 random bytes hex encoded, the password 24 random bytes
/// base64 encoded.
pub fn random_credentials() -> Credentials {
    let mut rng = rand::thread_rng();

    let mut user_bytes = [0u8; TEMP_USERNAME_BYTES];
    rng.fill_bytes(&mut user_bytes);
    let username = hex::encode(user_bytes);

    let mut password_bytes = [0u8; TEMP_PASSWORD_BYTES];
    rng.fill_bytes(&mut password_bytes);
    let password = BASE64.encode(password_bytes);

    Credentials { username, password }
}
