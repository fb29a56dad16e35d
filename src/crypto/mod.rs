use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::TryRngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

use crate::config::CipherConfig;
use crate::error::{GatewayError, GatewayResult};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_SALT_LEN: usize = 8;

/// An encrypted secret in its stored form: `<nonceHex>:<ciphertextHex>`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedSecret(String);

impl SealedSecret {
    pub fn from_envelope(envelope: impl Into<String>) -> Self {
        Self(envelope.into())
    }

    pub fn as_envelope(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedSecret(<redacted>)")
    }
}

/// Symmetric cipher for endpoint secrets. Holds only the derived key.
pub struct SecretCipher {
    key: [u8; 32],
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl Drop for SecretCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl SecretCipher {
    /// Derives the key with Argon2id. This is deliberately slow and is meant
    /// to run once at startup.
    pub fn from_config(config: &CipherConfig) -> GatewayResult<Self> {
        if config.secret.is_empty() {
            return Err(GatewayError::Crypto("Encryption secret is empty".to_string()));
        }
        if config.salt.len() < MIN_SALT_LEN {
            return Err(GatewayError::Crypto(format!(
                "KDF salt must be at least {} bytes",
                MIN_SALT_LEN
            )));
        }

        let params = Params::new(
            config.kdf.m_cost_kib,
            config.kdf.t_cost,
            config.kdf.p_cost,
            Some(32),
        )
        .map_err(|e| GatewayError::Crypto(format!("Invalid argon2 params: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; 32]);
        argon2
            .hash_password_into(config.secret.as_bytes(), &config.salt, key.as_mut())
            .map_err(|e| GatewayError::Crypto(format!("Key derivation failed: {}", e)))?;

        Ok(Self { key: *key })
    }

    pub fn encrypt(&self, plaintext: &str) -> GatewayResult<SealedSecret> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        let mut rng = rand::rngs::OsRng;
        rng.try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| GatewayError::Crypto(format!("Failed to generate nonce: {}", e)))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| GatewayError::Crypto("Failed to encrypt secret".to_string()))?;

        Ok(SealedSecret(format!(
            "{}:{}",
            hex::encode(nonce_bytes),
            hex::encode(ciphertext)
        )))
    }

    /// The plaintext is wiped from memory when the returned value is dropped.
    pub fn decrypt(&self, sealed: &SealedSecret) -> GatewayResult<Zeroizing<String>> {
        let (nonce_hex, ciphertext_hex) = sealed
            .0
            .split_once(':')
            .ok_or_else(|| malformed("missing separator"))?;
        if ciphertext_hex.contains(':') {
            return Err(malformed("too many separators"));
        }

        let nonce_bytes = hex::decode(nonce_hex).map_err(|_| malformed("nonce is not hex"))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(malformed("nonce has wrong length"));
        }
        let ciphertext =
            hex::decode(ciphertext_hex).map_err(|_| malformed("ciphertext is not hex"))?;
        if ciphertext.len() < TAG_LEN {
            return Err(malformed("ciphertext is truncated"));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| GatewayError::Crypto("Failed to decrypt secret".to_string()))?;

        String::from_utf8(plaintext).map(Zeroizing::new).map_err(|e| {
            e.into_bytes().zeroize();
            GatewayError::Crypto("Decrypted secret is not valid UTF-8".to_string())
        })
    }
}

fn malformed(reason: &str) -> GatewayError {
    GatewayError::Crypto(format!("Malformed secret envelope: {}", reason))
}

#[cfg(test)]
pub(crate) fn test_cipher() -> SecretCipher {
    SecretCipher::from_config(&crate::config::CipherConfig::for_tests("unit-test-secret"))
        .expect("test cipher")
}
