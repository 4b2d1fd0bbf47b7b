//! Key derivation: Argon2id password + salt → 256-bit key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use tvault_core::KdfSettings;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit per-chunk (or per-stream) key. Wiped when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// Argon2id cost parameters. Recorded in file metadata so a download
/// derives with exactly what the upload used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl KdfParams {
    fn hasher(&self) -> Result<Argon2<'static>, CryptoError> {
        let params = Params::new(
            self.mem_cost_kib,
            self.time_cost,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::Kdf(format!("invalid Argon2id params: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<KdfSettings> for KdfParams {
    fn from(s: KdfSettings) -> Self {
        Self {
            mem_cost_kib: s.mem_cost_kib,
            time_cost: s.time_cost,
            parallelism: s.parallelism,
        }
    }
}

impl From<KdfParams> for KdfSettings {
    fn from(p: KdfParams) -> Self {
        Self {
            mem_cost_kib: p.mem_cost_kib,
            time_cost: p.time_cost,
            parallelism: p.parallelism,
        }
    }
}

/// Derive a key from `password` and a random per-encryption `salt`. The
/// salt is not secret and travels in the clear ahead of the ciphertext.
pub fn derive_key(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> Result<DerivedKey, CryptoError> {
    let mut key = [0u8; KEY_SIZE];
    let result = params
        .hasher()?
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::Kdf(format!("Argon2id KDF failed: {e}")));
    let derived = result.map(|()| DerivedKey::from_bytes(key));
    key.zeroize();
    derived
}
