//! tvault-crypto: password-based authenticated encryption for chunk payloads
//!
//! Cipher: ChaCha20-Poly1305 (96-bit nonce). Keys come from Argon2id over the
//! user's password and a fresh random salt, derived again for every chunk so
//! no two chunks share a key.
//!
//! Per-chunk wire format:
//! ```text
//! [16 bytes: salt][12 bytes: nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! The streaming variant derives one key per file and gives every block the
//! base nonce XOR a big-endian block counter in its low 8 bytes.

pub mod chunk;
pub mod error;
pub mod kdf;
pub mod stream;

pub use chunk::{decrypt_chunk, encrypt_chunk, EncryptionHeader};
pub use error::CryptoError;
pub use kdf::{derive_key, DerivedKey, KdfParams};
pub use stream::{decrypt_file, encrypt_file, StreamDecryptor, StreamEncryptor};

/// Size of a derived key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the random KDF salt
pub const SALT_SIZE: usize = 16;

/// Size of a ChaCha20-Poly1305 nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Salt plus nonce, prepended to every encrypted chunk
pub const HEADER_SIZE: usize = SALT_SIZE + NONCE_SIZE;

/// Plaintext block size used by whole-file streaming encryption
pub const BLOCK_SIZE: usize = 64 * 1024;
