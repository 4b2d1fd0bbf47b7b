//! Streaming encryption: one Argon2id key per file, counter-derived nonces
//!
//! Each block nonce is the base nonce with its first 8 bytes XORed with the
//! big-endian block counter. Every block is written as `[nonce][ciphertext][tag]`
//! so blocks decrypt independently. A key is retired before its counter can
//! wrap.
//!
//! File format produced by [`encrypt_file`]:
//! ```text
//! [16 bytes: salt][12 bytes: base nonce]
//! repeated: [4 bytes: block length, big-endian][block bytes]
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use secrecy::SecretString;
use tracing::debug;

use crate::chunk::EncryptionHeader;
use crate::error::CryptoError;
use crate::kdf::{derive_key, KdfParams};
use crate::{BLOCK_SIZE, HEADER_SIZE, NONCE_SIZE, TAG_SIZE};

/// Blocks allowed under one key (2^32, far below the 64-bit counter space).
pub const MAX_BLOCKS_PER_KEY: u64 = 1 << 32;

fn block_nonce(base: &[u8; NONCE_SIZE], counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = *base;
    for (n, c) in nonce.iter_mut().zip(counter.to_be_bytes()) {
        *n ^= c;
    }
    nonce
}

pub struct StreamEncryptor {
    header: EncryptionHeader,
    cipher: ChaCha20Poly1305,
    counter: u64,
    limit: u64,
}

impl StreamEncryptor {
    pub fn new(password: &SecretString, params: &KdfParams) -> Result<Self, CryptoError> {
        Self::with_limit(password, params, MAX_BLOCKS_PER_KEY)
    }

    /// Like [`StreamEncryptor::new`] with a custom per-key block limit.
    pub fn with_limit(
        password: &SecretString,
        params: &KdfParams,
        limit: u64,
    ) -> Result<Self, CryptoError> {
        let header = EncryptionHeader::generate();
        let key = derive_key(password, &header.salt, params)?;
        Ok(Self {
            header,
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            counter: 0,
            limit,
        })
    }

    /// Header to store ahead of the encrypted blocks.
    pub fn header(&self) -> &EncryptionHeader {
        &self.header
    }

    pub fn blocks_encrypted(&self) -> u64 {
        self.counter
    }

    /// Encrypt one block. Returns `[nonce][ciphertext][tag]`.
    pub fn encrypt_block(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.counter >= self.limit {
            return Err(CryptoError::CounterExhausted(self.counter));
        }
        let nonce = block_nonce(&self.header.nonce, self.counter);
        self.counter += 1;

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|e| CryptoError::Encrypt(format!("block encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

pub struct StreamDecryptor {
    cipher: ChaCha20Poly1305,
}

impl StreamDecryptor {
    pub fn new(
        password: &SecretString,
        header: &EncryptionHeader,
        params: &KdfParams,
    ) -> Result<Self, CryptoError> {
        let key = derive_key(password, &header.salt, params)?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        })
    }

    /// Decrypt one `[nonce][ciphertext][tag]` block.
    pub fn decrypt_block(&self, block: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let min = NONCE_SIZE + TAG_SIZE;
        if block.len() < min {
            return Err(CryptoError::Truncated {
                len: block.len(),
                min,
            });
        }
        let (nonce, ciphertext) = block.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }
}

/// Read up to `buf.len()` bytes, stopping short only at end of input.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Encrypt `input` into `output` block by block. Returns plaintext bytes read.
pub fn encrypt_file(
    input: &Path,
    output: &Path,
    password: &SecretString,
    params: &KdfParams,
) -> Result<u64, CryptoError> {
    let mut reader = BufReader::new(File::open(input)?);
    let mut writer = BufWriter::new(File::create(output)?);
    let mut encryptor = StreamEncryptor::new(password, params)?;
    writer.write_all(&encryptor.header().to_bytes())?;

    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut total = 0u64;
    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let block = encryptor.encrypt_block(&buf[..n])?;
        writer.write_all(&(block.len() as u32).to_be_bytes())?;
        writer.write_all(&block)?;
        total += n as u64;
    }
    writer.flush()?;
    debug!(bytes = total, blocks = encryptor.blocks_encrypted(), "encrypted file");
    Ok(total)
}

/// Decrypt a file produced by [`encrypt_file`]. Returns plaintext bytes written.
///
/// Output written before a failing block is left in place; callers remove it.
pub fn decrypt_file(
    input: &Path,
    output: &Path,
    password: &SecretString,
    params: &KdfParams,
) -> Result<u64, CryptoError> {
    let mut reader = BufReader::new(File::open(input)?);

    let mut header_bytes = [0u8; HEADER_SIZE];
    let got = read_full(&mut reader, &mut header_bytes)?;
    let header = EncryptionHeader::from_bytes(&header_bytes[..got])?;
    let decryptor = StreamDecryptor::new(password, &header, params)?;

    let mut writer = BufWriter::new(File::create(output)?);
    let max_block = NONCE_SIZE + BLOCK_SIZE + TAG_SIZE;
    let mut total = 0u64;
    loop {
        let mut len_bytes = [0u8; 4];
        match read_full(&mut reader, &mut len_bytes)? {
            0 => break,
            4 => {}
            n => return Err(CryptoError::Truncated { len: n, min: 4 }),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > max_block {
            return Err(CryptoError::Authentication);
        }
        let mut block = vec![0u8; len];
        let got = read_full(&mut reader, &mut block)?;
        if got < len {
            return Err(CryptoError::Truncated { len: got, min: len });
        }
        let plain = decryptor.decrypt_block(&block)?;
        writer.write_all(&plain)?;
        total += plain.len() as u64;
    }
    writer.flush()?;
    Ok(total)
}
