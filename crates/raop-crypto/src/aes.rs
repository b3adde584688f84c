//! AES-128-CBC for RAOP audio payloads.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use raop_core::error::CryptoError;
use raop_core::{AES_IV_LEN, AES_KEY_LEN};
use zeroize::ZeroizeOnDrop;

const BLOCK_LEN: usize = 16;

/// AES-128-CBC cipher holding the session key and base IV.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AesCbcCipher {
    key: [u8; AES_KEY_LEN],
    iv: [u8; AES_IV_LEN],
}

impl AesCbcCipher {
    /// Cipher for one session's key and base IV.
    pub fn new(key: [u8; AES_KEY_LEN], iv: [u8; AES_IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// Create cipher from unchecked slices, validating both lengths.
    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; AES_KEY_LEN] = key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: AES_KEY_LEN,
            actual: key.len(),
        })?;
        let iv: [u8; AES_IV_LEN] = iv.try_into().map_err(|_| CryptoError::InvalidIvLength {
            expected: AES_IV_LEN,
            actual: iv.len(),
        })?;
        Ok(Self::new(key, iv))
    }

    fn block_cipher(&self) -> Result<Aes128, CryptoError> {
        Aes128::new_from_slice(&self.key)
            .map_err(|e| CryptoError::Decryption(format!("Invalid key: {}", e)))
    }

    /// CBC over block-aligned input.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() % BLOCK_LEN != 0 {
            return Err(CryptoError::Encryption(
                "Plaintext must be a multiple of 16 bytes".to_string(),
            ));
        }

        let cipher = self.block_cipher()?;
        let mut ciphertext = Vec::with_capacity(plaintext.len());
        let mut prev_block = self.iv;

        for chunk in plaintext.chunks_exact(BLOCK_LEN) {
            let mut block = [0u8; BLOCK_LEN];
            for i in 0..BLOCK_LEN {
                block[i] = chunk[i] ^ prev_block[i];
            }

            cipher.encrypt_block(aes::Block::from_mut_slice(&mut block));

            prev_block = block;
            ciphertext.extend_from_slice(&block);
        }

        Ok(ciphertext)
    }

    /// Decrypt ciphertext in place (must be multiple of 16 bytes).
    pub fn decrypt_in_place(&self, data: &mut [u8]) -> Result<(), CryptoError> {
        if data.len() % BLOCK_LEN != 0 {
            return Err(CryptoError::Decryption(
                "Ciphertext must be a multiple of 16 bytes".to_string(),
            ));
        }

        let cipher = self.block_cipher()?;
        let mut prev_block = self.iv;

        for chunk in data.chunks_exact_mut(BLOCK_LEN) {
            let mut saved = [0u8; BLOCK_LEN];
            saved.copy_from_slice(chunk);

            cipher.decrypt_block(aes::Block::from_mut_slice(chunk));
            for (byte, prev) in chunk.iter_mut().zip(prev_block.iter()) {
                *byte ^= prev;
            }

            prev_block = saved;
        }

        Ok(())
    }

    /// Decrypt ciphertext into a new buffer (must be multiple of 16 bytes).
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = ciphertext.to_vec();
        self.decrypt_in_place(&mut plaintext)?;
        Ok(plaintext)
    }

    /// RAOP encryption: only full 16-byte blocks are encrypted, trailing
    /// bytes pass through. The chain always starts from the base IV.
    pub fn encrypt_raop(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let full_len = payload.len() / BLOCK_LEN * BLOCK_LEN;
        if full_len == 0 {
            return Ok(payload.to_vec());
        }

        let mut result = self.encrypt(&payload[..full_len])?;
        result.extend_from_slice(&payload[full_len..]);
        Ok(result)
    }

    /// RAOP decryption in place. Inverse of [`encrypt_raop`](Self::encrypt_raop).
    pub fn decrypt_raop_in_place(&self, payload: &mut [u8]) -> Result<(), CryptoError> {
        let full_len = payload.len() / BLOCK_LEN * BLOCK_LEN;
        if full_len == 0 {
            return Ok(());
        }
        self.decrypt_in_place(&mut payload[..full_len])
    }

    /// Get the base IV.
    pub fn iv(&self) -> &[u8; AES_IV_LEN] {
        &self.iv
    }
}

impl std::fmt::Debug for AesCbcCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCbcCipher").finish_non_exhaustive()
    }
}
