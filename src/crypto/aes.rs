//! AES-256-CBC session encryption.
//!
//! Both wire protocols run CBC streams whose IV chains across frames, so the
//! encryptor and decryptor are stateful values owned by a session.

use aes::Aes256;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use super::SessionKey;

pub const AES_BLOCK_SIZE: usize = 16;

pub struct CbcEncryptor {
	inner: cbc::Encryptor<Aes256>,
}

impl CbcEncryptor {
	pub fn new(key: &SessionKey, iv: &[u8; AES_BLOCK_SIZE]) -> Self {
		CbcEncryptor {
			inner: cbc::Encryptor::new(GenericArray::from_slice(&key.0), GenericArray::from_slice(iv)),
		}
	}

	/// Encrypts `buf` in place. Length must be a multiple of 16.
	pub fn encrypt(&mut self, buf: &mut [u8]) {
		debug_assert_eq!(buf.len() % AES_BLOCK_SIZE, 0);
		for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
			self.inner.encrypt_block_mut(GenericArray::from_mut_slice(block));
		}
	}
}

pub struct CbcDecryptor {
	inner: cbc::Decryptor<Aes256>,
}

impl CbcDecryptor {
	pub fn new(key: &SessionKey, iv: &[u8; AES_BLOCK_SIZE]) -> Self {
		CbcDecryptor {
			inner: cbc::Decryptor::new(GenericArray::from_slice(&key.0), GenericArray::from_slice(iv)),
		}
	}

	/// Decrypts `buf` in place. Length must be a multiple of 16.
	pub fn decrypt(&mut self, buf: &mut [u8]) {
		debug_assert_eq!(buf.len() % AES_BLOCK_SIZE, 0);
		for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
			self.inner.decrypt_block_mut(GenericArray::from_mut_slice(block));
		}
	}
}

/// One-shot CBC encryption under a fresh IV, as used per datagram packet.
pub fn encrypt_cbc(key: &SessionKey, iv: &[u8; AES_BLOCK_SIZE], buf: &mut [u8]) {
	CbcEncryptor::new(key, iv).encrypt(buf);
}

/// One-shot CBC decryption under the packet IV.
pub fn decrypt_cbc(key: &SessionKey, iv: &[u8; AES_BLOCK_SIZE], buf: &mut [u8]) {
	CbcDecryptor::new(key, iv).decrypt(buf);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip() {
		let key = SessionKey([0x42; 32]);
		let iv = [0x17; 16];
		let plain = b"sixteen byte blksand another one".to_vec();
		let mut buf = plain.clone();
		encrypt_cbc(&key, &iv, &mut buf);
		assert_ne!(buf, plain);
		decrypt_cbc(&key, &iv, &mut buf);
		assert_eq!(buf, plain);
	}

	#[test]
	fn stream_chains_across_calls() {
		let key = SessionKey([9; 32]);
		let iv = [1; 16];
		let mut whole = vec![0xAAu8; 64];
		let mut split = whole.clone();
		encrypt_cbc(&key, &iv, &mut whole);
		let mut enc = CbcEncryptor::new(&key, &iv);
		enc.encrypt(&mut split[..32]);
		enc.encrypt(&mut split[32..]);
		assert_eq!(whole, split);

		let mut dec = CbcDecryptor::new(&key, &iv);
		dec.decrypt(&mut split[..16]);
		dec.decrypt(&mut split[16..]);
		assert_eq!(split, vec![0xAAu8; 64]);
	}
}
