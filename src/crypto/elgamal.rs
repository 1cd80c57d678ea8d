//! ElGamal-2048 over the shared MODP group.
//!
//! Used for the 256-byte encryption key carried in every router identity
//! ("something we can encrypt garlic messages to"). The plaintext block is
//! 255 bytes: a nonzero marker, a SHA-256 checksum, then 222 payload bytes
//! (zero padded; the checksum covers the padded payload).

use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::Error;

use super::dh::{DH_G, DH_P};

pub const ELGAMAL_KEY_SIZE: usize = 256;
pub const ELGAMAL_CIPHERTEXT_SIZE: usize = 512;
pub const ELGAMAL_MAX_PLAINTEXT: usize = 222;

const BLOCK_SIZE: usize = 255;

fn to_fixed(n: &BigUint, size: usize) -> Vec<u8> {
	let bytes = n.to_bytes_be();
	let mut out = vec![0u8; size];
	out[size - bytes.len()..].copy_from_slice(&bytes);
	out
}

pub fn generate_keypair() -> ([u8; ELGAMAL_KEY_SIZE], [u8; ELGAMAL_KEY_SIZE]) {
	let mut rng = OsRng;
	let x = rng.gen_biguint_below(&DH_P);
	let y = DH_G.modpow(&x, &DH_P);
	let mut private = [0u8; ELGAMAL_KEY_SIZE];
	let mut public = [0u8; ELGAMAL_KEY_SIZE];
	private.copy_from_slice(&to_fixed(&x, ELGAMAL_KEY_SIZE));
	public.copy_from_slice(&to_fixed(&y, ELGAMAL_KEY_SIZE));
	(private, public)
}

/// Encrypts up to 222 bytes; shorter payloads are zero padded.
pub fn encrypt(public_key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
	if data.len() > ELGAMAL_MAX_PLAINTEXT {
		return Err(Error::OversizedMessage(data.len()));
	}
	let y = BigUint::from_bytes_be(public_key);
	let mut rng = OsRng;

	let mut block = [0u8; BLOCK_SIZE];
	block[0] = rng.gen_range(1..=u8::MAX);
	block[33..33 + data.len()].copy_from_slice(data);
	let checksum = Sha256::digest(&block[33..]);
	block[1..33].copy_from_slice(&checksum);

	let k = rng.gen_biguint_below(&DH_P);
	let a = DH_G.modpow(&k, &DH_P);
	let m = BigUint::from_bytes_be(&block);
	let b = (y.modpow(&k, &DH_P) * m) % &*DH_P;

	let mut out = Vec::with_capacity(ELGAMAL_CIPHERTEXT_SIZE);
	out.extend_from_slice(&to_fixed(&a, ELGAMAL_KEY_SIZE));
	out.extend_from_slice(&to_fixed(&b, ELGAMAL_KEY_SIZE));
	Ok(out)
}

/// Decrypts a 512-byte ciphertext, returning the padded 222-byte payload.
pub fn decrypt(private_key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
	if ciphertext.len() != ELGAMAL_CIPHERTEXT_SIZE {
		return Err(Error::Crypto("bad ElGamal ciphertext length".into()));
	}
	let x = BigUint::from_bytes_be(private_key);
	let a = BigUint::from_bytes_be(&ciphertext[..ELGAMAL_KEY_SIZE]);
	let b = BigUint::from_bytes_be(&ciphertext[ELGAMAL_KEY_SIZE..]);

	// m = b * (a^x)^-1 mod p; inverse via Fermat since p is prime
	let ax = a.modpow(&x, &DH_P);
	let inv = ax.modpow(&(&*DH_P - BigUint::from(2u32)), &DH_P);
	let m = (b * inv) % &*DH_P;

	let block = to_fixed(&m, BLOCK_SIZE);
	if block[0] == 0 {
		return Err(Error::Crypto("bad ElGamal block marker".into()));
	}
	if Sha256::digest(&block[33..])[..] != block[1..33] {
		return Err(Error::Crypto("ElGamal checksum mismatch".into()));
	}
	Ok(block[33..].to_vec())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip() {
		let (private, public) = generate_keypair();
		let plaintext = b"garlic clove payload";
		let ciphertext = encrypt(&public, plaintext).unwrap();
		assert_eq!(ciphertext.len(), ELGAMAL_CIPHERTEXT_SIZE);
		let decrypted = decrypt(&private, &ciphertext).unwrap();
		assert_eq!(&decrypted[..plaintext.len()], plaintext);
		assert!(decrypted[plaintext.len()..].iter().all(|&b| b == 0));
	}

	#[test]
	fn tampered_ciphertext_fails() {
		let (private, public) = generate_keypair();
		let mut ciphertext = encrypt(&public, b"data").unwrap();
		ciphertext[300] ^= 1;
		assert!(decrypt(&private, &ciphertext).is_err());
	}

	#[test]
	fn oversized_plaintext_rejected() {
		let (_, public) = generate_keypair();
		assert!(encrypt(&public, &[0u8; ELGAMAL_MAX_PLAINTEXT + 1]).is_err());
	}
}
