//! Diffie-Hellman 2048 (RFC 3526 group 14) for transport session agreement.

use lazy_static::lazy_static;
use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::rngs::OsRng;

use crate::error::Error;

use super::SessionKey;

pub const DH_KEY_SIZE: usize = 256;

lazy_static! {
	/// 2048-bit MODP group prime (RFC 3526, group 14).
	pub static ref DH_P: BigUint = BigUint::parse_bytes(
		b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08\
		  8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B\
		  302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9\
		  A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE6\
		  49286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8\
		  FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D\
		  670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C\
		  180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
		  3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFF\
		  FFFFFFFF",
		16
	).expect("valid prime literal");
	pub static ref DH_G: BigUint = BigUint::from(2u32);
}

fn to_fixed_bytes(n: &BigUint) -> [u8; DH_KEY_SIZE] {
	let bytes = n.to_bytes_be();
	let mut out = [0u8; DH_KEY_SIZE];
	out[DH_KEY_SIZE - bytes.len()..].copy_from_slice(&bytes);
	out
}

/// A DH keypair. Move-only: the pool hands these out and takes them back.
pub struct DhKeys {
	private_key: BigUint,
	pub public_key: [u8; DH_KEY_SIZE],
}

impl DhKeys {
	pub fn generate() -> Self {
		let mut rng = OsRng;
		let private_key = rng.gen_biguint_below(&DH_P);
		let public = DH_G.modpow(&private_key, &DH_P);
		DhKeys {
			private_key,
			public_key: to_fixed_bytes(&public),
		}
	}

	/// Computes the shared secret against the peer's public value.
	///
	/// Degenerate peer values (0, 1, p-1, >= p) are a crypto failure: the
	/// session must terminate without retrying this keypair.
	pub fn agree(&self, peer_public: &[u8]) -> Result<[u8; DH_KEY_SIZE], Error> {
		if peer_public.len() != DH_KEY_SIZE {
			return Err(Error::Crypto("bad DH public key length".into()));
		}
		let peer = BigUint::from_bytes_be(peer_public);
		let p_minus_one = &*DH_P - BigUint::one();
		if peer.is_zero() || peer.is_one() || peer >= p_minus_one {
			return Err(Error::Crypto("degenerate DH public key".into()));
		}
		let shared = peer.modpow(&self.private_key, &DH_P);
		Ok(to_fixed_bytes(&shared))
	}
}

/// Derives the 32-byte AES session key from a DH shared secret.
///
/// If the high bit of the first byte is set, a zero byte is prepended and 31
/// bytes taken; if the first byte is non-zero the leading 32 bytes are used
/// directly; otherwise leading zero bytes are skipped first. All-zero prefixes
/// longer than 32 bytes abort the agreement.
pub fn derive_session_key(shared: &[u8; DH_KEY_SIZE]) -> Result<SessionKey, Error> {
	let mut key = [0u8; 32];
	if shared[0] & 0x80 != 0 {
		key[1..].copy_from_slice(&shared[..31]);
	} else if shared[0] != 0 {
		key.copy_from_slice(&shared[..32]);
	} else {
		let start = match shared.iter().position(|&b| b != 0) {
			Some(pos) if pos <= 32 && pos + 32 <= DH_KEY_SIZE => pos,
			_ => return Err(Error::Crypto("shared secret has an all-zero prefix".into())),
		};
		key.copy_from_slice(&shared[start..start + 32]);
	}
	Ok(SessionKey(key))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn agreement_matches() {
		let a = DhKeys::generate();
		let b = DhKeys::generate();
		let s1 = a.agree(&b.public_key).unwrap();
		let s2 = b.agree(&a.public_key).unwrap();
		assert_eq!(s1[..], s2[..]);
		assert_eq!(
			derive_session_key(&s1).unwrap().0,
			derive_session_key(&s2).unwrap().0
		);
	}

	#[test]
	fn rejects_degenerate_keys() {
		let a = DhKeys::generate();
		assert!(a.agree(&[0u8; DH_KEY_SIZE]).is_err());
		let mut one = [0u8; DH_KEY_SIZE];
		one[DH_KEY_SIZE - 1] = 1;
		assert!(a.agree(&one).is_err());
		assert!(a.agree(&to_fixed_bytes(&(&*DH_P - BigUint::one()))).is_err());
	}

	#[test]
	fn key_derivation_follows_first_byte() {
		let mut shared = [0u8; DH_KEY_SIZE];
		shared[0] = 0x81;
		for (i, b) in shared.iter_mut().enumerate().skip(1) {
			*b = i as u8;
		}
		let key = derive_session_key(&shared).unwrap();
		assert_eq!(key.0[0], 0);
		assert_eq!(key.0[1], 0x81);

		shared[0] = 0x42;
		let key = derive_session_key(&shared).unwrap();
		assert_eq!(key.0[..], shared[..32]);

		shared[0] = 0;
		shared[1] = 0;
		let key = derive_session_key(&shared).unwrap();
		assert_eq!(key.0[..], shared[2..34]);
	}
}
