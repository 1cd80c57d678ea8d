//! HMAC-MD5 packet authentication for the datagram transport.
//!
//! This is the network's variant, not RFC 2104: the key is 32 bytes, the
//! pads (0x36/0x5C) fill the 64-byte block, and the outer hash runs over
//! okeypad, the 16-byte inner digest and 16 zero bytes (the inner hash is
//! assumed to be 32 bytes wide on the wire), 96 bytes in total.

use md5::{Digest, Md5};

use super::MacKey;

pub const MAC_SIZE: usize = 16;

const BLOCK_SIZE: usize = 64;
const IPAD: u8 = 0x36;
const OPAD: u8 = 0x5C;

pub fn hmac_md5(key: &MacKey, data: &[u8]) -> [u8; MAC_SIZE] {
	let mut ikeypad = [IPAD; BLOCK_SIZE];
	let mut okeypad = [OPAD; BLOCK_SIZE];
	for (i, byte) in key.0.iter().enumerate() {
		ikeypad[i] ^= byte;
		okeypad[i] ^= byte;
	}

	let mut inner = Md5::new();
	inner.update(ikeypad);
	inner.update(data);
	let inner_digest = inner.finalize();

	let mut outer = Md5::new();
	outer.update(okeypad);
	outer.update(inner_digest);
	// widen the inner digest to 32 bytes with zeros
	outer.update([0u8; 16]);
	let digest = outer.finalize();

	let mut out = [0u8; MAC_SIZE];
	out.copy_from_slice(&digest);
	out
}

pub fn hmac_md5_verify(key: &MacKey, data: &[u8], expected: &[u8]) -> bool {
	expected.len() == MAC_SIZE && hmac_md5(key, data) == expected[..MAC_SIZE]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stable_and_key_dependent() {
		let k1 = MacKey([0x0b; 32]);
		let k2 = MacKey([0x0c; 32]);
		let m1 = hmac_md5(&k1, b"Hi There");
		assert_eq!(m1, hmac_md5(&k1, b"Hi There"));
		assert_ne!(m1, hmac_md5(&k2, b"Hi There"));
		assert_ne!(m1, hmac_md5(&k1, b"Hi Thera"));
	}

	#[test]
	fn matches_the_widened_outer_block() {
		// same digest as hashing the assembled 96-byte outer block directly
		let key = MacKey([0x11; 32]);
		let data = b"ssu packet body";

		let mut ikeypad = [IPAD; BLOCK_SIZE];
		let mut okeypad = [OPAD; BLOCK_SIZE];
		for (i, byte) in key.0.iter().enumerate() {
			ikeypad[i] ^= byte;
			okeypad[i] ^= byte;
		}
		let mut inner_block = Vec::new();
		inner_block.extend_from_slice(&ikeypad);
		inner_block.extend_from_slice(data);
		let inner_digest = Md5::digest(&inner_block);

		let mut outer_block = [0u8; 96];
		outer_block[..64].copy_from_slice(&okeypad);
		outer_block[64..80].copy_from_slice(&inner_digest);
		let expected = Md5::digest(outer_block);

		assert_eq!(hmac_md5(&key, data)[..], expected[..]);
	}

	#[test]
	fn verify_rejects_truncation() {
		let key = MacKey([7; 32]);
		let mac = hmac_md5(&key, b"payload");
		assert!(hmac_md5_verify(&key, b"payload", &mac));
		assert!(!hmac_md5_verify(&key, b"payload", &mac[..15]));
	}
}
