//! Lease sets: a destination's published inbound tunnel entry points.

use nom::Err;

use crate::error::Error;

use super::identity::RouterIdentity;
use super::{frame, milliseconds_since_epoch, Date, Hash};

pub const MAX_LEASES: usize = 16;

/// Authorization for one tunnel to receive messages for a destination.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Lease {
	pub tunnel_gateway: Hash,
	pub tunnel_id: u32,
	pub end_date: Date,
}

impl Lease {
	pub fn is_expired(&self) -> bool {
		self.end_date.0 <= milliseconds_since_epoch()
	}
}

/// The currently authorized leases for a destination plus the key garlic
/// messages can be encrypted to. Keyed in the database under the SHA-256 of
/// the destination.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaseSet {
	pub destination: RouterIdentity,
	pub encryption_key: Box<[u8; 256]>,
	pub(crate) revocation_key: Vec<u8>,
	pub leases: Vec<Lease>,
	pub(crate) signature: Vec<u8>,
}

impl LeaseSet {
	pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
		match frame::lease_set(data) {
			Ok((_, ls)) => Ok(ls),
			Err(Err::Incomplete(_)) => Err(Error::Truncated("lease set")),
			Err(_) => Err(Error::MessageParsing),
		}
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		frame::gen_lease_set(self)
	}

	pub fn hash(&self) -> Hash {
		self.destination.hash()
	}

	pub fn verify(&self) -> Result<(), Error> {
		let body = frame::gen_lease_set_minus_sig(self);
		self.destination.verify(&body, &self.signature)
	}

	pub fn has_non_expired_leases(&self) -> bool {
		self.leases.iter().any(|l| !l.is_expired())
	}

	/// Valid means the signature verifies and at least one lease is current.
	pub fn is_valid(&self) -> bool {
		self.verify().is_ok() && self.has_non_expired_leases()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::SigType;
	use crate::data::PrivateKeys;

	fn build_lease_set(end_offset_ms: i64) -> LeaseSet {
		let keys = PrivateKeys::random(SigType::Ed25519).unwrap();
		let end = (milliseconds_since_epoch() as i64 + end_offset_ms) as u64;
		let mut ls = LeaseSet {
			destination: keys.identity.clone(),
			encryption_key: Box::new([3u8; 256]),
			revocation_key: vec![0u8; SigType::Ed25519.pubkey_len()],
			leases: vec![Lease {
				tunnel_gateway: Hash::digest(b"gateway"),
				tunnel_id: 100,
				end_date: Date(end),
			}],
			signature: Vec::new(),
		};
		let body = frame::gen_lease_set_minus_sig(&ls);
		ls.signature = keys.sign(&body).unwrap();
		ls
	}

	#[test]
	fn round_trip_and_verify() {
		let ls = build_lease_set(60_000);
		let parsed = LeaseSet::from_bytes(&ls.to_bytes()).unwrap();
		assert_eq!(parsed, ls);
		assert!(parsed.is_valid());
	}

	#[test]
	fn expired_leases_invalidate() {
		let ls = build_lease_set(-60_000);
		assert!(ls.verify().is_ok());
		assert!(!ls.has_non_expired_leases());
		assert!(!ls.is_valid());
	}

	#[test]
	fn tampered_lease_set_fails() {
		let ls = build_lease_set(60_000);
		let mut bytes = ls.to_bytes();
		let flip = bytes.len() - 80;
		bytes[flip] ^= 1;
		let parsed = LeaseSet::from_bytes(&bytes).unwrap();
		assert!(parsed.verify().is_err());
	}
}
