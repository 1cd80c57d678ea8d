//! Router identities and their private key containers.
//!
//! An identity is the 387-byte legacy layout (256-byte ElGamal encryption
//! key, 128-byte signing-key slot, 3-byte null certificate) extended by a key
//! certificate when the signing algorithm does not fit the legacy slot. The
//! identity hash is SHA-256 over the full serialized form.

use nom::Err;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::crypto::{
	self, elgamal, SigType, SigningPrivateKey, SigningPublicKey, DEFAULT_ROUTER_SIGNING_KEY_TYPE,
};
use crate::error::Error;

use super::{frame, Hash};

pub const IDENTITY_BASE_SIZE: usize = 387;
pub const CERTIFICATE_TYPE_NULL: u8 = 0;
pub const CERTIFICATE_TYPE_KEY: u8 = 5;

/// A router's self-describing public-key package.
#[derive(Clone, Eq, PartialEq)]
pub struct RouterIdentity {
	pub(crate) public_key: Box<[u8; 256]>,
	pub(crate) padding: Vec<u8>,
	pub(crate) signing_key: SigningPublicKey,
	hash: Hash,
}

impl RouterIdentity {
	pub(crate) fn from_parts(
		public_key: Box<[u8; 256]>,
		padding: Vec<u8>,
		signing_key: SigningPublicKey,
	) -> Self {
		let mut identity = RouterIdentity {
			public_key,
			padding,
			signing_key,
			hash: Hash::default(),
		};
		identity.hash = Hash::digest(&identity.to_bytes());
		identity
	}

	pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
		match frame::router_identity(data) {
			Ok((_, identity)) => Ok(identity),
			Err(Err::Incomplete(_)) => Err(Error::Truncated("router identity")),
			Err(_) => Err(Error::MessageParsing),
		}
	}

	/// Parses an identity and returns how many bytes it consumed.
	pub fn from_bytes_prefix(data: &[u8]) -> Result<(Self, usize), Error> {
		match frame::router_identity(data) {
			Ok((rest, identity)) => Ok((identity, data.len() - rest.len())),
			Err(Err::Incomplete(_)) => Err(Error::Truncated("router identity")),
			Err(_) => Err(Error::MessageParsing),
		}
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		frame::gen_router_identity(self)
	}

	/// Serialized length: 387 plus any key-certificate excess.
	pub fn len(&self) -> usize {
		IDENTITY_BASE_SIZE + self.cert_extra_len()
	}

	fn cert_extra_len(&self) -> usize {
		match self.cert_type() {
			CERTIFICATE_TYPE_NULL => 0,
			_ => 4 + self.signing_key.sig_type().extra_len(),
		}
	}

	pub fn cert_type(&self) -> u8 {
		match self.signing_key.sig_type() {
			SigType::DsaSha1 => CERTIFICATE_TYPE_NULL,
			_ => CERTIFICATE_TYPE_KEY,
		}
	}

	pub fn sig_type(&self) -> SigType {
		self.signing_key.sig_type()
	}

	pub fn signature_len(&self) -> usize {
		self.signing_key.sig_type().sig_len()
	}

	pub fn hash(&self) -> Hash {
		self.hash
	}

	/// The 256-byte ElGamal public encryption key.
	pub fn encryption_key(&self) -> &[u8; 256] {
		&self.public_key
	}

	pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), Error> {
		self.signing_key.verify(message, signature)
	}

	pub fn to_base64(&self) -> String {
		super::BASE64_I2P.encode(&self.to_bytes())
	}

	pub fn from_base64(s: &str) -> Result<Self, Error> {
		let bytes = super::BASE64_I2P
			.decode(s.as_bytes())
			.map_err(|e| Error::Crypto(e.to_string()))?;
		Self::from_bytes(&bytes)
	}
}

impl fmt::Debug for RouterIdentity {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("RouterIdentity")
			.field("hash", &self.hash)
			.field("sig_type", &self.signing_key.sig_type())
			.finish()
	}
}

/// An identity together with its private halves.
#[derive(Clone)]
pub struct PrivateKeys {
	pub identity: RouterIdentity,
	pub(crate) private_key: Box<[u8; 256]>,
	pub(crate) signing_private_key: SigningPrivateKey,
}

impl PrivateKeys {
	/// Generates a fresh keypair of the given signing type.
	pub fn random(sig_type: SigType) -> Result<Self, Error> {
		let (signing_public, signing_private) = crypto::generate_signing_keypair(sig_type)?;
		let (enc_private, enc_public) = elgamal::generate_keypair();

		let mut padding = vec![0u8; sig_type.pad_len()];
		OsRng.fill_bytes(&mut padding);

		let identity =
			RouterIdentity::from_parts(Box::new(enc_public), padding, signing_public);
		Ok(PrivateKeys {
			identity,
			private_key: Box::new(enc_private),
			signing_private_key: signing_private,
		})
	}

	/// Generates keys of the default type for new routers.
	pub fn random_default() -> Result<Self, Error> {
		Self::random(
			SigType::from_code(DEFAULT_ROUTER_SIGNING_KEY_TYPE).expect("default type is known"),
		)
	}

	pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
		self.signing_private_key.sign(message)
	}

	pub fn hash(&self) -> Hash {
		self.identity.hash()
	}

	/// The ElGamal private key matching the identity's encryption key.
	pub fn decryption_key(&self) -> &[u8; 256] {
		&self.private_key
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		frame::gen_private_keys(self)
	}

	pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
		match frame::private_keys(data) {
			Ok((_, keys)) => Ok(keys),
			Err(Err::Incomplete(_)) => Err(Error::Truncated("private keys")),
			Err(_) => Err(Error::MessageParsing),
		}
	}

	pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
		let mut file = File::create(path)?;
		file.write_all(&self.to_bytes())?;
		Ok(())
	}

	pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
		let mut data = Vec::new();
		File::open(path)?.read_to_end(&mut data)?;
		Self::from_bytes(&data)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identity_round_trip_ed25519() {
		let keys = PrivateKeys::random(SigType::Ed25519).unwrap();
		let bytes = keys.identity.to_bytes();
		assert_eq!(bytes.len(), IDENTITY_BASE_SIZE + 4);
		let parsed = RouterIdentity::from_bytes(&bytes).unwrap();
		assert_eq!(parsed, keys.identity);
		assert_eq!(parsed.hash(), keys.identity.hash());
		assert_eq!(parsed.to_bytes(), bytes);
	}

	#[test]
	fn identity_round_trip_dsa() {
		let keys = PrivateKeys::random(SigType::DsaSha1).unwrap();
		let bytes = keys.identity.to_bytes();
		assert_eq!(bytes.len(), IDENTITY_BASE_SIZE);
		assert_eq!(keys.identity.cert_type(), CERTIFICATE_TYPE_NULL);
		let parsed = RouterIdentity::from_bytes(&bytes).unwrap();
		assert_eq!(parsed, keys.identity);
	}

	#[test]
	fn signatures_verify_under_identity() {
		let keys = PrivateKeys::random(SigType::Ed25519).unwrap();
		let message = b"signed body";
		let sig = keys.sign(message).unwrap();
		assert!(keys.identity.verify(message, &sig).is_ok());
		assert!(keys.identity.verify(b"other body", &sig).is_err());

		let strangers = PrivateKeys::random(SigType::Ed25519).unwrap();
		assert!(strangers.identity.verify(message, &sig).is_err());
	}

	#[test]
	fn private_keys_round_trip() {
		let keys = PrivateKeys::random(SigType::Ed25519).unwrap();
		let bytes = keys.to_bytes();
		let parsed = PrivateKeys::from_bytes(&bytes).unwrap();
		assert_eq!(parsed.identity, keys.identity);
		let sig = parsed.sign(b"still works").unwrap();
		assert!(keys.identity.verify(b"still works", &sig).is_ok());
	}

	#[test]
	fn base64_identity_round_trip() {
		let keys = PrivateKeys::random(SigType::Ed25519).unwrap();
		let encoded = keys.identity.to_base64();
		let parsed = RouterIdentity::from_base64(&encoded).unwrap();
		assert_eq!(parsed, keys.identity);
	}
}
