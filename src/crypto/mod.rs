//! Cryptographic primitives and the signing-key type dispatch.
//!
//! Signature types follow the network's registry. Ed25519 (the default for
//! new routers) and legacy DSA-SHA1 are fully implemented; the ECDSA and RSA
//! types parse and report correct lengths but cannot sign or verify here.

use ed25519_dalek::{Signer, Verifier};
use lazy_static::lazy_static;
use num_bigint::{BigUint, RandBigInt};
use num_traits::Zero;
use rand::rngs::OsRng;
use sha1::{Digest as Sha1Digest, Sha1};

use crate::error::Error;

pub mod aes;
pub mod checksum;
pub mod dh;
pub mod elgamal;
pub mod mac;

/// A 32-byte AES session key.
#[derive(Clone, Eq, PartialEq)]
pub struct SessionKey(pub [u8; 32]);

/// A 32-byte MAC key (intro key before a session exists).
#[derive(Clone, Eq, PartialEq)]
pub struct MacKey(pub [u8; 32]);

pub const SIGNING_KEY_TYPE_DSA_SHA1: u16 = 0;
pub const SIGNING_KEY_TYPE_ECDSA_SHA256_P256: u16 = 1;
pub const SIGNING_KEY_TYPE_ECDSA_SHA384_P384: u16 = 2;
pub const SIGNING_KEY_TYPE_ECDSA_SHA512_P521: u16 = 3;
pub const SIGNING_KEY_TYPE_RSA_SHA512_4096: u16 = 6;
pub const SIGNING_KEY_TYPE_EDDSA_SHA512_ED25519: u16 = 7;

pub const CRYPTO_KEY_TYPE_ELGAMAL: u16 = 0;

/// Default for newly generated routers.
pub const DEFAULT_ROUTER_SIGNING_KEY_TYPE: u16 = SIGNING_KEY_TYPE_EDDSA_SHA512_ED25519;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SigType {
	DsaSha1,
	EcdsaSha256P256,
	EcdsaSha384P384,
	EcdsaSha512P521,
	RsaSha512_4096,
	Ed25519,
}

impl SigType {
	pub fn from_code(code: u16) -> Option<SigType> {
		match code {
			SIGNING_KEY_TYPE_DSA_SHA1 => Some(SigType::DsaSha1),
			SIGNING_KEY_TYPE_ECDSA_SHA256_P256 => Some(SigType::EcdsaSha256P256),
			SIGNING_KEY_TYPE_ECDSA_SHA384_P384 => Some(SigType::EcdsaSha384P384),
			SIGNING_KEY_TYPE_ECDSA_SHA512_P521 => Some(SigType::EcdsaSha512P521),
			SIGNING_KEY_TYPE_RSA_SHA512_4096 => Some(SigType::RsaSha512_4096),
			SIGNING_KEY_TYPE_EDDSA_SHA512_ED25519 => Some(SigType::Ed25519),
			_ => None,
		}
	}

	pub fn code(&self) -> u16 {
		match self {
			SigType::DsaSha1 => SIGNING_KEY_TYPE_DSA_SHA1,
			SigType::EcdsaSha256P256 => SIGNING_KEY_TYPE_ECDSA_SHA256_P256,
			SigType::EcdsaSha384P384 => SIGNING_KEY_TYPE_ECDSA_SHA384_P384,
			SigType::EcdsaSha512P521 => SIGNING_KEY_TYPE_ECDSA_SHA512_P521,
			SigType::RsaSha512_4096 => SIGNING_KEY_TYPE_RSA_SHA512_4096,
			SigType::Ed25519 => SIGNING_KEY_TYPE_EDDSA_SHA512_ED25519,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			SigType::DsaSha1 => "DSA-SHA1",
			SigType::EcdsaSha256P256 => "ECDSA-SHA256-P256",
			SigType::EcdsaSha384P384 => "ECDSA-SHA384-P384",
			SigType::EcdsaSha512P521 => "ECDSA-SHA512-P521",
			SigType::RsaSha512_4096 => "RSA-SHA512-4096",
			SigType::Ed25519 => "EDDSA-SHA512-ED25519",
		}
	}

	pub fn pubkey_len(&self) -> usize {
		match self {
			SigType::DsaSha1 => 128,
			SigType::EcdsaSha256P256 => 64,
			SigType::EcdsaSha384P384 => 96,
			SigType::EcdsaSha512P521 => 132,
			SigType::RsaSha512_4096 => 512,
			SigType::Ed25519 => 32,
		}
	}

	pub fn privkey_len(&self) -> usize {
		match self {
			SigType::DsaSha1 => 20,
			SigType::EcdsaSha256P256 => 32,
			SigType::EcdsaSha384P384 => 48,
			SigType::EcdsaSha512P521 => 66,
			SigType::RsaSha512_4096 => 512,
			SigType::Ed25519 => 32,
		}
	}

	pub fn sig_len(&self) -> usize {
		match self {
			SigType::DsaSha1 => 40,
			SigType::EcdsaSha256P256 => 64,
			SigType::EcdsaSha384P384 => 96,
			SigType::EcdsaSha512P521 => 132,
			SigType::RsaSha512_4096 => 512,
			SigType::Ed25519 => 64,
		}
	}

	/// Random padding ahead of a key shorter than the legacy 128-byte slot.
	pub fn pad_len(&self) -> usize {
		128usize.saturating_sub(self.pubkey_len())
	}

	/// Key bytes that overflow the legacy slot into the key certificate.
	pub fn extra_len(&self) -> usize {
		self.pubkey_len().saturating_sub(128)
	}
}

lazy_static! {
	// Network-wide DSA-SHA1 domain parameters.
	static ref DSA_P: BigUint = BigUint::parse_bytes(
		b"9C05B2AA960D9B97B8931963C9CC9E8C3026E9B8ED92FAD0A69CC886D5BF8015\
		  FCADAE31A0AD18FAB3F01B00A358DE237655C4964AFAA2B337E96AD316B9FB1C\
		  C564B5AEC5B69A9FF6C3E4548707FEF8503D91DD8602E867E6D35D2235C1869C\
		  E2479C3B9D5401DE04E0727FB33D6511285D4CF29538D9E3B6051F5B22CC1C93",
		16
	).expect("valid prime literal");
	static ref DSA_Q: BigUint = BigUint::parse_bytes(
		b"A5DFC28FEF4CA1E286744CD8EED9D29D684046B7", 16
	).expect("valid prime literal");
	static ref DSA_G: BigUint = BigUint::parse_bytes(
		b"0C1F4D27D40093B429E962D7223824E0BBC47E7C832A39236FC683AF84889581\
		  075FF9082ED32353D4374D7301CDA1D23C431F4698599DDA02451824FF369752\
		  593647CC3DDC197DE985E43D136CDCFC6BD5409CD2F450821142A5E6F8EB1C3A\
		  B5D0484B8129FCF17BCE4F7F33321C3CB3DBB14A905E7B2B3E93BE4708CBCC82",
		16
	).expect("valid generator literal");
}

fn to_fixed(n: &BigUint, size: usize) -> Vec<u8> {
	let bytes = n.to_bytes_be();
	let mut out = vec![0u8; size];
	out[size - bytes.len()..].copy_from_slice(&bytes);
	out
}

fn modinv_prime(a: &BigUint, p: &BigUint) -> BigUint {
	a.modpow(&(p - BigUint::from(2u32)), p)
}

/// A verifying key of any recognized signature type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SigningPublicKey {
	sig_type: SigType,
	data: Vec<u8>,
}

impl SigningPublicKey {
	pub fn from_bytes(sig_type: SigType, data: &[u8]) -> Result<Self, Error> {
		if data.len() != sig_type.pubkey_len() {
			return Err(Error::Crypto(format!(
				"bad {} public key length {}",
				sig_type.name(),
				data.len()
			)));
		}
		Ok(SigningPublicKey {
			sig_type,
			data: data.to_vec(),
		})
	}

	pub fn sig_type(&self) -> SigType {
		self.sig_type
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.data
	}

	pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), Error> {
		if signature.len() != self.sig_type.sig_len() {
			return Err(Error::BadSignature);
		}
		match self.sig_type {
			SigType::DsaSha1 => dsa_verify(&self.data, message, signature),
			SigType::Ed25519 => {
				let key: [u8; 32] = self.data[..]
					.try_into()
					.map_err(|_| Error::BadSignature)?;
				let verifier = ed25519_dalek::VerifyingKey::from_bytes(&key)
					.map_err(|e| Error::Crypto(e.to_string()))?;
				let sig = ed25519_dalek::Signature::from_slice(signature)
					.map_err(|_| Error::BadSignature)?;
				verifier
					.verify(message, &sig)
					.map_err(|_| Error::BadSignature)
			}
			other => Err(Error::UnsupportedSigningKey(other.code())),
		}
	}
}

/// A signing key of any recognized signature type.
#[derive(Clone)]
pub struct SigningPrivateKey {
	sig_type: SigType,
	data: Vec<u8>,
}

impl std::fmt::Debug for SigningPrivateKey {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		// never print key material
		write!(f, "SigningPrivateKey({})", self.sig_type.name())
	}
}

impl SigningPrivateKey {
	pub fn from_bytes(sig_type: SigType, data: &[u8]) -> Result<Self, Error> {
		if data.len() != sig_type.privkey_len() {
			return Err(Error::Crypto(format!(
				"bad {} private key length {}",
				sig_type.name(),
				data.len()
			)));
		}
		Ok(SigningPrivateKey {
			sig_type,
			data: data.to_vec(),
		})
	}

	pub fn sig_type(&self) -> SigType {
		self.sig_type
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.data
	}

	pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
		match self.sig_type {
			SigType::DsaSha1 => dsa_sign(&self.data, message),
			SigType::Ed25519 => {
				let seed: [u8; 32] = self.data[..]
					.try_into()
					.map_err(|_| Error::Crypto("bad Ed25519 seed".into()))?;
				let signer = ed25519_dalek::SigningKey::from_bytes(&seed);
				Ok(signer.sign(message).to_bytes().to_vec())
			}
			other => Err(Error::UnsupportedSigningKey(other.code())),
		}
	}

	pub fn public(&self) -> Result<SigningPublicKey, Error> {
		match self.sig_type {
			SigType::DsaSha1 => {
				let x = BigUint::from_bytes_be(&self.data);
				let y = DSA_G.modpow(&x, &DSA_P);
				SigningPublicKey::from_bytes(SigType::DsaSha1, &to_fixed(&y, 128))
			}
			SigType::Ed25519 => {
				let seed: [u8; 32] = self.data[..]
					.try_into()
					.map_err(|_| Error::Crypto("bad Ed25519 seed".into()))?;
				let signer = ed25519_dalek::SigningKey::from_bytes(&seed);
				SigningPublicKey::from_bytes(SigType::Ed25519, signer.verifying_key().as_bytes())
			}
			other => Err(Error::UnsupportedSigningKey(other.code())),
		}
	}
}

/// Generates a fresh keypair of the given type.
pub fn generate_signing_keypair(
	sig_type: SigType,
) -> Result<(SigningPublicKey, SigningPrivateKey), Error> {
	match sig_type {
		SigType::DsaSha1 => {
			let mut rng = OsRng;
			let mut x = BigUint::zero();
			while x.is_zero() {
				x = rng.gen_biguint_below(&DSA_Q);
			}
			let private = SigningPrivateKey::from_bytes(sig_type, &to_fixed(&x, 20))?;
			let public = private.public()?;
			Ok((public, private))
		}
		SigType::Ed25519 => {
			let signer = ed25519_dalek::SigningKey::generate(&mut OsRng);
			let private = SigningPrivateKey::from_bytes(sig_type, signer.as_bytes())?;
			let public =
				SigningPublicKey::from_bytes(sig_type, signer.verifying_key().as_bytes())?;
			Ok((public, private))
		}
		other => Err(Error::UnsupportedSigningKey(other.code())),
	}
}

fn dsa_digest(message: &[u8]) -> BigUint {
	let mut hasher = Sha1::new();
	hasher.update(message);
	BigUint::from_bytes_be(&hasher.finalize())
}

fn dsa_sign(private: &[u8], message: &[u8]) -> Result<Vec<u8>, Error> {
	let x = BigUint::from_bytes_be(private);
	let h = dsa_digest(message);
	let mut rng = OsRng;
	loop {
		let k = rng.gen_biguint_below(&DSA_Q);
		if k.is_zero() {
			continue;
		}
		let r = DSA_G.modpow(&k, &DSA_P) % &*DSA_Q;
		if r.is_zero() {
			continue;
		}
		let kinv = modinv_prime(&k, &DSA_Q);
		let s = (kinv * (&h + &x * &r)) % &*DSA_Q;
		if s.is_zero() {
			continue;
		}
		let mut sig = to_fixed(&r, 20);
		sig.extend_from_slice(&to_fixed(&s, 20));
		return Ok(sig);
	}
}

fn dsa_verify(public: &[u8], message: &[u8], signature: &[u8]) -> Result<(), Error> {
	let y = BigUint::from_bytes_be(public);
	let r = BigUint::from_bytes_be(&signature[..20]);
	let s = BigUint::from_bytes_be(&signature[20..40]);
	if r.is_zero() || s.is_zero() || r >= *DSA_Q || s >= *DSA_Q {
		return Err(Error::BadSignature);
	}
	let h = dsa_digest(message);
	let w = modinv_prime(&s, &DSA_Q);
	let u1 = (&h * &w) % &*DSA_Q;
	let u2 = (&r * &w) % &*DSA_Q;
	let v = (DSA_G.modpow(&u1, &DSA_P) * y.modpow(&u2, &DSA_P)) % &*DSA_P % &*DSA_Q;
	if v == r {
		Ok(())
	} else {
		Err(Error::BadSignature)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sign_verify_mismatch(sig_type: SigType) {
		let (pub1, priv1) = generate_signing_keypair(sig_type).unwrap();
		let (pub2, _) = generate_signing_keypair(sig_type).unwrap();
		let message = b"the quick brown fox";
		let sig = priv1.sign(message).unwrap();
		assert_eq!(sig.len(), sig_type.sig_len());
		assert!(pub1.verify(message, &sig).is_ok());
		assert!(pub2.verify(message, &sig).is_err());
		assert!(pub1.verify(b"the quick brown fax", &sig).is_err());
	}

	#[test]
	fn ed25519_sign_verify() {
		sign_verify_mismatch(SigType::Ed25519);
	}

	#[test]
	fn dsa_sign_verify() {
		sign_verify_mismatch(SigType::DsaSha1);
	}

	#[test]
	fn unsupported_types_are_typed_errors() {
		assert_eq!(
			generate_signing_keypair(SigType::EcdsaSha256P256).unwrap_err(),
			Error::UnsupportedSigningKey(1)
		);
	}

	#[test]
	fn type_codes_round_trip() {
		for code in [0u16, 1, 2, 3, 6, 7] {
			let t = SigType::from_code(code).unwrap();
			assert_eq!(t.code(), code);
		}
		assert!(SigType::from_code(4).is_none());
		assert!(SigType::from_code(5).is_none());
	}

	#[test]
	fn slot_arithmetic() {
		assert_eq!(SigType::Ed25519.pad_len(), 96);
		assert_eq!(SigType::Ed25519.extra_len(), 0);
		assert_eq!(SigType::EcdsaSha512P521.pad_len(), 0);
		assert_eq!(SigType::EcdsaSha512P521.extra_len(), 4);
		assert_eq!(SigType::RsaSha512_4096.extra_len(), 384);
		assert_eq!(SigType::DsaSha1.pad_len(), 0);
	}
}
