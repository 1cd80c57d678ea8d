//! Wire codecs for the common data structures.
//!
//! Parsers are nom combinators over byte slices; writers build `Vec<u8>`
//! with the exact layouts the network expects. `gen_x` is the inverse of
//! `x` for every structure here.

use byteorder::{BigEndian, WriteBytesExt};
use nom::bytes::complete::{tag, take};
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::{be_u16, be_u32, be_u64, be_u8};
use nom::{Err, IResult};

use crate::crypto::{SigType, SigningPublicKey};

use super::identity::{
	PrivateKeys, RouterIdentity, CERTIFICATE_TYPE_KEY, CERTIFICATE_TYPE_NULL,
};
use super::lease_set::{Lease, LeaseSet};
use super::router_info::{RouterAddress, RouterInfo, TransportStyle};
use super::{Date, Hash, Mapping};

fn parse_failure(input: &[u8]) -> Err<NomError<&[u8]>> {
	Err::Error(NomError::new(input, ErrorKind::Verify))
}

//
// Strings and mappings
//

pub fn i2p_string(input: &[u8]) -> IResult<&[u8], String> {
	let (input, len) = be_u8(input)?;
	let (input, bytes) = take(len)(input)?;
	match String::from_utf8(bytes.to_vec()) {
		Ok(s) => Ok((input, s)),
		Err(_) => Err(parse_failure(input)),
	}
}

pub fn gen_i2p_string(out: &mut Vec<u8>, s: &str) {
	debug_assert!(s.len() <= 255);
	out.push(s.len() as u8);
	out.extend_from_slice(s.as_bytes());
}

pub fn mapping(input: &[u8]) -> IResult<&[u8], Mapping> {
	let (rest, size) = be_u16(input)?;
	let (rest, mut block) = take(size)(rest)?;
	let mut map = Mapping::new();
	while !block.is_empty() {
		let (b, key) = i2p_string(block)?;
		let (b, _) = tag(b"=")(b)?;
		let (b, value) = i2p_string(b)?;
		let (b, _) = tag(b";")(b)?;
		map.insert(&key, &value);
		block = b;
	}
	Ok((rest, map))
}

pub fn gen_mapping(out: &mut Vec<u8>, map: &Mapping) {
	let mut inner = Vec::new();
	for (key, value) in &map.0 {
		gen_i2p_string(&mut inner, key);
		inner.push(b'=');
		gen_i2p_string(&mut inner, value);
		inner.push(b';');
	}
	out.write_u16::<BigEndian>(inner.len() as u16).unwrap();
	out.extend_from_slice(&inner);
}

//
// Router identity
//

pub fn router_identity(input: &[u8]) -> IResult<&[u8], RouterIdentity> {
	let (input, public_key) = take(256usize)(input)?;
	let (input, slot) = take(128usize)(input)?;
	let (input, cert_type) = be_u8(input)?;
	let (input, cert_len) = be_u16(input)?;
	let (input, cert_payload) = take(cert_len)(input)?;

	let mut enc_key = Box::new([0u8; 256]);
	enc_key.copy_from_slice(public_key);

	match cert_type {
		CERTIFICATE_TYPE_NULL => {
			if cert_len != 0 {
				return Err(parse_failure(input));
			}
			let signing_key = SigningPublicKey::from_bytes(SigType::DsaSha1, slot)
				.map_err(|_| parse_failure(input))?;
			Ok((
				input,
				RouterIdentity::from_parts(enc_key, Vec::new(), signing_key),
			))
		}
		CERTIFICATE_TYPE_KEY => {
			if cert_payload.len() < 4 {
				return Err(parse_failure(input));
			}
			let sig_code = u16::from_be_bytes([cert_payload[0], cert_payload[1]]);
			let sig_type = match SigType::from_code(sig_code) {
				Some(t) => t,
				None => return Err(parse_failure(input)),
			};
			let extra = &cert_payload[4..];
			if extra.len() != sig_type.extra_len() {
				return Err(parse_failure(input));
			}
			let pad_len = sig_type.pad_len();
			let mut key_bytes = Vec::with_capacity(sig_type.pubkey_len());
			key_bytes.extend_from_slice(&slot[pad_len..]);
			key_bytes.extend_from_slice(extra);
			let signing_key = SigningPublicKey::from_bytes(sig_type, &key_bytes)
				.map_err(|_| parse_failure(input))?;
			Ok((
				input,
				RouterIdentity::from_parts(enc_key, slot[..pad_len].to_vec(), signing_key),
			))
		}
		_ => Err(parse_failure(input)),
	}
}

pub fn gen_router_identity(identity: &RouterIdentity) -> Vec<u8> {
	let sig_type = identity.signing_key.sig_type();
	let mut out = Vec::with_capacity(identity.len());
	out.extend_from_slice(&identity.public_key[..]);
	// 128-byte legacy slot: padding then as much of the key as fits
	out.extend_from_slice(&identity.padding);
	let key = identity.signing_key.as_bytes();
	let in_slot = key.len().min(128 - identity.padding.len());
	out.extend_from_slice(&key[..in_slot]);
	match identity.cert_type() {
		CERTIFICATE_TYPE_NULL => {
			out.push(CERTIFICATE_TYPE_NULL);
			out.write_u16::<BigEndian>(0).unwrap();
		}
		_ => {
			out.push(CERTIFICATE_TYPE_KEY);
			out.write_u16::<BigEndian>((4 + sig_type.extra_len()) as u16)
				.unwrap();
			out.write_u16::<BigEndian>(sig_type.code()).unwrap();
			out.write_u16::<BigEndian>(crate::crypto::CRYPTO_KEY_TYPE_ELGAMAL)
				.unwrap();
			out.extend_from_slice(&key[in_slot..]);
		}
	}
	out
}

//
// Private keys
//

pub fn private_keys(input: &[u8]) -> IResult<&[u8], PrivateKeys> {
	let (input, identity) = router_identity(input)?;
	let (input, enc_private) = take(256usize)(input)?;
	let (input, sig_private) = take(identity.sig_type().privkey_len())(input)?;

	let mut private_key = Box::new([0u8; 256]);
	private_key.copy_from_slice(enc_private);
	let signing_private_key =
		crate::crypto::SigningPrivateKey::from_bytes(identity.sig_type(), sig_private)
			.map_err(|_| parse_failure(input))?;
	Ok((
		input,
		PrivateKeys {
			identity,
			private_key,
			signing_private_key,
		},
	))
}

pub fn gen_private_keys(keys: &PrivateKeys) -> Vec<u8> {
	let mut out = gen_router_identity(&keys.identity);
	out.extend_from_slice(&keys.private_key[..]);
	out.extend_from_slice(keys.signing_private_key.as_bytes());
	out
}

//
// Router addresses and router info
//

pub fn router_address(input: &[u8]) -> IResult<&[u8], RouterAddress> {
	let (input, cost) = be_u8(input)?;
	let (input, expiration) = be_u64(input)?;
	let (input, style) = i2p_string(input)?;
	let (input, options) = mapping(input)?;
	Ok((
		input,
		RouterAddress {
			cost,
			expiration: Date(expiration),
			style: TransportStyle::from_str(&style),
			options,
		},
	))
}

pub fn gen_router_address(out: &mut Vec<u8>, address: &RouterAddress) {
	out.push(address.cost);
	out.write_u64::<BigEndian>(address.expiration.0).unwrap();
	gen_i2p_string(out, address.style.as_str());
	gen_mapping(out, &address.options);
}

pub fn router_info(input: &[u8]) -> IResult<&[u8], RouterInfo> {
	let (input, identity) = router_identity(input)?;
	let (input, published) = be_u64(input)?;
	let (input, address_count) = be_u8(input)?;
	let mut addresses = Vec::with_capacity(address_count as usize);
	let mut rest = input;
	for _ in 0..address_count {
		let (r, address) = router_address(rest)?;
		addresses.push(address);
		rest = r;
	}
	// peer count, always zero in practice; skip any carried hashes
	let (rest, peer_count) = be_u8(rest)?;
	let (rest, _) = take(32usize * peer_count as usize)(rest)?;
	let (rest, options) = mapping(rest)?;
	let (rest, signature) = take(identity.signature_len())(rest)?;
	let signature = signature.to_vec();
	Ok((
		rest,
		RouterInfo::from_parts(identity, Date(published), addresses, options, Some(signature)),
	))
}

/// Serializes everything up to but not including the signature.
pub fn gen_router_info_minus_sig(info: &RouterInfo) -> Vec<u8> {
	let mut out = gen_router_identity(&info.identity);
	out.write_u64::<BigEndian>(info.published.0).unwrap();
	out.push(info.addresses.len() as u8);
	for address in &info.addresses {
		gen_router_address(&mut out, address);
	}
	out.push(0); // peer count
	gen_mapping(&mut out, &info.options);
	out
}

pub fn gen_router_info(info: &RouterInfo) -> Option<Vec<u8>> {
	let mut out = gen_router_info_minus_sig(info);
	out.extend_from_slice(info.signature.as_ref()?);
	Some(out)
}

//
// Lease sets
//

pub fn lease_set(input: &[u8]) -> IResult<&[u8], LeaseSet> {
	let (input, destination) = router_identity(input)?;
	let (input, enc_key) = take(256usize)(input)?;
	let (input, revocation_key) = take(destination.sig_type().pubkey_len())(input)?;
	let (input, lease_count) = be_u8(input)?;
	if lease_count > 16 {
		return Err(parse_failure(input));
	}
	let mut leases = Vec::with_capacity(lease_count as usize);
	let mut rest = input;
	for _ in 0..lease_count {
		let (r, gateway) = take(32usize)(rest)?;
		let (r, tunnel_id) = be_u32(r)?;
		let (r, end_date) = be_u64(r)?;
		leases.push(Lease {
			tunnel_gateway: Hash::from_slice(gateway).expect("32 bytes"),
			tunnel_id,
			end_date: Date(end_date),
		});
		rest = r;
	}
	let (rest, signature) = take(destination.signature_len())(rest)?;

	let mut encryption_key = Box::new([0u8; 256]);
	encryption_key.copy_from_slice(enc_key);
	Ok((
		rest,
		LeaseSet {
			destination,
			encryption_key,
			revocation_key: revocation_key.to_vec(),
			leases,
			signature: signature.to_vec(),
		},
	))
}

pub fn gen_lease_set_minus_sig(ls: &LeaseSet) -> Vec<u8> {
	let mut out = gen_router_identity(&ls.destination);
	out.extend_from_slice(&ls.encryption_key[..]);
	out.extend_from_slice(&ls.revocation_key);
	out.push(ls.leases.len() as u8);
	for lease in &ls.leases {
		out.extend_from_slice(&lease.tunnel_gateway.0);
		out.write_u32::<BigEndian>(lease.tunnel_id).unwrap();
		out.write_u64::<BigEndian>(lease.end_date.0).unwrap();
	}
	out
}

pub fn gen_lease_set(ls: &LeaseSet) -> Vec<u8> {
	let mut out = gen_lease_set_minus_sig(ls);
	out.extend_from_slice(&ls.signature);
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn string_round_trip() {
		let mut buf = Vec::new();
		gen_i2p_string(&mut buf, "host");
		let (rest, s) = i2p_string(&buf).unwrap();
		assert!(rest.is_empty());
		assert_eq!(s, "host");
	}

	#[test]
	fn mapping_round_trip_is_ordered() {
		let mut map = Mapping::new();
		map.insert("port", "12345");
		map.insert("host", "127.0.0.1");
		map.insert("caps", "fR");
		let mut buf = Vec::new();
		gen_mapping(&mut buf, &map);
		// BTreeMap iteration puts caps first regardless of insertion order
		assert_eq!(&buf[2..], b"\x04caps=\x02fR;\x04host=\x09127.0.0.1;\x04port=\x0512345;");
		let (rest, parsed) = mapping(&buf).unwrap();
		assert!(rest.is_empty());
		assert_eq!(parsed, map);
	}

	#[test]
	fn empty_mapping() {
		let mut buf = Vec::new();
		gen_mapping(&mut buf, &Mapping::new());
		assert_eq!(buf, vec![0, 0]);
		let (_, parsed) = mapping(&buf).unwrap();
		assert_eq!(parsed, Mapping::new());
	}

	#[test]
	fn truncated_mapping_is_error() {
		assert!(mapping(&[0x00]).is_err());
		assert!(mapping(&[0x00, 0x10, 0x01]).is_err());
	}

	#[test]
	fn malformed_certificate_rejected() {
		let mut buf = vec![0u8; 384];
		buf.push(9); // unknown certificate type
		buf.extend_from_slice(&[0, 0]);
		assert!(router_identity(&buf).is_err());
	}
}
