//! Signed router records: transport addresses, capabilities and properties.

use log::{error, warn};
use nom::Err;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;

use super::identity::{PrivateKeys, RouterIdentity};
use super::{frame, Date, Hash, Mapping};

pub const CAPS_FLAG_FLOODFILL: char = 'f';
pub const CAPS_FLAG_HIDDEN: char = 'H';
pub const CAPS_FLAG_REACHABLE: char = 'R';
pub const CAPS_FLAG_UNREACHABLE: char = 'U';
pub const CAPS_FLAG_LOW_BANDWIDTH1: char = 'K';
pub const CAPS_FLAG_LOW_BANDWIDTH2: char = 'L';
pub const CAPS_FLAG_HIGH_BANDWIDTH1: char = 'M';
pub const CAPS_FLAG_HIGH_BANDWIDTH2: char = 'N';
pub const CAPS_FLAG_HIGH_BANDWIDTH3: char = 'O';
pub const CAPS_FLAG_HIGH_BANDWIDTH4: char = 'P';
pub const CAPS_FLAG_UNLIMITED_BANDWIDTH: char = 'X';
pub const CAPS_FLAG_SSU_TESTING: char = 'B';
pub const CAPS_FLAG_SSU_INTRODUCER: char = 'C';

pub mod caps {
	pub const FLOODFILL: u8 = 0x01;
	pub const UNLIMITED_BANDWIDTH: u8 = 0x02;
	pub const HIGH_BANDWIDTH: u8 = 0x04;
	pub const REACHABLE: u8 = 0x08;
	pub const SSU_TESTING: u8 = 0x10;
	pub const SSU_INTRODUCER: u8 = 0x20;
	pub const HIDDEN: u8 = 0x40;
	pub const UNREACHABLE: u8 = 0x80;
}

pub const PROPERTY_CAPS: &str = "caps";
pub const PROPERTY_NET_ID: &str = "netId";
pub const PROPERTY_ROUTER_VERSION: &str = "router.version";
pub const NET_ID: &str = "2";
pub const ROUTER_VERSION: &str = "0.9.30";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportStyle {
	Ntcp,
	Ssu,
	Unknown(String),
}

impl TransportStyle {
	pub fn from_str(s: &str) -> Self {
		match s {
			"NTCP" => TransportStyle::Ntcp,
			"SSU" => TransportStyle::Ssu,
			other => TransportStyle::Unknown(other.to_string()),
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			TransportStyle::Ntcp => "NTCP",
			TransportStyle::Ssu => "SSU",
			TransportStyle::Unknown(s) => s,
		}
	}
}

/// A reachable router that forwards hole-punch signals for a firewalled one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Introducer {
	pub host: IpAddr,
	pub port: u16,
	pub key: [u8; 32],
	pub tag: u32,
}

/// One transport endpoint of a router.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouterAddress {
	pub cost: u8,
	pub expiration: Date,
	pub style: TransportStyle,
	pub options: Mapping,
}

impl RouterAddress {
	pub fn new(style: TransportStyle, addr: SocketAddr) -> Self {
		let mut options = Mapping::new();
		options.insert("host", &addr.ip().to_string());
		options.insert("port", &addr.port().to_string());
		RouterAddress {
			cost: 0,
			expiration: Date(0),
			style,
			options,
		}
	}

	pub fn host(&self) -> Option<IpAddr> {
		self.options.get("host").and_then(|h| h.parse().ok())
	}

	/// The raw host string; present even when it is a DNS name.
	pub fn host_string(&self) -> Option<&str> {
		self.options.get("host")
	}

	pub fn port(&self) -> Option<u16> {
		self.options.get("port").and_then(|p| p.parse().ok())
	}

	pub fn socket_addr(&self) -> Option<SocketAddr> {
		match (self.host(), self.port()) {
			(Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
			_ => None,
		}
	}

	pub fn mtu(&self) -> Option<u16> {
		self.options.get("mtu").and_then(|m| m.parse().ok())
	}

	pub fn set_mtu(&mut self, mtu: u16) {
		self.options.insert("mtu", &mtu.to_string());
	}

	/// The 32-byte intro key published for the datagram transport.
	pub fn intro_key(&self) -> Option<[u8; 32]> {
		let encoded = self.options.get("key")?;
		let bytes = super::BASE64_I2P.decode(encoded.as_bytes()).ok()?;
		bytes.try_into().ok()
	}

	pub fn set_intro_key(&mut self, key: &[u8; 32]) {
		self.options.insert("key", &super::BASE64_I2P.encode(key));
	}

	pub fn introducers(&self) -> Vec<Introducer> {
		let mut out = Vec::new();
		for index in 0..3 {
			let host = self
				.options
				.get(&format!("ihost{}", index))
				.and_then(|h| h.parse().ok());
			let port = self
				.options
				.get(&format!("iport{}", index))
				.and_then(|p| p.parse().ok());
			let key = self
				.options
				.get(&format!("ikey{}", index))
				.and_then(|k| super::BASE64_I2P.decode(k.as_bytes()).ok())
				.and_then(|k| <[u8; 32]>::try_from(k).ok());
			let tag = self
				.options
				.get(&format!("itag{}", index))
				.and_then(|t| t.parse().ok());
			match (host, port, key, tag) {
				(Some(host), Some(port), Some(key), Some(tag)) => out.push(Introducer {
					host,
					port,
					key,
					tag,
				}),
				_ => break,
			}
		}
		out
	}

	pub fn add_introducer(&mut self, introducer: &Introducer) -> bool {
		let index = self.introducers().len();
		if index >= 3 {
			return false;
		}
		self.options
			.insert(&format!("ihost{}", index), &introducer.host.to_string());
		self.options
			.insert(&format!("iport{}", index), &introducer.port.to_string());
		self.options.insert(
			&format!("ikey{}", index),
			&super::BASE64_I2P.encode(&introducer.key),
		);
		self.options
			.insert(&format!("itag{}", index), &introducer.tag.to_string());
		true
	}

	/// Addresses are compatible when their IP families match.
	pub fn is_compatible(&self, other: &IpAddr) -> bool {
		match self.host() {
			Some(ip) => ip.is_ipv4() == other.is_ipv4(),
			None => false,
		}
	}
}

/// All of the data a router publishes for the network to see, keyed in the
/// database under the SHA-256 of its identity.
pub struct RouterInfo {
	pub identity: RouterIdentity,
	pub(crate) published: Date,
	pub(crate) addresses: Vec<RouterAddress>,
	pub(crate) options: Mapping,
	pub(crate) signature: Option<Vec<u8>>,
	caps: u8,
	is_updated: AtomicBool,
	is_unreachable: AtomicBool,
}

impl Clone for RouterInfo {
	fn clone(&self) -> Self {
		RouterInfo {
			identity: self.identity.clone(),
			published: self.published,
			addresses: self.addresses.clone(),
			options: self.options.clone(),
			signature: self.signature.clone(),
			caps: self.caps,
			is_updated: AtomicBool::new(self.is_updated.load(Ordering::Relaxed)),
			is_unreachable: AtomicBool::new(self.is_unreachable.load(Ordering::Relaxed)),
		}
	}
}

impl PartialEq for RouterInfo {
	fn eq(&self, other: &Self) -> bool {
		self.identity == other.identity
			&& self.published == other.published
			&& self.addresses == other.addresses
			&& self.options == other.options
			&& self.signature == other.signature
	}
}

impl Eq for RouterInfo {}

impl fmt::Debug for RouterInfo {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("RouterInfo")
			.field("hash", &self.identity.hash())
			.field("published", &self.published)
			.field("addresses", &self.addresses.len())
			.field("caps", &self.caps_string())
			.finish()
	}
}

impl RouterInfo {
	pub fn new(identity: RouterIdentity) -> Self {
		let mut options = Mapping::new();
		options.insert(PROPERTY_NET_ID, NET_ID);
		options.insert(PROPERTY_ROUTER_VERSION, ROUTER_VERSION);
		RouterInfo {
			identity,
			published: Date::now(),
			addresses: Vec::new(),
			options,
			signature: None,
			caps: 0,
			is_updated: AtomicBool::new(false),
			is_unreachable: AtomicBool::new(false),
		}
	}

	pub(crate) fn from_parts(
		identity: RouterIdentity,
		published: Date,
		addresses: Vec<RouterAddress>,
		options: Mapping,
		signature: Option<Vec<u8>>,
	) -> Self {
		let mut info = RouterInfo {
			identity,
			published,
			addresses,
			options,
			signature,
			caps: 0,
			is_updated: AtomicBool::new(false),
			is_unreachable: AtomicBool::new(false),
		};
		info.extract_caps();
		info
	}

	/// Creates a fresh signed router info for our own keys.
	pub fn create(
		keys: &PrivateKeys,
		endpoints: &[(TransportStyle, SocketAddr)],
		caps_string: &str,
	) -> Result<Self, Error> {
		let mut info = RouterInfo::new(keys.identity.clone());
		for (style, addr) in endpoints {
			info.add_address(style.clone(), *addr, None);
		}
		info.set_caps(caps_string);
		info.sign(keys)?;
		Ok(info)
	}

	pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
		match frame::router_info(data) {
			Ok((_, info)) => Ok(info),
			Err(Err::Incomplete(_)) => Err(Error::Truncated("router info")),
			Err(_) => Err(Error::MessageParsing),
		}
	}

	pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
		frame::gen_router_info(self).ok_or(Error::Crypto("router info is unsigned".into()))
	}

	/// Loads a stored file; the updated flag stays clear.
	pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
		let mut data = Vec::new();
		File::open(path)?.read_to_end(&mut data)?;
		Self::from_bytes(&data)
	}

	pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
		let mut file = File::create(path)?;
		file.write_all(&self.to_bytes()?)?;
		Ok(())
	}

	pub fn hash(&self) -> Hash {
		self.identity.hash()
	}

	pub fn published(&self) -> Date {
		self.published
	}

	pub fn addresses(&self) -> &[RouterAddress] {
		&self.addresses
	}

	pub fn option(&self, key: &str) -> Option<&str> {
		self.options.get(key)
	}

	pub fn add_address(
		&mut self,
		style: TransportStyle,
		addr: SocketAddr,
		mtu: Option<u16>,
	) {
		let mut address = RouterAddress::new(style.clone(), addr);
		if let TransportStyle::Ssu = style {
			// the intro key published for SSU is the identity hash
			address.set_intro_key(&self.identity.hash().0);
			if let Some(mtu) = mtu {
				address.set_mtu(mtu);
			}
		}
		self.addresses.push(address);
		self.signature = None;
		self.set_updated(true);
	}

	/// Adds an introducer entry to the SSU address. Fails when the router has
	/// no SSU address or all three introducer slots are taken.
	pub fn add_introducer(&mut self, introducer: &Introducer) -> bool {
		for address in &mut self.addresses {
			if address.style == TransportStyle::Ssu {
				if address.add_introducer(introducer) {
					self.signature = None;
					self.set_updated(true);
					return true;
				}
				return false;
			}
		}
		false
	}

	fn extract_caps(&mut self) {
		self.caps = 0;
		let Some(caps) = self.options.get(PROPERTY_CAPS) else {
			return;
		};
		for c in caps.chars() {
			match c {
				CAPS_FLAG_FLOODFILL => self.caps |= caps::FLOODFILL,
				CAPS_FLAG_UNLIMITED_BANDWIDTH => {
					self.caps |= caps::UNLIMITED_BANDWIDTH | caps::HIGH_BANDWIDTH
				}
				CAPS_FLAG_HIGH_BANDWIDTH1 | CAPS_FLAG_HIGH_BANDWIDTH2
				| CAPS_FLAG_HIGH_BANDWIDTH3 | CAPS_FLAG_HIGH_BANDWIDTH4 => {
					self.caps |= caps::HIGH_BANDWIDTH
				}
				CAPS_FLAG_REACHABLE => self.caps |= caps::REACHABLE,
				CAPS_FLAG_UNREACHABLE => self.caps |= caps::UNREACHABLE,
				CAPS_FLAG_SSU_TESTING => self.caps |= caps::SSU_TESTING,
				CAPS_FLAG_SSU_INTRODUCER => self.caps |= caps::SSU_INTRODUCER,
				CAPS_FLAG_HIDDEN => self.caps |= caps::HIDDEN,
				CAPS_FLAG_LOW_BANDWIDTH1 | CAPS_FLAG_LOW_BANDWIDTH2 => {}
				other => warn!("RouterInfo: unknown cap '{}'", other),
			}
		}
	}

	pub fn set_caps(&mut self, caps_string: &str) {
		self.options.insert(PROPERTY_CAPS, caps_string);
		self.extract_caps();
		self.signature = None;
		self.set_updated(true);
	}

	pub fn caps_string(&self) -> &str {
		self.options.get(PROPERTY_CAPS).unwrap_or("")
	}

	pub fn is_floodfill(&self) -> bool {
		self.caps & caps::FLOODFILL != 0
	}

	pub fn is_reachable(&self) -> bool {
		self.caps & caps::REACHABLE != 0
	}

	pub fn is_hidden(&self) -> bool {
		self.caps & caps::HIDDEN != 0
	}

	pub fn is_high_bandwidth(&self) -> bool {
		self.caps & caps::HIGH_BANDWIDTH != 0
	}

	pub fn is_introducer(&self) -> bool {
		self.caps & caps::SSU_INTRODUCER != 0
	}

	pub fn is_peer_testing(&self) -> bool {
		self.caps & caps::SSU_TESTING != 0
	}

	pub fn ntcp_address(&self) -> Option<&RouterAddress> {
		self.addresses
			.iter()
			.find(|a| a.style == TransportStyle::Ntcp)
	}

	pub fn ssu_address(&self) -> Option<&RouterAddress> {
		self.addresses
			.iter()
			.find(|a| a.style == TransportStyle::Ssu)
	}

	pub fn has_ntcp(&self) -> bool {
		self.ntcp_address().is_some()
	}

	pub fn has_ssu(&self) -> bool {
		self.ssu_address().is_some()
	}

	/// A firewalled SSU router publishes introducers instead of a reachable
	/// endpoint.
	pub fn uses_introducer(&self) -> bool {
		self.ssu_address()
			.map(|a| !a.introducers().is_empty())
			.unwrap_or(false)
	}

	/// Routers are compatible when they share at least one address family.
	pub fn is_compatible(&self, other: &RouterInfo) -> bool {
		for ours in &self.addresses {
			if let Some(ip) = ours.host() {
				if other.addresses.iter().any(|a| a.is_compatible(&ip)) {
					return true;
				}
			}
		}
		false
	}

	pub fn sign(&mut self, keys: &PrivateKeys) -> Result<(), Error> {
		self.published = Date::now();
		let body = frame::gen_router_info_minus_sig(self);
		self.signature = Some(keys.sign(&body)?);
		self.set_updated(true);
		Ok(())
	}

	/// Verifies the signature over all bytes up to but not including it.
	pub fn verify(&self) -> Result<(), Error> {
		let Some(signature) = self.signature.as_ref() else {
			return Err(Error::BadSignature);
		};
		let body = frame::gen_router_info_minus_sig(self);
		self.identity.verify(&body, signature).map_err(|e| {
			error!("RouterInfo: bad signature for {}", self.identity.hash());
			e
		})
	}

	pub fn is_updated(&self) -> bool {
		self.is_updated.load(Ordering::Relaxed)
	}

	pub fn set_updated(&self, updated: bool) {
		self.is_updated.store(updated, Ordering::Relaxed);
	}

	pub fn is_unreachable(&self) -> bool {
		self.is_unreachable.load(Ordering::Relaxed)
	}

	pub fn set_unreachable(&self, unreachable: bool) {
		self.is_unreachable.store(unreachable, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::SigType;

	fn test_keys() -> PrivateKeys {
		PrivateKeys::random(SigType::Ed25519).unwrap()
	}

	fn loopback(port: u16) -> SocketAddr {
		SocketAddr::new(IpAddr::V4("127.0.0.1".parse().unwrap()), port)
	}

	#[test]
	fn create_sign_verify_round_trip() {
		let keys = test_keys();
		let info = RouterInfo::create(
			&keys,
			&[
				(TransportStyle::Ntcp, loopback(10100)),
				(TransportStyle::Ssu, loopback(10100)),
			],
			"fR",
		)
		.unwrap();
		assert!(info.verify().is_ok());
		assert!(info.is_floodfill());
		assert!(info.is_reachable());

		let bytes = info.to_bytes().unwrap();
		let parsed = RouterInfo::from_bytes(&bytes).unwrap();
		assert_eq!(parsed, info);
		assert!(parsed.verify().is_ok());
		assert_eq!(parsed.hash(), keys.hash());
		assert!(!parsed.is_updated());
		// round trip again for byte-exactness
		assert_eq!(parsed.to_bytes().unwrap(), bytes);
	}

	#[test]
	fn tampered_body_fails_verification() {
		let keys = test_keys();
		let info =
			RouterInfo::create(&keys, &[(TransportStyle::Ntcp, loopback(1))], "LR").unwrap();
		let mut bytes = info.to_bytes().unwrap();
		let flip = bytes.len() - 100;
		bytes[flip] ^= 0x01;
		let parsed = RouterInfo::from_bytes(&bytes).unwrap();
		assert!(parsed.verify().is_err());
	}

	#[test]
	fn caps_characters() {
		let keys = test_keys();
		let mut info = RouterInfo::new(keys.identity.clone());
		info.set_caps("PBC");
		assert!(info.is_high_bandwidth());
		assert!(info.is_peer_testing());
		assert!(info.is_introducer());
		assert!(!info.is_floodfill());
		info.set_caps("fU");
		assert!(info.is_floodfill());
		assert!(!info.is_reachable());
	}

	#[test]
	fn ssu_address_carries_intro_key() {
		let keys = test_keys();
		let mut info = RouterInfo::new(keys.identity.clone());
		info.add_address(TransportStyle::Ssu, loopback(9000), Some(1484));
		let addr = info.ssu_address().unwrap();
		assert_eq!(addr.intro_key().unwrap(), info.hash().0);
		assert_eq!(addr.mtu(), Some(1484));
	}

	#[test]
	fn introducers_round_trip() {
		let keys = test_keys();
		let mut info = RouterInfo::new(keys.identity.clone());
		info.add_address(TransportStyle::Ssu, loopback(9000), None);
		let introducer = Introducer {
			host: "10.0.0.1".parse().unwrap(),
			port: 8999,
			key: [7u8; 32],
			tag: 4242,
		};
		assert!(info.add_introducer(&introducer));
		assert!(info.uses_introducer());
		info.sign(&keys).unwrap();
		let parsed = RouterInfo::from_bytes(&info.to_bytes().unwrap()).unwrap();
		assert_eq!(parsed.ssu_address().unwrap().introducers(), vec![introducer]);
	}

	#[test]
	fn compatibility_is_by_address_family() {
		let a = RouterInfo::create(
			&test_keys(),
			&[(TransportStyle::Ntcp, loopback(1))],
			"LR",
		)
		.unwrap();
		let b = RouterInfo::create(
			&test_keys(),
			&[(TransportStyle::Ntcp, loopback(2))],
			"LR",
		)
		.unwrap();
		let v6 = RouterInfo::create(
			&test_keys(),
			&[(TransportStyle::Ntcp, "[::1]:3".parse().unwrap())],
			"LR",
		)
		.unwrap();
		assert!(a.is_compatible(&b));
		assert!(!a.is_compatible(&v6));
	}

	#[test]
	fn timestamp_is_monotone_across_resign() {
		let keys = test_keys();
		let mut info =
			RouterInfo::create(&keys, &[(TransportStyle::Ntcp, loopback(1))], "LR").unwrap();
		let first = info.published();
		info.set_caps("fR");
		info.sign(&keys).unwrap();
		assert!(info.published() >= first);
	}
}
