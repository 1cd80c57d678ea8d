//! Datatypes common to the router core: identity hashes, the Kademlia
//! distance metric, timestamps and the length-prefixed options mappings used
//! by router infos and addresses.

use data_encoding::{Encoding, Specification};
use lazy_static::lazy_static;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Error;

pub mod frame;
pub mod identity;
pub mod lease_set;
pub mod router_info;

pub use self::identity::{PrivateKeys, RouterIdentity};
pub use self::lease_set::{Lease, LeaseSet};
pub use self::router_info::{RouterAddress, RouterInfo};

pub const B32_EXT: &str = ".b32.i2p";

lazy_static! {
	pub static ref BASE32_I2P: Encoding = {
		let mut spec = Specification::new();
		spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
		spec.padding = None;
		spec.encoding().unwrap()
	};
}

lazy_static! {
	pub static ref BASE64_I2P: Encoding = {
		let mut spec = Specification::new();
		spec.symbols
			.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~");
		spec.padding = Some('=');
		spec.encoding().unwrap()
	};
}

/// The SHA-256 hash of a serialized structure; identity hashes order the
/// keyspace byte-lexicographically.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Hash(pub [u8; 32]);

impl Hash {
	pub fn from_bytes(buf: &[u8; 32]) -> Self {
		Hash(*buf)
	}

	pub fn from_slice(buf: &[u8]) -> Result<Self, Error> {
		let mut x = [0u8; 32];
		if buf.len() < 32 {
			return Err(Error::Truncated("hash"));
		}
		x.copy_from_slice(&buf[..32]);
		Ok(Hash(x))
	}

	pub fn digest(buf: &[u8]) -> Self {
		let mut x = [0u8; 32];
		x.copy_from_slice(&Sha256::digest(buf));
		Hash(x)
	}

	pub fn is_zero(&self) -> bool {
		self.0.iter().all(|&b| b == 0)
	}

	/// XOR distance to `other`, the Kademlia metric.
	pub fn xor(&self, other: &Hash) -> XorMetric {
		let mut metric = [0u8; 32];
		for i in 0..32 {
			metric[i] = self.0[i] ^ other.0[i];
		}
		XorMetric(metric)
	}

	pub fn to_base64(&self) -> String {
		BASE64_I2P.encode(&self.0)
	}

	pub fn to_base32(&self) -> String {
		BASE32_I2P.encode(&self.0)
	}

	pub fn from_base64(s: &str) -> Result<Self, Error> {
		let bytes = BASE64_I2P
			.decode(s.as_bytes())
			.map_err(|e| Error::Crypto(e.to_string()))?;
		Hash::from_slice(&bytes)
	}

	/// The `<base32>.b32.i2p` hostname form.
	pub fn to_b32_address(&self) -> String {
		format!("{}{}", self.to_base32(), B32_EXT)
	}
}

impl fmt::Display for Hash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.to_base64())
	}
}

impl fmt::Debug for Hash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Hash({})", &self.to_base64()[..8])
	}
}

/// 32-byte XOR distance; compares byte-lexicographically.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct XorMetric(pub [u8; 32]);

impl XorMetric {
	pub fn max() -> Self {
		XorMetric([0xFF; 32])
	}
}

impl PartialOrd for XorMetric {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for XorMetric {
	fn cmp(&self, other: &Self) -> Ordering {
		self.0.cmp(&other.0)
	}
}

/// Day-salted routing key: SHA-256(identity hash, current UTC day string).
/// The keyspace neighborhood rotates daily.
pub fn routing_key(ident: &Hash) -> Hash {
	routing_key_for_day(ident, days_since_epoch(SystemTime::now()))
}

pub(crate) fn routing_key_for_day(ident: &Hash, days: u64) -> Hash {
	let (year, month, day) = civil_from_days(days);
	let mut hasher = Sha256::new();
	hasher.update(ident.0);
	hasher.update(format!("{:04}{:02}{:02}", year, month, day).as_bytes());
	let mut out = [0u8; 32];
	out.copy_from_slice(&hasher.finalize());
	Hash(out)
}

fn days_since_epoch(t: SystemTime) -> u64 {
	t.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::ZERO)
		.as_secs() / 86_400
}

/// Gregorian calendar date from days since 1970-01-01 (civil-from-days).
pub(crate) fn civil_from_days(days: u64) -> (u64, u64, u64) {
	let z = days + 719_468;
	let era = z / 146_097;
	let doe = z - era * 146_097;
	let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
	let y = yoe + era * 400;
	let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
	let mp = (5 * doy + 2) / 153;
	let d = doy - (153 * mp + 2) / 5 + 1;
	let m = if mp < 10 { mp + 3 } else { mp - 9 };
	(if m <= 2 { y + 1 } else { y }, m, d)
}

/// Milliseconds since the Unix epoch; 0 means undefined.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Date(pub u64);

impl Date {
	pub fn now() -> Self {
		Date::from_system_time(SystemTime::now())
	}

	pub fn from_system_time(t: SystemTime) -> Self {
		let d = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
		Date(d.as_secs() * 1_000 + u64::from(d.subsec_millis()))
	}

	pub fn is_null(&self) -> bool {
		self.0 == 0
	}
}

/// Seconds since the Unix epoch, used by both wire protocols.
pub fn seconds_since_epoch() -> u32 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::ZERO)
		.as_secs() as u32
}

pub fn milliseconds_since_epoch() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::ZERO)
		.as_millis() as u64
}

/// An ordered set of key/value properties. Serialization iterates in key
/// order so signed structures are deterministic.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Mapping(pub BTreeMap<String, String>);

impl Mapping {
	pub fn new() -> Self {
		Mapping(BTreeMap::new())
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(String::as_str)
	}

	pub fn insert(&mut self, key: &str, value: &str) {
		self.0.insert(key.to_string(), value.to_string());
	}

	pub fn remove(&mut self, key: &str) {
		self.0.remove(key);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hash_xor() {
		let h0 = Hash([0u8; 32]);
		let h1 = Hash([1u8; 32]);
		let h2 = Hash([2u8; 32]);
		let h3 = Hash([3u8; 32]);
		assert_eq!(h1.xor(&h2).0, h3.xor(&h0).0);
		assert_eq!(h1.xor(&h1).0, [0u8; 32]);
		assert!(h1.xor(&h1) < h1.xor(&h2));
	}

	#[test]
	fn base_codecs_round_trip() {
		for len in [0usize, 1, 31, 32, 33, 512, 1024] {
			let data: Vec<u8> = (0..len).map(|i| (i * 37) as u8).collect();
			let b64 = BASE64_I2P.encode(&data);
			assert_eq!(BASE64_I2P.decode(b64.as_bytes()).unwrap(), data);
			let b32 = BASE32_I2P.encode(&data);
			assert_eq!(BASE32_I2P.decode(b32.as_bytes()).unwrap(), data);
		}
	}

	#[test]
	fn base64_uses_i2p_alphabet() {
		// 0xFF blocks encode with '~' where standard base64 uses '/'
		let encoded = BASE64_I2P.encode(&[0xFF, 0xFF, 0xFF]);
		assert!(encoded.contains('~') || encoded.contains('-'));
		assert!(!encoded.contains('/'));
		assert!(!encoded.contains('+'));
	}

	#[test]
	fn civil_dates() {
		assert_eq!(civil_from_days(0), (1970, 1, 1));
		assert_eq!(civil_from_days(19_723), (2024, 1, 1));
		assert_eq!(civil_from_days(11_016), (2000, 2, 29));
	}

	#[test]
	fn routing_key_rotates_daily() {
		let ident = Hash::digest(b"some router");
		let today = routing_key_for_day(&ident, 19_000);
		let tomorrow = routing_key_for_day(&ident, 19_001);
		assert_ne!(today, tomorrow);
		assert_eq!(today, routing_key_for_day(&ident, 19_000));
	}

	#[test]
	fn b32_address_form() {
		let ident = Hash([0xAB; 32]);
		let addr = ident.to_b32_address();
		assert!(addr.ends_with(B32_EXT));
		assert_eq!(addr.len(), 52 + B32_EXT.len());
	}
}
