//! I2NP messages: the framed unit both transports carry and the dispatcher
//! routes.
//!
//! A message owns its byte buffer. The 16-byte header sits at a fixed offset
//! (two bytes are reserved ahead of it for the stream transport's length
//! prefix); the 5-byte short header used by the datagram transport occupies
//! the tail of the full header region, so converting between the two forms
//! never moves the payload.

use byteorder::{BigEndian, ByteOrder};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, error, warn};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::data::{milliseconds_since_epoch, Hash, RouterInfo};
use crate::error::Error;

pub const I2NP_HEADER_SIZE: usize = 16;
pub const I2NP_SHORT_HEADER_SIZE: usize = 5;
pub const I2NP_MAX_MESSAGE_SIZE: usize = 32_768;
pub const I2NP_MAX_SHORT_MESSAGE_SIZE: usize = 4_096;
pub const I2NP_DEFAULT_EXPIRATION_MS: u64 = 60_000;

// two bytes reserved ahead of the header for the NTCP length prefix
const HEADER_OFFSET: usize = 2;
// room for frame padding and checksums appended by the transports
const BUFFER_MARGIN: usize = 64;

pub const MSG_TYPE_DATABASE_STORE: u8 = 1;
pub const MSG_TYPE_DATABASE_LOOKUP: u8 = 2;
pub const MSG_TYPE_DATABASE_SEARCH_REPLY: u8 = 3;
pub const MSG_TYPE_DELIVERY_STATUS: u8 = 10;
pub const MSG_TYPE_GARLIC: u8 = 11;
pub const MSG_TYPE_TUNNEL_DATA: u8 = 18;
pub const MSG_TYPE_TUNNEL_GATEWAY: u8 = 19;
pub const MSG_TYPE_DATA: u8 = 20;
pub const MSG_TYPE_TUNNEL_BUILD: u8 = 21;
pub const MSG_TYPE_TUNNEL_BUILD_REPLY: u8 = 22;
pub const MSG_TYPE_VARIABLE_TUNNEL_BUILD: u8 = 23;
pub const MSG_TYPE_VARIABLE_TUNNEL_BUILD_REPLY: u8 = 24;

// database-lookup flags
pub const LOOKUP_DELIVERY_FLAG: u8 = 0x01;
pub const LOOKUP_ENCRYPTION_FLAG: u8 = 0x02;
pub const LOOKUP_TYPE_MASK: u8 = 0x0C;
pub const LOOKUP_TYPE_NORMAL: u8 = 0x00;
pub const LOOKUP_TYPE_LEASE_SET: u8 = 0x04;
pub const LOOKUP_TYPE_ROUTER_INFO: u8 = 0x08;
pub const LOOKUP_TYPE_EXPLORATORY: u8 = 0x0C;

// database-store payload offsets
pub const STORE_KEY_OFFSET: usize = 0;
pub const STORE_TYPE_OFFSET: usize = 32;
pub const STORE_REPLY_TOKEN_OFFSET: usize = 33;
pub const STORE_HEADER_SIZE: usize = 37;

#[derive(Clone)]
pub struct Message {
	buf: Vec<u8>,
	len: usize,
}

impl Message {
	pub fn new() -> Self {
		Self::with_capacity(I2NP_MAX_MESSAGE_SIZE)
	}

	pub fn new_short() -> Self {
		Self::with_capacity(I2NP_MAX_SHORT_MESSAGE_SIZE)
	}

	fn with_capacity(max: usize) -> Self {
		let mut buf = Vec::with_capacity(HEADER_OFFSET + max + BUFFER_MARGIN);
		buf.resize(HEADER_OFFSET + I2NP_HEADER_SIZE, 0);
		Message {
			buf,
			len: HEADER_OFFSET + I2NP_HEADER_SIZE,
		}
	}

	/// Wraps received full-header bytes (header + payload).
	pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
		if data.len() < I2NP_HEADER_SIZE {
			return Err(Error::Truncated("I2NP header"));
		}
		if data.len() > I2NP_MAX_MESSAGE_SIZE + I2NP_HEADER_SIZE {
			return Err(Error::OversizedMessage(data.len()));
		}
		let mut msg = Message::with_capacity(data.len());
		msg.buf.truncate(HEADER_OFFSET);
		msg.buf.extend_from_slice(data);
		msg.len = HEADER_OFFSET + data.len();
		Ok(msg)
	}

	fn header(&self) -> &[u8] {
		&self.buf[HEADER_OFFSET..HEADER_OFFSET + I2NP_HEADER_SIZE]
	}

	fn header_mut(&mut self) -> &mut [u8] {
		&mut self.buf[HEADER_OFFSET..HEADER_OFFSET + I2NP_HEADER_SIZE]
	}

	pub fn type_id(&self) -> u8 {
		self.header()[0]
	}

	pub fn set_type_id(&mut self, type_id: u8) {
		self.header_mut()[0] = type_id;
	}

	pub fn msg_id(&self) -> u32 {
		BigEndian::read_u32(&self.header()[1..5])
	}

	pub fn set_msg_id(&mut self, msg_id: u32) {
		BigEndian::write_u32(&mut self.header_mut()[1..5], msg_id);
	}

	pub fn expiration(&self) -> u64 {
		BigEndian::read_u64(&self.header()[5..13])
	}

	pub fn set_expiration(&mut self, expiration_ms: u64) {
		BigEndian::write_u64(&mut self.header_mut()[5..13], expiration_ms);
	}

	pub fn size(&self) -> u16 {
		BigEndian::read_u16(&self.header()[13..15])
	}

	pub fn set_size(&mut self, size: u16) {
		BigEndian::write_u16(&mut self.header_mut()[13..15], size);
	}

	pub fn checksum(&self) -> u8 {
		self.header()[15]
	}

	pub fn update_checksum(&mut self) {
		let digest = Sha256::digest(self.payload());
		self.header_mut()[15] = digest[0];
	}

	pub fn payload(&self) -> &[u8] {
		&self.buf[HEADER_OFFSET + I2NP_HEADER_SIZE..self.len]
	}

	pub fn payload_len(&self) -> usize {
		self.len - HEADER_OFFSET - I2NP_HEADER_SIZE
	}

	pub fn append_payload(&mut self, data: &[u8]) -> Result<(), Error> {
		if self.payload_len() + data.len() > I2NP_MAX_MESSAGE_SIZE {
			return Err(Error::OversizedMessage(self.payload_len() + data.len()));
		}
		self.buf.truncate(self.len);
		self.buf.extend_from_slice(data);
		self.len = self.buf.len();
		Ok(())
	}

	/// Header + payload, as the stream transport frames it.
	pub fn bytes(&self) -> &[u8] {
		&self.buf[HEADER_OFFSET..self.len]
	}

	pub fn total_len(&self) -> usize {
		self.len - HEADER_OFFSET
	}

	/// Stamps message id, expiration, size and checksum for transmit.
	pub fn fill_header(&mut self, type_id: u8) {
		self.set_type_id(type_id);
		self.set_msg_id(rand::thread_rng().gen());
		self.set_expiration(milliseconds_since_epoch() + I2NP_DEFAULT_EXPIRATION_MS);
		self.set_size(self.payload_len() as u16);
		self.update_checksum();
	}

	pub fn verify_checksum(&self) -> bool {
		let digest = Sha256::digest(self.payload());
		digest[0] == self.checksum() && self.size() as usize == self.payload_len()
	}

	pub fn is_expired(&self) -> bool {
		let expiration = self.expiration();
		expiration != 0 && expiration < milliseconds_since_epoch()
	}

	fn short_header_pos(&self) -> usize {
		HEADER_OFFSET + I2NP_HEADER_SIZE - I2NP_SHORT_HEADER_SIZE
	}

	/// Converts to the short-header form for the datagram transport and
	/// returns the message id the fragments are keyed by.
	pub fn to_short(&mut self) -> u32 {
		let msg_id = self.msg_id();
		let type_id = self.type_id();
		let expiration_secs = (self.expiration() / 1_000) as u32;
		let pos = self.short_header_pos();
		self.buf[pos] = type_id;
		BigEndian::write_u32(&mut self.buf[pos + 1..pos + 5], expiration_secs);
		msg_id
	}

	/// Short header + payload, the byte stream the datagram sender fragments.
	pub fn short_bytes(&self) -> &[u8] {
		&self.buf[self.short_header_pos()..self.len]
	}

	/// Promotes a reassembled short-headed message back to the full form.
	pub fn from_short(&mut self, msg_id: u32) -> Result<(), Error> {
		let pos = self.short_header_pos();
		if self.len < pos + I2NP_SHORT_HEADER_SIZE {
			return Err(Error::Truncated("I2NP short header"));
		}
		let type_id = self.buf[pos];
		let expiration_secs = BigEndian::read_u32(&self.buf[pos + 1..pos + 5]);
		self.set_type_id(type_id);
		self.set_msg_id(msg_id);
		self.set_expiration(u64::from(expiration_secs) * 1_000);
		self.set_size(self.payload_len() as u16);
		self.update_checksum();
		Ok(())
	}

	/// Grows the buffer ahead of reassembly when the total size is known.
	pub fn reserve(&mut self, additional: usize) {
		self.buf.reserve(additional);
	}

	/// Appends raw bytes of a short-headed stream during reassembly. The
	/// first fragment carries the short header itself. Short-headed messages
	/// are capped at 4 KiB, not the full 32 KiB.
	pub(crate) fn append_short_stream(&mut self, data: &[u8]) -> Result<(), Error> {
		if self.len == HEADER_OFFSET + I2NP_HEADER_SIZE {
			// rewind so the first fragment lands on the short header position
			self.len = self.short_header_pos();
			self.buf.truncate(self.len);
		}
		let stream_len = self.len + data.len() - self.short_header_pos();
		if stream_len > I2NP_MAX_SHORT_MESSAGE_SIZE {
			return Err(Error::OversizedMessage(stream_len));
		}
		self.buf.extend_from_slice(data);
		self.len = self.buf.len();
		Ok(())
	}
}

impl Default for Message {
	fn default() -> Self {
		Message::new()
	}
}

//
// Builders
//

pub fn create_data_message(payload: &[u8]) -> Result<Message, Error> {
	let mut msg = Message::new();
	msg.append_payload(&(payload.len() as u32).to_be_bytes())?;
	msg.append_payload(payload)?;
	msg.fill_header(MSG_TYPE_DATA);
	Ok(msg)
}

pub fn create_delivery_status_message(status_msg_id: u32) -> Message {
	let mut msg = Message::new_short();
	let mut payload = [0u8; 12];
	BigEndian::write_u32(&mut payload[0..4], status_msg_id);
	BigEndian::write_u64(&mut payload[4..12], milliseconds_since_epoch());
	msg.append_payload(&payload).expect("fits");
	msg.fill_header(MSG_TYPE_DELIVERY_STATUS);
	msg
}

/// Database store carrying a gzipped router info. A nonzero reply token asks
/// the recipient for a delivery status, sent directly (tunnel id 0) or
/// through the named tunnel gateway.
pub fn create_database_store_message(
	info: &RouterInfo,
	reply_token: u32,
	reply_tunnel: Option<(u32, Hash)>,
) -> Result<Message, Error> {
	let mut msg = Message::new();
	let mut payload = Vec::new();
	payload.extend_from_slice(&info.hash().0);
	payload.push(0); // type 0: router info
	payload.extend_from_slice(&reply_token.to_be_bytes());
	if reply_token != 0 {
		let (tunnel_id, gateway) = reply_tunnel.unwrap_or((0, Hash::default()));
		payload.extend_from_slice(&tunnel_id.to_be_bytes());
		payload.extend_from_slice(&gateway.0);
	}
	let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
	encoder
		.write_all(&info.to_bytes()?)
		.and_then(|_| encoder.finish())
		.map_err(Error::from)
		.and_then(|compressed| {
			payload.extend_from_slice(&(compressed.len() as u16).to_be_bytes());
			payload.extend_from_slice(&compressed);
			Ok(())
		})?;
	msg.append_payload(&payload)?;
	msg.fill_header(MSG_TYPE_DATABASE_STORE);
	Ok(msg)
}

pub fn decompress_router_info(data: &[u8]) -> Result<RouterInfo, Error> {
	let mut decoder = GzDecoder::new(data);
	let mut uncompressed = Vec::new();
	decoder
		.read_to_end(&mut uncompressed)
		.map_err(|e| Error::Protocol(format!("bad gzip in database store: {}", e)))?;
	if uncompressed.len() > I2NP_MAX_MESSAGE_SIZE {
		return Err(Error::OversizedMessage(uncompressed.len()));
	}
	RouterInfo::from_bytes(&uncompressed)
}

pub struct LookupOptions {
	pub exploratory: bool,
	pub reply_tunnel_id: u32,
	/// session key and tag for a garlic-encrypted reply
	pub encryption: Option<([u8; 32], [u8; 32])>,
}

impl Default for LookupOptions {
	fn default() -> Self {
		LookupOptions {
			exploratory: false,
			reply_tunnel_id: 0,
			encryption: None,
		}
	}
}

pub fn create_database_lookup_message(
	key: &Hash,
	from: &Hash,
	excluded: &[Hash],
	options: LookupOptions,
) -> Result<Message, Error> {
	let mut msg = Message::new_short();
	let mut payload = Vec::new();
	payload.extend_from_slice(&key.0);
	payload.extend_from_slice(&from.0);
	let mut flag = if options.exploratory {
		LOOKUP_TYPE_EXPLORATORY
	} else {
		LOOKUP_TYPE_NORMAL
	};
	if options.reply_tunnel_id != 0 {
		flag |= LOOKUP_DELIVERY_FLAG;
	}
	if options.encryption.is_some() {
		flag |= LOOKUP_ENCRYPTION_FLAG;
	}
	payload.push(flag);
	if options.reply_tunnel_id != 0 {
		payload.extend_from_slice(&options.reply_tunnel_id.to_be_bytes());
	}
	payload.extend_from_slice(&(excluded.len() as u16).to_be_bytes());
	for hash in excluded {
		payload.extend_from_slice(&hash.0);
	}
	if let Some((session_key, tag)) = options.encryption {
		payload.extend_from_slice(&session_key);
		payload.push(1); // tag count
		payload.extend_from_slice(&tag);
	}
	msg.append_payload(&payload)?;
	msg.fill_header(MSG_TYPE_DATABASE_LOOKUP);
	Ok(msg)
}

pub fn create_database_search_reply(key: &Hash, routers: &[Hash], from: &Hash) -> Message {
	let mut msg = Message::new_short();
	let mut payload = Vec::with_capacity(65 + routers.len() * 32);
	payload.extend_from_slice(&key.0);
	payload.push(routers.len() as u8);
	for hash in routers {
		payload.extend_from_slice(&hash.0);
	}
	payload.extend_from_slice(&from.0);
	msg.append_payload(&payload).expect("fits");
	msg.fill_header(MSG_TYPE_DATABASE_SEARCH_REPLY);
	msg
}

pub fn create_tunnel_gateway_message(tunnel_id: u32, inner: &Message) -> Result<Message, Error> {
	let mut msg = Message::new();
	let inner_bytes = inner.bytes();
	let mut payload = Vec::with_capacity(6 + inner_bytes.len());
	payload.extend_from_slice(&tunnel_id.to_be_bytes());
	payload.extend_from_slice(&(inner_bytes.len() as u16).to_be_bytes());
	payload.extend_from_slice(inner_bytes);
	msg.append_payload(&payload)?;
	msg.fill_header(MSG_TYPE_TUNNEL_GATEWAY);
	Ok(msg)
}

//
// Dispatcher
//

/// Receives tunnel-layer messages. The tunnel layer itself lives above this
/// crate; routers that do not install one drop these on the floor.
pub trait TunnelHandler: Send + Sync {
	fn handle_tunnel_data(&self, msgs: Vec<Message>);
	fn handle_tunnel_gateway(&self, msgs: Vec<Message>);
	fn handle_tunnel_build(&self, msg: Message);
}

/// Receives garlic messages for decryption above this crate.
pub trait GarlicHandler: Send + Sync {
	fn handle_garlic(&self, from: Option<Hash>, msg: Message);
}

/// Routes messages from transport receive callbacks to the database, the
/// tunnel layer or the garlic processor. Stateless apart from two small
/// per-call batches flushed at the end of each dispatch.
pub struct Dispatcher {
	netdb_queue: mpsc::Sender<(Option<Hash>, Message)>,
	tunnel_handler: Mutex<Option<Arc<dyn TunnelHandler>>>,
	garlic_handler: Mutex<Option<Arc<dyn GarlicHandler>>>,
}

impl Dispatcher {
	pub fn new(netdb_queue: mpsc::Sender<(Option<Hash>, Message)>) -> Self {
		Dispatcher {
			netdb_queue,
			tunnel_handler: Mutex::new(None),
			garlic_handler: Mutex::new(None),
		}
	}

	pub fn set_tunnel_handler(&self, handler: Arc<dyn TunnelHandler>) {
		*self.tunnel_handler.lock().unwrap() = Some(handler);
	}

	pub fn set_garlic_handler(&self, handler: Arc<dyn GarlicHandler>) {
		*self.garlic_handler.lock().unwrap() = Some(handler);
	}

	pub fn dispatch(&self, from: Option<Hash>, msg: Message) {
		self.dispatch_batch(from, vec![msg]);
	}

	pub fn dispatch_batch(&self, from: Option<Hash>, msgs: Vec<Message>) {
		let mut tunnel_data = Vec::new();
		let mut tunnel_gateway = Vec::new();
		for msg in msgs {
			if msg.is_expired() {
				debug!("Dispatcher: dropping expired message {}", msg.msg_id());
				continue;
			}
			match msg.type_id() {
				MSG_TYPE_DATABASE_STORE
				| MSG_TYPE_DATABASE_LOOKUP
				| MSG_TYPE_DATABASE_SEARCH_REPLY => {
					if let Err(e) = self.netdb_queue.send((from, msg)) {
						error!("Dispatcher: netdb queue closed: {}", e);
					}
				}
				MSG_TYPE_TUNNEL_DATA => tunnel_data.push(msg),
				MSG_TYPE_TUNNEL_GATEWAY => tunnel_gateway.push(msg),
				MSG_TYPE_TUNNEL_BUILD
				| MSG_TYPE_TUNNEL_BUILD_REPLY
				| MSG_TYPE_VARIABLE_TUNNEL_BUILD
				| MSG_TYPE_VARIABLE_TUNNEL_BUILD_REPLY => {
					if let Some(handler) = self.tunnel_handler.lock().unwrap().clone() {
						handler.handle_tunnel_build(msg);
					} else {
						debug!("Dispatcher: no tunnel layer, dropping build message");
					}
				}
				MSG_TYPE_GARLIC => {
					if let Some(handler) = self.garlic_handler.lock().unwrap().clone() {
						handler.handle_garlic(from, msg);
					} else {
						debug!("Dispatcher: no garlic processor installed");
					}
				}
				MSG_TYPE_DELIVERY_STATUS | MSG_TYPE_DATA => {
					debug!(
						"Dispatcher: message type {} handled locally, dropping",
						msg.type_id()
					);
				}
				other => warn!("Dispatcher: unexpected message type {}", other),
			}
		}
		if let Some(handler) = self.tunnel_handler.lock().unwrap().clone() {
			if !tunnel_data.is_empty() {
				handler.handle_tunnel_data(tunnel_data);
			}
			if !tunnel_gateway.is_empty() {
				handler.handle_tunnel_gateway(tunnel_gateway);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::SigType;
	use crate::data::router_info::TransportStyle;
	use crate::data::PrivateKeys;

	#[test]
	fn header_fields_round_trip() {
		let mut msg = Message::new();
		msg.append_payload(b"payload bytes").unwrap();
		msg.fill_header(MSG_TYPE_DATA);
		assert_eq!(msg.type_id(), MSG_TYPE_DATA);
		assert_eq!(msg.size() as usize, 13);
		assert!(msg.verify_checksum());
		assert!(!msg.is_expired());

		let parsed = Message::from_bytes(msg.bytes()).unwrap();
		assert_eq!(parsed.msg_id(), msg.msg_id());
		assert_eq!(parsed.payload(), msg.payload());
		assert!(parsed.verify_checksum());
	}

	#[test]
	fn checksum_is_low_byte_of_sha256() {
		let mut msg = Message::new();
		msg.append_payload(b"x").unwrap();
		msg.fill_header(MSG_TYPE_DATA);
		assert_eq!(msg.checksum(), Sha256::digest(b"x")[0]);
	}

	#[test]
	fn short_header_conversion_round_trips() {
		let mut msg = Message::new_short();
		msg.append_payload(b"datagram payload").unwrap();
		msg.fill_header(MSG_TYPE_DATA);
		let msg_id = msg.msg_id();
		let expiration = msg.expiration();

		let id = msg.to_short();
		assert_eq!(id, msg_id);
		let stream = msg.short_bytes().to_vec();
		assert_eq!(stream.len(), I2NP_SHORT_HEADER_SIZE + 16);
		assert_eq!(stream[0], MSG_TYPE_DATA);

		// receive side: reassemble then promote
		let mut received = Message::new_short();
		received.append_short_stream(&stream).unwrap();
		received.from_short(msg_id).unwrap();
		assert_eq!(received.type_id(), MSG_TYPE_DATA);
		assert_eq!(received.msg_id(), msg_id);
		assert_eq!(received.payload(), b"datagram payload");
		// seconds granularity
		assert_eq!(received.expiration() / 1000, expiration / 1000);
		assert!(received.verify_checksum());
	}

	#[test]
	fn oversized_payload_rejected() {
		let mut msg = Message::new();
		assert!(msg.append_payload(&vec![0u8; I2NP_MAX_MESSAGE_SIZE + 1]).is_err());
	}

	#[test]
	fn short_stream_enforces_short_cap() {
		let mut msg = Message::new_short();
		let chunk = [0u8; 1024];
		for _ in 0..4 {
			msg.append_short_stream(&chunk).unwrap();
		}
		// exactly 4 KiB fits; one more byte crosses the short-header cap
		assert!(msg.append_short_stream(&[0u8]).is_err());
	}

	#[test]
	fn database_store_round_trips_router_info() {
		let keys = PrivateKeys::random(SigType::Ed25519).unwrap();
		let info = RouterInfo::create(
			&keys,
			&[(TransportStyle::Ntcp, "127.0.0.1:1234".parse().unwrap())],
			"LR",
		)
		.unwrap();
		let msg = create_database_store_message(&info, 0, None).unwrap();
		assert_eq!(msg.type_id(), MSG_TYPE_DATABASE_STORE);
		let payload = msg.payload();
		assert_eq!(&payload[..32], &info.hash().0);
		assert_eq!(payload[STORE_TYPE_OFFSET], 0);
		let size = u16::from_be_bytes([
			payload[STORE_HEADER_SIZE],
			payload[STORE_HEADER_SIZE + 1],
		]) as usize;
		let decompressed =
			decompress_router_info(&payload[STORE_HEADER_SIZE + 2..STORE_HEADER_SIZE + 2 + size])
				.unwrap();
		assert_eq!(decompressed, info);
	}

	#[test]
	fn lookup_message_layout() {
		let key = Hash::digest(b"target");
		let from = Hash::digest(b"us");
		let excluded = vec![Hash::digest(b"tried")];
		let msg = create_database_lookup_message(
			&key,
			&from,
			&excluded,
			LookupOptions {
				exploratory: true,
				..Default::default()
			},
		)
		.unwrap();
		let payload = msg.payload();
		assert_eq!(&payload[..32], &key.0);
		assert_eq!(&payload[32..64], &from.0);
		assert_eq!(payload[64] & LOOKUP_TYPE_MASK, LOOKUP_TYPE_EXPLORATORY);
		assert_eq!(u16::from_be_bytes([payload[65], payload[66]]), 1);
		assert_eq!(&payload[67..99], &excluded[0].0);
	}

	#[test]
	fn search_reply_layout() {
		let key = Hash::digest(b"key");
		let from = Hash::digest(b"me");
		let routers = vec![Hash::digest(b"r1"), Hash::digest(b"r2")];
		let msg = create_database_search_reply(&key, &routers, &from);
		let payload = msg.payload();
		assert_eq!(payload[32], 2);
		assert_eq!(&payload[33..65], &routers[0].0);
		assert_eq!(&payload[97..129], &from.0);
	}
}
