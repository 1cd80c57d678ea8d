//! SSU packet parsing and building.
//!
//! Every packet on the wire is `MAC(16) || IV(16) || encrypted body`. This
//! module codes the decrypted body: a flag byte (payload type in the high
//! nibble, rekey and extended-options bits below), a 4-byte timestamp,
//! optional keying material and extended options, then the payload. Trailing
//! bytes are AES padding and are ignored by parsers.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::net::IpAddr;

use crate::error::Error;

pub const SSU_MTU_V4: usize = 1484;
pub const SSU_MTU_V6: usize = 1472;
pub const SSU_PACKET_MAX_V4: usize = 1456;
pub const SSU_PACKET_MAX_V6: usize = 1424;
pub const SSU_HEADER_MIN: usize = 37;
pub const SSU_MAC_SIZE: usize = 16;
pub const SSU_IV_SIZE: usize = 16;
pub const SSU_INTRO_KEY_SIZE: usize = 32;
pub const SSU_KEYING_MATERIAL_SIZE: usize = 64;
pub const SSU_DH_PUBLIC_SIZE: usize = 256;
pub const SSU_MAX_RECEIVED_MESSAGES: usize = 1000;

pub const FLAG_EXTENDED_OPTIONS: u8 = 0x04;
pub const FLAG_REKEY: u8 = 0x08;

pub const DATA_FLAG_EXTENDED_INCLUDED: u8 = 0x02;
pub const DATA_FLAG_WANT_REPLY: u8 = 0x04;
pub const DATA_FLAG_REQUEST_PREVIOUS_ACKS: u8 = 0x08;
pub const DATA_FLAG_ECN: u8 = 0x10;
pub const DATA_FLAG_ACK_BITFIELDS_INCLUDED: u8 = 0x40;
pub const DATA_FLAG_EXPLICIT_ACKS_INCLUDED: u8 = 0x80;
pub const DATA_FLAG_ACK_BITFIELD_HAS_NEXT: u8 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PayloadType {
	SessionRequest = 0,
	SessionCreated = 1,
	SessionConfirmed = 2,
	RelayRequest = 3,
	RelayResponse = 4,
	RelayIntro = 5,
	Data = 6,
	PeerTest = 7,
	SessionDestroyed = 8,
}

impl PayloadType {
	pub fn from_nibble(value: u8) -> Option<PayloadType> {
		match value {
			0 => Some(PayloadType::SessionRequest),
			1 => Some(PayloadType::SessionCreated),
			2 => Some(PayloadType::SessionConfirmed),
			3 => Some(PayloadType::RelayRequest),
			4 => Some(PayloadType::RelayResponse),
			5 => Some(PayloadType::RelayIntro),
			6 => Some(PayloadType::Data),
			7 => Some(PayloadType::PeerTest),
			8 => Some(PayloadType::SessionDestroyed),
			_ => None,
		}
	}
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SsuHeader {
	pub payload_type: PayloadType,
	pub time: u32,
	pub rekey_material: Option<Vec<u8>>,
	pub extended_options: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionRequestPacket {
	pub dh_x: Vec<u8>,
	pub address: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionCreatedPacket {
	pub dh_y: Vec<u8>,
	pub address: Vec<u8>,
	pub port: u16,
	pub relay_tag: u32,
	pub signed_on: u32,
	/// signature block, AES-encrypted under the session key
	pub signature: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionConfirmedPacket {
	pub identity: Vec<u8>,
	pub signed_on: u32,
	pub signature: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayRequestPacket {
	pub relay_tag: u32,
	pub address: Vec<u8>,
	pub port: u16,
	pub challenge: Vec<u8>,
	pub intro_key: [u8; SSU_INTRO_KEY_SIZE],
	pub nonce: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayResponsePacket {
	pub charlie_address: Vec<u8>,
	pub charlie_port: u16,
	pub alice_address: Vec<u8>,
	pub alice_port: u16,
	pub nonce: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayIntroPacket {
	pub address: Vec<u8>,
	pub port: u16,
	pub challenge: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fragment {
	pub msg_id: u32,
	pub number: u8,
	pub is_last: bool,
	pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DataPacket {
	pub flags: u8,
	pub explicit_acks: Vec<u32>,
	/// per entry: message id and its fragment bitfield bytes
	pub ack_bitfields: Vec<(u32, Vec<u8>)>,
	pub fragments: Vec<Fragment>,
}

impl DataPacket {
	pub fn want_reply(&self) -> bool {
		self.flags & DATA_FLAG_WANT_REPLY != 0
	}
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerTestPacket {
	pub nonce: u32,
	pub address: Vec<u8>,
	pub port: u16,
	pub intro_key: [u8; SSU_INTRO_KEY_SIZE],
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SsuPayload {
	SessionRequest(SessionRequestPacket),
	SessionCreated(SessionCreatedPacket),
	SessionConfirmed(SessionConfirmedPacket),
	RelayRequest(RelayRequestPacket),
	RelayResponse(RelayResponsePacket),
	RelayIntro(RelayIntroPacket),
	Data(DataPacket),
	PeerTest(PeerTestPacket),
	SessionDestroyed,
}

/// Byte cursor over a decrypted packet body.
struct Reader<'a> {
	data: &'a [u8],
}

impl<'a> Reader<'a> {
	fn new(data: &'a [u8]) -> Self {
		Reader { data }
	}

	fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
		if n > self.data.len() {
			return Err(Error::Truncated("SSU packet"));
		}
		let (head, tail) = self.data.split_at(n);
		self.data = tail;
		Ok(head)
	}

	fn read_u8(&mut self) -> Result<u8, Error> {
		Ok(self.take(1)?[0])
	}

	fn read_u16(&mut self) -> Result<u16, Error> {
		Ok(BigEndian::read_u16(self.take(2)?))
	}

	fn read_u32(&mut self) -> Result<u32, Error> {
		Ok(BigEndian::read_u32(self.take(4)?))
	}

	fn remaining(&self) -> &'a [u8] {
		self.data
	}
}

pub fn parse_body(body: &[u8]) -> Result<(SsuHeader, SsuPayload), Error> {
	let mut reader = Reader::new(body);
	let flag = reader.read_u8()?;
	let payload_type = PayloadType::from_nibble(flag >> 4)
		.ok_or_else(|| Error::Protocol(format!("unknown SSU payload type {}", flag >> 4)))?;
	let time = reader.read_u32()?;
	let rekey_material = if flag & FLAG_REKEY != 0 {
		Some(reader.take(SSU_KEYING_MATERIAL_SIZE)?.to_vec())
	} else {
		None
	};
	let extended_options = if flag & FLAG_EXTENDED_OPTIONS != 0 {
		let len = reader.read_u8()? as usize;
		Some(reader.take(len)?.to_vec())
	} else {
		None
	};
	let header = SsuHeader {
		payload_type,
		time,
		rekey_material,
		extended_options,
	};
	let payload = match payload_type {
		PayloadType::SessionRequest => {
			let dh_x = reader.take(SSU_DH_PUBLIC_SIZE)?.to_vec();
			let size = reader.read_u8()? as usize;
			let address = reader.take(size)?.to_vec();
			SsuPayload::SessionRequest(SessionRequestPacket { dh_x, address })
		}
		PayloadType::SessionCreated => {
			let dh_y = reader.take(SSU_DH_PUBLIC_SIZE)?.to_vec();
			let size = reader.read_u8()? as usize;
			let address = reader.take(size)?.to_vec();
			let port = reader.read_u16()?;
			let relay_tag = reader.read_u32()?;
			let signed_on = reader.read_u32()?;
			let signature = reader.remaining().to_vec();
			SsuPayload::SessionCreated(SessionCreatedPacket {
				dh_y,
				address,
				port,
				relay_tag,
				signed_on,
				signature,
			})
		}
		PayloadType::SessionConfirmed => {
			let _info = reader.read_u8()?; // fragment info, single fragment
			let size = reader.read_u16()? as usize;
			let identity = reader.take(size)?.to_vec();
			let signed_on = reader.read_u32()?;
			let signature = reader.remaining().to_vec();
			SsuPayload::SessionConfirmed(SessionConfirmedPacket {
				identity,
				signed_on,
				signature,
			})
		}
		PayloadType::RelayRequest => {
			let relay_tag = reader.read_u32()?;
			let size = reader.read_u8()? as usize;
			let address = reader.take(size)?.to_vec();
			let port = reader.read_u16()?;
			let challenge_size = reader.read_u8()? as usize;
			let challenge = reader.take(challenge_size)?.to_vec();
			let intro_key = reader
				.take(SSU_INTRO_KEY_SIZE)?
				.try_into()
				.expect("fixed size");
			let nonce = reader.read_u32()?;
			SsuPayload::RelayRequest(RelayRequestPacket {
				relay_tag,
				address,
				port,
				challenge,
				intro_key,
				nonce,
			})
		}
		PayloadType::RelayResponse => {
			let charlie_size = reader.read_u8()? as usize;
			let charlie_address = reader.take(charlie_size)?.to_vec();
			let charlie_port = reader.read_u16()?;
			let alice_size = reader.read_u8()? as usize;
			let alice_address = reader.take(alice_size)?.to_vec();
			let alice_port = reader.read_u16()?;
			let nonce = reader.read_u32()?;
			SsuPayload::RelayResponse(RelayResponsePacket {
				charlie_address,
				charlie_port,
				alice_address,
				alice_port,
				nonce,
			})
		}
		PayloadType::RelayIntro => {
			let size = reader.read_u8()? as usize;
			let address = reader.take(size)?.to_vec();
			let port = reader.read_u16()?;
			let challenge_size = reader.read_u8()? as usize;
			let challenge = reader.take(challenge_size)?.to_vec();
			SsuPayload::RelayIntro(RelayIntroPacket {
				address,
				port,
				challenge,
			})
		}
		PayloadType::Data => SsuPayload::Data(parse_data(&mut reader)?),
		PayloadType::PeerTest => {
			let nonce = reader.read_u32()?;
			let size = reader.read_u8()? as usize;
			let address = reader.take(size)?.to_vec();
			let port = reader.read_u16()?;
			let intro_key = reader
				.take(SSU_INTRO_KEY_SIZE)?
				.try_into()
				.expect("fixed size");
			SsuPayload::PeerTest(PeerTestPacket {
				nonce,
				address,
				port,
				intro_key,
			})
		}
		PayloadType::SessionDestroyed => SsuPayload::SessionDestroyed,
	};
	Ok((header, payload))
}

fn parse_data(reader: &mut Reader) -> Result<DataPacket, Error> {
	let flags = reader.read_u8()?;
	let mut packet = DataPacket {
		flags,
		..Default::default()
	};
	if flags & DATA_FLAG_EXPLICIT_ACKS_INCLUDED != 0 {
		let count = reader.read_u8()?;
		for _ in 0..count {
			packet.explicit_acks.push(reader.read_u32()?);
		}
	}
	if flags & DATA_FLAG_ACK_BITFIELDS_INCLUDED != 0 {
		let count = reader.read_u8()?;
		for _ in 0..count {
			let msg_id = reader.read_u32()?;
			let mut bitfield = Vec::new();
			loop {
				let byte = reader.read_u8()?;
				bitfield.push(byte);
				if byte & DATA_FLAG_ACK_BITFIELD_HAS_NEXT == 0 {
					break;
				}
			}
			packet.ack_bitfields.push((msg_id, bitfield));
		}
	}
	if flags & DATA_FLAG_EXTENDED_INCLUDED != 0 {
		let len = reader.read_u8()? as usize;
		reader.take(len)?;
	}
	let fragment_count = reader.read_u8()?;
	for _ in 0..fragment_count {
		let msg_id = reader.read_u32()?;
		let info_bytes = reader.take(3)?;
		let info = u32::from_be_bytes([0, info_bytes[0], info_bytes[1], info_bytes[2]]);
		let size = (info & 0x3FFF) as usize; // bits 0-13
		let is_last = info & 0x01_0000 != 0; // bit 16
		let number = (info >> 17) as u8; // bits 23-17
		if size > SSU_PACKET_MAX_V4 {
			return Err(Error::Protocol(format!("fragment size {} exceeds packet", size)));
		}
		let data = reader.take(size)?.to_vec();
		packet.fragments.push(Fragment {
			msg_id,
			number,
			is_last,
			data,
		});
	}
	Ok(packet)
}

//
// Builders: all produce the body content after the flag/time header; the
// header itself is written by `build_body`.
//

fn write_flag_and_time(out: &mut Vec<u8>, payload_type: PayloadType, time: u32) {
	out.push((payload_type as u8) << 4);
	out.write_u32::<BigEndian>(time).unwrap();
}

/// Serializes a full body (header + payload content), unpadded.
pub fn build_body(payload_type: PayloadType, time: u32, content: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(5 + content.len());
	write_flag_and_time(&mut out, payload_type, time);
	out.extend_from_slice(content);
	out
}

pub fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
	match ip {
		IpAddr::V4(v4) => v4.octets().to_vec(),
		IpAddr::V6(v6) => v6.octets().to_vec(),
	}
}

pub fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
	match bytes.len() {
		4 => {
			let octets: [u8; 4] = bytes.try_into().ok()?;
			Some(IpAddr::from(octets))
		}
		16 => {
			let octets: [u8; 16] = bytes.try_into().ok()?;
			Some(IpAddr::from(octets))
		}
		_ => None,
	}
}

pub fn build_session_request(dh_x: &[u8], remote_ip: &IpAddr) -> Vec<u8> {
	let address = ip_bytes(remote_ip);
	let mut out = Vec::with_capacity(SSU_DH_PUBLIC_SIZE + 1 + address.len());
	out.extend_from_slice(dh_x);
	out.push(address.len() as u8);
	out.extend_from_slice(&address);
	out
}

pub fn build_session_created(
	dh_y: &[u8],
	alice_ip: &IpAddr,
	alice_port: u16,
	relay_tag: u32,
	signed_on: u32,
	encrypted_signature: &[u8],
) -> Vec<u8> {
	let address = ip_bytes(alice_ip);
	let mut out = Vec::new();
	out.extend_from_slice(dh_y);
	out.push(address.len() as u8);
	out.extend_from_slice(&address);
	out.write_u16::<BigEndian>(alice_port).unwrap();
	out.write_u32::<BigEndian>(relay_tag).unwrap();
	out.write_u32::<BigEndian>(signed_on).unwrap();
	out.extend_from_slice(encrypted_signature);
	out
}

pub fn build_session_confirmed(identity: &[u8], signed_on: u32, signature: &[u8]) -> Vec<u8> {
	let mut out = Vec::new();
	out.push(0x01); // fragment 0 of 1
	out.write_u16::<BigEndian>(identity.len() as u16).unwrap();
	out.extend_from_slice(identity);
	out.write_u32::<BigEndian>(signed_on).unwrap();
	out.extend_from_slice(signature);
	out
}

pub fn build_relay_request(
	relay_tag: u32,
	address: &[u8],
	port: u16,
	challenge: &[u8],
	intro_key: &[u8; SSU_INTRO_KEY_SIZE],
	nonce: u32,
) -> Vec<u8> {
	let mut out = Vec::new();
	out.write_u32::<BigEndian>(relay_tag).unwrap();
	out.push(address.len() as u8);
	out.extend_from_slice(address);
	out.write_u16::<BigEndian>(port).unwrap();
	out.push(challenge.len() as u8);
	out.extend_from_slice(challenge);
	out.extend_from_slice(intro_key);
	out.write_u32::<BigEndian>(nonce).unwrap();
	out
}

pub fn build_relay_response(
	charlie: (&[u8], u16),
	alice: (&[u8], u16),
	nonce: u32,
) -> Vec<u8> {
	let mut out = Vec::new();
	out.push(charlie.0.len() as u8);
	out.extend_from_slice(charlie.0);
	out.write_u16::<BigEndian>(charlie.1).unwrap();
	out.push(alice.0.len() as u8);
	out.extend_from_slice(alice.0);
	out.write_u16::<BigEndian>(alice.1).unwrap();
	out.write_u32::<BigEndian>(nonce).unwrap();
	out
}

pub fn build_relay_intro(address: &[u8], port: u16, challenge: &[u8]) -> Vec<u8> {
	let mut out = Vec::new();
	out.push(address.len() as u8);
	out.extend_from_slice(address);
	out.write_u16::<BigEndian>(port).unwrap();
	out.push(challenge.len() as u8);
	out.extend_from_slice(challenge);
	out
}

pub fn build_peer_test(
	nonce: u32,
	address: &[u8],
	port: u16,
	intro_key: &[u8; SSU_INTRO_KEY_SIZE],
) -> Vec<u8> {
	let mut out = Vec::new();
	out.write_u32::<BigEndian>(nonce).unwrap();
	out.push(address.len() as u8);
	out.extend_from_slice(address);
	out.write_u16::<BigEndian>(port).unwrap();
	out.extend_from_slice(intro_key);
	out
}

/// Serializes a data payload. ACK bitfield entries are written before any
/// fragments; the layout mirrors `parse_data`.
pub struct DataPayloadBuilder {
	flags: u8,
	explicit_acks: Vec<u32>,
	ack_bitfields: Vec<(u32, Vec<u8>)>,
	fragments: Vec<u8>,
	fragment_count: u8,
}

impl DataPayloadBuilder {
	pub fn new() -> Self {
		DataPayloadBuilder {
			flags: 0,
			explicit_acks: Vec::new(),
			ack_bitfields: Vec::new(),
			fragments: Vec::new(),
			fragment_count: 0,
		}
	}

	pub fn want_reply(mut self) -> Self {
		self.flags |= DATA_FLAG_WANT_REPLY;
		self
	}

	pub fn explicit_ack(mut self, msg_id: u32) -> Self {
		self.flags |= DATA_FLAG_EXPLICIT_ACKS_INCLUDED;
		self.explicit_acks.push(msg_id);
		self
	}

	/// ACK a single fragment; the bitfield uses 7-bit groups with the high
	/// bit as a continuation marker.
	pub fn fragment_ack(mut self, msg_id: u32, fragment_number: u8) -> Self {
		self.flags |= DATA_FLAG_ACK_BITFIELDS_INCLUDED;
		let full_groups = (fragment_number / 7) as usize;
		let mut bitfield = vec![DATA_FLAG_ACK_BITFIELD_HAS_NEXT; full_groups];
		bitfield.push(0x01 << (fragment_number % 7));
		self.ack_bitfields.push((msg_id, bitfield));
		self
	}

	pub fn fragment(mut self, fragment: &Fragment) -> Self {
		self.fragments
			.extend_from_slice(&fragment.msg_id.to_be_bytes());
		let mut info = (fragment.number as u32) << 17;
		if fragment.is_last {
			info |= 0x01_0000;
		}
		info |= fragment.data.len() as u32 & 0x3FFF;
		self.fragments.extend_from_slice(&info.to_be_bytes()[1..4]);
		self.fragments.extend_from_slice(&fragment.data);
		self.fragment_count += 1;
		self
	}

	pub fn build(self) -> Vec<u8> {
		let mut out = Vec::new();
		out.push(self.flags);
		if self.flags & DATA_FLAG_EXPLICIT_ACKS_INCLUDED != 0 {
			out.push(self.explicit_acks.len() as u8);
			for ack in &self.explicit_acks {
				out.extend_from_slice(&ack.to_be_bytes());
			}
		}
		if self.flags & DATA_FLAG_ACK_BITFIELDS_INCLUDED != 0 {
			out.push(self.ack_bitfields.len() as u8);
			for (msg_id, bitfield) in &self.ack_bitfields {
				out.extend_from_slice(&msg_id.to_be_bytes());
				out.extend_from_slice(bitfield);
			}
		}
		out.push(self.fragment_count);
		out.extend_from_slice(&self.fragments);
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(body: &[u8]) -> (SsuHeader, SsuPayload) {
		parse_body(body).unwrap()
	}

	#[test]
	fn session_request_round_trip() {
		let dh_x = vec![0x11; SSU_DH_PUBLIC_SIZE];
		let ip: IpAddr = "192.168.1.7".parse().unwrap();
		let body = build_body(
			PayloadType::SessionRequest,
			12_345,
			&build_session_request(&dh_x, &ip),
		);
		let (header, payload) = parse(&body);
		assert_eq!(header.payload_type, PayloadType::SessionRequest);
		assert_eq!(header.time, 12_345);
		match payload {
			SsuPayload::SessionRequest(p) => {
				assert_eq!(p.dh_x, dh_x);
				assert_eq!(ip_from_bytes(&p.address), Some(ip));
			}
			other => panic!("wrong payload {:?}", other),
		}
	}

	#[test]
	fn session_created_round_trip() {
		let dh_y = vec![0x22; SSU_DH_PUBLIC_SIZE];
		let ip: IpAddr = "10.0.0.9".parse().unwrap();
		let signature = vec![0xEE; 64];
		let content = build_session_created(&dh_y, &ip, 9887, 777, 4_000_000, &signature);
		let body = build_body(PayloadType::SessionCreated, 1, &content);
		match parse(&body).1 {
			SsuPayload::SessionCreated(p) => {
				assert_eq!(p.dh_y, dh_y);
				assert_eq!(p.port, 9887);
				assert_eq!(p.relay_tag, 777);
				assert_eq!(p.signed_on, 4_000_000);
				assert_eq!(p.signature, signature);
			}
			other => panic!("wrong payload {:?}", other),
		}
	}

	#[test]
	fn relay_packets_round_trip() {
		let intro_key = [9u8; SSU_INTRO_KEY_SIZE];
		let content = build_relay_request(42, &[127, 0, 0, 1], 8000, &[], &intro_key, 555);
		match parse(&build_body(PayloadType::RelayRequest, 7, &content)).1 {
			SsuPayload::RelayRequest(p) => {
				assert_eq!(p.relay_tag, 42);
				assert_eq!(p.port, 8000);
				assert!(p.challenge.is_empty());
				assert_eq!(p.intro_key, intro_key);
				assert_eq!(p.nonce, 555);
			}
			other => panic!("wrong payload {:?}", other),
		}

		let content = build_relay_response((&[10, 1, 1, 1], 9001), (&[10, 2, 2, 2], 9002), 555);
		match parse(&build_body(PayloadType::RelayResponse, 7, &content)).1 {
			SsuPayload::RelayResponse(p) => {
				assert_eq!(p.charlie_port, 9001);
				assert_eq!(p.alice_port, 9002);
				assert_eq!(p.nonce, 555);
			}
			other => panic!("wrong payload {:?}", other),
		}

		let content = build_relay_intro(&[172, 16, 0, 1], 7001, &[]);
		match parse(&build_body(PayloadType::RelayIntro, 7, &content)).1 {
			SsuPayload::RelayIntro(p) => {
				assert_eq!(ip_from_bytes(&p.address), Some("172.16.0.1".parse().unwrap()));
				assert_eq!(p.port, 7001);
			}
			other => panic!("wrong payload {:?}", other),
		}
	}

	#[test]
	fn peer_test_round_trip() {
		let intro_key = [3u8; SSU_INTRO_KEY_SIZE];
		let content = build_peer_test(999, &[1, 2, 3, 4], 5555, &intro_key);
		match parse(&build_body(PayloadType::PeerTest, 7, &content)).1 {
			SsuPayload::PeerTest(p) => {
				assert_eq!(p.nonce, 999);
				assert_eq!(p.port, 5555);
				assert_eq!(p.intro_key, intro_key);
			}
			other => panic!("wrong payload {:?}", other),
		}
	}

	#[test]
	fn data_payload_round_trip() {
		let fragment = Fragment {
			msg_id: 0xDEADBEEF,
			number: 3,
			is_last: true,
			data: vec![0xAB; 100],
		};
		let content = DataPayloadBuilder::new()
			.want_reply()
			.explicit_ack(0x1234)
			.fragment_ack(0x5678, 9)
			.fragment(&fragment)
			.build();
		let body = build_body(PayloadType::Data, 7, &content);
		match parse(&body).1 {
			SsuPayload::Data(p) => {
				assert!(p.want_reply());
				assert_eq!(p.explicit_acks, vec![0x1234]);
				assert_eq!(p.ack_bitfields.len(), 1);
				assert_eq!(p.ack_bitfields[0].0, 0x5678);
				// fragment 9 = group 1, bit 2
				assert_eq!(p.ack_bitfields[0].1, vec![0x80, 0x04]);
				assert_eq!(p.fragments.len(), 1);
				assert_eq!(p.fragments[0], fragment);
			}
			other => panic!("wrong payload {:?}", other),
		}
	}

	#[test]
	fn data_payload_tolerates_padding() {
		let content = DataPayloadBuilder::new().explicit_ack(7).build();
		let mut body = build_body(PayloadType::Data, 7, &content);
		body.extend_from_slice(&[0u8; 11]); // AES padding
		match parse(&body).1 {
			SsuPayload::Data(p) => assert_eq!(p.explicit_acks, vec![7]),
			other => panic!("wrong payload {:?}", other),
		}
	}

	#[test]
	fn fragment_info_bit_packing() {
		// size 0x3FFF is the maximum encodable
		let fragment = Fragment {
			msg_id: 1,
			number: 0x7F,
			is_last: false,
			data: vec![0; 10],
		};
		let content = DataPayloadBuilder::new().fragment(&fragment).build();
		match parse(&build_body(PayloadType::Data, 7, &content)).1 {
			SsuPayload::Data(p) => {
				assert_eq!(p.fragments[0].number, 0x7F);
				assert!(!p.fragments[0].is_last);
				assert_eq!(p.fragments[0].data.len(), 10);
			}
			other => panic!("wrong payload {:?}", other),
		}
	}

	#[test]
	fn truncated_packets_are_typed_errors() {
		assert!(parse_body(&[]).is_err());
		assert!(parse_body(&[0x00, 0, 0]).is_err());
		// claims a fragment but carries none
		let content = vec![0x00, 1, 0, 0, 0, 1];
		let body = build_body(PayloadType::Data, 7, &content);
		assert!(parse_body(&body).is_err());
		// unknown payload type nibble
		assert!(parse_body(&[0x90, 0, 0, 0, 0]).is_err());
	}
}
