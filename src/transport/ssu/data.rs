//! The SSU data subprotocol: fragmentation, ACK tracking, retransmission and
//! duplicate suppression for one session.
//!
//! This is a pure state machine. Methods return data-payload bodies (the
//! bytes after the packet header) for the session to encrypt and send, and
//! completed messages for upward dispatch, so the whole reliability layer is
//! testable without sockets.

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::i2np::Message;

use super::packet::{
	DataPayloadBuilder, Fragment, SSU_HEADER_MIN, SSU_MAX_RECEIVED_MESSAGES, SSU_PACKET_MAX_V4,
	SSU_PACKET_MAX_V6,
};

pub const RESEND_INTERVAL: Duration = Duration::from_secs(3);
pub const MAX_RESENDS: u8 = 5;
pub const INCOMPLETE_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);
pub const RECEIVED_DECAY_INTERVAL: Duration = Duration::from_secs(20);
// flag + fragment count + message id + fragment info
const FRAGMENT_OVERHEAD: usize = 9;

struct IncompleteMessage {
	msg: Message,
	next_fragment: u8,
	last_insert: Instant,
	saved: BTreeMap<u8, Fragment>,
}

impl IncompleteMessage {
	fn new(first_fragment: &Fragment) -> Self {
		let mut msg = Message::new_short();
		// size the buffer from the fragment metadata up front: fragments
		// before the last are all full-size, so number * len is a floor
		msg.reserve((first_fragment.number as usize + 2) * first_fragment.data.len());
		IncompleteMessage {
			msg,
			next_fragment: 0,
			last_insert: Instant::now(),
			saved: BTreeMap::new(),
		}
	}

	fn attach(&mut self, data: &[u8]) -> Result<(), Error> {
		self.msg.append_short_stream(data)?;
		self.next_fragment += 1;
		self.last_insert = Instant::now();
		Ok(())
	}
}

struct SentMessage {
	/// payload bodies per fragment; ACKed slots are cleared
	fragments: Vec<Option<Vec<u8>>>,
	next_resend: Instant,
	resend_count: u8,
}

impl SentMessage {
	fn is_fully_acked(&self) -> bool {
		self.fragments.iter().all(Option::is_none)
	}
}

/// A message that finished reassembly, keyed by its wire message id.
pub struct CompletedMessage {
	pub msg_id: u32,
	pub message: Message,
	pub duplicate: bool,
}

pub struct SsuData {
	incomplete: HashMap<u32, IncompleteMessage>,
	sent: HashMap<u32, SentMessage>,
	received_recently: HashSet<u32>,
	last_received_insert: Instant,
	packet_size: usize,
	max_packet_size: usize,
}

impl SsuData {
	pub fn new(ipv6: bool) -> Self {
		let max_packet_size = if ipv6 {
			SSU_PACKET_MAX_V6
		} else {
			SSU_PACKET_MAX_V4
		};
		SsuData {
			incomplete: HashMap::new(),
			sent: HashMap::new(),
			received_recently: HashSet::new(),
			last_received_insert: Instant::now(),
			packet_size: max_packet_size,
			max_packet_size,
		}
	}

	pub fn packet_size(&self) -> usize {
		self.packet_size
	}

	/// Clamps the packet size to the remote's advertised MTU, 16-aligned.
	pub fn adjust_packet_size(&mut self, mtu: u16, ipv6: bool) {
		let header = if ipv6 { 40 + 8 } else { 20 + 8 };
		let size = (mtu as usize).saturating_sub(header);
		if size == 0 {
			warn!("SsuData: unexpected MTU {}", mtu);
			self.packet_size = self.max_packet_size;
			return;
		}
		self.packet_size = (size & !0x0F).min(self.max_packet_size);
		info!("SsuData: MTU {}, packet size {}", mtu, self.packet_size);
	}

	/// Splits an I2NP message into fragment payload bodies and records the
	/// retransmit state. The message is converted to its short-header form.
	pub fn send(&mut self, msg: &mut Message) -> Result<Vec<Vec<u8>>, Error> {
		let msg_id = msg.to_short();
		if self.sent.contains_key(&msg_id) {
			warn!("SsuData: message {} was already sent", msg_id);
			return Ok(Vec::new());
		}
		let payload_size = self.packet_size - SSU_HEADER_MIN - FRAGMENT_OVERHEAD;
		let stream = msg.short_bytes();
		let mut bodies = Vec::new();
		let mut fragments = Vec::new();
		let mut offset = 0;
		let mut number = 0u8;
		loop {
			let remaining = stream.len() - offset;
			let is_last = remaining <= payload_size;
			let size = remaining.min(payload_size);
			let fragment = Fragment {
				msg_id,
				number,
				is_last,
				data: stream[offset..offset + size].to_vec(),
			};
			let body = DataPayloadBuilder::new()
				.want_reply()
				.fragment(&fragment)
				.build();
			bodies.push(body.clone());
			fragments.push(Some(body));
			offset += size;
			number = number.wrapping_add(1);
			if is_last {
				break;
			}
		}
		self.sent.insert(
			msg_id,
			SentMessage {
				fragments,
				next_resend: Instant::now() + RESEND_INTERVAL,
				resend_count: 0,
			},
		);
		Ok(bodies)
	}

	/// Handles the ACK sections of a received data payload.
	pub fn process_acks(&mut self, explicit: &[u32], bitfields: &[(u32, Vec<u8>)]) {
		for msg_id in explicit {
			if self.sent.remove(msg_id).is_some() {
				debug!("SsuData: message {} fully ACKed", msg_id);
			}
		}
		for (msg_id, bitfield) in bitfields {
			let Some(sent) = self.sent.get_mut(msg_id) else {
				continue;
			};
			let mut fragment = 0usize;
			for byte in bitfield {
				let bits = byte & 0x7F;
				for bit in 0..7 {
					if bits & (1 << bit) != 0 {
						if let Some(slot) = sent.fragments.get_mut(fragment) {
							*slot = None;
						}
					}
					fragment += 1;
				}
			}
			if sent.is_fully_acked() {
				self.sent.remove(msg_id);
			}
		}
	}

	/// Handles received fragments. Returns the ACK payload bodies to emit
	/// and any messages that completed reassembly.
	pub fn process_fragments(
		&mut self,
		fragments: &[Fragment],
	) -> (Vec<Vec<u8>>, Vec<CompletedMessage>) {
		let mut acks = Vec::new();
		let mut completed = Vec::new();
		for fragment in fragments {
			match self.process_fragment(fragment, &mut acks) {
				Ok(Some(done)) => completed.push(done),
				Ok(None) => {}
				Err(e) => warn!("SsuData: dropping fragment of {}: {}", fragment.msg_id, e),
			}
		}
		(acks, completed)
	}

	fn process_fragment(
		&mut self,
		fragment: &Fragment,
		acks: &mut Vec<Vec<u8>>,
	) -> Result<Option<CompletedMessage>, Error> {
		let msg_id = fragment.msg_id;
		let entry = self
			.incomplete
			.entry(msg_id)
			.or_insert_with(|| IncompleteMessage::new(fragment));

		let mut is_last = fragment.is_last;
		if fragment.number == entry.next_fragment {
			// expected fragment
			entry.attach(&fragment.data)?;
			// advance through saved out-of-order fragments
			while let Some(saved) = entry.saved.remove(&entry.next_fragment) {
				entry.attach(&saved.data)?;
				is_last = saved.is_last;
			}
		} else if fragment.number < entry.next_fragment {
			warn!(
				"SsuData: ignoring duplicate fragment {} of message {}",
				fragment.number, msg_id
			);
			acks.push(
				DataPayloadBuilder::new()
					.fragment_ack(msg_id, fragment.number)
					.build(),
			);
			return Ok(None);
		} else {
			debug!(
				"SsuData: missing fragments {}..{} of message {}",
				entry.next_fragment, fragment.number, msg_id
			);
			if entry.saved.insert(fragment.number, fragment.clone()).is_none() {
				entry.last_insert = Instant::now();
			}
			acks.push(
				DataPayloadBuilder::new()
					.fragment_ack(msg_id, fragment.number)
					.build(),
			);
			return Ok(None);
		}

		if !is_last {
			acks.push(
				DataPayloadBuilder::new()
					.fragment_ack(msg_id, fragment.number)
					.build(),
			);
			return Ok(None);
		}

		// complete: ack the whole message and hand it up
		let mut entry = self.incomplete.remove(&msg_id).expect("present");
		acks.push(DataPayloadBuilder::new().explicit_ack(msg_id).build());
		entry.msg.from_short(msg_id)?;

		let duplicate = !self.note_received(msg_id);
		Ok(Some(CompletedMessage {
			msg_id,
			message: entry.msg,
			duplicate,
		}))
	}

	/// Tracks the message id in the bounded recently-received set; returns
	/// false for duplicates.
	fn note_received(&mut self, msg_id: u32) -> bool {
		if self.received_recently.contains(&msg_id) {
			warn!("SsuData: message {} already received", msg_id);
			return false;
		}
		if self.received_recently.len() >= SSU_MAX_RECEIVED_MESSAGES {
			self.received_recently.clear();
		}
		self.received_recently.insert(msg_id);
		self.last_received_insert = Instant::now();
		true
	}

	/// Fragments due for retransmission. Messages past the resend cap are
	/// abandoned.
	pub fn resend_due(&mut self, now: Instant) -> Vec<Vec<u8>> {
		let mut out = Vec::new();
		self.sent.retain(|msg_id, sent| {
			if now < sent.next_resend {
				return true;
			}
			if sent.resend_count >= MAX_RESENDS {
				warn!(
					"SsuData: message {} not ACKed after {} attempts, deleted",
					msg_id, MAX_RESENDS
				);
				return false;
			}
			for body in sent.fragments.iter().flatten() {
				out.push(body.clone());
			}
			sent.resend_count += 1;
			sent.next_resend = now + RESEND_INTERVAL * u32::from(sent.resend_count);
			true
		});
		out
	}

	pub fn has_pending_sends(&self) -> bool {
		!self.sent.is_empty()
	}

	/// Periodic maintenance: expires stale partial messages and decays the
	/// duplicate-suppression set after a quiet period.
	pub fn maintain(&mut self, now: Instant) {
		self.incomplete.retain(|msg_id, entry| {
			let keep = now.duration_since(entry.last_insert) < INCOMPLETE_MESSAGE_TIMEOUT;
			if !keep {
				warn!(
					"SsuData: message {} was not completed in {:?}, deleted",
					msg_id, INCOMPLETE_MESSAGE_TIMEOUT
				);
			}
			keep
		});
		if !self.received_recently.is_empty()
			&& now.duration_since(self.last_received_insert) > RECEIVED_DECAY_INTERVAL
		{
			self.received_recently.clear();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::i2np::MSG_TYPE_DATA;

	fn data_message(size: usize) -> Message {
		let payload = (0..size).map(|i| (i % 251) as u8).collect::<Vec<_>>();
		let mut msg = Message::new();
		msg.append_payload(&payload).unwrap();
		msg.fill_header(MSG_TYPE_DATA);
		msg
	}

	fn extract_fragments(bodies: &[Vec<u8>]) -> Vec<Fragment> {
		use crate::transport::ssu::packet::{build_body, parse_body, PayloadType, SsuPayload};
		bodies
			.iter()
			.flat_map(|body| {
				let full = build_body(PayloadType::Data, 0, body);
				match parse_body(&full).unwrap().1 {
					SsuPayload::Data(p) => p.fragments,
					_ => panic!("not a data payload"),
				}
			})
			.collect()
	}

	#[test]
	fn fragment_count_matches_size() {
		let mut data = SsuData::new(false);
		let payload_size = data.packet_size() - SSU_HEADER_MIN - FRAGMENT_OVERHEAD;
		let mut msg = data_message(4 * payload_size);
		let bodies = data.send(&mut msg).unwrap();
		// short header adds a few bytes, so one extra fragment
		assert_eq!(bodies.len(), 5);
		let fragments = extract_fragments(&bodies);
		assert!(fragments.last().unwrap().is_last);
		assert_eq!(fragments.iter().filter(|f| f.is_last).count(), 1);
	}

	#[test]
	fn reassembly_in_order() {
		let mut sender = SsuData::new(false);
		let mut receiver = SsuData::new(false);
		let mut msg = data_message(4000);
		let original_payload = msg.payload().to_vec();
		let bodies = sender.send(&mut msg).unwrap();
		let fragments = extract_fragments(&bodies);
		let (acks, completed) = receiver.process_fragments(&fragments);
		assert_eq!(completed.len(), 1);
		assert!(!completed[0].duplicate);
		assert_eq!(completed[0].message.payload(), original_payload);
		// per-fragment acks plus the final explicit ack
		assert_eq!(acks.len(), fragments.len());
	}

	#[test]
	fn reassembly_out_of_order() {
		let mut sender = SsuData::new(false);
		let mut receiver = SsuData::new(false);
		let mut msg = data_message(3000);
		let original_payload = msg.payload().to_vec();
		let bodies = sender.send(&mut msg).unwrap();
		let mut fragments = extract_fragments(&bodies);
		fragments.reverse();
		let (_, completed) = receiver.process_fragments(&fragments);
		assert_eq!(completed.len(), 1);
		assert_eq!(completed[0].message.payload(), original_payload);
	}

	#[test]
	fn duplicate_message_is_flagged() {
		let mut sender = SsuData::new(false);
		let mut receiver = SsuData::new(false);
		let mut msg = data_message(100);
		let bodies = sender.send(&mut msg).unwrap();
		let fragments = extract_fragments(&bodies);
		let (_, first) = receiver.process_fragments(&fragments);
		assert!(!first[0].duplicate);
		let (_, second) = receiver.process_fragments(&fragments);
		assert!(second[0].duplicate);
	}

	#[test]
	fn acks_clear_retransmit_state() {
		let mut sender = SsuData::new(false);
		let mut msg = data_message(4000);
		let bodies = sender.send(&mut msg).unwrap();
		let fragments = extract_fragments(&bodies);
		let msg_id = fragments[0].msg_id;
		assert!(sender.has_pending_sends());

		// fragment acks clear individual slots
		for fragment in &fragments[..fragments.len() - 1] {
			sender.process_acks(&[], &[(msg_id, ack_bitfield_for(fragment.number))]);
			assert!(sender.has_pending_sends());
		}
		// explicit ack clears the message
		sender.process_acks(&[msg_id], &[]);
		assert!(!sender.has_pending_sends());
	}

	fn ack_bitfield_for(fragment: u8) -> Vec<u8> {
		let groups = (fragment / 7) as usize;
		let mut bitfield = vec![0x80u8; groups];
		bitfield.push(0x01 << (fragment % 7));
		bitfield
	}

	#[test]
	fn resend_schedule_and_abandon() {
		let mut sender = SsuData::new(false);
		let mut msg = data_message(100);
		let bodies = sender.send(&mut msg).unwrap();
		assert_eq!(bodies.len(), 1);

		let now = Instant::now();
		// not due yet
		assert!(sender.resend_due(now).is_empty());
		let mut due = now + RESEND_INTERVAL;
		for _ in 0..MAX_RESENDS {
			let resent = sender.resend_due(due);
			assert_eq!(resent.len(), 1);
			due += RESEND_INTERVAL * u32::from(MAX_RESENDS);
		}
		// past the cap the message is abandoned
		assert!(sender.resend_due(due).is_empty());
		assert!(!sender.has_pending_sends());
	}

	#[test]
	fn incomplete_messages_expire() {
		let mut receiver = SsuData::new(false);
		let fragment = Fragment {
			msg_id: 77,
			number: 1, // out of order so it stays incomplete
			is_last: true,
			data: vec![0; 10],
		};
		receiver.process_fragments(&[fragment]);
		assert_eq!(receiver.incomplete.len(), 1);
		receiver.maintain(Instant::now() + INCOMPLETE_MESSAGE_TIMEOUT + Duration::from_secs(1));
		assert!(receiver.incomplete.is_empty());
	}

	#[test]
	fn mtu_clamps_packet_size() {
		let mut data = SsuData::new(false);
		data.adjust_packet_size(1200, false);
		assert_eq!(data.packet_size() % 16, 0);
		assert!(data.packet_size() <= 1200 - 28);
		// larger than the transport maximum is clamped
		data.adjust_packet_size(9000, false);
		assert_eq!(data.packet_size(), SSU_PACKET_MAX_V4);
	}

	#[test]
	fn lost_fragment_recovers_via_resend() {
		let mut sender = SsuData::new(false);
		let mut receiver = SsuData::new(false);
		let mut msg = data_message(3500);
		let original_payload = msg.payload().to_vec();
		let bodies = sender.send(&mut msg).unwrap();
		let fragments = extract_fragments(&bodies);
		assert!(fragments.len() >= 2);

		// drop fragment 1 on first delivery
		let mut delivered: Vec<Fragment> = fragments.clone();
		delivered.remove(1);
		let (acks, completed) = receiver.process_fragments(&delivered);
		assert!(completed.is_empty());
		assert!(!acks.is_empty());

		// sender processes the acks it did get: explicit none, bitfields for
		// fragments 0 and 2, then resends the remainder
		let msg_id = fragments[0].msg_id;
		for number in delivered.iter().map(|f| f.number) {
			sender.process_acks(&[], &[(msg_id, ack_bitfield_for(number))]);
		}
		let resent = sender.resend_due(Instant::now() + RESEND_INTERVAL);
		let resent_fragments = extract_fragments(&resent);
		assert!(resent_fragments.iter().any(|f| f.number == 1));

		let (_, completed) = receiver.process_fragments(&resent_fragments);
		assert_eq!(completed.len(), 1);
		assert_eq!(completed[0].message.payload(), original_payload);
	}
}
