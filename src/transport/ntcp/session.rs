//! One NTCP session: the four-phase establishment handshake followed by the
//! AES-CBC framed steady state.
//!
//! Frame layout after establishment: a 16-byte CBC block stream where each
//! message starts with a big-endian length prefix, carries the I2NP bytes
//! padded to the block boundary, and ends with an Adler-32 over everything
//! before it. A zero length marks a time-sync frame.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, info, warn};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::crypto::aes::{CbcDecryptor, CbcEncryptor, AES_BLOCK_SIZE};
use crate::crypto::checksum::{adler32, adler32_verify};
use crate::crypto::dh::{derive_session_key, DH_KEY_SIZE};
use crate::data::{seconds_since_epoch, Hash, RouterIdentity, RouterInfo};
use crate::error::Error;
use crate::i2np::{self, Message};
use crate::transport::TransportSession;

use super::{
	NtcpServer, NTCP_BUFFER_SIZE, NTCP_HASH_SIZE, NTCP_MAX_MESSAGE_SIZE, NTCP_PHASE1_SIZE,
	NTCP_PHASE2_SIZE, NTCP_PHASE3_BASE_SIZE, NTCP_PUB_KEY_SIZE,
};

const LENGTH_PREFIX_SIZE: usize = 2;
const ADLER_SIZE: usize = 4;

fn round_up_to_block(len: usize) -> usize {
	(len + AES_BLOCK_SIZE - 1) / AES_BLOCK_SIZE * AES_BLOCK_SIZE
}

struct SendState {
	encryptor: CbcEncryptor,
	stream: TcpStream,
}

/// Tracks the frame currently being reassembled from decrypted blocks.
struct Reassembly {
	frame: Vec<u8>,
	expected: usize,
}

pub struct NtcpSession {
	self_ref: Weak<NtcpSession>,
	server: Arc<NtcpServer>,
	stream: TcpStream,
	remote_addr: SocketAddr,
	remote_router: Mutex<Option<Arc<RouterInfo>>>,
	remote_identity: Mutex<Option<RouterIdentity>>,
	send_state: Mutex<Option<SendState>>,
	is_established: AtomicBool,
	is_terminated: AtomicBool,
	num_sent_bytes: AtomicU64,
	num_received_bytes: AtomicU64,
	last_activity: Mutex<Instant>,
}

impl NtcpSession {
	pub fn new(
		server: Arc<NtcpServer>,
		stream: TcpStream,
		remote_addr: SocketAddr,
		remote_router: Option<Arc<RouterInfo>>,
	) -> Arc<Self> {
		let remote_identity = remote_router.as_ref().map(|r| r.identity.clone());
		Arc::new_cyclic(|self_ref| NtcpSession {
			self_ref: self_ref.clone(),
			server,
			stream,
			remote_addr,
			remote_router: Mutex::new(remote_router),
			remote_identity: Mutex::new(remote_identity),
			send_state: Mutex::new(None),
			is_established: AtomicBool::new(false),
			is_terminated: AtomicBool::new(false),
			num_sent_bytes: AtomicU64::new(0),
			num_received_bytes: AtomicU64::new(0),
			last_activity: Mutex::new(Instant::now()),
		})
	}

	pub fn is_established(&self) -> bool {
		self.is_established.load(Ordering::SeqCst)
	}

	pub fn remote_addr(&self) -> SocketAddr {
		self.remote_addr
	}

	pub fn idle_for(&self) -> Duration {
		self.last_activity.lock().unwrap().elapsed()
	}

	fn touch(&self) {
		*self.last_activity.lock().unwrap() = Instant::now();
	}

	/// Entry point for the session thread. Outbound sessions know their
	/// remote router; inbound ones learn the identity in phase 3.
	pub fn run(self: Arc<Self>) {
		let outbound = self.remote_router.lock().unwrap().is_some();
		// a peer that stalls mid-handshake must not pin this thread
		let _ = self
			.stream
			.set_read_timeout(Some(super::NTCP_CONNECT_TIMEOUT));
		let result = if outbound {
			self.client_handshake()
		} else {
			self.server_handshake()
		};
		match result {
			Ok((encryptor, decryptor)) => {
				let _ = self.stream.set_read_timeout(None);
				self.connected(encryptor);
				self.receive_loop(decryptor);
			}
			Err(e) => {
				warn!("NtcpSession: {} handshake failed: {}", self.remote_addr, e);
				let nothing_received = self.num_received_bytes.load(Ordering::Relaxed) == 0;
				match &e {
					Error::Protocol(_) => self.server.ban(&self.remote_addr),
					Error::Io(_) if nothing_received => self.server.ban(&self.remote_addr),
					Error::BadSignature => self.mark_unreachable(),
					_ => {}
				}
				self.terminate();
			}
		}
	}

	fn mark_unreachable(&self) {
		if let Some(identity) = self.remote_identity.lock().unwrap().as_ref() {
			if let Some(transports) = self.server.transports() {
				transports.netdb().set_unreachable(&identity.hash(), true);
			}
		}
	}

	fn read_exact(&self, buf: &mut [u8]) -> Result<(), Error> {
		let mut stream = &self.stream;
		stream.read_exact(buf)?;
		self.count_received(buf.len());
		Ok(())
	}

	fn count_received(&self, n: usize) {
		self.num_received_bytes.fetch_add(n as u64, Ordering::Relaxed);
		if let Some(transports) = self.server.transports() {
			transports.update_received_bytes(n as u64);
		}
		self.touch();
	}

	fn count_sent(&self, n: usize) {
		self.num_sent_bytes.fetch_add(n as u64, Ordering::Relaxed);
		if let Some(transports) = self.server.transports() {
			transports.update_sent_bytes(n as u64);
		}
		self.touch();
	}

	fn write_all(&self, buf: &[u8]) -> Result<(), Error> {
		let mut stream = &self.stream;
		stream.write_all(buf)?;
		self.count_sent(buf.len());
		Ok(())
	}

	fn transports(&self) -> Result<Arc<crate::transport::Transports>, Error> {
		self.server.transports().ok_or(Error::SessionClosed)
	}

	fn signed_data(x: &[u8], y: &[u8], ident_hash: &Hash, ts_a: u32, ts_b: u32) -> Vec<u8> {
		let mut data = Vec::with_capacity(2 * NTCP_PUB_KEY_SIZE + NTCP_HASH_SIZE + 8);
		data.extend_from_slice(x);
		data.extend_from_slice(y);
		data.extend_from_slice(&ident_hash.0);
		data.extend_from_slice(&ts_a.to_be_bytes());
		data.extend_from_slice(&ts_b.to_be_bytes());
		data
	}

	/// Initiator side: sends phases 1 and 3, receives 2 and 4.
	fn client_handshake(self: &Arc<Self>) -> Result<(CbcEncryptor, CbcDecryptor), Error> {
		let transports = self.transports()?;
		let ctx = transports.context().clone();
		let remote_identity = self
			.remote_identity
			.lock()
			.unwrap()
			.clone()
			.ok_or(Error::SessionClosed)?;
		let dh_keys = transports.dh_pool.acquire();
		let x = dh_keys.public_key;

		// Phase 1: X || SHA-256(X) ^ SHA-256(B identity)
		debug!("NtcpSession: {} <-- phase 1", self.remote_addr);
		let mut phase1 = [0u8; NTCP_PHASE1_SIZE];
		phase1[..NTCP_PUB_KEY_SIZE].copy_from_slice(&x);
		let hx = Sha256::digest(x);
		let remote_hash = remote_identity.hash();
		for i in 0..NTCP_HASH_SIZE {
			phase1[NTCP_PUB_KEY_SIZE + i] = hx[i] ^ remote_hash.0[i];
		}
		let hxxorhi: [u8; 32] = phase1[NTCP_PUB_KEY_SIZE..].try_into().unwrap();
		self.write_all(&phase1)?;

		// Phase 2: Y || AES(SHA-256(X||Y) || tsB || padding)
		debug!("NtcpSession: {} --> phase 2", self.remote_addr);
		let mut phase2 = [0u8; NTCP_PHASE2_SIZE];
		self.read_exact(&mut phase2)?;
		let y: [u8; DH_KEY_SIZE] = phase2[..NTCP_PUB_KEY_SIZE].try_into().unwrap();

		let shared = dh_keys.agree(&y)?;
		let session_key = derive_session_key(&shared)?;
		let mut decryptor = CbcDecryptor::new(&session_key, y[240..256].try_into().unwrap());
		let mut encryptor = CbcEncryptor::new(&session_key, hxxorhi[16..32].try_into().unwrap());

		let mut encrypted: [u8; 48] = phase2[NTCP_PUB_KEY_SIZE..].try_into().unwrap();
		decryptor.decrypt(&mut encrypted);
		let mut xy = Vec::with_capacity(2 * NTCP_PUB_KEY_SIZE);
		xy.extend_from_slice(&x);
		xy.extend_from_slice(&y);
		if Sha256::digest(&xy)[..] != encrypted[..32] {
			error!("NtcpSession: {} phase 2, incorrect hash", self.remote_addr);
			transports.dh_pool.give_back(dh_keys);
			return Err(Error::Protocol("phase 2 hash mismatch".into()));
		}
		let ts_b = BigEndian::read_u32(&encrypted[32..36]);

		// Phase 3: our identity, timestamp and signature, encrypted
		debug!("NtcpSession: {} <-- phase 3", self.remote_addr);
		let ts_a = seconds_since_epoch();
		let own_identity_bytes = ctx.keys().identity.to_bytes();
		let mut phase3 = Vec::new();
		phase3.extend_from_slice(&(own_identity_bytes.len() as u16).to_be_bytes());
		phase3.extend_from_slice(&own_identity_bytes);
		phase3.extend_from_slice(&ts_a.to_be_bytes());
		let sig_len = ctx.keys().identity.signature_len();
		let padding = round_up_to_block(phase3.len() + sig_len) - phase3.len() - sig_len;
		let mut pad = vec![0u8; padding];
		rand::thread_rng().fill_bytes(&mut pad);
		phase3.extend_from_slice(&pad);
		let signed = Self::signed_data(&x, &y, &remote_hash, ts_a, ts_b);
		phase3.extend_from_slice(&ctx.keys().sign(&signed)?);
		encryptor.encrypt(&mut phase3);
		self.write_all(&phase3)?;

		// Phase 4: B's signature over the same transcript with our hash
		debug!("NtcpSession: {} --> phase 4", self.remote_addr);
		let own_hash = ctx.ident_hash();
		let sig_read = round_up_to_block(remote_identity.signature_len());
		let mut phase4 = vec![0u8; sig_read];
		if let Err(e) = self.read_exact(&mut phase4) {
			// the responder hung up on our identity; clocks may disagree
			error!(
				"NtcpSession: {} phase 4 read error '{}', check your clock",
				self.remote_addr, e
			);
			self.mark_unreachable();
			return Err(e);
		}
		decryptor.decrypt(&mut phase4);
		let signed = Self::signed_data(&x, &y, &own_hash, ts_a, ts_b);
		remote_identity
			.verify(&signed, &phase4[..remote_identity.signature_len()])
			.map_err(|_| {
				error!(
					"NtcpSession: {} phase 4 signature verification failed",
					self.remote_addr
				);
				Error::BadSignature
			})?;

		Ok((encryptor, decryptor))
	}

	/// Responder side: receives phases 1 and 3, sends 2 and 4.
	fn server_handshake(self: &Arc<Self>) -> Result<(CbcEncryptor, CbcDecryptor), Error> {
		let transports = self.transports()?;
		let ctx = transports.context().clone();

		// Phase 1
		debug!("NtcpSession: {} --> phase 1", self.remote_addr);
		let mut phase1 = [0u8; NTCP_PHASE1_SIZE];
		self.read_exact(&mut phase1)?;
		let x: [u8; DH_KEY_SIZE] = phase1[..NTCP_PUB_KEY_SIZE].try_into().unwrap();
		let hxxorhi: [u8; 32] = phase1[NTCP_PUB_KEY_SIZE..].try_into().unwrap();
		let hx = Sha256::digest(x);
		let own_hash = ctx.ident_hash();
		for i in 0..NTCP_HASH_SIZE {
			if hxxorhi[i] ^ own_hash.0[i] != hx[i] {
				error!("NtcpSession: {} phase 1, wrong ident", self.remote_addr);
				return Err(Error::Protocol("phase 1 ident mismatch".into()));
			}
		}

		// Phase 2
		debug!("NtcpSession: {} <-- phase 2", self.remote_addr);
		let dh_keys = transports.dh_pool.acquire();
		let y = dh_keys.public_key;
		let shared = dh_keys.agree(&x)?;
		let session_key = derive_session_key(&shared)?;
		let mut encryptor = CbcEncryptor::new(&session_key, y[240..256].try_into().unwrap());
		let mut decryptor = CbcDecryptor::new(&session_key, hxxorhi[16..32].try_into().unwrap());

		let ts_b = seconds_since_epoch();
		let mut xy = Vec::with_capacity(2 * NTCP_PUB_KEY_SIZE);
		xy.extend_from_slice(&x);
		xy.extend_from_slice(&y);
		let mut encrypted = [0u8; 48];
		encrypted[..32].copy_from_slice(&Sha256::digest(&xy));
		BigEndian::write_u32(&mut encrypted[32..36], ts_b);
		rand::thread_rng().fill_bytes(&mut encrypted[36..]);
		encryptor.encrypt(&mut encrypted);
		let mut phase2 = [0u8; NTCP_PHASE2_SIZE];
		phase2[..NTCP_PUB_KEY_SIZE].copy_from_slice(&y);
		phase2[NTCP_PUB_KEY_SIZE..].copy_from_slice(&encrypted);
		self.write_all(&phase2)?;

		// Phase 3
		debug!("NtcpSession: {} --> phase 3", self.remote_addr);
		let mut phase3 = vec![0u8; NTCP_PHASE3_BASE_SIZE];
		self.read_exact(&mut phase3)?;
		decryptor.decrypt(&mut phase3);
		let ident_size = BigEndian::read_u16(&phase3[..2]) as usize;
		if ident_size == 0 || ident_size > NTCP_BUFFER_SIZE {
			return Err(Error::Protocol("phase 3 bad identity length".into()));
		}
		let ident_end = 2 + ident_size;
		// oversized identities spill past the base read
		if ident_end + 4 > phase3.len() {
			let needed = round_up_to_block(ident_end + 4) - phase3.len();
			let mut more = vec![0u8; needed];
			self.read_exact(&mut more)?;
			decryptor.decrypt(&mut more);
			phase3.extend_from_slice(&more);
		}
		let remote_identity = RouterIdentity::from_bytes(&phase3[2..ident_end])
			.map_err(|_| Error::Protocol("phase 3 undecodable identity".into()))?;
		if self.server.find_session(&remote_identity.hash()).is_some() {
			error!(
				"NtcpSession: {} phase 3, session already exists",
				self.remote_addr
			);
			return Err(Error::Protocol("session already exists".into()));
		}
		let sig_len = remote_identity.signature_len();
		let unpadded = ident_end + 4 + sig_len;
		let expected = round_up_to_block(unpadded);
		if expected > phase3.len() {
			let mut more = vec![0u8; expected - phase3.len()];
			self.read_exact(&mut more)?;
			decryptor.decrypt(&mut more);
			phase3.extend_from_slice(&more);
		}
		let ts_a = BigEndian::read_u32(&phase3[ident_end..ident_end + 4]);
		let padding = expected - unpadded;
		let sig_offset = ident_end + 4 + padding;
		let signed = Self::signed_data(&x, &y, &own_hash, ts_a, ts_b);
		remote_identity
			.verify(&signed, &phase3[sig_offset..sig_offset + sig_len])
			.map_err(|_| {
				error!(
					"NtcpSession: {} phase 3 signature verification failed",
					self.remote_addr
				);
				Error::BadSignature
			})?;
		*self.remote_identity.lock().unwrap() = Some(remote_identity.clone());

		// Phase 4: sign over the initiator's identity hash
		debug!("NtcpSession: {} <-- phase 4", self.remote_addr);
		let signed = Self::signed_data(&x, &y, &remote_identity.hash(), ts_a, ts_b);
		let mut phase4 = ctx.keys().sign(&signed)?;
		let sig_len = phase4.len();
		let padded = round_up_to_block(sig_len);
		if padded > sig_len {
			let mut pad = vec![0u8; padded - sig_len];
			rand::thread_rng().fill_bytes(&mut pad);
			phase4.extend_from_slice(&pad);
		}
		encryptor.encrypt(&mut phase4);
		self.write_all(&phase4)?;

		Ok((encryptor, decryptor))
	}

	/// Marks the session live, announces ourselves and registers with the
	/// peer manager.
	fn connected(self: &Arc<Self>, encryptor: CbcEncryptor) {
		debug!("NtcpSession: {} established", self.remote_addr);
		self.is_established.store(true, Ordering::SeqCst);
		{
			let stream = match self.stream.try_clone() {
				Ok(s) => s,
				Err(e) => {
					error!("NtcpSession: cannot clone stream: {}", e);
					self.terminate();
					return;
				}
			};
			*self.send_state.lock().unwrap() = Some(SendState { encryptor, stream });
		}
		if let Some(ident) = self.remote_hash() {
			self.server.add_session(ident, self.clone());
		}
		// time sync, then we tell immediately who we are
		self.send_time_sync();
		if let Some(transports) = self.server.transports() {
			let ctx = transports.context();
			if let Ok(store) = i2np::create_database_store_message(&ctx.router_info(), 0, None) {
				self.send_messages(vec![store]);
			}
			transports.peer_connected(self.clone() as Arc<dyn TransportSession>);
		}
	}

	//
	// Steady state
	//

	fn build_frame(msg: Option<&Message>, out: &mut Vec<u8>) {
		let start = out.len();
		match msg {
			Some(msg) => {
				let body = msg.bytes();
				out.extend_from_slice(&(body.len() as u16).to_be_bytes());
				out.extend_from_slice(body);
			}
			None => {
				// time sync frame: zero length then seconds
				out.extend_from_slice(&0u16.to_be_bytes());
				out.extend_from_slice(&seconds_since_epoch().to_be_bytes());
			}
		}
		let unpadded = out.len() - start + ADLER_SIZE;
		let padding = round_up_to_block(unpadded) - unpadded;
		let mut pad = vec![0u8; padding];
		rand::thread_rng().fill_bytes(&mut pad);
		out.extend_from_slice(&pad);
		let digest = adler32(&out[start..]);
		out.extend_from_slice(&digest.to_be_bytes());
	}

	/// Encrypts and writes a batch of frames as one gathered write. Callers
	/// waiting on the send lock preserve submission order.
	fn send_frames(&self, msgs: &[Option<&Message>]) {
		let mut state = self.send_state.lock().unwrap();
		let Some(send) = state.as_mut() else {
			debug!("NtcpSession: send before establishment, dropping");
			return;
		};
		let mut buf = Vec::new();
		for msg in msgs {
			Self::build_frame(*msg, &mut buf);
		}
		send.encryptor.encrypt(&mut buf);
		if let Err(e) = send.stream.write_all(&buf) {
			warn!("NtcpSession: {} send error: {}", self.remote_addr, e);
			return;
		}
		drop(state);
		self.count_sent(buf.len());
	}

	pub fn send_time_sync(&self) {
		debug!("NtcpSession: {} <-- time sync", self.remote_addr);
		self.send_frames(&[None]);
	}

	fn receive_loop(self: &Arc<Self>, mut decryptor: CbcDecryptor) {
		let mut pending: Vec<u8> = Vec::with_capacity(NTCP_BUFFER_SIZE);
		let mut chunk = vec![0u8; NTCP_BUFFER_SIZE];
		let mut reassembly = Reassembly {
			frame: Vec::new(),
			expected: 0,
		};
		let mut stream = match self.stream.try_clone() {
			Ok(s) => s,
			Err(_) => return,
		};
		loop {
			if self.is_terminated.load(Ordering::SeqCst) {
				return;
			}
			let n = match stream.read(&mut chunk) {
				Ok(0) => {
					debug!("NtcpSession: {} closed by remote", self.remote_addr);
					self.terminate();
					return;
				}
				Ok(n) => n,
				Err(e) => {
					if !self.is_terminated.load(Ordering::SeqCst) {
						debug!("NtcpSession: {} read error: {}", self.remote_addr, e);
					}
					self.terminate();
					return;
				}
			};
			self.count_received(n);

			pending.extend_from_slice(&chunk[..n]);
			let full_blocks = pending.len() / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
			let mut received = Vec::new();
			decryptor.decrypt(&mut pending[..full_blocks]);
			for block_start in (0..full_blocks).step_by(AES_BLOCK_SIZE) {
				let block = &pending[block_start..block_start + AES_BLOCK_SIZE];
				if let Err(e) = Self::feed_block(
					self.remote_addr,
					block,
					&mut reassembly,
					&mut received,
				) {
					warn!("NtcpSession: {} bad frame: {}", self.remote_addr, e);
					self.terminate();
					return;
				}
			}
			pending.drain(..full_blocks);
			if !received.is_empty() {
				self.deliver(received);
			}
		}
	}

	/// Feeds one decrypted block into the frame reassembly state.
	fn feed_block(
		remote: SocketAddr,
		block: &[u8],
		reassembly: &mut Reassembly,
		received: &mut Vec<Message>,
	) -> Result<(), Error> {
		if reassembly.frame.is_empty() {
			let data_size = BigEndian::read_u16(&block[..2]) as usize;
			if data_size == 0 {
				// time sync; 4 bytes of seconds follow the length
				debug!("NtcpSession: {} time sync", remote);
				return Ok(());
			}
			if data_size > NTCP_MAX_MESSAGE_SIZE {
				return Err(Error::OversizedMessage(data_size));
			}
			reassembly.expected =
				round_up_to_block(LENGTH_PREFIX_SIZE + data_size + ADLER_SIZE);
		}
		reassembly.frame.extend_from_slice(block);
		if reassembly.frame.len() >= reassembly.expected {
			let frame = std::mem::take(&mut reassembly.frame);
			let data_size = BigEndian::read_u16(&frame[..2]) as usize;
			let body_end = reassembly.expected - ADLER_SIZE;
			let digest = BigEndian::read_u32(&frame[body_end..body_end + ADLER_SIZE]);
			if adler32_verify(&frame[..body_end], digest) {
				match Message::from_bytes(
					&frame[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + data_size],
				) {
					Ok(message) => received.push(message),
					Err(e) => debug!("NtcpSession: undecodable message: {}", e),
				}
			} else {
				// drop the message, keep decoding subsequent frames
				warn!("NtcpSession: {} incorrect Adler checksum, message dropped", remote);
			}
		}
		Ok(())
	}

	fn deliver(&self, msgs: Vec<Message>) {
		let Some(transports) = self.server.transports() else {
			return;
		};
		let from = self.remote_hash();
		transports.context().dispatcher().dispatch_batch(from, msgs);
	}

	pub fn terminate(&self) {
		if self.is_terminated.swap(true, Ordering::SeqCst) {
			return;
		}
		debug!("NtcpSession: {} terminating", self.remote_addr);
		self.is_established.store(false, Ordering::SeqCst);
		let _ = self.stream.shutdown(Shutdown::Both);
		*self.send_state.lock().unwrap() = None;
		if let Some(ident) = self.remote_hash() {
			self.server.remove_session(&ident);
		}
		if let (Some(transports), Some(session)) =
			(self.server.transports(), self.self_ref.upgrade())
		{
			let session: Arc<dyn TransportSession> = session;
			transports.peer_disconnected(&session);
		}
		info!("NtcpSession: {} terminated", self.remote_addr);
	}
}

impl TransportSession for NtcpSession {
	fn send_messages(&self, msgs: Vec<Message>) {
		if self.is_terminated.load(Ordering::SeqCst) {
			return;
		}
		let frames: Vec<Option<&Message>> = msgs.iter().map(Some).collect();
		self.send_frames(&frames);
	}

	fn remote_hash(&self) -> Option<Hash> {
		self.remote_identity.lock().unwrap().as_ref().map(|i| i.hash())
	}

	fn done(&self) {
		// the send path is synchronous, so the queue is already drained
		self.terminate();
	}

	fn sent_bytes(&self) -> u64 {
		self.num_sent_bytes.load(Ordering::Relaxed)
	}

	fn received_bytes(&self) -> u64 {
		self.num_received_bytes.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn frame_layout() {
		let mut msg = Message::new();
		msg.append_payload(b"hello frames").unwrap();
		msg.fill_header(crate::i2np::MSG_TYPE_DATA);
		let mut out = Vec::new();
		NtcpSession::build_frame(Some(&msg), &mut out);
		assert_eq!(out.len() % AES_BLOCK_SIZE, 0);
		let len = BigEndian::read_u16(&out[..2]) as usize;
		assert_eq!(len, msg.total_len());
		let body_end = out.len() - ADLER_SIZE;
		let digest = BigEndian::read_u32(&out[body_end..]);
		assert!(adler32_verify(&out[..body_end], digest));
	}

	#[test]
	fn time_sync_frame_is_one_block() {
		let mut out = Vec::new();
		NtcpSession::build_frame(None, &mut out);
		assert_eq!(out.len(), AES_BLOCK_SIZE);
		assert_eq!(BigEndian::read_u16(&out[..2]), 0);
	}

	#[test]
	fn feed_block_reassembles_across_blocks() {
		let mut msg = Message::new();
		msg.append_payload(&[0x5A; 40]).unwrap();
		msg.fill_header(crate::i2np::MSG_TYPE_DATA);
		let mut frame = Vec::new();
		NtcpSession::build_frame(Some(&msg), &mut frame);

		let remote: SocketAddr = "127.0.0.1:1".parse().unwrap();
		let mut reassembly = Reassembly {
			frame: Vec::new(),
			expected: 0,
		};
		let mut received = Vec::new();
		for block in frame.chunks(AES_BLOCK_SIZE) {
			NtcpSession::feed_block(remote, block, &mut reassembly, &mut received).unwrap();
		}
		assert_eq!(received.len(), 1);
		assert_eq!(received[0].payload(), msg.payload());
		assert_eq!(received[0].msg_id(), msg.msg_id());
	}

	#[test]
	fn corrupted_frame_is_dropped_silently() {
		let mut msg = Message::new();
		msg.append_payload(b"corrupt me").unwrap();
		msg.fill_header(crate::i2np::MSG_TYPE_DATA);
		let mut frame = Vec::new();
		NtcpSession::build_frame(Some(&msg), &mut frame);
		frame[10] ^= 0x01;

		let remote: SocketAddr = "127.0.0.1:1".parse().unwrap();
		let mut reassembly = Reassembly {
			frame: Vec::new(),
			expected: 0,
		};
		let mut received = Vec::new();
		for block in frame.chunks(AES_BLOCK_SIZE) {
			NtcpSession::feed_block(remote, block, &mut reassembly, &mut received).unwrap();
		}
		assert!(received.is_empty());
		// the state is clean for the next frame
		assert!(reassembly.frame.is_empty());
	}

	#[test]
	fn oversized_length_terminates() {
		let remote: SocketAddr = "127.0.0.1:1".parse().unwrap();
		let mut block = [0u8; AES_BLOCK_SIZE];
		BigEndian::write_u16(&mut block[..2], (NTCP_MAX_MESSAGE_SIZE + 1) as u16);
		let mut reassembly = Reassembly {
			frame: Vec::new(),
			expected: 0,
		};
		let mut received = Vec::new();
		assert!(
			NtcpSession::feed_block(remote, &block, &mut reassembly, &mut received).is_err()
		);
	}
}
