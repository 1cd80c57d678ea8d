//! One SSU session: intro-key bootstrap, the three-message handshake, the
//! data channel, and the relay and peer-test subprotocols.
//!
//! Pre-session packets (session-request/created, relay-request/response,
//! direct peer tests) are protected with a 32-byte intro key published in the
//! target's router info; everything after session-confirmed uses the AES and
//! MAC keys derived from the DH agreement.

use log::{debug, error, info, warn};
use rand::{Rng, RngCore};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::crypto::aes::{decrypt_cbc, encrypt_cbc, AES_BLOCK_SIZE};
use crate::crypto::dh::{derive_session_key, DhKeys, DH_KEY_SIZE};
use crate::crypto::mac::{hmac_md5, hmac_md5_verify, MAC_SIZE};
use crate::crypto::{MacKey, SessionKey};
use crate::data::{seconds_since_epoch, Hash, RouterIdentity, RouterInfo};
use crate::error::Error;
use crate::i2np::{self, Message};
use crate::transport::{SessionState, TransportSession};

use super::data::SsuData;
use super::packet::{
	self, build_body, ip_bytes, ip_from_bytes, PayloadType, SsuPayload, SSU_IV_SIZE,
};
use super::SsuServer;

pub const SSU_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const SSU_TERMINATION_TIMEOUT: Duration = Duration::from_secs(330);
pub const SSU_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const SSU_INTRODUCER_SESSION_DURATION: Duration = Duration::from_secs(3600);

struct SessionKeys {
	session_key: SessionKey,
	mac_key: MacKey,
}

/// Splits the DH shared secret into the AES session key and the MAC key that
/// follows it.
fn derive_keys(shared: &[u8; DH_KEY_SIZE]) -> Result<(SessionKey, MacKey), Error> {
	let session_key = derive_session_key(shared)?;
	let start = if shared[0] & 0x80 != 0 {
		31
	} else if shared[0] != 0 {
		32
	} else {
		let pos = shared
			.iter()
			.position(|&b| b != 0)
			.ok_or_else(|| Error::Crypto("all-zero shared secret".into()))?;
		pos + 32
	};
	let mut mac = [0u8; 32];
	mac.copy_from_slice(&shared[start..start + 32]);
	Ok((session_key, MacKey(mac)))
}

/// The data the handshake signatures cover: X, Y, Alice's endpoint, Bob's
/// endpoint, the relay tag and the signed-on time.
fn handshake_signed_data(
	x: &[u8],
	y: &[u8],
	alice: &SocketAddr,
	bob: &SocketAddr,
	relay_tag: u32,
	signed_on: u32,
) -> Vec<u8> {
	let mut data = Vec::with_capacity(2 * DH_KEY_SIZE + 44);
	data.extend_from_slice(x);
	data.extend_from_slice(y);
	data.extend_from_slice(&ip_bytes(&alice.ip()));
	data.extend_from_slice(&alice.port().to_be_bytes());
	data.extend_from_slice(&ip_bytes(&bob.ip()));
	data.extend_from_slice(&bob.port().to_be_bytes());
	data.extend_from_slice(&relay_tag.to_be_bytes());
	data.extend_from_slice(&signed_on.to_be_bytes());
	data
}

/// MAC input per the packet format: encrypted body, IV, body length, then
/// the destination and source endpoints.
fn mac_input(encrypted: &[u8], iv: &[u8], dest: &SocketAddr, src: &SocketAddr) -> Vec<u8> {
	let mut data = Vec::with_capacity(encrypted.len() + SSU_IV_SIZE + 16);
	data.extend_from_slice(encrypted);
	data.extend_from_slice(iv);
	data.extend_from_slice(&(encrypted.len() as u16).to_be_bytes());
	data.extend_from_slice(&ip_bytes(&dest.ip()));
	data.extend_from_slice(&dest.port().to_be_bytes());
	data.extend_from_slice(&ip_bytes(&src.ip()));
	data.extend_from_slice(&src.port().to_be_bytes());
	data
}

pub struct SsuSession {
	self_ref: Weak<SsuSession>,
	server: Arc<SsuServer>,
	remote_endpoint: SocketAddr,
	remote_router: Mutex<Option<Arc<RouterInfo>>>,
	remote_identity: Mutex<Option<RouterIdentity>>,
	/// the remote's published intro key, known for outbound sessions
	remote_intro_key: Mutex<Option<[u8; 32]>>,
	state: Mutex<SessionState>,
	keys: Mutex<Option<SessionKeys>>,
	dh_keys: Mutex<Option<DhKeys>>,
	/// X as received by the responder, for the handshake signatures
	remote_dh_x: Mutex<Option<Vec<u8>>>,
	/// relay tag we issued to the remote (we are their introducer)
	issued_relay_tag: Mutex<u32>,
	/// relay tag the remote issued to us
	granted_relay_tag: Mutex<u32>,
	data: Mutex<SsuData>,
	pending_sends: Mutex<Vec<Message>>,
	run_peer_test: AtomicBool,
	created: Instant,
	last_activity: Mutex<Instant>,
	last_keep_alive: Mutex<Instant>,
	num_sent_bytes: AtomicU64,
	num_received_bytes: AtomicU64,
}

impl SsuSession {
	pub fn new(
		server: Arc<SsuServer>,
		remote_endpoint: SocketAddr,
		remote_router: Option<Arc<RouterInfo>>,
		peer_test: bool,
	) -> Arc<Self> {
		let remote_identity = remote_router.as_ref().map(|r| r.identity.clone());
		let remote_intro_key = remote_router
			.as_ref()
			.and_then(|r| r.ssu_address())
			.and_then(|a| a.intro_key());
		let is_v6 = remote_endpoint.is_ipv6();
		Arc::new_cyclic(|self_ref| SsuSession {
			self_ref: self_ref.clone(),
			server,
			remote_endpoint,
			remote_router: Mutex::new(remote_router),
			remote_identity: Mutex::new(remote_identity),
			remote_intro_key: Mutex::new(remote_intro_key),
			state: Mutex::new(SessionState::Unknown),
			keys: Mutex::new(None),
			dh_keys: Mutex::new(None),
			remote_dh_x: Mutex::new(None),
			issued_relay_tag: Mutex::new(0),
			granted_relay_tag: Mutex::new(0),
			data: Mutex::new(SsuData::new(is_v6)),
			pending_sends: Mutex::new(Vec::new()),
			run_peer_test: AtomicBool::new(peer_test),
			created: Instant::now(),
			last_activity: Mutex::new(Instant::now()),
			last_keep_alive: Mutex::new(Instant::now()),
			num_sent_bytes: AtomicU64::new(0),
			num_received_bytes: AtomicU64::new(0),
		})
	}

	pub fn remote_endpoint(&self) -> SocketAddr {
		self.remote_endpoint
	}

	pub fn state(&self) -> SessionState {
		*self.state.lock().unwrap()
	}

	pub fn is_established(&self) -> bool {
		self.state() == SessionState::Established
	}

	pub fn created_at(&self) -> Instant {
		self.created
	}

	/// The relay tag the remote issued to us, nonzero when it agreed to act
	/// as our introducer. Published in our SSU address when firewalled.
	pub fn granted_relay_tag(&self) -> u32 {
		*self.granted_relay_tag.lock().unwrap()
	}

	pub fn idle_for(&self) -> Duration {
		self.last_activity.lock().unwrap().elapsed()
	}

	fn touch(&self) {
		*self.last_activity.lock().unwrap() = Instant::now();
	}

	fn own_intro_key(&self) -> [u8; 32] {
		// we publish our identity hash as intro key
		self.server.context_hash().0
	}

	//
	// Packet encryption
	//

	pub(crate) fn send_with_keys(
		&self,
		payload_type: PayloadType,
		content: &[u8],
		aes_key: &SessionKey,
		mac_key: &MacKey,
	) {
		let mut iv = [0u8; SSU_IV_SIZE];
		rand::thread_rng().fill_bytes(&mut iv);
		let mut body = build_body(payload_type, seconds_since_epoch(), content);
		let padding = (AES_BLOCK_SIZE - body.len() % AES_BLOCK_SIZE) % AES_BLOCK_SIZE;
		if padding > 0 {
			let start = body.len();
			body.resize(start + padding, 0);
			rand::thread_rng().fill_bytes(&mut body[start..]);
		}
		encrypt_cbc(aes_key, &iv, &mut body);

		let local = self.server.external_endpoint();
		let mac = hmac_md5(
			mac_key,
			&mac_input(&body, &iv, &self.remote_endpoint, &local),
		);

		let mut packet = Vec::with_capacity(MAC_SIZE + SSU_IV_SIZE + body.len());
		packet.extend_from_slice(&mac);
		packet.extend_from_slice(&iv);
		packet.extend_from_slice(&body);
		self.num_sent_bytes
			.fetch_add(packet.len() as u64, Ordering::Relaxed);
		self.server.send_to(&packet, &self.remote_endpoint);
	}

	fn send_with_session_keys(&self, payload_type: PayloadType, content: &[u8]) {
		let keys = self.keys.lock().unwrap();
		let Some(keys) = keys.as_ref() else {
			warn!("SsuSession: {} no session keys yet", self.remote_endpoint);
			return;
		};
		self.send_with_keys(payload_type, content, &keys.session_key, &keys.mac_key);
	}

	fn intro_keys_of_remote(&self) -> Option<(SessionKey, MacKey)> {
		let key = (*self.remote_intro_key.lock().unwrap())?;
		Some((SessionKey(key), MacKey(key)))
	}

	/// Verifies the MAC and decrypts a raw packet, trying the session keys
	/// first, then our own intro key, then the remote's published one.
	pub fn open_packet(&self, raw: &[u8], from: &SocketAddr) -> Result<Vec<u8>, Error> {
		if raw.len() < MAC_SIZE + SSU_IV_SIZE + AES_BLOCK_SIZE {
			return Err(Error::Truncated("SSU packet"));
		}
		let (mac, rest) = raw.split_at(MAC_SIZE);
		let (iv_slice, body) = rest.split_at(SSU_IV_SIZE);
		if body.len() % AES_BLOCK_SIZE != 0 {
			return Err(Error::Protocol("SSU body not block aligned".into()));
		}
		let iv: [u8; SSU_IV_SIZE] = iv_slice.try_into().expect("fixed size");
		let local = self.server.external_endpoint();
		let input = mac_input(body, &iv, &local, from);

		let mut candidates: Vec<(SessionKey, MacKey)> = Vec::new();
		if let Some(keys) = self.keys.lock().unwrap().as_ref() {
			candidates.push((keys.session_key.clone(), keys.mac_key.clone()));
		}
		let own = self.own_intro_key();
		candidates.push((SessionKey(own), MacKey(own)));
		if let Some(remote) = self.intro_keys_of_remote() {
			candidates.push(remote);
		}
		for (aes_key, mac_key) in candidates {
			if hmac_md5_verify(&mac_key, &input, mac) {
				let mut decrypted = body.to_vec();
				decrypt_cbc(&aes_key, &iv, &mut decrypted);
				self.num_received_bytes
					.fetch_add(raw.len() as u64, Ordering::Relaxed);
				self.touch();
				return Ok(decrypted);
			}
		}
		Err(Error::Crypto("SSU MAC mismatch".into()))
	}

	/// Handles one decrypted packet body.
	pub fn process_packet(self: &Arc<Self>, body: &[u8]) {
		let (header, payload) = match packet::parse_body(body) {
			Ok(parsed) => parsed,
			Err(e) => {
				warn!("SsuSession: {} bad packet: {}", self.remote_endpoint, e);
				self.server.ban(&self.remote_endpoint);
				return;
			}
		};
		let _ = header;
		let result = match payload {
			SsuPayload::SessionRequest(p) => self.on_session_request(p),
			SsuPayload::SessionCreated(p) => self.on_session_created(p),
			SsuPayload::SessionConfirmed(p) => self.on_session_confirmed(p),
			SsuPayload::RelayRequest(p) => self.on_relay_request(p),
			SsuPayload::RelayResponse(p) => self.on_relay_response(p),
			SsuPayload::RelayIntro(p) => self.on_relay_intro(p),
			SsuPayload::Data(p) => self.on_data(p),
			SsuPayload::PeerTest(p) => self.on_peer_test(p),
			SsuPayload::SessionDestroyed => {
				debug!("SsuSession: {} destroyed by remote", self.remote_endpoint);
				self.terminate(false);
				Ok(())
			}
		};
		if let Err(e) = result {
			warn!("SsuSession: {} handler error: {}", self.remote_endpoint, e);
			if matches!(e, Error::Protocol(_)) {
				self.server.ban(&self.remote_endpoint);
				self.terminate(false);
			}
		}
	}

	//
	// Establishment, initiator side
	//

	/// Sends the session request; requires the remote router info.
	pub fn connect(self: &Arc<Self>) -> Result<(), Error> {
		let (aes_key, mac_key) = self
			.intro_keys_of_remote()
			.ok_or(Error::NoCompatibleAddress("SSU"))?;
		let dh_keys = self.server.acquire_dh_keys()?;
		let content = packet::build_session_request(
			&dh_keys.public_key,
			&self.remote_endpoint.ip(),
		);
		*self.dh_keys.lock().unwrap() = Some(dh_keys);
		*self.state.lock().unwrap() = SessionState::Introduced;
		debug!("SsuSession: {} <-- session request", self.remote_endpoint);
		self.send_with_keys(PayloadType::SessionRequest, &content, &aes_key, &mac_key);
		Ok(())
	}

	fn on_session_created(self: &Arc<Self>, p: packet::SessionCreatedPacket) -> Result<(), Error> {
		if self.state() != SessionState::Introduced {
			return Ok(());
		}
		debug!("SsuSession: {} --> session created", self.remote_endpoint);
		let remote_identity = self
			.remote_identity
			.lock()
			.unwrap()
			.clone()
			.ok_or(Error::SessionClosed)?;
		let dh_keys = self
			.dh_keys
			.lock()
			.unwrap()
			.take()
			.ok_or(Error::SessionClosed)?;
		let shared = dh_keys.agree(&p.dh_y)?;
		let (session_key, mac_key) = derive_keys(&shared)?;

		// our observed endpoint, as the responder saw us
		let our_ip = ip_from_bytes(&p.address)
			.ok_or_else(|| Error::Protocol("bad address in session created".into()))?;
		let alice = SocketAddr::new(our_ip, p.port);

		// the signature block is AES-encrypted under the session key
		if p.signature.len() % AES_BLOCK_SIZE != 0 || p.signature.len() < AES_BLOCK_SIZE {
			return Err(Error::Protocol("bad signature block length".into()));
		}
		let mut sig_block = p.signature.clone();
		let sig_iv: [u8; SSU_IV_SIZE] = sig_block[..SSU_IV_SIZE].try_into().expect("size");
		// the block carries its own IV ahead of the encrypted signature
		let mut encrypted = sig_block.split_off(SSU_IV_SIZE);
		decrypt_cbc(&session_key, &sig_iv, &mut encrypted);
		let sig_len = remote_identity.signature_len();
		if encrypted.len() < sig_len {
			return Err(Error::Protocol("short signature block".into()));
		}

		let signed = handshake_signed_data(
			&dh_keys.public_key,
			&p.dh_y,
			&alice,
			&self.remote_endpoint,
			p.relay_tag,
			p.signed_on,
		);
		remote_identity
			.verify(&signed, &encrypted[..sig_len])
			.map_err(|_| {
				error!(
					"SsuSession: {} session created signature failed",
					self.remote_endpoint
				);
				self.mark_unreachable();
				Error::BadSignature
			})?;

		*self.granted_relay_tag.lock().unwrap() = p.relay_tag;
		if p.relay_tag != 0 {
			self.server.note_introducer(self.remote_endpoint);
		}
		*self.keys.lock().unwrap() = Some(SessionKeys {
			session_key: session_key.clone(),
			mac_key: mac_key.clone(),
		});

		// session confirmed: our identity and our signature over the tuple
		let ctx = self.server.context()?;
		let signed_on = seconds_since_epoch();
		let signed = handshake_signed_data(
			&dh_keys.public_key,
			&p.dh_y,
			&alice,
			&self.remote_endpoint,
			p.relay_tag,
			signed_on,
		);
		let signature = ctx.keys().sign(&signed)?;
		let content = packet::build_session_confirmed(
			&ctx.keys().identity.to_bytes(),
			signed_on,
			&signature,
		);
		debug!("SsuSession: {} <-- session confirmed", self.remote_endpoint);
		self.send_with_keys(PayloadType::SessionConfirmed, &content, &session_key, &mac_key);
		// established once the responder's delivery status arrives
		Ok(())
	}

	//
	// Establishment, responder side
	//

	fn on_session_request(self: &Arc<Self>, p: packet::SessionRequestPacket) -> Result<(), Error> {
		debug!("SsuSession: {} --> session request", self.remote_endpoint);
		let ctx = self.server.context()?;
		let dh_keys = self.server.acquire_dh_keys()?;
		let shared = dh_keys.agree(&p.dh_x)?;
		let (session_key, mac_key) = derive_keys(&shared)?;

		// issue a relay tag when we can introduce
		let relay_tag = if ctx.router_info().is_introducer() {
			let tag = rand::thread_rng().gen_range(1..u32::MAX);
			self.server.register_relay_tag(tag, self.remote_endpoint);
			*self.issued_relay_tag.lock().unwrap() = tag;
			tag
		} else {
			0
		};

		let signed_on = seconds_since_epoch();
		let bob = self.server.external_endpoint();
		let signed = handshake_signed_data(
			&p.dh_x,
			&dh_keys.public_key,
			&self.remote_endpoint,
			&bob,
			relay_tag,
			signed_on,
		);
		let mut sig_block = ctx.keys().sign(&signed)?;
		let padding = (AES_BLOCK_SIZE - sig_block.len() % AES_BLOCK_SIZE) % AES_BLOCK_SIZE;
		if padding > 0 {
			let start = sig_block.len();
			sig_block.resize(start + padding, 0);
			rand::thread_rng().fill_bytes(&mut sig_block[start..]);
		}
		// encrypt the signature with the new session key under its own IV
		let mut sig_iv = [0u8; SSU_IV_SIZE];
		rand::thread_rng().fill_bytes(&mut sig_iv);
		encrypt_cbc(&session_key, &sig_iv, &mut sig_block);
		let mut encrypted_signature = Vec::with_capacity(SSU_IV_SIZE + sig_block.len());
		encrypted_signature.extend_from_slice(&sig_iv);
		encrypted_signature.extend_from_slice(&sig_block);

		let content = packet::build_session_created(
			&dh_keys.public_key,
			&self.remote_endpoint.ip(),
			self.remote_endpoint.port(),
			relay_tag,
			signed_on,
			&encrypted_signature,
		);

		*self.remote_dh_x.lock().unwrap() = Some(p.dh_x);
		*self.dh_keys.lock().unwrap() = Some(dh_keys);
		*self.keys.lock().unwrap() = Some(SessionKeys {
			session_key,
			mac_key,
		});
		*self.state.lock().unwrap() = SessionState::Introduced;

		// the whole packet still travels under our intro key
		let own = self.own_intro_key();
		debug!("SsuSession: {} <-- session created", self.remote_endpoint);
		self.send_with_keys(
			PayloadType::SessionCreated,
			&content,
			&SessionKey(own),
			&MacKey(own),
		);
		Ok(())
	}

	fn on_session_confirmed(self: &Arc<Self>, p: packet::SessionConfirmedPacket) -> Result<(), Error> {
		if self.state() != SessionState::Introduced {
			return Ok(());
		}
		debug!("SsuSession: {} --> session confirmed", self.remote_endpoint);
		let remote_identity = RouterIdentity::from_bytes(&p.identity)
			.map_err(|_| Error::Protocol("undecodable identity in confirmed".into()))?;
		if self.server.find_by_ident(&remote_identity.hash()).is_some() {
			error!(
				"SsuSession: {} identity already bound to a session",
				self.remote_endpoint
			);
			self.terminate(true);
			return Err(Error::Protocol("identity already bound".into()));
		}
		let dh_keys = self
			.dh_keys
			.lock()
			.unwrap()
			.take()
			.ok_or(Error::SessionClosed)?;
		let x = self
			.remote_dh_x
			.lock()
			.unwrap()
			.take()
			.ok_or(Error::SessionClosed)?;
		let bob = self.server.external_endpoint();
		let relay_tag = *self.issued_relay_tag.lock().unwrap();
		let signed = handshake_signed_data(
			&x,
			&dh_keys.public_key,
			&self.remote_endpoint,
			&bob,
			relay_tag,
			p.signed_on,
		);
		let sig_len = remote_identity.signature_len();
		if p.signature.len() < sig_len {
			return Err(Error::Truncated("session confirmed signature"));
		}
		remote_identity
			.verify(&signed, &p.signature[..sig_len])
			.map_err(|_| {
				error!(
					"SsuSession: {} session confirmed signature failed",
					self.remote_endpoint
				);
				Error::BadSignature
			})?;

		*self.remote_identity.lock().unwrap() = Some(remote_identity);
		self.established();
		// confirm liveness to the initiator
		let status = i2np::create_delivery_status_message(rand::thread_rng().gen());
		self.send_messages(vec![status]);
		Ok(())
	}

	/// Installs the session: registry, peer manager, MTU clamp, queued sends.
	fn established(self: &Arc<Self>) {
		info!("SsuSession: {} established", self.remote_endpoint);
		*self.state.lock().unwrap() = SessionState::Established;
		if let Some(ident) = self.remote_hash() {
			self.server.register_ident(ident, self.remote_endpoint);
			// clamp the packet size to the remote's advertised MTU
			if let Some(transports) = self.server.transports() {
				let router = self
					.remote_router
					.lock()
					.unwrap()
					.clone()
					.or_else(|| transports.netdb().find_router(&ident));
				if let Some(router) = router {
					if let Some(mtu) = router.ssu_address().and_then(|a| a.mtu()) {
						self.data
							.lock()
							.unwrap()
							.adjust_packet_size(mtu, self.remote_endpoint.is_ipv6());
					}
				}
				if let Some(session) = self.self_ref.upgrade() {
					transports.peer_connected(session as Arc<dyn TransportSession>);
				}
			}
		}
		let pending = std::mem::take(&mut *self.pending_sends.lock().unwrap());
		if !pending.is_empty() {
			self.send_messages(pending);
		}
		if self.run_peer_test.swap(false, Ordering::SeqCst) {
			self.send_peer_test();
		}
	}

	fn mark_unreachable(&self) {
		if let (Some(identity), Some(transports)) = (
			self.remote_identity.lock().unwrap().as_ref(),
			self.server.transports(),
		) {
			transports.netdb().set_unreachable(&identity.hash(), true);
		}
	}

	//
	// Data channel
	//

	fn on_data(self: &Arc<Self>, p: packet::DataPacket) -> Result<(), Error> {
		let (acks, completed) = {
			let mut data = self.data.lock().unwrap();
			data.process_acks(&p.explicit_acks, &p.ack_bitfields);
			data.process_fragments(&p.fragments)
		};
		for ack in acks {
			self.send_with_session_keys(PayloadType::Data, &ack);
		}
		let established = self.is_established();
		let mut upward = Vec::new();
		for done in completed {
			if done.duplicate {
				continue;
			}
			let type_id = done.message.type_id();
			if established {
				upward.push(done.message);
			} else if type_id == i2np::MSG_TYPE_DELIVERY_STATUS {
				// the responder confirmed liveness
				info!("SsuSession: {} liveness confirmed", self.remote_endpoint);
				self.established();
			} else if type_id == i2np::MSG_TYPE_DATABASE_STORE {
				upward.push(done.message);
			} else {
				error!(
					"SsuSession: {} unexpected pre-establishment message {}",
					self.remote_endpoint, type_id
				);
			}
		}
		if !upward.is_empty() {
			if let Some(transports) = self.server.transports() {
				transports
					.context()
					.dispatcher()
					.dispatch_batch(self.remote_hash(), upward);
			}
		}
		// a fragment-free want-reply packet is a keep-alive; the activity
		// timestamp was already refreshed when the packet was opened
		Ok(())
	}

	//
	// Relay subprotocol (we can be Bob the introducer, Alice the requester,
	// or Charlie the firewalled target)
	//

	fn on_relay_request(self: &Arc<Self>, p: packet::RelayRequestPacket) -> Result<(), Error> {
		debug!(
			"SsuSession: {} --> relay request tag {}",
			self.remote_endpoint, p.relay_tag
		);
		let Some(charlie_endpoint) = self.server.lookup_relay_tag(p.relay_tag) else {
			warn!("SsuSession: unknown relay tag {}", p.relay_tag);
			return Ok(());
		};
		// intro to Charlie through the established session
		if let Some(charlie) = self.server.find_session(&charlie_endpoint) {
			let alice = self.remote_endpoint;
			let content = packet::build_relay_intro(
				&ip_bytes(&alice.ip()),
				alice.port(),
				&p.challenge,
			);
			charlie.send_with_session_keys(PayloadType::RelayIntro, &content);
		}
		// response to Alice under her intro key
		let content = packet::build_relay_response(
			(&ip_bytes(&charlie_endpoint.ip()), charlie_endpoint.port()),
			(&ip_bytes(&self.remote_endpoint.ip()), self.remote_endpoint.port()),
			p.nonce,
		);
		let alice_key = SessionKey(p.intro_key);
		let alice_mac = MacKey(p.intro_key);
		self.send_with_keys(PayloadType::RelayResponse, &content, &alice_key, &alice_mac);
		Ok(())
	}

	fn on_relay_response(self: &Arc<Self>, p: packet::RelayResponsePacket) -> Result<(), Error> {
		debug!(
			"SsuSession: {} --> relay response nonce {}",
			self.remote_endpoint, p.nonce
		);
		let Some(charlie_ip) = ip_from_bytes(&p.charlie_address) else {
			return Err(Error::Protocol("bad relay response address".into()));
		};
		let charlie = SocketAddr::new(charlie_ip, p.charlie_port);
		self.server.relay_response_received(p.nonce, charlie);
		Ok(())
	}

	fn on_relay_intro(self: &Arc<Self>, p: packet::RelayIntroPacket) -> Result<(), Error> {
		let Some(alice_ip) = ip_from_bytes(&p.address) else {
			return Err(Error::Protocol("bad relay intro address".into()));
		};
		let alice = SocketAddr::new(alice_ip, p.port);
		debug!("SsuSession: hole punch towards {}", alice);
		// a small random packet opens our NAT mapping towards Alice
		let mut punch = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut punch);
		self.server.send_to(&punch, &alice);
		Ok(())
	}

	//
	// Peer test
	//

	/// Starts a reachability test through this (established) session.
	pub fn send_peer_test(self: &Arc<Self>) {
		let nonce = rand::thread_rng().gen_range(1..u32::MAX);
		debug!(
			"SsuSession: {} <-- peer test nonce {}",
			self.remote_endpoint, nonce
		);
		self.server.register_peer_test(nonce);
		// empty address: Bob reads our endpoint from the packet source
		let content = packet::build_peer_test(nonce, &[], 0, &self.own_intro_key());
		self.send_with_session_keys(PayloadType::PeerTest, &content);
	}

	fn on_peer_test(self: &Arc<Self>, p: packet::PeerTestPacket) -> Result<(), Error> {
		if self.server.complete_peer_test(p.nonce) {
			// we are Alice and a third party reached us directly
			info!("SsuSession: peer test {} succeeded, we are reachable", p.nonce);
			if let Some(transports) = self.server.transports() {
				transports
					.context()
					.set_status(crate::router::RouterStatus::Ok);
			}
			return Ok(());
		}
		if p.address.is_empty() {
			// we are Bob: forward to a Charlie over another session
			let alice = self.remote_endpoint;
			debug!("SsuSession: forwarding peer test {} for {}", p.nonce, alice);
			let content = packet::build_peer_test(
				p.nonce,
				&ip_bytes(&alice.ip()),
				alice.port(),
				&p.intro_key,
			);
			if let Some(charlie) = self.server.random_established_except(&alice) {
				charlie.send_with_session_keys(PayloadType::PeerTest, &content);
			}
			return Ok(());
		}
		// we are Charlie: answer Alice directly under her intro key
		let Some(alice_ip) = ip_from_bytes(&p.address) else {
			return Err(Error::Protocol("bad peer test address".into()));
		};
		let alice = SocketAddr::new(alice_ip, p.port);
		debug!("SsuSession: answering peer test {} towards {}", p.nonce, alice);
		let content = packet::build_peer_test(
			p.nonce,
			&ip_bytes(&alice.ip()),
			alice.port(),
			&self.own_intro_key(),
		);
		let key = SessionKey(p.intro_key);
		let mac = MacKey(p.intro_key);
		let session = self.server.session_towards(alice);
		session.send_with_keys(PayloadType::PeerTest, &content, &key, &mac);
		Ok(())
	}

	//
	// Timers, called from the server maintenance thread
	//

	pub fn tick(self: &Arc<Self>, now: Instant) {
		let state = self.state();
		match state {
			SessionState::Unknown | SessionState::Introduced => {
				if self.created.elapsed() > SSU_CONNECT_TIMEOUT {
					warn!("SsuSession: {} connect timed out", self.remote_endpoint);
					self.fail();
				}
			}
			SessionState::Established => {
				if self.idle_for() > SSU_TERMINATION_TIMEOUT {
					info!("SsuSession: {} termination timeout", self.remote_endpoint);
					self.terminate(true);
					return;
				}
				let resend = self.data.lock().unwrap().resend_due(now);
				for body in resend {
					self.send_with_session_keys(PayloadType::Data, &body);
				}
				self.data.lock().unwrap().maintain(now);
				let mut last_keep_alive = self.last_keep_alive.lock().unwrap();
				if last_keep_alive.elapsed() > SSU_KEEP_ALIVE_INTERVAL {
					*last_keep_alive = Instant::now();
					drop(last_keep_alive);
					self.send_keep_alive();
				}
			}
			SessionState::Closed | SessionState::Failed => {}
		}
	}

	/// Data packet with no fragments and want-reply set.
	fn send_keep_alive(&self) {
		debug!("SsuSession: {} <-- keep alive", self.remote_endpoint);
		let body = packet::DataPayloadBuilder::new().want_reply().build();
		self.send_with_session_keys(PayloadType::Data, &body);
	}

	fn fail(self: &Arc<Self>) {
		*self.state.lock().unwrap() = SessionState::Failed;
		self.server.remove_session(&self.remote_endpoint);
		if let (Some(transports), Some(session)) =
			(self.server.transports(), self.self_ref.upgrade())
		{
			let session: Arc<dyn TransportSession> = session;
			transports.peer_disconnected(&session);
		}
	}

	pub fn terminate(self: &Arc<Self>, notify_remote: bool) {
		{
			let mut state = self.state.lock().unwrap();
			if *state == SessionState::Closed {
				return;
			}
			*state = SessionState::Closed;
		}
		if notify_remote && self.keys.lock().unwrap().is_some() {
			self.send_with_session_keys(PayloadType::SessionDestroyed, &[]);
		}
		if let Some(tag) = {
			let tag = *self.issued_relay_tag.lock().unwrap();
			(tag != 0).then_some(tag)
		} {
			self.server.unregister_relay_tag(tag);
		}
		if let Some(ident) = self.remote_hash() {
			self.server.unregister_ident(&ident);
		}
		self.server.remove_session(&self.remote_endpoint);
		if let (Some(transports), Some(session)) =
			(self.server.transports(), self.self_ref.upgrade())
		{
			let session: Arc<dyn TransportSession> = session;
			transports.peer_disconnected(&session);
		}
		info!("SsuSession: {} terminated", self.remote_endpoint);
	}
}

impl TransportSession for SsuSession {
	fn send_messages(&self, msgs: Vec<Message>) {
		if !self.is_established() {
			let mut pending = self.pending_sends.lock().unwrap();
			pending.extend(msgs);
			return;
		}
		for mut msg in msgs {
			let bodies = match self.data.lock().unwrap().send(&mut msg) {
				Ok(bodies) => bodies,
				Err(e) => {
					warn!("SsuSession: {} send failed: {}", self.remote_endpoint, e);
					continue;
				}
			};
			for body in bodies {
				self.send_with_session_keys(PayloadType::Data, &body);
			}
		}
	}

	fn remote_hash(&self) -> Option<Hash> {
		self.remote_identity.lock().unwrap().as_ref().map(|i| i.hash())
	}

	fn done(&self) {
		if let Some(session) = self.self_ref.upgrade() {
			session.terminate(true);
		}
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
	fn key_derivation_splits_session_and_mac() {
		let mut shared = [0u8; DH_KEY_SIZE];
		for (i, b) in shared.iter_mut().enumerate() {
			*b = (i % 251 + 1) as u8;
		}
		let (session, mac) = derive_keys(&shared).unwrap();
		assert_eq!(session.0[..], shared[..32]);
		assert_eq!(mac.0[..], shared[32..64]);
		assert_ne!(session.0, mac.0);
	}

	#[test]
	fn key_derivation_high_bit() {
		let mut shared = [0u8; DH_KEY_SIZE];
		shared[0] = 0x80;
		for (i, b) in shared.iter_mut().enumerate().skip(1) {
			*b = i as u8;
		}
		let (session, mac) = derive_keys(&shared).unwrap();
		assert_eq!(session.0[0], 0);
		assert_eq!(session.0[1..], shared[..31]);
		assert_eq!(mac.0[..], shared[31..63]);
	}

	#[test]
	fn signed_data_covers_both_endpoints() {
		let x = vec![1u8; DH_KEY_SIZE];
		let y = vec![2u8; DH_KEY_SIZE];
		let alice: SocketAddr = "10.0.0.1:1111".parse().unwrap();
		let bob: SocketAddr = "10.0.0.2:2222".parse().unwrap();
		let a = handshake_signed_data(&x, &y, &alice, &bob, 5, 6);
		let b = handshake_signed_data(&x, &y, &alice, &bob, 5, 7);
		assert_ne!(a, b);
		let c = handshake_signed_data(&x, &y, &bob, &alice, 5, 6);
		assert_ne!(a, c);
		assert_eq!(a.len(), 2 * DH_KEY_SIZE + 4 + 2 + 4 + 2 + 4 + 4);
	}

	#[test]
	fn mac_input_binds_addresses() {
		let iv = [0u8; SSU_IV_SIZE];
		let body = [1u8; 32];
		let a: SocketAddr = "10.0.0.1:1111".parse().unwrap();
		let b: SocketAddr = "10.0.0.2:2222".parse().unwrap();
		assert_ne!(mac_input(&body, &iv, &a, &b), mac_input(&body, &iv, &b, &a));
	}
}
