//! SSU, the UDP-based datagram transport.
//!
//! The server owns the socket, the session registry keyed by remote
//! endpoint, the relay-tag table for sessions we introduce, and the
//! peer-test nonce table. A receive thread feeds packets to sessions; a
//! maintenance thread drives resends and timeouts once per second.

use dashmap::DashMap;
use log::{debug, info, warn};
use rand::seq::IteratorRandom;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::crypto::dh::DhKeys;
use crate::data::{Hash, RouterInfo};
use crate::error::Error;
use crate::router::RouterContext;

use super::Transports;

pub mod data;
pub mod packet;
pub mod session;

pub use self::session::SsuSession;

use self::packet::{SSU_MTU_V4, SSU_PACKET_MAX_V4};
use self::session::{SSU_CONNECT_TIMEOUT, SSU_INTRODUCER_SESSION_DURATION};

pub const SSU_PEER_TEST_TIMEOUT: Duration = Duration::from_secs(60);
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// An in-flight introduction: the router we are trying to reach and the
/// nonce our relay request carried.
struct PendingIntroduction {
	router: Arc<RouterInfo>,
	created: Instant,
}

pub struct SsuServer {
	transports: Weak<Transports>,
	socket: UdpSocket,
	local_addr: SocketAddr,
	sessions: DashMap<SocketAddr, Arc<SsuSession>>,
	by_ident: DashMap<Hash, SocketAddr>,
	relay_tags: DashMap<u32, SocketAddr>,
	peer_tests: DashMap<u32, Instant>,
	introductions: DashMap<u32, PendingIntroduction>,
	/// sessions kept alive because the remote introduces for us
	introducer_sessions: DashMap<SocketAddr, Instant>,
	running: AtomicBool,
	threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SsuServer {
	pub fn new(transports: Weak<Transports>, addr: SocketAddr) -> Result<Arc<Self>, Error> {
		let socket = UdpSocket::bind(addr)?;
		socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
		let local_addr = socket.local_addr()?;
		Ok(Arc::new(SsuServer {
			transports,
			socket,
			local_addr,
			sessions: DashMap::new(),
			by_ident: DashMap::new(),
			relay_tags: DashMap::new(),
			peer_tests: DashMap::new(),
			introductions: DashMap::new(),
			introducer_sessions: DashMap::new(),
			running: AtomicBool::new(false),
			threads: Mutex::new(Vec::new()),
		}))
	}

	pub fn start(self: &Arc<Self>) {
		self.running.store(true, Ordering::SeqCst);
		let server = self.clone();
		let receive = thread::Builder::new()
			.name("ssu-receive".into())
			.spawn(move || server.receive_loop())
			.expect("spawn ssu receive thread");
		let server = self.clone();
		let maintenance = thread::Builder::new()
			.name("ssu-maintenance".into())
			.spawn(move || server.maintenance_loop())
			.expect("spawn ssu maintenance thread");
		let mut threads = self.threads.lock().unwrap();
		threads.push(receive);
		threads.push(maintenance);
	}

	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
		let sessions: Vec<Arc<SsuSession>> =
			self.sessions.iter().map(|e| e.value().clone()).collect();
		for session in sessions {
			session.terminate(true);
		}
		self.sessions.clear();
		self.by_ident.clear();
		self.relay_tags.clear();
		for handle in self.threads.lock().unwrap().drain(..) {
			let _ = handle.join();
		}
	}

	pub(crate) fn transports(&self) -> Option<Arc<Transports>> {
		self.transports.upgrade()
	}

	pub(crate) fn context(&self) -> Result<Arc<RouterContext>, Error> {
		Ok(self
			.transports()
			.ok_or(Error::SessionClosed)?
			.context()
			.clone())
	}

	pub(crate) fn context_hash(&self) -> Hash {
		self.context().map(|c| c.ident_hash()).unwrap_or_default()
	}

	/// Our endpoint as peers see it: the published SSU address when known,
	/// otherwise the bound socket address.
	pub(crate) fn external_endpoint(&self) -> SocketAddr {
		if let Ok(ctx) = self.context() {
			if let Some(addr) = ctx.router_info().ssu_address().and_then(|a| a.socket_addr()) {
				return addr;
			}
		}
		self.local_addr
	}

	pub(crate) fn acquire_dh_keys(&self) -> Result<DhKeys, Error> {
		Ok(self
			.transports()
			.ok_or(Error::SessionClosed)?
			.dh_pool
			.acquire())
	}

	pub(crate) fn send_to(&self, packet: &[u8], to: &SocketAddr) {
		match self.socket.send_to(packet, to) {
			Ok(n) => {
				if let Some(transports) = self.transports() {
					transports.update_sent_bytes(n as u64);
				}
			}
			Err(e) => warn!("SsuServer: send to {} failed: {}", to, e),
		}
	}

	pub(crate) fn ban(&self, endpoint: &SocketAddr) {
		if let Some(transports) = self.transports() {
			transports.ban_list.ban(endpoint.ip());
		}
	}

	//
	// Session registry
	//

	pub fn find_session(&self, endpoint: &SocketAddr) -> Option<Arc<SsuSession>> {
		self.sessions.get(endpoint).map(|s| s.value().clone())
	}

	pub fn find_by_ident(&self, ident: &Hash) -> Option<Arc<SsuSession>> {
		let endpoint = self.by_ident.get(ident).map(|e| *e.value())?;
		self.find_session(&endpoint)
	}

	pub(crate) fn register_ident(&self, ident: Hash, endpoint: SocketAddr) {
		self.by_ident.insert(ident, endpoint);
	}

	pub(crate) fn unregister_ident(&self, ident: &Hash) {
		self.by_ident.remove(ident);
	}

	pub(crate) fn remove_session(&self, endpoint: &SocketAddr) {
		self.sessions.remove(endpoint);
	}

	/// Session handle used for sending direct packets to an arbitrary
	/// endpoint (hole punches, peer-test replies).
	pub(crate) fn session_towards(self: &Arc<Self>, endpoint: SocketAddr) -> Arc<SsuSession> {
		if let Some(session) = self.find_session(&endpoint) {
			return session;
		}
		let session = SsuSession::new(self.clone(), endpoint, None, false);
		self.sessions.insert(endpoint, session.clone());
		session
	}

	pub(crate) fn random_established_except(
		&self,
		not: &SocketAddr,
	) -> Option<Arc<SsuSession>> {
		let mut rng = rand::thread_rng();
		self.sessions
			.iter()
			.filter(|e| e.value().is_established() && e.key() != not)
			.map(|e| e.value().clone())
			.choose(&mut rng)
	}

	//
	// Relay and peer-test tables
	//

	pub(crate) fn register_relay_tag(&self, tag: u32, endpoint: SocketAddr) {
		self.relay_tags.insert(tag, endpoint);
	}

	pub(crate) fn unregister_relay_tag(&self, tag: u32) {
		self.relay_tags.remove(&tag);
	}

	pub(crate) fn lookup_relay_tag(&self, tag: u32) -> Option<SocketAddr> {
		self.relay_tags.get(&tag).map(|e| *e.value())
	}

	pub(crate) fn register_peer_test(&self, nonce: u32) {
		self.peer_tests.insert(nonce, Instant::now());
	}

	/// True when the nonce belongs to a test we initiated; completes it.
	pub(crate) fn complete_peer_test(&self, nonce: u32) -> bool {
		self.peer_tests.remove(&nonce).is_some()
	}

	/// The remote agreed to introduce for us; keep that session alive.
	pub(crate) fn note_introducer(&self, endpoint: SocketAddr) {
		self.introducer_sessions.insert(endpoint, Instant::now());
	}

	pub(crate) fn relay_response_received(self: &Arc<Self>, nonce: u32, charlie: SocketAddr) {
		let Some((_, pending)) = self.introductions.remove(&nonce) else {
			warn!("SsuServer: relay response with unknown nonce {}", nonce);
			return;
		};
		info!("SsuServer: introduction {} answered, connecting to {}", nonce, charlie);
		// Charlie has punched a hole towards us by now
		let session = SsuSession::new(self.clone(), charlie, Some(pending.router), false);
		self.sessions.insert(charlie, session.clone());
		if let Err(e) = session.connect() {
			warn!("SsuServer: direct session after introduction failed: {}", e);
			self.sessions.remove(&charlie);
		}
	}

	//
	// Establishment entry points
	//

	/// Opens a session to the router's SSU endpoint, directly or through one
	/// of its introducers.
	pub fn open_session(
		self: &Arc<Self>,
		router: Arc<RouterInfo>,
		peer_test: bool,
	) -> Result<(), Error> {
		if let Some(session) = self.find_by_ident(&router.hash()) {
			if session.is_established() {
				return Ok(());
			}
		}
		let address = router
			.ssu_address()
			.ok_or(Error::NoCompatibleAddress("SSU"))?;
		match address.socket_addr() {
			Some(endpoint) => {
				if self.find_session(&endpoint).is_some() {
					return Ok(());
				}
				let session = SsuSession::new(self.clone(), endpoint, Some(router), peer_test);
				self.sessions.insert(endpoint, session.clone());
				session.connect()
			}
			None => {
					let introducers = address.introducers();
					self.request_introduction(router, introducers)
				}
		}
	}

	/// Relay request to the first usable introducer; requires no session
	/// with the introducer, only its intro key.
	fn request_introduction(
		self: &Arc<Self>,
		router: Arc<RouterInfo>,
		introducers: Vec<crate::data::router_info::Introducer>,
	) -> Result<(), Error> {
		let ctx = self.context()?;
		let own_intro_key = ctx.ident_hash().0;
		let Some(introducer) = introducers.first() else {
			return Err(Error::NoCompatibleAddress("SSU introducer"));
		};
		let nonce = rand::random::<u32>() | 1;
		self.introductions.insert(
			nonce,
			PendingIntroduction {
				router: router.clone(),
				created: Instant::now(),
			},
		);
		debug!(
			"SsuServer: requesting introduction to {} via {}:{}",
			router.hash(),
			introducer.host,
			introducer.port
		);
		let bob = SocketAddr::new(introducer.host, introducer.port);
		let session = self.session_towards(bob);
		let content = packet::build_relay_request(
			introducer.tag,
			&[], // Bob reads our endpoint from the packet source
			0,
			&[],
			&own_intro_key,
			nonce,
		);
		let key = crate::crypto::SessionKey(introducer.key);
		let mac = crate::crypto::MacKey(introducer.key);
		session.send_with_keys(packet::PayloadType::RelayRequest, &content, &key, &mac);
		Ok(())
	}

	//
	// Threads
	//

	fn receive_loop(self: Arc<Self>) {
		debug!("SsuServer: receiving on {}", self.local_addr);
		let mut buf = vec![0u8; SSU_MTU_V4.max(SSU_PACKET_MAX_V4) + 64];
		while self.running.load(Ordering::SeqCst) {
			let (len, from) = match self.socket.recv_from(&mut buf) {
				Ok(received) => received,
				Err(ref e)
					if e.kind() == std::io::ErrorKind::WouldBlock
						|| e.kind() == std::io::ErrorKind::TimedOut =>
				{
					continue;
				}
				Err(e) => {
					if self.running.load(Ordering::SeqCst) {
						warn!("SsuServer: receive error: {}", e);
					}
					continue;
				}
			};
			if let Some(transports) = self.transports() {
				if transports.ban_list.is_banned(&from.ip()) {
					debug!("SsuServer: dropping packet from banned {}", from.ip());
					continue;
				}
				transports.update_received_bytes(len as u64);
			}
			self.handle_packet(&buf[..len], from);
		}
	}

	fn handle_packet(self: &Arc<Self>, raw: &[u8], from: SocketAddr) {
		let session = match self.find_session(&from) {
			Some(session) => session,
			None => {
				// unknown peer: only intro-key packets can start something
				let session = SsuSession::new(self.clone(), from, None, false);
				self.sessions.insert(from, session.clone());
				session
			}
		};
		match session.open_packet(raw, &from) {
			Ok(body) => session.process_packet(&body),
			Err(e) => {
				debug!("SsuServer: undecryptable packet from {}: {}", from, e);
				// hole punches arrive as garbage; never ban for them alone
				if raw.len() > 64 {
					self.ban(&from);
					session.terminate(false);
				} else if session.state() == crate::transport::SessionState::Unknown {
					self.sessions.remove(&from);
				}
			}
		}
	}

	fn maintenance_loop(self: Arc<Self>) {
		while self.running.load(Ordering::SeqCst) {
			thread::sleep(MAINTENANCE_INTERVAL);
			let now = Instant::now();
			let sessions: Vec<Arc<SsuSession>> =
				self.sessions.iter().map(|e| e.value().clone()).collect();
			for session in sessions {
				session.tick(now);
			}
			self.peer_tests
				.retain(|_, started| started.elapsed() < SSU_PEER_TEST_TIMEOUT);
			self.introductions
				.retain(|_, pending| pending.created.elapsed() < SSU_CONNECT_TIMEOUT * 4);
			self.introducer_sessions
				.retain(|_, since| since.elapsed() < SSU_INTRODUCER_SESSION_DURATION);
		}
	}
}
