//! Peer lifecycle management over both transports.
//!
//! The peer manager owns one `Peer` entry per remote identity: its known
//! router info, active sessions, and messages delayed while a connection is
//! being established. Connection attempts ladder from the stream transport to
//! the datagram transport before the peer is dropped.

use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::crypto::dh::DhKeys;
use crate::data::{Hash, RouterInfo};
use crate::i2np::Message;
use crate::netdb::NetDb;
use crate::router::{RouterContext, RouterStatus};

pub mod ntcp;
pub mod ssu;

pub const SESSION_CREATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const PEER_CLEANUP_INTERVAL: Duration = Duration::from_secs(50);
pub const BAN_DURATION: Duration = Duration::from_secs(70);
pub const DH_POOL_SIZE: usize = 5;
pub const MAX_DELAYED_MESSAGES: usize = 64;
const BANDWIDTH_UPDATE_INTERVAL: Duration = Duration::from_secs(1);
const LOW_BANDWIDTH_LIMIT: u64 = 48 * 1024; // bytes per second

/// Session lifecycle shared by both transports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
	Unknown,
	Introduced,
	Established,
	Closed,
	Failed,
}

/// A live transport session owned by its server; the peer manager holds
/// non-owning handles.
pub trait TransportSession: Send + Sync {
	fn send_messages(&self, msgs: Vec<Message>);
	fn remote_hash(&self) -> Option<Hash>;
	/// Graceful close: drains the send queue, accepts no new work.
	fn done(&self);
	fn sent_bytes(&self) -> u64;
	fn received_bytes(&self) -> u64;
}

/// Pre-generates DH keypairs on a dedicated producer thread.
///
/// `acquire` never blocks the caller on key generation unless the pool is
/// empty; returned pairs go back for reuse when a handshake is aborted.
pub struct DhKeysPool {
	queue: Mutex<Vec<DhKeys>>,
	acquired: Condvar,
	running: AtomicBool,
	producer: Mutex<Option<JoinHandle<()>>>,
}

impl DhKeysPool {
	pub fn new() -> Arc<Self> {
		Arc::new(DhKeysPool {
			queue: Mutex::new(Vec::new()),
			acquired: Condvar::new(),
			running: AtomicBool::new(false),
			producer: Mutex::new(None),
		})
	}

	pub fn start(self: &Arc<Self>) {
		debug!("DhKeysPool: starting");
		self.running.store(true, Ordering::SeqCst);
		let pool = self.clone();
		let handle = thread::Builder::new()
			.name("dh-pool".into())
			.spawn(move || pool.run())
			.expect("spawn dh pool thread");
		*self.producer.lock().unwrap() = Some(handle);
	}

	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
		self.acquired.notify_all();
		if let Some(handle) = self.producer.lock().unwrap().take() {
			let _ = handle.join();
		}
	}

	fn run(&self) {
		debug!("DhKeysPool: running");
		while self.running.load(Ordering::SeqCst) {
			loop {
				let missing = {
					let queue = self.queue.lock().unwrap();
					DH_POOL_SIZE.saturating_sub(queue.len())
				};
				if missing == 0 || !self.running.load(Ordering::SeqCst) {
					break;
				}
				let pair = DhKeys::generate();
				self.queue.lock().unwrap().push(pair);
			}
			let queue = self.queue.lock().unwrap();
			// wait until a pair gets acquired
			let _unused = self
				.acquired
				.wait_timeout(queue, Duration::from_secs(1))
				.unwrap();
		}
	}

	pub fn acquire(&self) -> DhKeys {
		let mut queue = self.queue.lock().unwrap();
		if let Some(pair) = queue.pop() {
			self.acquired.notify_one();
			return pair;
		}
		drop(queue);
		// pool exhausted, generate inline
		DhKeys::generate()
	}

	pub fn give_back(&self, pair: DhKeys) {
		self.queue.lock().unwrap().push(pair);
	}
}

/// Peer IPs banned after protocol errors; entries expire after 70 s.
pub struct BanList {
	banned: DashMap<IpAddr, Instant>,
}

impl BanList {
	pub fn new() -> Self {
		BanList {
			banned: DashMap::new(),
		}
	}

	pub fn ban(&self, ip: IpAddr) {
		warn!("BanList: banning {} for {:?}", ip, BAN_DURATION);
		self.banned.insert(ip, Instant::now() + BAN_DURATION);
	}

	pub fn is_banned(&self, ip: &IpAddr) -> bool {
		let Some(expiry) = self.banned.get(ip).map(|e| *e) else {
			return false;
		};
		if expiry > Instant::now() {
			return true;
		}
		self.banned.remove(ip);
		false
	}

	pub fn expiry(&self, ip: &IpAddr) -> Option<Instant> {
		self.banned.get(ip).map(|e| *e)
	}
}

struct Peer {
	num_attempts: u32,
	router: Option<Arc<RouterInfo>>,
	sessions: Vec<Arc<dyn TransportSession>>,
	created: Instant,
	delayed_messages: Vec<Message>,
}

/// The peer manager: resolves identities to sessions, queues messages during
/// establishment, falls back between transports and accounts bandwidth.
pub struct Transports {
	ctx: Arc<RouterContext>,
	netdb: Arc<NetDb>,
	peers: Mutex<HashMap<Hash, Peer>>,
	pub ban_list: BanList,
	pub dh_pool: Arc<DhKeysPool>,
	ntcp_server: Mutex<Option<Arc<ntcp::NtcpServer>>>,
	ssu_server: Mutex<Option<Arc<ssu::SsuServer>>>,
	total_sent_bytes: AtomicU64,
	total_received_bytes: AtomicU64,
	in_bandwidth: AtomicU64,
	out_bandwidth: AtomicU64,
	bandwidth_marks: Mutex<(Instant, u64, u64)>,
	running: AtomicBool,
	cleanup_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Transports {
	pub fn new(ctx: Arc<RouterContext>, netdb: Arc<NetDb>) -> Arc<Self> {
		Arc::new(Transports {
			ctx,
			netdb,
			peers: Mutex::new(HashMap::new()),
			ban_list: BanList::new(),
			dh_pool: DhKeysPool::new(),
			ntcp_server: Mutex::new(None),
			ssu_server: Mutex::new(None),
			total_sent_bytes: AtomicU64::new(0),
			total_received_bytes: AtomicU64::new(0),
			in_bandwidth: AtomicU64::new(0),
			out_bandwidth: AtomicU64::new(0),
			bandwidth_marks: Mutex::new((Instant::now(), 0, 0)),
			running: AtomicBool::new(false),
			cleanup_thread: Mutex::new(None),
		})
	}

	pub fn context(&self) -> &Arc<RouterContext> {
		&self.ctx
	}

	pub fn netdb(&self) -> &Arc<NetDb> {
		&self.netdb
	}

	pub fn start(self: &Arc<Self>) -> Result<(), crate::error::Error> {
		debug!("Transports: starting");
		self.dh_pool.start();
		self.running.store(true, Ordering::SeqCst);

		let own = self.ctx.router_info();
		for address in own.addresses() {
			let Some(addr) = address.socket_addr() else {
				continue;
			};
			match address.style {
				crate::data::router_info::TransportStyle::Ntcp => {
					let mut server = self.ntcp_server.lock().unwrap();
					if server.is_none() {
						info!("Transports: TCP listening on port {}", addr.port());
						let ntcp = ntcp::NtcpServer::new(Arc::downgrade(self), addr)?;
						ntcp.start();
						*server = Some(ntcp);
					} else {
						error!("Transports: TCP server already exists");
					}
				}
				crate::data::router_info::TransportStyle::Ssu => {
					let mut server = self.ssu_server.lock().unwrap();
					if server.is_none() {
						info!("Transports: UDP listening on port {}", addr.port());
						let ssu = ssu::SsuServer::new(Arc::downgrade(self), addr)?;
						ssu.start();
						*server = Some(ssu);
					} else {
						error!("Transports: SSU server already exists");
					}
				}
				_ => {}
			}
		}
		if self.ssu_server.lock().unwrap().is_some() {
			self.detect_external_ip();
		}

		let transports = self.clone();
		let handle = thread::Builder::new()
			.name("peer-cleanup".into())
			.spawn(move || transports.cleanup_loop())
			.expect("spawn cleanup thread");
		*self.cleanup_thread.lock().unwrap() = Some(handle);
		Ok(())
	}

	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
		self.peers.lock().unwrap().clear();
		if let Some(ssu) = self.ssu_server.lock().unwrap().take() {
			ssu.stop();
		}
		if let Some(ntcp) = self.ntcp_server.lock().unwrap().take() {
			ntcp.stop();
		}
		self.dh_pool.stop();
		if let Some(handle) = self.cleanup_thread.lock().unwrap().take() {
			let _ = handle.join();
		}
	}

	pub fn ntcp_server(&self) -> Option<Arc<ntcp::NtcpServer>> {
		self.ntcp_server.lock().unwrap().clone()
	}

	pub fn ssu_server(&self) -> Option<Arc<ssu::SsuServer>> {
		self.ssu_server.lock().unwrap().clone()
	}

	pub fn send_message(self: &Arc<Self>, ident: &Hash, msg: Message) {
		self.send_messages(ident, vec![msg]);
	}

	/// Delivers messages to the peer, opening a session if necessary.
	/// Messages queue on the peer while a connection attempt is in flight.
	pub fn send_messages(self: &Arc<Self>, ident: &Hash, msgs: Vec<Message>) {
		if *ident == self.ctx.ident_hash() {
			// we send it to ourself
			self.ctx.dispatcher().dispatch_batch(Some(*ident), msgs);
			return;
		}
		let mut peers = self.peers.lock().unwrap();
		if !peers.contains_key(ident) {
			let router = self.netdb.find_router(ident);
			peers.insert(
				*ident,
				Peer {
					num_attempts: 0,
					router,
					sessions: Vec::new(),
					created: Instant::now(),
					delayed_messages: Vec::new(),
				},
			);
			let peer = peers.get_mut(ident).unwrap();
			if !self.connect_to_peer(ident, peer) {
				peers.remove(ident);
				return;
			}
		}
		let peer = peers.get_mut(ident).unwrap();
		match peer.sessions.first().cloned() {
			Some(session) => {
				// write without holding the peers lock
				drop(peers);
				session.send_messages(msgs);
			}
			None => {
				for msg in msgs {
					if peer.delayed_messages.len() >= MAX_DELAYED_MESSAGES {
						warn!("Transports: delayed queue for {} full, dropping", ident);
						break;
					}
					peer.delayed_messages.push(msg);
				}
			}
		}
	}

	/// Attempt ladder: 0 = stream transport (with async DNS resolution when
	/// the address is a hostname), 1 = datagram transport. Returns false when
	/// the peer should be dropped.
	fn connect_to_peer(self: &Arc<Self>, ident: &Hash, peer: &mut Peer) -> bool {
		if let Some(router) = peer.router.clone() {
			if peer.num_attempts == 0 {
				peer.num_attempts += 1;
				debug!("Transports: attempting NTCP for {}", ident);
				if let Some(address) = router.ntcp_address() {
					if !router.uses_introducer() && !router.is_unreachable() {
						if let Some(server) = self.ntcp_server() {
							if let Some(addr) = address.socket_addr() {
								server.connect(addr, router.clone());
								return true;
							}
							if let Some(host) = address.host_string() {
								self.resolve_and_connect(
									host.to_string(),
									address.port().unwrap_or(0),
									*ident,
								);
								return true;
							}
						}
					}
				}
			}
			if peer.num_attempts == 1 {
				peer.num_attempts += 1;
				debug!("Transports: attempting SSU for {}", ident);
				if let Some(server) = self.ssu_server() {
					if server.open_session(router, false).is_ok() {
						return true;
					}
				}
			}
			error!("Transports: no NTCP/SSU address available for {}", ident);
			false
		} else {
			// request the router info, then retry the ladder; posted to a
			// helper thread because the callback can fire synchronously and
			// needs the peers map
			debug!("Transports: router info not found for {}, requesting", ident);
			let transports = self.clone();
			let ident = *ident;
			let _ = thread::Builder::new().name("ri-request".into()).spawn(move || {
				let callback_target = transports.clone();
				transports.netdb.request_destination(
					&ident,
					Box::new(move |router| callback_target.request_complete(router, &ident)),
				);
			});
			true
		}
	}

	fn resolve_and_connect(self: &Arc<Self>, host: String, port: u16, ident: Hash) {
		let transports = self.clone();
		let _ = thread::Builder::new().name("ntcp-resolve".into()).spawn(move || {
			match (host.as_str(), port).to_socket_addrs() {
				Ok(mut addrs) => {
					if let Some(addr) = addrs.next() {
						info!("Transports: {} resolved to {}", host, addr.ip());
						let router = {
							let peers = transports.peers.lock().unwrap();
							peers.get(&ident).and_then(|p| p.router.clone())
						};
						match (router, transports.ntcp_server()) {
							(Some(router), Some(server)) => server.connect(addr, router),
							_ => transports.drop_peer(&ident),
						}
						return;
					}
					error!("Transports: unable to resolve {}", host);
					transports.drop_peer(&ident);
				}
				Err(e) => {
					error!("Transports: unable to resolve {}: {}", host, e);
					transports.drop_peer(&ident);
				}
			}
		});
	}

	fn drop_peer(&self, ident: &Hash) {
		self.peers.lock().unwrap().remove(ident);
	}

	/// Completion callback for a router-info request issued by the ladder.
	pub fn request_complete(self: &Arc<Self>, router: Option<Arc<RouterInfo>>, ident: &Hash) {
		let mut peers = self.peers.lock().unwrap();
		let Some(peer) = peers.get_mut(ident) else {
			return;
		};
		match router {
			Some(router) => {
				info!("Transports: router {} found, trying to connect", ident);
				peer.router = Some(router);
				if !self.connect_to_peer(ident, peer) {
					peers.remove(ident);
				}
			}
			None => {
				warn!("Transports: router {} not found, failed to send messages", ident);
				peers.remove(ident);
			}
		}
	}

	/// Installs an established session and flushes the peer's delayed queue.
	pub fn peer_connected(&self, session: Arc<dyn TransportSession>) {
		let Some(ident) = session.remote_hash() else {
			return;
		};
		debug!("Transports: peer {} connected", ident);
		let delayed = {
			let mut peers = self.peers.lock().unwrap();
			match peers.get_mut(&ident) {
				Some(peer) => {
					peer.sessions.push(session.clone());
					std::mem::take(&mut peer.delayed_messages)
				}
				None => {
					// incoming connection
					peers.insert(
						ident,
						Peer {
							num_attempts: 0,
							router: None,
							sessions: vec![session.clone()],
							created: Instant::now(),
							delayed_messages: Vec::new(),
						},
					);
					Vec::new()
				}
			}
		};
		if !delayed.is_empty() {
			session.send_messages(delayed);
		}
	}

	/// Removes a terminated session; peers with queued messages re-attempt.
	pub fn peer_disconnected(self: &Arc<Self>, session: &Arc<dyn TransportSession>) {
		let Some(ident) = session.remote_hash() else {
			return;
		};
		debug!("Transports: peer {} disconnected", ident);
		let mut peers = self.peers.lock().unwrap();
		if let Some(peer) = peers.get_mut(&ident) {
			peer.sessions.retain(|s| !Arc::ptr_eq(s, session));
			if peer.sessions.is_empty() {
				if !peer.delayed_messages.is_empty() {
					if !self.connect_to_peer(&ident, peer) {
						peers.remove(&ident);
					}
				} else {
					peers.remove(&ident);
				}
			}
		}
	}

	pub fn is_connected(&self, ident: &Hash) -> bool {
		self.peers
			.lock()
			.unwrap()
			.get(ident)
			.map(|p| !p.sessions.is_empty())
			.unwrap_or(false)
	}

	pub fn update_sent_bytes(&self, bytes: u64) {
		self.total_sent_bytes.fetch_add(bytes, Ordering::Relaxed);
	}

	pub fn update_received_bytes(&self, bytes: u64) {
		self.total_received_bytes.fetch_add(bytes, Ordering::Relaxed);
	}

	/// Rolling one-second bandwidth estimates.
	fn update_bandwidth(&self) {
		let mut marks = self.bandwidth_marks.lock().unwrap();
		let (last_time, last_in, last_out) = *marks;
		let elapsed = last_time.elapsed();
		if elapsed >= BANDWIDTH_UPDATE_INTERVAL {
			let total_in = self.total_received_bytes.load(Ordering::Relaxed);
			let total_out = self.total_sent_bytes.load(Ordering::Relaxed);
			let millis = elapsed.as_millis().max(1) as u64;
			self.in_bandwidth
				.store((total_in - last_in) * 1_000 / millis, Ordering::Relaxed);
			self.out_bandwidth
				.store((total_out - last_out) * 1_000 / millis, Ordering::Relaxed);
			*marks = (Instant::now(), total_in, total_out);
		}
	}

	pub fn bandwidth(&self) -> (u64, u64) {
		(
			self.in_bandwidth.load(Ordering::Relaxed),
			self.out_bandwidth.load(Ordering::Relaxed),
		)
	}

	pub fn is_bandwidth_exceeded(&self) -> bool {
		if self.ctx.router_info().is_high_bandwidth() {
			return false;
		}
		let (inb, outb) = self.bandwidth();
		inb.max(outb) > LOW_BANDWIDTH_LIMIT
	}

	/// Kicks off reachability probing: up to five peer tests against
	/// peer-test capable routers known to the database.
	pub fn detect_external_ip(&self) {
		debug!("Transports: detecting external IP");
		let Some(server) = self.ssu_server() else {
			error!("Transports: can't detect external IP, SSU is not available");
			return;
		};
		self.ctx.set_status(RouterStatus::Testing);
		for _ in 0..5 {
			let router = self
				.netdb
				.random_peer_test_router()
				.or_else(|| self.netdb.random_router());
			if let Some(router) = router {
				if router.has_ssu() {
					let peer_test = router.is_peer_testing();
					let _ = server.open_session(router, peer_test);
				}
			}
		}
	}

	fn cleanup_loop(self: Arc<Self>) {
		let mut last_cleanup = Instant::now();
		while self.running.load(Ordering::SeqCst) {
			thread::sleep(BANDWIDTH_UPDATE_INTERVAL);
			self.update_bandwidth();
			if last_cleanup.elapsed() >= PEER_CLEANUP_INTERVAL {
				last_cleanup = Instant::now();
				self.cleanup_peers();
				if self.ctx.status() == RouterStatus::Testing {
					self.detect_external_ip();
				}
			}
		}
	}

	/// Drops peers that never got a session and are older than the creation
	/// timeout.
	fn cleanup_peers(&self) {
		let mut peers = self.peers.lock().unwrap();
		peers.retain(|ident, peer| {
			let keep = !peer.sessions.is_empty()
				|| peer.created.elapsed() < SESSION_CREATION_TIMEOUT;
			if !keep {
				debug!("Transports: dropping stale peer {}", ident);
			}
			keep
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dh_pool_acquire_and_return() {
		let pool = DhKeysPool::new();
		// acquire without the producer running generates inline
		let pair = pool.acquire();
		let public = pair.public_key;
		pool.give_back(pair);
		let again = pool.acquire();
		assert_eq!(again.public_key[..], public[..]);
	}

	#[test]
	fn dh_pool_producer_fills_queue() {
		let pool = DhKeysPool::new();
		pool.start();
		let deadline = Instant::now() + Duration::from_secs(30);
		loop {
			if pool.queue.lock().unwrap().len() >= DH_POOL_SIZE {
				break;
			}
			assert!(Instant::now() < deadline, "pool never filled");
			thread::sleep(Duration::from_millis(50));
		}
		pool.stop();
	}

	#[test]
	fn ban_list_expires() {
		let list = BanList::new();
		let ip: IpAddr = "10.1.2.3".parse().unwrap();
		assert!(!list.is_banned(&ip));
		list.ban(ip);
		assert!(list.is_banned(&ip));
		let expiry = list.expiry(&ip).unwrap();
		let remaining = expiry - Instant::now();
		assert!(remaining <= BAN_DURATION);
		assert!(remaining > BAN_DURATION - Duration::from_secs(5));
	}
}
