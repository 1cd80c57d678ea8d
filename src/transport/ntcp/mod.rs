//! NTCP, the TCP-based stream transport.
//!
//! The server owns the listener and the session registry (one session per
//! remote identity). Each connection runs on its own thread: the four-phase
//! handshake first, then the framed receive loop. A maintenance thread
//! enforces the inactivity timeout.

use dashmap::DashMap;
use log::{debug, info, warn};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::data::{Hash, RouterInfo};

use super::Transports;

pub mod session;

pub use self::session::NtcpSession;

pub const NTCP_PUB_KEY_SIZE: usize = 256;
pub const NTCP_HASH_SIZE: usize = 32;
pub const NTCP_PHASE1_SIZE: usize = NTCP_PUB_KEY_SIZE + NTCP_HASH_SIZE;
pub const NTCP_PHASE2_SIZE: usize = NTCP_PUB_KEY_SIZE + 48;
pub const NTCP_PHASE3_BASE_SIZE: usize = 448;
pub const NTCP_BUFFER_SIZE: usize = 16_384;
pub const NTCP_MAX_MESSAGE_SIZE: usize = 16_384;
pub const NTCP_TERMINATION_TIMEOUT: Duration = Duration::from_secs(120);
pub const NTCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

pub struct NtcpServer {
	transports: Weak<Transports>,
	listener: TcpListener,
	sessions: DashMap<Hash, Arc<NtcpSession>>,
	running: AtomicBool,
	threads: Mutex<Vec<JoinHandle<()>>>,
}

impl NtcpServer {
	pub fn new(
		transports: Weak<Transports>,
		addr: SocketAddr,
	) -> Result<Arc<Self>, crate::error::Error> {
		let listener = TcpListener::bind(addr)?;
		listener.set_nonblocking(true)?;
		Ok(Arc::new(NtcpServer {
			transports,
			listener,
			sessions: DashMap::new(),
			running: AtomicBool::new(false),
			threads: Mutex::new(Vec::new()),
		}))
	}

	pub fn start(self: &Arc<Self>) {
		self.running.store(true, Ordering::SeqCst);
		let server = self.clone();
		let accept = thread::Builder::new()
			.name("ntcp-accept".into())
			.spawn(move || server.accept_loop())
			.expect("spawn ntcp accept thread");
		let server = self.clone();
		let maintenance = thread::Builder::new()
			.name("ntcp-maintenance".into())
			.spawn(move || server.maintenance_loop())
			.expect("spawn ntcp maintenance thread");
		let mut threads = self.threads.lock().unwrap();
		threads.push(accept);
		threads.push(maintenance);
	}

	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
		let sessions: Vec<Arc<NtcpSession>> =
			self.sessions.iter().map(|e| e.value().clone()).collect();
		for session in sessions {
			session.terminate();
		}
		self.sessions.clear();
		for handle in self.threads.lock().unwrap().drain(..) {
			let _ = handle.join();
		}
	}

	fn accept_loop(self: Arc<Self>) {
		debug!("NtcpServer: accepting connections");
		while self.running.load(Ordering::SeqCst) {
			match self.listener.accept() {
				Ok((stream, remote)) => {
					if let Some(transports) = self.transports.upgrade() {
						if transports.ban_list.is_banned(&remote.ip()) {
							info!("NtcpServer: refusing banned {}", remote.ip());
							continue;
						}
					}
					debug!("NtcpServer: incoming connection from {}", remote);
					self.spawn_session(stream, remote, None);
				}
				Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
					thread::sleep(ACCEPT_POLL_INTERVAL);
				}
				Err(e) => {
					if self.running.load(Ordering::SeqCst) {
						warn!("NtcpServer: accept error: {}", e);
						thread::sleep(ACCEPT_POLL_INTERVAL);
					}
				}
			}
		}
	}

	/// Opens an outbound connection and runs the client side of the
	/// handshake on a fresh thread.
	pub fn connect(self: &Arc<Self>, addr: SocketAddr, router: Arc<RouterInfo>) {
		let server = self.clone();
		let _ = thread::Builder::new().name("ntcp-connect".into()).spawn(move || {
			debug!("NtcpServer: connecting to {}", addr);
			match TcpStream::connect_timeout(&addr, NTCP_CONNECT_TIMEOUT) {
				Ok(stream) => server.spawn_session(stream, addr, Some(router)),
				Err(e) => {
					warn!("NtcpServer: connect to {} failed: {}", addr, e);
					if let Some(transports) = server.transports.upgrade() {
						transports.netdb().set_unreachable(&router.hash(), true);
					}
				}
			}
		});
	}

	fn spawn_session(
		self: &Arc<Self>,
		stream: TcpStream,
		remote: SocketAddr,
		router: Option<Arc<RouterInfo>>,
	) {
		let server = self.clone();
		let _ = thread::Builder::new().name("ntcp-session".into()).spawn(move || {
			let session = NtcpSession::new(server.clone(), stream, remote, router);
			session.run();
		});
	}

	pub fn find_session(&self, ident: &Hash) -> Option<Arc<NtcpSession>> {
		self.sessions.get(ident).map(|s| s.value().clone())
	}

	pub(crate) fn add_session(&self, ident: Hash, session: Arc<NtcpSession>) {
		self.sessions.insert(ident, session);
	}

	pub(crate) fn remove_session(&self, ident: &Hash) {
		self.sessions.remove(ident);
	}

	pub(crate) fn transports(&self) -> Option<Arc<Transports>> {
		self.transports.upgrade()
	}

	/// Bans the remote IP after a first-byte protocol error.
	pub(crate) fn ban(&self, remote: &SocketAddr) {
		if let Some(transports) = self.transports.upgrade() {
			transports.ban_list.ban(remote.ip());
		}
	}

	fn maintenance_loop(self: Arc<Self>) {
		while self.running.load(Ordering::SeqCst) {
			thread::sleep(MAINTENANCE_INTERVAL);
			let mut idle = Vec::new();
			for entry in self.sessions.iter() {
				if entry.value().idle_for() > NTCP_TERMINATION_TIMEOUT {
					idle.push(entry.value().clone());
				}
			}
			for session in idle {
				info!(
					"NtcpServer: no activity for {:?}, terminating session",
					NTCP_TERMINATION_TIMEOUT
				);
				session.terminate();
			}
		}
	}
}
