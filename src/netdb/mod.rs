//! The network database: Kademlia-style router and lease-set storage fed by
//! database-store messages, with flood-fill distribution, exploratory
//! discovery and per-peer profiling.
//!
//! A single worker thread owns all mutations; other subsystems read through
//! locks and post messages through the queue the dispatcher feeds.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, info, warn};
use rand::seq::IteratorRandom;
use rand::{Rng, RngCore};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::data::{
	milliseconds_since_epoch, routing_key, Hash, LeaseSet, RouterInfo, XorMetric,
};
use crate::error::Error;
use crate::i2np::{self, Message};
use crate::router::RouterContext;
use crate::transport::Transports;

pub mod profiling;
pub mod requests;

pub use self::profiling::{ProfileStore, RouterProfile};
pub use self::requests::{NetDbRequests, RequestAction, RequestComplete};

pub const NETDB_DIRECTORY: &str = "netDb";

const WAIT_FOR_MESSAGE: Duration = Duration::from_secs(15);
const MAX_MESSAGES_READ: usize = 100;
const MANAGE_REQUESTS_INTERVAL: Duration = Duration::from_secs(15);
const SAVE_INTERVAL: Duration = Duration::from_secs(60);
const PUBLISH_INTERVAL: Duration = Duration::from_secs(20 * 60);
const EXPLORATORY_INTERVAL: Duration = Duration::from_secs(30);
const DELAYED_EXPLORATORY_INTERVAL: Duration = Duration::from_secs(55);
const FAVOURED_KNOWN_ROUTERS: usize = 2500;
const MIN_KNOWN_ROUTERS: usize = 800;
const EXPLORATORY_COUNT: usize = 5;
const MAX_EXPLORATORY_COUNT: usize = 15;
const MAX_EXCLUDED_PEERS: usize = 512;
/// router infos older than this are considered stale
const ROUTER_EXPIRATION: Duration = Duration::from_secs(3600);
/// never expire below this table size
const ROUTER_EXPIRATION_FLOOR: usize = 300;

/// Hook for sending replies through the tunnel layer, which lives above this
/// crate. Without one installed, replies go directly over the transports.
pub trait TunnelSender: Send + Sync {
	fn send_through_tunnel(&self, gateway: &Hash, tunnel_id: u32, msg: Message) -> bool;
}

pub struct NetDb {
	ctx: Arc<RouterContext>,
	routers: RwLock<HashMap<Hash, Arc<RouterInfo>>>,
	lease_sets: RwLock<HashMap<Hash, Arc<LeaseSet>>>,
	floodfills: Mutex<Vec<Hash>>,
	requests: NetDbRequests,
	profiles: ProfileStore,
	queue_tx: Sender<(Option<Hash>, Message)>,
	queue_rx: Mutex<Option<Receiver<(Option<Hash>, Message)>>>,
	transports: Mutex<Option<Weak<Transports>>>,
	tunnels: Mutex<Option<Arc<dyn TunnelSender>>>,
	storage_path: PathBuf,
	running: AtomicBool,
	worker: Mutex<Option<JoinHandle<()>>>,
}

impl NetDb {
	pub fn new<P: AsRef<Path>>(ctx: Arc<RouterContext>, data_dir: P) -> Arc<Self> {
		let (queue_tx, queue_rx) = mpsc::channel();
		Arc::new(NetDb {
			ctx,
			routers: RwLock::new(HashMap::new()),
			lease_sets: RwLock::new(HashMap::new()),
			floodfills: Mutex::new(Vec::new()),
			requests: NetDbRequests::new(),
			profiles: ProfileStore::new(&data_dir),
			queue_tx,
			queue_rx: Mutex::new(Some(queue_rx)),
			transports: Mutex::new(None),
			tunnels: Mutex::new(None),
			storage_path: data_dir.as_ref().join(NETDB_DIRECTORY),
			running: AtomicBool::new(false),
			worker: Mutex::new(None),
		})
	}

	/// The queue the dispatcher posts database messages into.
	pub fn queue_sender(&self) -> Sender<(Option<Hash>, Message)> {
		self.queue_tx.clone()
	}

	pub fn set_transports(&self, transports: &Arc<Transports>) {
		*self.transports.lock().unwrap() = Some(Arc::downgrade(transports));
	}

	pub fn set_tunnel_sender(&self, tunnels: Arc<dyn TunnelSender>) {
		*self.tunnels.lock().unwrap() = Some(tunnels);
	}

	pub fn profiles(&self) -> &ProfileStore {
		&self.profiles
	}

	fn transports(&self) -> Option<Arc<Transports>> {
		self.transports.lock().unwrap().as_ref()?.upgrade()
	}

	pub fn start(self: &Arc<Self>) -> Result<(), Error> {
		self.load()?;
		self.running.store(true, Ordering::SeqCst);
		let netdb = self.clone();
		let handle = thread::Builder::new()
			.name("netdb".into())
			.spawn(move || netdb.run())
			.expect("spawn netdb thread");
		*self.worker.lock().unwrap() = Some(handle);
		Ok(())
	}

	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
		// wake the queue
		let _ = self.queue_tx.send((None, Message::new_short()));
		if let Some(handle) = self.worker.lock().unwrap().take() {
			let _ = handle.join();
		}
		self.save_updated();
		self.profiles.save_all();
		self.requests.clear();
	}

	//
	// Worker loop
	//

	fn run(self: Arc<Self>) {
		let rx = self
			.queue_rx
			.lock()
			.unwrap()
			.take()
			.expect("netdb started twice");
		let mut last_save = Instant::now();
		let mut last_publish = Instant::now();
		let mut last_exploratory = Instant::now();
		let mut last_manage = Instant::now();
		while self.running.load(Ordering::SeqCst) {
			match rx.recv_timeout(WAIT_FOR_MESSAGE) {
				Ok(first) => {
					let mut batch = vec![first];
					while batch.len() < MAX_MESSAGES_READ {
						match rx.try_recv() {
							Ok(msg) => batch.push(msg),
							Err(_) => break,
						}
					}
					for (from, msg) in batch {
						self.handle_message(from, msg);
					}
				}
				Err(RecvTimeoutError::Timeout) => {}
				Err(RecvTimeoutError::Disconnected) => break,
			}
			if !self.running.load(Ordering::SeqCst) {
				break;
			}
			if last_manage.elapsed() >= MANAGE_REQUESTS_INTERVAL {
				self.manage_requests();
				last_manage = Instant::now();
			}
			if last_save.elapsed() >= SAVE_INTERVAL {
				self.save_updated();
				self.manage_lease_sets();
				last_save = Instant::now();
			}
			if last_publish.elapsed() >= PUBLISH_INTERVAL {
				self.publish();
				last_publish = Instant::now();
			}
			let exploratory_interval = if self.known_routers() < FAVOURED_KNOWN_ROUTERS {
				EXPLORATORY_INTERVAL
			} else {
				DELAYED_EXPLORATORY_INTERVAL
			};
			if last_exploratory.elapsed() >= exploratory_interval {
				let count = if self.known_routers() < MIN_KNOWN_ROUTERS {
					MAX_EXPLORATORY_COUNT
				} else {
					EXPLORATORY_COUNT
				};
				self.explore(count);
				last_exploratory = Instant::now();
			}
		}
		debug!("NetDb: worker stopped");
	}

	fn handle_message(&self, from: Option<Hash>, msg: Message) {
		// one poisoned message must not kill the worker
		let result = match msg.type_id() {
			i2np::MSG_TYPE_DATABASE_STORE => self.handle_database_store(from, &msg),
			i2np::MSG_TYPE_DATABASE_SEARCH_REPLY => self.handle_search_reply(&msg),
			i2np::MSG_TYPE_DATABASE_LOOKUP => self.handle_lookup(&msg),
			0 => Ok(()), // wake-up marker from stop()
			other => {
				warn!("NetDb: unexpected message type {}", other);
				Ok(())
			}
		};
		if let Err(e) = result {
			error!("NetDb: handler failed: {}", e);
		}
	}

	//
	// Storage
	//

	pub fn known_routers(&self) -> usize {
		self.routers.read().unwrap().len()
	}

	pub fn find_router(&self, ident: &Hash) -> Option<Arc<RouterInfo>> {
		self.routers.read().unwrap().get(ident).cloned()
	}

	pub fn find_lease_set(&self, ident: &Hash) -> Option<Arc<LeaseSet>> {
		self.lease_sets.read().unwrap().get(ident).cloned()
	}

	pub fn set_unreachable(&self, ident: &Hash, unreachable: bool) {
		if let Some(router) = self.find_router(ident) {
			router.set_unreachable(unreachable);
		}
	}

	/// Validates and installs a router info; rejects bad signatures and
	/// timestamps older than what we already hold.
	pub fn add_router_info(&self, data: &[u8]) -> Result<Arc<RouterInfo>, Error> {
		let info = RouterInfo::from_bytes(data)?;
		info.verify()?;
		let ident = info.hash();
		{
			let routers = self.routers.read().unwrap();
			if let Some(existing) = routers.get(&ident) {
				if existing.published() >= info.published() {
					// not newer, keep what we have
					return Ok(existing.clone());
				}
			}
		}
		info.set_updated(true);
		let info = Arc::new(info);
		let previous = self
			.routers
			.write()
			.unwrap()
			.insert(ident, info.clone());
		let mut floodfills = self.floodfills.lock().unwrap();
		let was_floodfill = previous.map(|p| p.is_floodfill()).unwrap_or(false);
		if info.is_floodfill() && !was_floodfill {
			floodfills.push(ident);
		} else if !info.is_floodfill() && was_floodfill {
			floodfills.retain(|h| h != &ident);
		}
		drop(floodfills);
		debug!("NetDb: installed router {}", ident);
		// a pending request for this router is now satisfied
		self.requests.complete(&ident, Some(info.clone()));
		Ok(info)
	}

	pub fn add_lease_set(&self, data: &[u8]) -> Result<Arc<LeaseSet>, Error> {
		let ls = LeaseSet::from_bytes(data)?;
		ls.verify()?;
		if !ls.has_non_expired_leases() {
			return Err(Error::Protocol("lease set fully expired".into()));
		}
		let ident = ls.hash();
		let ls = Arc::new(ls);
		self.lease_sets.write().unwrap().insert(ident, ls.clone());
		debug!("NetDb: installed lease set {}", ident);
		Ok(ls)
	}

	fn manage_lease_sets(&self) {
		self.lease_sets.write().unwrap().retain(|ident, ls| {
			let keep = ls.has_non_expired_leases();
			if !keep {
				debug!("NetDb: lease set {} expired", ident);
			}
			keep
		});
	}

	//
	// Disk persistence: netDb/rX/router_info_<base64>.dat, with the bucket
	// letter lowercased so one tree works on case-insensitive filesystems.
	//

	fn store_path_for(&self, ident: &Hash) -> PathBuf {
		let base64 = ident.to_base64();
		let bucket: String = base64
			.chars()
			.take(1)
			.map(|c| c.to_ascii_lowercase())
			.collect();
		self.storage_path
			.join(format!("r{}", bucket))
			.join(format!("router_info_{}.dat", base64))
	}

	fn load(&self) -> Result<(), Error> {
		if !self.storage_path.exists() {
			fs::create_dir_all(&self.storage_path)?;
			return Ok(());
		}
		let mut loaded = 0usize;
		for bucket in fs::read_dir(&self.storage_path)?.flatten() {
			if !bucket.path().is_dir() {
				continue;
			}
			for file in fs::read_dir(bucket.path())?.flatten() {
				match fs::read(file.path()).map_err(Error::from).and_then(|data| {
					let info = RouterInfo::from_bytes(&data)?;
					info.verify()?;
					Ok(info)
				}) {
					Ok(info) => {
						let ident = info.hash();
						let info = Arc::new(info);
						if info.is_floodfill() {
							self.floodfills.lock().unwrap().push(ident);
						}
						self.routers.write().unwrap().insert(ident, info);
						loaded += 1;
					}
					Err(e) => {
						warn!("NetDb: removing undecodable {:?}: {}", file.path(), e);
						let _ = fs::remove_file(file.path());
					}
				}
			}
		}
		info!("NetDb: loaded {} router infos", loaded);
		Ok(())
	}

	/// Mirrors a directory of `.dat` router infos into the table, used for
	/// reseeding a fresh router.
	pub fn bootstrap_from_files<P: AsRef<Path>>(&self, dir: P) -> usize {
		let mut count = 0;
		let Ok(entries) = fs::read_dir(dir) else {
			return 0;
		};
		for entry in entries.flatten() {
			if let Ok(data) = fs::read(entry.path()) {
				if self.add_router_info(&data).is_ok() {
					count += 1;
				}
			}
		}
		count
	}

	fn save_updated(&self) {
		let now = milliseconds_since_epoch();
		let mut expired = Vec::new();
		{
			let routers = self.routers.read().unwrap();
			let can_expire = routers.len() > ROUTER_EXPIRATION_FLOOR;
			for (ident, info) in routers.iter() {
				if info.is_updated() {
					let path = self.store_path_for(ident);
					if let Some(parent) = path.parent() {
						let _ = fs::create_dir_all(parent);
					}
					match info.to_bytes() {
						Ok(bytes) => {
							if let Err(e) = fs::write(&path, bytes) {
								error!("NetDb: saving {} failed: {}", ident, e);
							} else {
								info.set_updated(false);
							}
						}
						Err(e) => error!("NetDb: cannot serialize {}: {}", ident, e),
					}
				}
				if can_expire
					&& *ident != self.ctx.ident_hash()
					&& now.saturating_sub(info.published().0)
						> ROUTER_EXPIRATION.as_millis() as u64
				{
					expired.push(*ident);
				}
			}
		}
		if !expired.is_empty() {
			debug!("NetDb: expiring {} stale routers", expired.len());
			{
				let mut routers = self.routers.write().unwrap();
				for ident in &expired {
					routers.remove(ident);
				}
			}
			self.floodfills
				.lock()
				.unwrap()
				.retain(|h| !expired.contains(h));
			for ident in &expired {
				let _ = fs::remove_file(self.store_path_for(ident));
			}
		}
	}

	//
	// Kademlia selection. Distance is routing_key(router hash) XOR target.
	//

	fn metric_to(&self, router: &Hash, target: &Hash) -> XorMetric {
		routing_key(router).xor(target)
	}

	pub fn closest_floodfill(
		&self,
		target: &Hash,
		excluded: &HashSet<Hash>,
	) -> Option<Arc<RouterInfo>> {
		let floodfills = self.floodfills.lock().unwrap();
		let routers = self.routers.read().unwrap();
		let mut best: Option<(XorMetric, &Hash)> = None;
		for ident in floodfills.iter() {
			if excluded.contains(ident) {
				continue;
			}
			let Some(info) = routers.get(ident) else {
				continue;
			};
			if info.is_unreachable() {
				continue;
			}
			let metric = self.metric_to(ident, target);
			if best.map(|(m, _)| metric < m).unwrap_or(true) {
				best = Some((metric, ident));
			}
		}
		best.and_then(|(_, ident)| routers.get(ident).cloned())
	}

	pub fn closest_floodfills(
		&self,
		target: &Hash,
		count: usize,
		excluded: &HashSet<Hash>,
	) -> Vec<Hash> {
		let floodfills = self.floodfills.lock().unwrap();
		let routers = self.routers.read().unwrap();
		let mut sorted: Vec<(XorMetric, Hash)> = floodfills
			.iter()
			.filter(|ident| !excluded.contains(*ident))
			.filter(|ident| {
				routers
					.get(*ident)
					.map(|info| !info.is_unreachable())
					.unwrap_or(false)
			})
			.map(|ident| (self.metric_to(ident, target), *ident))
			.collect();
		sorted.sort_by(|a, b| a.0.cmp(&b.0));
		sorted.truncate(count);
		sorted.into_iter().map(|(_, ident)| ident).collect()
	}

	pub fn closest_non_floodfill(
		&self,
		target: &Hash,
		excluded: &HashSet<Hash>,
	) -> Option<Arc<RouterInfo>> {
		let routers = self.routers.read().unwrap();
		let mut best: Option<(XorMetric, &Arc<RouterInfo>)> = None;
		for (ident, info) in routers.iter() {
			if info.is_floodfill() || excluded.contains(ident) {
				continue;
			}
			let metric = self.metric_to(ident, target);
			if best.map(|(m, _)| metric < m).unwrap_or(true) {
				best = Some((metric, info));
			}
		}
		best.map(|(_, info)| info.clone())
	}

	fn random_router_where(
		&self,
		filter: impl Fn(&RouterInfo) -> bool,
	) -> Option<Arc<RouterInfo>> {
		let routers = self.routers.read().unwrap();
		let mut rng = rand::thread_rng();
		routers
			.values()
			.filter(|info| !info.is_unreachable() && !info.is_hidden() && filter(info))
			.choose(&mut rng)
			.cloned()
	}

	pub fn random_router(&self) -> Option<Arc<RouterInfo>> {
		self.random_router_where(|_| true)
	}

	pub fn random_peer_test_router(&self) -> Option<Arc<RouterInfo>> {
		self.random_router_where(|info| info.is_peer_testing())
	}

	pub fn random_introducer(&self) -> Option<Arc<RouterInfo>> {
		self.random_router_where(|info| info.is_introducer())
	}

	pub fn random_high_bandwidth_router(&self) -> Option<Arc<RouterInfo>> {
		self.random_router_where(|info| info.is_high_bandwidth())
	}

	//
	// Requests
	//

	/// Looks up a router by hash, calling back with the result. The first
	/// lookup goes to the closest floodfill.
	pub fn request_destination(&self, destination: &Hash, complete: RequestComplete) {
		if let Some(router) = self.find_router(destination) {
			complete(Some(router));
			return;
		}
		if !self
			.requests
			.create_request(destination, false, Some(complete))
		{
			return;
		}
		self.send_next_lookup(destination);
	}

	/// Fire-and-forget variant used for search-reply follow-ups.
	fn request_destination_quiet(&self, destination: &Hash) {
		if self.find_router(destination).is_some() {
			return;
		}
		if self.requests.create_request(destination, false, None) {
			self.send_next_lookup(destination);
		}
	}

	fn send_next_lookup(&self, destination: &Hash) {
		let own = self.ctx.ident_hash();
		let excluded: HashSet<Hash> = self
			.requests
			.with_request(destination, |r| r.excluded())
			.unwrap_or_default()
			.into_iter()
			.collect();
		let Some(floodfill) = self.closest_floodfill(destination, &excluded) else {
			error!("NetDb: no floodfills found for {}", destination);
			self.requests.complete(destination, None);
			return;
		};
		let msg = self.requests.with_request(destination, |request| {
			request.create_request_message(&floodfill.hash(), &own, 0)
		});
		match msg {
			Some(Ok(msg)) => self.send_message(&floodfill.hash(), msg),
			Some(Err(e)) => error!("NetDb: building lookup failed: {}", e),
			None => {}
		}
	}

	fn manage_requests(&self) {
		for action in self.requests.manage() {
			match action {
				RequestAction::Retry(destination) => self.send_next_lookup(&destination),
				RequestAction::Fail(_) => {}
			}
		}
	}

	//
	// Periodic work
	//

	/// Asks the floodfills closest to random keys for new routers.
	fn explore(&self, count: usize) {
		debug!("NetDb: exploring {} new routers", count);
		let own = self.ctx.ident_hash();
		let mut contacted: HashSet<Hash> = HashSet::new();
		for _ in 0..count {
			let mut random = [0u8; 32];
			rand::thread_rng().fill_bytes(&mut random);
			let destination = Hash(random);
			if !self.requests.create_request(&destination, true, None) {
				continue;
			}
			let excluded = HashSet::new();
			let Some(floodfill) = self.closest_floodfill(&destination, &excluded) else {
				self.requests.complete(&destination, None);
				continue;
			};
			// each floodfill only once per round
			if !contacted.insert(floodfill.hash()) {
				self.requests.complete(&destination, None);
				continue;
			}
			// tell the floodfill about us, then explore
			if let Ok(store) =
				i2np::create_database_store_message(&self.ctx.router_info(), 0, None)
			{
				self.send_message(&floodfill.hash(), store);
			}
			let msg = self.requests.with_request(&destination, |request| {
				request.create_request_message(&floodfill.hash(), &own, 0)
			});
			if let Some(Ok(msg)) = msg {
				self.send_message(&floodfill.hash(), msg);
			}
		}
	}

	/// Publishes our own router info to the two closest floodfills.
	fn publish(&self) {
		let own = self.ctx.ident_hash();
		let mut excluded = HashSet::new();
		for _ in 0..2 {
			let Some(floodfill) = self.closest_floodfill(&own, &excluded) else {
				return;
			};
			let reply_token: u32 = rand::thread_rng().gen_range(1..u32::MAX);
			debug!(
				"NetDb: publishing our router info to {}, reply token {}",
				floodfill.hash(),
				reply_token
			);
			// tunnel id zero: the delivery status comes straight back to us
			match i2np::create_database_store_message(
				&self.ctx.router_info(),
				reply_token,
				Some((0, own)),
			) {
				Ok(msg) => self.send_message(&floodfill.hash(), msg),
				Err(e) => error!("NetDb: cannot build publish message: {}", e),
			}
			excluded.insert(floodfill.hash());
		}
	}

	fn send_message(&self, to: &Hash, msg: Message) {
		if let Some(transports) = self.transports() {
			transports.send_message(to, msg);
		} else {
			debug!("NetDb: no transports wired, dropping message for {}", to);
		}
	}

	fn send_reply(&self, to: &Hash, reply_tunnel_id: u32, msg: Message) {
		if reply_tunnel_id != 0 {
			if let Some(tunnels) = self.tunnels.lock().unwrap().clone() {
				if tunnels.send_through_tunnel(to, reply_tunnel_id, msg.clone()) {
					return;
				}
			} else if let Ok(gateway) = i2np::create_tunnel_gateway_message(reply_tunnel_id, &msg)
			{
				self.send_message(to, gateway);
				return;
			}
		}
		self.send_message(to, msg);
	}

	//
	// Handlers
	//

	fn handle_database_store(&self, _from: Option<Hash>, msg: &Message) -> Result<(), Error> {
		let payload = msg.payload();
		if payload.len() < i2np::STORE_HEADER_SIZE {
			return Err(Error::Truncated("database store"));
		}
		let key = Hash::from_slice(&payload[i2np::STORE_KEY_OFFSET..])?;
		if key.is_zero() {
			return Err(Error::Protocol("database store with zero ident".into()));
		}
		let store_type = payload[i2np::STORE_TYPE_OFFSET];
		let reply_token =
			BigEndian::read_u32(&payload[i2np::STORE_REPLY_TOKEN_OFFSET..i2np::STORE_HEADER_SIZE]);
		let mut offset = i2np::STORE_HEADER_SIZE;
		if reply_token != 0 {
			if payload.len() < offset + 36 {
				return Err(Error::Truncated("database store reply block"));
			}
			let tunnel_id = BigEndian::read_u32(&payload[offset..offset + 4]);
			offset += 4;
			let gateway = Hash::from_slice(&payload[offset..])?;
			offset += 32;
			let status = i2np::create_delivery_status_message(reply_token);
			self.send_reply(&gateway, tunnel_id, status);

			if self.ctx.is_floodfill() {
				self.flood(&key, store_type, &payload[offset..]);
			}
		}
		if store_type != 0 {
			debug!("NetDb: lease set store for {}", key);
			self.add_lease_set(&payload[offset..])?;
		} else {
			debug!("NetDb: router info store for {}", key);
			if payload.len() < offset + 2 {
				return Err(Error::Truncated("database store size"));
			}
			let size = BigEndian::read_u16(&payload[offset..offset + 2]) as usize;
			offset += 2;
			if size > payload.len() - offset {
				return Err(Error::Protocol(format!("invalid router info length {}", size)));
			}
			let info = i2np::decompress_router_info(&payload[offset..offset + size])?;
			let bytes = info.to_bytes()?;
			self.add_router_info(&bytes)?;
		}
		Ok(())
	}

	/// Re-floods a received store to the three closest floodfills with a
	/// zeroed reply token.
	fn flood(&self, key: &Hash, store_type: u8, data: &[u8]) {
		let mut flood = Message::new();
		let mut payload = Vec::with_capacity(i2np::STORE_HEADER_SIZE + data.len());
		payload.extend_from_slice(&key.0);
		payload.push(store_type);
		payload.extend_from_slice(&0u32.to_be_bytes());
		payload.extend_from_slice(data);
		if flood.append_payload(&payload).is_err() {
			return;
		}
		flood.fill_header(i2np::MSG_TYPE_DATABASE_STORE);
		let mut excluded = HashSet::new();
		excluded.insert(self.ctx.ident_hash());
		for ident in self.closest_floodfills(key, 3, &excluded) {
			self.send_message(&ident, flood.clone());
		}
	}

	fn handle_search_reply(&self, msg: &Message) -> Result<(), Error> {
		let payload = msg.payload();
		if payload.len() < 65 {
			return Err(Error::Truncated("database search reply"));
		}
		let key = Hash::from_slice(payload)?;
		let num = payload[32] as usize;
		if payload.len() < 33 + num * 32 {
			return Err(Error::Truncated("database search reply peers"));
		}
		debug!("NetDb: search reply for {}, {} peers", key, num);

		if self.requests.contains(&key) {
			let exploratory = self
				.requests
				.with_request(&key, |r| r.is_exploratory())
				.unwrap_or(true);
			let attempts = self.requests.with_request(&key, |r| r.attempts()).unwrap_or(0);
			if !exploratory && num > 0 && attempts < requests::MAX_REQUEST_ATTEMPTS {
				// try the next closest floodfill
				self.send_next_lookup(&key);
			} else {
				self.requests.complete(&key, None);
			}
		} else {
			warn!("NetDb: unsolicited search reply for {}", key);
		}

		// request whatever the reply told us about that we do not have
		let now = milliseconds_since_epoch();
		for i in 0..num {
			let router = Hash::from_slice(&payload[33 + i * 32..])?;
			let known_and_fresh = self
				.find_router(&router)
				.map(|info| {
					now.saturating_sub(info.published().0) < ROUTER_EXPIRATION.as_millis() as u64
				})
				.unwrap_or(false);
			if !known_and_fresh {
				self.request_destination_quiet(&router);
			}
		}
		Ok(())
	}

	fn handle_lookup(&self, msg: &Message) -> Result<(), Error> {
		let payload = msg.payload();
		if payload.len() < 67 {
			return Err(Error::Truncated("database lookup"));
		}
		let key = Hash::from_slice(payload)?;
		if key.is_zero() {
			return Err(Error::Protocol("lookup for zero ident".into()));
		}
		let from = Hash::from_slice(&payload[32..])?;
		let flag = payload[64];
		let lookup_type = flag & i2np::LOOKUP_TYPE_MASK;
		let mut offset = 65;
		let mut reply_tunnel_id = 0;
		if flag & i2np::LOOKUP_DELIVERY_FLAG != 0 {
			reply_tunnel_id = BigEndian::read_u32(&payload[offset..offset + 4]);
			offset += 4;
		}
		let num_excluded = BigEndian::read_u16(&payload[offset..offset + 2]) as usize;
		offset += 2;
		let num_excluded = if num_excluded > MAX_EXCLUDED_PEERS {
			warn!("NetDb: {} excluded peers exceeds the maximum", num_excluded);
			0
		} else {
			num_excluded
		};
		if payload.len() < offset + num_excluded * 32 {
			return Err(Error::Truncated("database lookup exclusion list"));
		}
		let mut excluded = HashSet::new();
		for i in 0..num_excluded {
			excluded.insert(Hash::from_slice(&payload[offset + i * 32..])?);
		}
		offset += num_excluded * 32;

		let own = self.ctx.ident_hash();
		let mut reply = None;
		if lookup_type == i2np::LOOKUP_TYPE_EXPLORATORY {
			debug!("NetDb: exploratory lookup close to {}", key);
			let mut routers = Vec::new();
			let mut local_excluded = excluded.clone();
			for _ in 0..3 {
				if let Some(router) = self.closest_non_floodfill(&key, &local_excluded) {
					local_excluded.insert(router.hash());
					routers.push(router.hash());
				}
			}
			reply = Some(i2np::create_database_search_reply(&key, &routers, &own));
		} else {
			if lookup_type == i2np::LOOKUP_TYPE_ROUTER_INFO
				|| lookup_type == i2np::LOOKUP_TYPE_NORMAL
			{
				if let Some(router) = self.find_router(&key) {
					debug!("NetDb: requested router info {} found", key);
					reply = i2np::create_database_store_message(&router, 0, None).ok();
				}
			}
			if reply.is_none()
				&& (lookup_type == i2np::LOOKUP_TYPE_LEASE_SET
					|| lookup_type == i2np::LOOKUP_TYPE_NORMAL)
			{
				if let Some(ls) = self.find_lease_set(&key) {
					debug!("NetDb: requested lease set {} found", key);
					reply = Some(Self::create_lease_set_store(&key, &ls)?);
				}
			}
			if reply.is_none() {
				debug!(
					"NetDb: requested {} not found, {} excluded",
					key,
					excluded.len()
				);
				let closest = self.closest_floodfills(&key, 3, &excluded);
				reply = Some(i2np::create_database_search_reply(&key, &closest, &own));
			}
		}
		let Some(mut reply) = reply else {
			return Ok(());
		};
		// an encrypted reply travels as a garlic message under the supplied
		// session key and tag
		if flag & i2np::LOOKUP_ENCRYPTION_FLAG != 0 && payload.len() >= offset + 33 {
			let session_key: [u8; 32] = payload[offset..offset + 32].try_into().unwrap();
			let num_tags = payload[offset + 32] as usize;
			if num_tags > 0 && payload.len() >= offset + 33 + 32 {
				let tag: [u8; 32] = payload[offset + 33..offset + 65].try_into().unwrap();
				reply = Self::garlic_wrap(&reply, &session_key, &tag)?;
			}
		}
		self.send_reply(&from, reply_tunnel_id, reply);
		Ok(())
	}

	fn create_lease_set_store(key: &Hash, ls: &LeaseSet) -> Result<Message, Error> {
		let mut msg = Message::new();
		let mut payload = Vec::new();
		payload.extend_from_slice(&key.0);
		payload.push(1); // type 1: lease set
		payload.extend_from_slice(&0u32.to_be_bytes());
		payload.extend_from_slice(&ls.to_bytes());
		msg.append_payload(&payload)?;
		msg.fill_header(i2np::MSG_TYPE_DATABASE_STORE);
		Ok(msg)
	}

	/// Tag-and-encrypt for lookup replies: the session tag travels in clear
	/// ahead of the AES-encrypted message, as the garlic layer expects.
	fn garlic_wrap(msg: &Message, session_key: &[u8; 32], tag: &[u8; 32]) -> Result<Message, Error> {
		use crate::crypto::aes::encrypt_cbc;
		use crate::crypto::SessionKey;

		let body = msg.bytes();
		let mut encrypted = Vec::with_capacity(body.len() + 20);
		encrypted.extend_from_slice(&(body.len() as u32).to_be_bytes());
		encrypted.extend_from_slice(body);
		let padding = (16 - encrypted.len() % 16) % 16;
		encrypted.resize(encrypted.len() + padding, 0);
		let iv_material: [u8; 16] = tag[..16].try_into().unwrap();
		encrypt_cbc(&SessionKey(*session_key), &iv_material, &mut encrypted);

		let mut garlic = Message::new();
		let mut payload = Vec::with_capacity(32 + encrypted.len());
		payload.extend_from_slice(tag);
		payload.extend_from_slice(&encrypted);
		garlic.append_payload(&payload)?;
		garlic.fill_header(i2np::MSG_TYPE_GARLIC);
		Ok(garlic)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use crate::crypto::SigType;
	use crate::data::router_info::TransportStyle;
	use crate::data::PrivateKeys;

	fn test_context(dir: &Path) -> Arc<RouterContext> {
		let mut config = Config::default();
		config.datadir = dir.to_path_buf();
		config.host = Some("127.0.0.1".parse().unwrap());
		config.port = Some(20_000);
		RouterContext::create(config).unwrap()
	}

	fn synthetic_router(floodfill: bool, seed: u16) -> Arc<RouterInfo> {
		let keys = PrivateKeys::random(SigType::Ed25519).unwrap();
		let caps = if floodfill { "fR" } else { "LR" };
		let info = RouterInfo::create(
			&keys,
			&[(
				TransportStyle::Ntcp,
				format!("127.0.0.1:{}", 10_000 + seed).parse().unwrap(),
			)],
			caps,
		)
		.unwrap();
		Arc::new(info)
	}

	fn netdb_with_routers(
		dir: &Path,
		total: usize,
		floodfills: usize,
	) -> (Arc<NetDb>, Vec<Arc<RouterInfo>>) {
		let ctx = test_context(dir);
		let netdb = NetDb::new(ctx, dir);
		let mut routers = Vec::new();
		for i in 0..total {
			let info = synthetic_router(i < floodfills, i as u16);
			let bytes = info.to_bytes().unwrap();
			netdb.add_router_info(&bytes).unwrap();
			routers.push(info);
		}
		(netdb, routers)
	}

	#[test]
	fn add_and_find_router() {
		let dir = tempfile::tempdir().unwrap();
		let (netdb, routers) = netdb_with_routers(dir.path(), 3, 1);
		assert_eq!(netdb.known_routers(), 3);
		let found = netdb.find_router(&routers[0].hash()).unwrap();
		assert_eq!(found.hash(), routers[0].hash());
		assert!(found.is_floodfill());
	}

	#[test]
	fn bad_signature_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let (netdb, _) = netdb_with_routers(dir.path(), 0, 0);
		let info = synthetic_router(false, 99);
		let mut bytes = info.to_bytes().unwrap();
		let flip = bytes.len() - 10;
		bytes[flip] ^= 1;
		assert!(netdb.add_router_info(&bytes).is_err());
	}

	#[test]
	fn closest_floodfill_minimizes_xor_distance() {
		let dir = tempfile::tempdir().unwrap();
		let (netdb, routers) = netdb_with_routers(dir.path(), 100, 10);
		let target = Hash::digest(b"lookup target");
		let excluded = HashSet::new();
		let chosen = netdb.closest_floodfill(&target, &excluded).unwrap();
		let chosen_metric = routing_key(&chosen.hash()).xor(&target);
		for router in routers.iter().filter(|r| r.is_floodfill()) {
			let metric = routing_key(&router.hash()).xor(&target);
			assert!(chosen_metric <= metric);
		}
		// excluding the winner yields the runner-up
		let mut excluded = HashSet::new();
		excluded.insert(chosen.hash());
		let second = netdb.closest_floodfill(&target, &excluded).unwrap();
		assert_ne!(second.hash(), chosen.hash());
		assert!(chosen_metric <= routing_key(&second.hash()).xor(&target));
	}

	#[test]
	fn closest_floodfills_are_sorted_and_bounded() {
		let dir = tempfile::tempdir().unwrap();
		let (netdb, _) = netdb_with_routers(dir.path(), 40, 8);
		let target = Hash::digest(b"another target");
		let excluded = HashSet::new();
		let closest = netdb.closest_floodfills(&target, 3, &excluded);
		assert_eq!(closest.len(), 3);
		let metrics: Vec<_> = closest
			.iter()
			.map(|h| routing_key(h).xor(&target))
			.collect();
		assert!(metrics[0] <= metrics[1] && metrics[1] <= metrics[2]);
	}

	#[test]
	fn exploratory_lookup_returns_non_floodfills() {
		let dir = tempfile::tempdir().unwrap();
		let (netdb, _) = netdb_with_routers(dir.path(), 20, 5);
		let target = Hash::digest(b"x");
		let excluded = HashSet::new();
		let router = netdb.closest_non_floodfill(&target, &excluded).unwrap();
		assert!(!router.is_floodfill());
	}

	#[test]
	fn request_callback_fires_on_install() {
		let dir = tempfile::tempdir().unwrap();
		let (netdb, _) = netdb_with_routers(dir.path(), 5, 2);
		let incoming = synthetic_router(false, 77);
		let expected = incoming.hash();
		let fired = Arc::new(AtomicBool::new(false));
		let flag = fired.clone();
		netdb.request_destination(
			&expected,
			Box::new(move |router| {
				assert_eq!(router.unwrap().hash(), expected);
				flag.store(true, Ordering::SeqCst);
			}),
		);
		assert!(!fired.load(Ordering::SeqCst));
		netdb.add_router_info(&incoming.to_bytes().unwrap()).unwrap();
		assert!(fired.load(Ordering::SeqCst));
	}

	#[test]
	fn known_router_resolves_immediately() {
		let dir = tempfile::tempdir().unwrap();
		let (netdb, routers) = netdb_with_routers(dir.path(), 3, 1);
		let target = routers[1].hash();
		let fired = Arc::new(AtomicBool::new(false));
		let flag = fired.clone();
		netdb.request_destination(
			&target,
			Box::new(move |router| {
				assert!(router.is_some());
				flag.store(true, Ordering::SeqCst);
			}),
		);
		assert!(fired.load(Ordering::SeqCst));
	}

	#[test]
	fn database_store_message_installs_router() {
		let dir = tempfile::tempdir().unwrap();
		let (netdb, _) = netdb_with_routers(dir.path(), 2, 1);
		let incoming = synthetic_router(false, 55);
		let store = i2np::create_database_store_message(&incoming, 0, None).unwrap();
		netdb.handle_message(None, store);
		assert!(netdb.find_router(&incoming.hash()).is_some());
	}

	#[test]
	fn stale_router_not_installed_over_fresh() {
		let dir = tempfile::tempdir().unwrap();
		let (netdb, _) = netdb_with_routers(dir.path(), 0, 0);
		let keys = PrivateKeys::random(SigType::Ed25519).unwrap();
		let mut info = RouterInfo::create(
			&keys,
			&[(TransportStyle::Ntcp, "127.0.0.1:4000".parse().unwrap())],
			"LR",
		)
		.unwrap();
		let old_bytes = info.to_bytes().unwrap();
		std::thread::sleep(Duration::from_millis(5));
		info.set_caps("fR");
		info.sign(&keys).unwrap();
		let new_bytes = info.to_bytes().unwrap();

		netdb.add_router_info(&new_bytes).unwrap();
		let resolved = netdb.add_router_info(&old_bytes).unwrap();
		// the fresher record wins
		assert!(resolved.is_floodfill());
	}

	#[test]
	fn lease_sets_expire_on_manage() {
		let dir = tempfile::tempdir().unwrap();
		let (netdb, _) = netdb_with_routers(dir.path(), 0, 0);
		// build a lease set that expires immediately
		let keys = PrivateKeys::random(SigType::Ed25519).unwrap();
		let mut ls = LeaseSet {
			destination: keys.identity.clone(),
			encryption_key: Box::new([1u8; 256]),
			revocation_key: vec![0u8; 32],
			leases: vec![crate::data::Lease {
				tunnel_gateway: Hash::digest(b"gw"),
				tunnel_id: 5,
				end_date: crate::data::Date(milliseconds_since_epoch() + 50),
			}],
			signature: Vec::new(),
		};
		let body = crate::data::frame::gen_lease_set_minus_sig(&ls);
		ls.signature = keys.sign(&body).unwrap();
		netdb.add_lease_set(&ls.to_bytes()).unwrap();
		assert!(netdb.find_lease_set(&keys.hash()).is_some());
		std::thread::sleep(Duration::from_millis(80));
		netdb.manage_lease_sets();
		assert!(netdb.find_lease_set(&keys.hash()).is_none());
	}
}
