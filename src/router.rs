//! The owning node value: keys, published router info, and the wiring
//! between the network database, the transports and the dispatcher.
//!
//! Everything the original design kept in global singletons lives here, so
//! tests can create as many independent routers as they need.

use log::{info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::config::Config;
use crate::data::router_info::TransportStyle;
use crate::data::{Hash, PrivateKeys, RouterInfo};
use crate::error::Error;
use crate::i2np::Dispatcher;
use crate::netdb::NetDb;
use crate::transport::Transports;

pub const ROUTER_KEYS_FILE: &str = "router.keys";
pub const ROUTER_INFO_FILE: &str = "router.info";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouterStatus {
	Ok,
	Testing,
	Firewalled,
	Unknown,
}

/// Long-lived state shared by every subsystem of one router.
pub struct RouterContext {
	config: Config,
	keys: PrivateKeys,
	router_info: RwLock<Arc<RouterInfo>>,
	status: Mutex<RouterStatus>,
	dispatcher: OnceLock<Arc<Dispatcher>>,
}

impl RouterContext {
	/// Loads the router keys from the data directory or generates a fresh
	/// identity, then builds and signs our router info.
	pub fn create(config: Config) -> Result<Arc<Self>, Error> {
		config.validate()?;
		std::fs::create_dir_all(&config.datadir)?;
		let keys_path = config.datadir.join(ROUTER_KEYS_FILE);
		let keys = match PrivateKeys::from_file(&keys_path) {
			Ok(keys) => keys,
			Err(_) => {
				info!("RouterContext: generating a new router identity");
				let keys = PrivateKeys::random_default()?;
				keys.to_file(&keys_path)?;
				keys
			}
		};

		let info = Self::build_router_info(&config, &keys)?;
		info.to_file(config.datadir.join(ROUTER_INFO_FILE))?;
		info!(
			"RouterContext: router {} with caps '{}'",
			info.hash(),
			info.caps_string()
		);
		Ok(Arc::new(RouterContext {
			config,
			keys,
			router_info: RwLock::new(Arc::new(info)),
			status: Mutex::new(RouterStatus::Unknown),
			dispatcher: OnceLock::new(),
		}))
	}

	fn build_router_info(config: &Config, keys: &PrivateKeys) -> Result<RouterInfo, Error> {
		let mut endpoints: Vec<(TransportStyle, SocketAddr)> = Vec::new();
		if let Some(host) = config.host {
			let port = config.port_or_random();
			if config.enable_ntcp {
				endpoints.push((TransportStyle::Ntcp, SocketAddr::new(host, port)));
			}
			if config.enable_ssu {
				endpoints.push((TransportStyle::Ssu, SocketAddr::new(host, port)));
			}
		} else {
			warn!("RouterContext: no host configured, publishing no addresses");
		}
		RouterInfo::create(keys, &endpoints, &config.caps_string())
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn data_dir(&self) -> PathBuf {
		self.config.datadir.clone()
	}

	pub fn keys(&self) -> &PrivateKeys {
		&self.keys
	}

	pub fn ident_hash(&self) -> Hash {
		self.keys.hash()
	}

	pub fn router_info(&self) -> Arc<RouterInfo> {
		self.router_info.read().unwrap().clone()
	}

	pub fn is_floodfill(&self) -> bool {
		self.router_info().is_floodfill()
	}

	/// Applies a mutation to our router info and re-signs it.
	pub fn update_router_info(
		&self,
		mutate: impl FnOnce(&mut RouterInfo),
	) -> Result<(), Error> {
		let mut info = (*self.router_info()).clone();
		mutate(&mut info);
		info.sign(&self.keys)?;
		info.to_file(self.config.datadir.join(ROUTER_INFO_FILE))?;
		*self.router_info.write().unwrap() = Arc::new(info);
		Ok(())
	}

	pub fn status(&self) -> RouterStatus {
		*self.status.lock().unwrap()
	}

	pub fn set_status(&self, status: RouterStatus) {
		let mut current = self.status.lock().unwrap();
		if *current != status {
			info!("RouterContext: status {:?} -> {:?}", *current, status);
			*current = status;
		}
	}

	pub(crate) fn set_dispatcher(&self, dispatcher: Arc<Dispatcher>) {
		let _ = self.dispatcher.set(dispatcher);
	}

	pub fn dispatcher(&self) -> Arc<Dispatcher> {
		self.dispatcher
			.get()
			.expect("dispatcher wired during router construction")
			.clone()
	}
}

/// A complete router node: context, database and transports.
pub struct Router {
	ctx: Arc<RouterContext>,
	netdb: Arc<NetDb>,
	transports: Arc<Transports>,
}

impl Router {
	pub fn new(config: Config) -> Result<Self, Error> {
		let ctx = RouterContext::create(config)?;
		let netdb = NetDb::new(ctx.clone(), ctx.data_dir());
		let dispatcher = Arc::new(Dispatcher::new(netdb.queue_sender()));
		ctx.set_dispatcher(dispatcher);
		let transports = Transports::new(ctx.clone(), netdb.clone());
		netdb.set_transports(&transports);
		Ok(Router {
			ctx,
			netdb,
			transports,
		})
	}

	pub fn context(&self) -> &Arc<RouterContext> {
		&self.ctx
	}

	pub fn netdb(&self) -> &Arc<NetDb> {
		&self.netdb
	}

	pub fn transports(&self) -> &Arc<Transports> {
		&self.transports
	}

	pub fn start(&self) -> Result<(), Error> {
		info!("Router: starting {}", self.ctx.ident_hash());
		self.netdb.start()?;
		self.transports.start()?;
		Ok(())
	}

	pub fn stop(&self) {
		info!("Router: stopping {}", self.ctx.ident_hash());
		self.transports.stop();
		self.netdb.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_config(dir: &std::path::Path) -> Config {
		Config {
			datadir: dir.to_path_buf(),
			host: Some("127.0.0.1".parse().unwrap()),
			port: Some(17_891),
			..Default::default()
		}
	}

	#[test]
	fn identity_persists_across_restarts() {
		let dir = tempfile::tempdir().unwrap();
		let first = RouterContext::create(test_config(dir.path())).unwrap();
		let hash = first.ident_hash();
		drop(first);
		let second = RouterContext::create(test_config(dir.path())).unwrap();
		assert_eq!(second.ident_hash(), hash);
	}

	#[test]
	fn router_info_matches_config() {
		let dir = tempfile::tempdir().unwrap();
		let mut config = test_config(dir.path());
		config.floodfill = true;
		config.bandwidth = 'P';
		let ctx = RouterContext::create(config).unwrap();
		let info = ctx.router_info();
		assert!(info.is_floodfill());
		assert!(info.is_high_bandwidth());
		assert!(info.has_ntcp());
		assert!(info.has_ssu());
		assert!(info.verify().is_ok());
		// the stored file parses back to the same record
		let reloaded =
			RouterInfo::from_file(dir.path().join(ROUTER_INFO_FILE)).unwrap();
		assert_eq!(reloaded.hash(), ctx.ident_hash());
		assert!(reloaded.verify().is_ok());
	}

	#[test]
	fn update_router_info_resigns() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = RouterContext::create(test_config(dir.path())).unwrap();
		assert!(!ctx.is_floodfill());
		ctx.update_router_info(|info| info.set_caps("fLR")).unwrap();
		assert!(ctx.is_floodfill());
		assert!(ctx.router_info().verify().is_ok());
	}

	#[test]
	fn router_wires_subsystems() {
		let dir = tempfile::tempdir().unwrap();
		let router = Router::new(test_config(dir.path())).unwrap();
		// the dispatcher is reachable through the context once wired
		let _ = router.context().dispatcher();
		assert_eq!(router.netdb().known_routers(), 0);
	}
}
