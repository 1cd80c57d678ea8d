//! End-to-end scenarios exercised through the public library surface.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use i2p_router::config::Config;
use i2p_router::crypto::SigType;
use i2p_router::data::router_info::TransportStyle;
use i2p_router::data::{routing_key, Hash, PrivateKeys, RouterInfo};
use i2p_router::netdb::NetDb;
use i2p_router::RouterContext;

fn init_logging() {
	let _ = env_logger::builder().is_test(true).try_init();
}

fn context_in(dir: &std::path::Path, port: u16) -> Arc<RouterContext> {
	let config = Config {
		datadir: dir.to_path_buf(),
		host: Some("127.0.0.1".parse().unwrap()),
		port: Some(port),
		..Default::default()
	};
	RouterContext::create(config).unwrap()
}

fn synthetic_router(floodfill: bool, port: u16) -> RouterInfo {
	let keys = PrivateKeys::random(SigType::Ed25519).unwrap();
	RouterInfo::create(
		&keys,
		&[
			(
				TransportStyle::Ntcp,
				format!("192.168.1.1:{}", port).parse().unwrap(),
			),
			(
				TransportStyle::Ssu,
				format!("192.168.1.1:{}", port).parse().unwrap(),
			),
		],
		if floodfill { "fOR" } else { "LR" },
	)
	.unwrap()
}

/// Generate an Ed25519 router info, serialize to disk, reload it into a
/// fresh database instance and check everything survived.
#[test]
fn router_info_disk_round_trip() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let keys = PrivateKeys::random(SigType::Ed25519).unwrap();
	let info = RouterInfo::create(
		&keys,
		&[
			(TransportStyle::Ntcp, "192.168.1.1:10100".parse().unwrap()),
			(TransportStyle::Ssu, "192.168.1.1:10100".parse().unwrap()),
		],
		"fPR",
	)
	.unwrap();
	let created_hash = info.hash();
	let path = dir.path().join("router.dat");
	info.to_file(&path).unwrap();

	let reloaded = RouterInfo::from_file(&path).unwrap();
	assert!(reloaded.is_floodfill());
	assert!(reloaded.is_high_bandwidth());
	assert_eq!(reloaded.hash(), created_hash);
	assert!(reloaded.verify().is_ok());
	assert!(!reloaded.is_updated());

	// and through a fresh database instance
	let ctx = context_in(dir.path(), 18_000);
	let netdb = NetDb::new(ctx, dir.path());
	let installed = netdb.add_router_info(&reloaded.to_bytes().unwrap()).unwrap();
	assert_eq!(installed.hash(), created_hash);
	assert!(netdb.find_router(&created_hash).unwrap().is_floodfill());
}

/// Populate a database with synthetic routers and verify the closest
/// flood-fill choice minimizes day-salted XOR distance over all candidates.
#[test]
fn floodfill_selection_minimizes_distance() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let ctx = context_in(dir.path(), 18_001);
	let netdb = NetDb::new(ctx, dir.path());

	let mut floodfills = Vec::new();
	for i in 0..100u16 {
		let info = synthetic_router(i < 10, 20_000 + i);
		if info.is_floodfill() {
			floodfills.push(info.hash());
		}
		netdb.add_router_info(&info.to_bytes().unwrap()).unwrap();
	}
	assert_eq!(floodfills.len(), 10);

	let target = Hash::digest(b"absent router");
	let excluded = HashSet::new();
	let chosen = netdb.closest_floodfill(&target, &excluded).unwrap();
	let chosen_metric = routing_key(&chosen.hash()).xor(&target);
	for candidate in &floodfills {
		assert!(chosen_metric <= routing_key(candidate).xor(&target));
	}

	// the top three come back sorted by distance
	let three = netdb.closest_floodfills(&target, 3, &excluded);
	assert_eq!(three.len(), 3);
	assert_eq!(three[0], chosen.hash());
}

/// A lookup for an unknown router invokes the completion callback with the
/// installed record once a store arrives.
#[test]
fn pending_request_completes_on_store() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let ctx = context_in(dir.path(), 18_002);
	let netdb = NetDb::new(ctx, dir.path());
	for i in 0..10u16 {
		let info = synthetic_router(true, 21_000 + i);
		netdb.add_router_info(&info.to_bytes().unwrap()).unwrap();
	}

	let wanted = synthetic_router(false, 22_000);
	let wanted_hash = wanted.hash();
	let resolved = Arc::new(AtomicBool::new(false));
	let flag = resolved.clone();
	netdb.request_destination(
		&wanted_hash,
		Box::new(move |router| {
			if let Some(router) = router {
				assert_eq!(router.hash(), wanted_hash);
				flag.store(true, Ordering::SeqCst);
			}
		}),
	);
	assert!(!resolved.load(Ordering::SeqCst));
	netdb.add_router_info(&wanted.to_bytes().unwrap()).unwrap();
	assert!(resolved.load(Ordering::SeqCst));
}

/// Peer profiles survive a simulated restart (S6).
#[test]
fn peer_profile_persistence() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let ident = Hash::digest(b"profiled peer");
	{
		let store = i2p_router::netdb::ProfileStore::new(dir.path());
		let profile = store.profile(&ident);
		let mut profile = profile.lock().unwrap();
		profile.tunnel_build_response(0);
		profile.tunnel_build_response(0);
		profile.tunnel_build_response(0);
		profile.tunnel_build_response(30);
		drop(profile);
		store.save_all();
	}
	let store = i2p_router::netdb::ProfileStore::new(dir.path());
	let profile = store.profile(&ident);
	let mut profile = profile.lock().unwrap();
	assert_eq!(profile.agreed(), 3);
	assert_eq!(profile.declined(), 1);
	assert!(!profile.is_bad());
}

/// Base32 and base64 codecs are round-trip identities (property 6), and the
/// identity hash survives serialize/parse cycles (property 1).
#[test]
fn codec_and_identity_stability() {
	init_logging();
	for len in [0usize, 1, 17, 256, 1024] {
		let data: Vec<u8> = (0..len).map(|i| (i * 131 + 7) as u8).collect();
		let b64 = i2p_router::data::BASE64_I2P.encode(&data);
		assert_eq!(i2p_router::data::BASE64_I2P.decode(b64.as_bytes()).unwrap(), data);
		let b32 = i2p_router::data::BASE32_I2P.encode(&data);
		assert_eq!(i2p_router::data::BASE32_I2P.decode(b32.as_bytes()).unwrap(), data);
	}

	let keys = PrivateKeys::random(SigType::Ed25519).unwrap();
	let bytes = keys.identity.to_bytes();
	let parsed = i2p_router::data::RouterIdentity::from_bytes(&bytes).unwrap();
	let reparsed =
		i2p_router::data::RouterIdentity::from_bytes(&parsed.to_bytes()).unwrap();
	assert_eq!(parsed, reparsed);
	assert_eq!(parsed.hash(), keys.identity.hash());
}

//
// Live loopback scenarios: two in-process routers talking over real sockets.
//

use std::time::{Duration, Instant};

use i2p_router::Router;

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		if check() {
			return true;
		}
		std::thread::sleep(Duration::from_millis(50));
	}
	false
}

fn loopback_router(dir: &std::path::Path, port: u16, ntcp: bool, ssu: bool) -> Router {
	let config = Config {
		datadir: dir.to_path_buf(),
		host: Some("127.0.0.1".parse().unwrap()),
		port: Some(port),
		enable_ntcp: ntcp,
		enable_ssu: ssu,
		..Default::default()
	};
	let router = Router::new(config).unwrap();
	router.start().unwrap();
	router
}

/// Two routers on a loopback address; A connects to B over the stream
/// transport. Both report an established session and the handshake's
/// database store lands A's identity in B's table.
#[test]
fn stream_handshake_happy_path() {
	init_logging();
	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();
	let a = loopback_router(dir_a.path(), 34_101, true, false);
	let b = loopback_router(dir_b.path(), 34_102, true, false);

	let b_info = b.context().router_info();
	a.netdb().add_router_info(&b_info.to_bytes().unwrap()).unwrap();

	let b_hash = b.context().ident_hash();
	let a_hash = a.context().ident_hash();
	let msg = i2p_router::i2np::create_data_message(b"poke").unwrap();
	a.transports().send_message(&b_hash, msg);

	assert!(
		wait_until(Duration::from_secs(5), || a.transports().is_connected(&b_hash)),
		"initiator never reached established"
	);
	assert!(
		wait_until(Duration::from_secs(5), || b.transports().is_connected(&a_hash)),
		"responder never reached established"
	);
	// the post-handshake database store announced A to B
	assert!(
		wait_until(Duration::from_secs(5), || b
			.netdb()
			.find_router(&a_hash)
			.is_some()),
		"initiator identity never reached the responder's database"
	);

	a.stop();
	b.stop();
}

/// Datagram transport establishment, then a database store delivered over
/// the data subprotocol and dispatched upward at the receiver.
#[test]
fn datagram_session_delivers_messages() {
	init_logging();
	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();
	let a = loopback_router(dir_a.path(), 34_111, false, true);
	let b = loopback_router(dir_b.path(), 34_112, false, true);

	let b_info = Arc::new(
		RouterInfo::from_bytes(&b.context().router_info().to_bytes().unwrap()).unwrap(),
	);
	let b_hash = b_info.hash();
	let a_hash = a.context().ident_hash();

	let ssu = a.transports().ssu_server().expect("ssu enabled");
	ssu.open_session(b_info, false).unwrap();
	assert!(
		wait_until(Duration::from_secs(5), || a.transports().is_connected(&b_hash)),
		"datagram session never established"
	);

	// B installing our router info proves the data channel dispatches
	let store =
		i2p_router::i2np::create_database_store_message(&a.context().router_info(), 0, None)
			.unwrap();
	a.transports().send_message(&b_hash, store);
	assert!(
		wait_until(Duration::from_secs(5), || b
			.netdb()
			.find_router(&a_hash)
			.is_some()),
		"store never dispatched upward at the receiver"
	);

	a.stop();
	b.stop();
}

/// A connection whose first phase carries a wrong identity digest gets the
/// socket closed and the source IP banned for roughly 70 seconds.
#[test]
fn ban_after_protocol_error() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let router = loopback_router(dir.path(), 34_121, true, false);

	{
		use std::io::Write;
		let mut stream = std::net::TcpStream::connect("127.0.0.1:34121").unwrap();
		// phase 1 sized garbage: X plus a digest that matches no identity
		stream.write_all(&[0x5Au8; 288]).unwrap();
	}

	let ip: std::net::IpAddr = "127.0.0.1".parse().unwrap();
	assert!(
		wait_until(Duration::from_secs(5), || router
			.transports()
			.ban_list
			.is_banned(&ip)),
		"protocol violation did not ban the peer"
	);
	let expiry = router.transports().ban_list.expiry(&ip).unwrap();
	let remaining = expiry - Instant::now();
	assert!(remaining > Duration::from_secs(60) && remaining <= Duration::from_secs(70));

	router.stop();
}
