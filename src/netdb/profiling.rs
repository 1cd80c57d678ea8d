//! Peer profiles: per-router participation counters persisted as INI files.
//!
//! Files live under `peerProfiles/pX/profile-<base64>.txt` where `X` is the
//! first base64 character of the identity hash, lowercased so one layout
//! works on case-insensitive filesystems. Writes are atomic (tmp + rename).

use log::{debug, error, warn};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::data::{civil_from_days, Hash};
use crate::error::Error;

pub const PEER_PROFILES_DIRECTORY: &str = "peerProfiles";
pub const PEER_PROFILE_PREFIX: &str = "profile-";
pub const PROFILE_EXPIRATION: Duration = Duration::from_secs(72 * 3600);

const SECTION_PARTICIPATION: &str = "participation";
const SECTION_USAGE: &str = "usage";
const KEY_LAST_UPDATE: &str = "lastupdatetime";
const KEY_AGREED: &str = "agreed";
const KEY_DECLINED: &str = "declined";
const KEY_NON_REPLIED: &str = "nonreplied";
const KEY_TAKEN: &str = "taken";
const KEY_REJECTED: &str = "rejected";

fn format_timestamp(t: SystemTime) -> String {
	let secs = t
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::ZERO)
		.as_secs();
	let (year, month, day) = civil_from_days(secs / 86_400);
	let rem = secs % 86_400;
	format!(
		"{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
		year,
		month,
		day,
		rem / 3600,
		rem % 3600 / 60,
		rem % 60
	)
}

fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
	let y = if month <= 2 { year - 1 } else { year };
	let era = y.div_euclid(400);
	let yoe = y - era * 400;
	let mp = if month > 2 { month - 3 } else { month + 9 };
	let doy = (153 * mp + 2) / 5 + day - 1;
	let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
	era * 146_097 + doe - 719_468
}

fn parse_timestamp(s: &str) -> Option<SystemTime> {
	let (date, time) = s.trim().split_once(' ')?;
	let mut date_parts = date.split('-');
	let year: i64 = date_parts.next()?.parse().ok()?;
	let month: i64 = date_parts.next()?.parse().ok()?;
	let day: i64 = date_parts.next()?.parse().ok()?;
	let mut time_parts = time.split(':');
	let hour: u64 = time_parts.next()?.parse().ok()?;
	let minute: u64 = time_parts.next()?.parse().ok()?;
	let second: u64 = time_parts.next()?.parse().ok()?;
	let days = days_from_civil(year, month, day);
	if days < 0 {
		return None;
	}
	Some(UNIX_EPOCH + Duration::from_secs(days as u64 * 86_400 + hour * 3600 + minute * 60 + second))
}

/// Counters for one peer's tunnel behavior.
pub struct RouterProfile {
	ident: Hash,
	last_update: SystemTime,
	// participation
	tunnels_agreed: u32,
	tunnels_declined: u32,
	tunnels_non_replied: u32,
	// usage
	times_taken: u32,
	times_rejected: u32,
}

impl RouterProfile {
	pub fn new(ident: Hash) -> Self {
		RouterProfile {
			ident,
			last_update: SystemTime::now(),
			tunnels_agreed: 0,
			tunnels_declined: 0,
			tunnels_non_replied: 0,
			times_taken: 0,
			times_rejected: 0,
		}
	}

	pub fn ident(&self) -> Hash {
		self.ident
	}

	pub fn agreed(&self) -> u32 {
		self.tunnels_agreed
	}

	pub fn declined(&self) -> u32 {
		self.tunnels_declined
	}

	pub fn non_replied(&self) -> u32 {
		self.tunnels_non_replied
	}

	/// Records a tunnel build reply: zero means the peer agreed.
	pub fn tunnel_build_response(&mut self, response_code: u8) {
		if response_code == 0 {
			self.tunnels_agreed += 1;
		} else {
			self.tunnels_declined += 1;
		}
		self.last_update = SystemTime::now();
	}

	pub fn tunnel_non_replied(&mut self) {
		self.tunnels_non_replied += 1;
		self.last_update = SystemTime::now();
	}

	pub fn taken(&mut self) {
		self.times_taken += 1;
	}

	fn is_always_declining(&self) -> bool {
		self.tunnels_agreed == 0 && self.tunnels_declined >= 5
	}

	fn is_low_participation(&self) -> bool {
		self.tunnels_declined > 4 * self.tunnels_agreed
	}

	/// Bad peers are skipped for tunnel selection. Each bad verdict counts
	/// as a rejection; a profile stuck bad despite heavy use gets reset.
	pub fn is_bad(&mut self) -> bool {
		let mut bad = self.is_always_declining() || self.is_low_participation();
		if bad && self.times_rejected > 10 * (self.times_taken + 1) {
			debug!("RouterProfile: resetting overloaded profile {}", self.ident);
			let ident = self.ident;
			*self = RouterProfile::new(ident);
			bad = false;
		}
		if bad {
			self.times_rejected += 1;
		}
		bad
	}

	fn serialize(&self) -> String {
		let mut out = String::new();
		out.push_str(&format!(
			"{}={}\n",
			KEY_LAST_UPDATE,
			format_timestamp(self.last_update)
		));
		out.push_str(&format!("[{}]\n", SECTION_PARTICIPATION));
		out.push_str(&format!("{}={}\n", KEY_AGREED, self.tunnels_agreed));
		out.push_str(&format!("{}={}\n", KEY_DECLINED, self.tunnels_declined));
		out.push_str(&format!("{}={}\n", KEY_NON_REPLIED, self.tunnels_non_replied));
		out.push_str(&format!("[{}]\n", SECTION_USAGE));
		out.push_str(&format!("{}={}\n", KEY_TAKEN, self.times_taken));
		out.push_str(&format!("{}={}\n", KEY_REJECTED, self.times_rejected));
		out
	}

	fn deserialize(ident: Hash, content: &str) -> Self {
		let mut profile = RouterProfile::new(ident);
		let mut section = "";
		for line in content.lines() {
			let line = line.trim();
			if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
				continue;
			}
			if line.starts_with('[') && line.ends_with(']') {
				section = &line[1..line.len() - 1];
				continue;
			}
			let Some((key, value)) = line.split_once('=') else {
				continue;
			};
			match (section, key) {
				("", KEY_LAST_UPDATE) => {
					if let Some(t) = parse_timestamp(value) {
						profile.last_update = t;
					}
				}
				(SECTION_PARTICIPATION, KEY_AGREED) => {
					profile.tunnels_agreed = value.parse().unwrap_or(0)
				}
				(SECTION_PARTICIPATION, KEY_DECLINED) => {
					profile.tunnels_declined = value.parse().unwrap_or(0)
				}
				(SECTION_PARTICIPATION, KEY_NON_REPLIED) => {
					profile.tunnels_non_replied = value.parse().unwrap_or(0)
				}
				(SECTION_USAGE, KEY_TAKEN) => profile.times_taken = value.parse().unwrap_or(0),
				(SECTION_USAGE, KEY_REJECTED) => {
					profile.times_rejected = value.parse().unwrap_or(0)
				}
				_ => warn!("RouterProfile: unknown key {} in section {}", key, section),
			}
		}
		profile
	}

	fn is_expired(&self) -> bool {
		self.last_update
			.elapsed()
			.map(|age| age > PROFILE_EXPIRATION)
			.unwrap_or(false)
	}
}

/// Lazily loaded, cached profiles backed by a directory of INI files.
pub struct ProfileStore {
	directory: PathBuf,
	cache: Mutex<HashMap<Hash, Arc<Mutex<RouterProfile>>>>,
}

impl ProfileStore {
	pub fn new<P: AsRef<Path>>(directory: P) -> Self {
		ProfileStore {
			directory: directory.as_ref().join(PEER_PROFILES_DIRECTORY),
			cache: Mutex::new(HashMap::new()),
		}
	}

	fn path_for(&self, ident: &Hash) -> PathBuf {
		let base64 = ident.to_base64();
		let bucket: String = base64
			.chars()
			.take(1)
			.map(|c| c.to_ascii_lowercase())
			.collect();
		self.directory
			.join(format!("p{}", bucket))
			.join(format!("{}{}.txt", PEER_PROFILE_PREFIX, base64))
	}

	/// Fetches the profile, loading it from disk on first reference.
	/// Expired profiles start fresh.
	pub fn profile(&self, ident: &Hash) -> Arc<Mutex<RouterProfile>> {
		let mut cache = self.cache.lock().unwrap();
		if let Some(profile) = cache.get(ident) {
			return profile.clone();
		}
		let profile = match fs::read_to_string(self.path_for(ident)) {
			Ok(content) => {
				let loaded = RouterProfile::deserialize(*ident, &content);
				if loaded.is_expired() {
					debug!("ProfileStore: profile for {} expired", ident);
					RouterProfile::new(*ident)
				} else {
					loaded
				}
			}
			Err(_) => RouterProfile::new(*ident),
		};
		let profile = Arc::new(Mutex::new(profile));
		cache.insert(*ident, profile.clone());
		profile
	}

	fn save_one(&self, profile: &RouterProfile) -> Result<(), Error> {
		let path = self.path_for(&profile.ident);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		let tmp = path.with_extension("tmp");
		{
			let mut file = fs::File::create(&tmp)?;
			file.write_all(profile.serialize().as_bytes())?;
		}
		fs::rename(&tmp, &path)?;
		Ok(())
	}

	/// Writes every cached profile; called on shutdown.
	pub fn save_all(&self) {
		let cache = self.cache.lock().unwrap();
		for profile in cache.values() {
			let profile = profile.lock().unwrap();
			if let Err(e) = self.save_one(&profile) {
				error!("ProfileStore: saving {} failed: {}", profile.ident, e);
			}
		}
	}

	/// Removes profile files untouched for longer than the expiration.
	pub fn delete_obsolete(&self) {
		let Ok(buckets) = fs::read_dir(&self.directory) else {
			return;
		};
		for bucket in buckets.flatten() {
			let Ok(files) = fs::read_dir(bucket.path()) else {
				continue;
			};
			for file in files.flatten() {
				let expired = file
					.metadata()
					.and_then(|m| m.modified())
					.ok()
					.and_then(|m| m.elapsed().ok())
					.map(|age| age > PROFILE_EXPIRATION)
					.unwrap_or(false);
				if expired {
					debug!("ProfileStore: deleting obsolete {:?}", file.path());
					let _ = fs::remove_file(file.path());
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn timestamps_round_trip() {
		let now = UNIX_EPOCH + Duration::from_secs(1_700_000_123);
		let formatted = format_timestamp(now);
		assert_eq!(parse_timestamp(&formatted), Some(now));
	}

	#[test]
	fn bad_peer_predicate() {
		let mut profile = RouterProfile::new(Hash::digest(b"peer"));
		assert!(!profile.is_bad());
		for _ in 0..5 {
			profile.tunnel_build_response(30);
		}
		// agreed = 0, declined = 5
		assert!(profile.is_bad());

		let mut profile = RouterProfile::new(Hash::digest(b"peer2"));
		profile.tunnel_build_response(0);
		for _ in 0..4 {
			profile.tunnel_build_response(30);
		}
		// declined = 4 = 4 * agreed, not yet bad
		assert!(!profile.is_bad());
		profile.tunnel_build_response(30);
		assert!(profile.is_bad());
	}

	#[test]
	fn heavily_rejected_profile_resets() {
		let mut profile = RouterProfile::new(Hash::digest(b"peer"));
		for _ in 0..5 {
			profile.tunnel_build_response(30);
		}
		profile.times_rejected = 11;
		profile.times_taken = 0;
		assert!(!profile.is_bad());
		assert_eq!(profile.declined(), 0);
	}

	#[test]
	fn persistence_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let store = ProfileStore::new(dir.path());
		let ident = Hash::digest(b"persistent peer");
		{
			let profile = store.profile(&ident);
			let mut profile = profile.lock().unwrap();
			profile.tunnel_build_response(0);
			profile.tunnel_build_response(0);
			profile.tunnel_build_response(0);
			profile.tunnel_build_response(30);
		}
		store.save_all();

		// a fresh store reads the file back
		let reloaded = ProfileStore::new(dir.path());
		let profile = reloaded.profile(&ident);
		let mut profile = profile.lock().unwrap();
		assert_eq!(profile.agreed(), 3);
		assert_eq!(profile.declined(), 1);
		assert!(!profile.is_bad());
	}

	#[test]
	fn profile_path_buckets_are_lowercase(){
		let store = ProfileStore::new("/tmp/prof-test");
		let ident = Hash([0u8; 32]); // base64 starts with 'A'
		let path = store.path_for(&ident);
		let bucket = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
		assert_eq!(bucket, "pa");
	}
}
