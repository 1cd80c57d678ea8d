//! Pending lookup tracker for the network database.
//!
//! Each requested destination remembers which floodfills were already tried
//! so retries walk outward through the keyspace. Requests die after a minute
//! or after seven unanswered attempts.

use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::data::{Hash, RouterInfo};
use crate::error::Error;
use crate::i2np::{self, LookupOptions, Message};

pub const REQUEST_LIFETIME: Duration = Duration::from_secs(60);
pub const REQUEST_RETRY_AFTER: Duration = Duration::from_secs(5);
pub const MAX_REQUEST_ATTEMPTS: usize = 7;

pub type RequestComplete = Box<dyn FnOnce(Option<Arc<RouterInfo>>) + Send>;

pub struct RequestedDestination {
	destination: Hash,
	exploratory: bool,
	excluded: HashSet<Hash>,
	created: Instant,
	complete: Option<RequestComplete>,
}

impl RequestedDestination {
	fn new(destination: Hash, exploratory: bool, complete: Option<RequestComplete>) -> Self {
		RequestedDestination {
			destination,
			exploratory,
			excluded: HashSet::new(),
			created: Instant::now(),
			complete,
		}
	}

	pub fn destination(&self) -> Hash {
		self.destination
	}

	pub fn is_exploratory(&self) -> bool {
		self.exploratory
	}

	pub fn excluded(&self) -> Vec<Hash> {
		self.excluded.iter().copied().collect()
	}

	pub fn attempts(&self) -> usize {
		self.excluded.len()
	}

	/// Builds the lookup addressed to `floodfill` and records the attempt.
	pub fn create_request_message(
		&mut self,
		floodfill: &Hash,
		from: &Hash,
		reply_tunnel_id: u32,
	) -> Result<Message, Error> {
		let excluded = self.excluded();
		let msg = i2np::create_database_lookup_message(
			&self.destination,
			from,
			&excluded,
			LookupOptions {
				exploratory: self.exploratory,
				reply_tunnel_id,
				encryption: None,
			},
		)?;
		self.excluded.insert(*floodfill);
		Ok(msg)
	}

	fn finish(&mut self, router: Option<Arc<RouterInfo>>) {
		if let Some(complete) = self.complete.take() {
			complete(router);
		}
	}
}

impl Drop for RequestedDestination {
	fn drop(&mut self) {
		// an abandoned request still answers its caller
		self.finish(None);
	}
}

/// What the reaper decided for each pending request.
pub enum RequestAction {
	/// send another lookup, excluding the listed peers
	Retry(Hash),
	/// give up and run the completion callback with nothing
	Fail(Hash),
}

#[derive(Default)]
pub struct NetDbRequests {
	pending: Mutex<HashMap<Hash, RequestedDestination>>,
}

impl NetDbRequests {
	pub fn new() -> Self {
		NetDbRequests::default()
	}

	/// Registers a request; false when the destination is already pending.
	pub fn create_request(
		&self,
		destination: &Hash,
		exploratory: bool,
		complete: Option<RequestComplete>,
	) -> bool {
		let mut pending = self.pending.lock().unwrap();
		if pending.contains_key(destination) {
			debug!("NetDbRequests: {} was already requested", destination);
			return false;
		}
		pending.insert(
			*destination,
			RequestedDestination::new(*destination, exploratory, complete),
		);
		true
	}

	/// Runs `f` against the pending request, if any.
	pub fn with_request<T>(
		&self,
		destination: &Hash,
		f: impl FnOnce(&mut RequestedDestination) -> T,
	) -> Option<T> {
		let mut pending = self.pending.lock().unwrap();
		pending.get_mut(destination).map(f)
	}

	pub fn contains(&self, destination: &Hash) -> bool {
		self.pending.lock().unwrap().contains_key(destination)
	}

	/// Completes and removes the request, invoking its callback.
	pub fn complete(&self, destination: &Hash, router: Option<Arc<RouterInfo>>) {
		let removed = self.pending.lock().unwrap().remove(destination);
		if let Some(mut request) = removed {
			request.finish(router);
		}
	}

	/// The reaper: drops requests older than a minute, retries unanswered
	/// ones after five seconds, fails after seven attempts.
	pub fn manage(&self) -> Vec<RequestAction> {
		let mut actions = Vec::new();
		let now = Instant::now();
		let mut pending = self.pending.lock().unwrap();
		let mut failed = Vec::new();
		for (destination, request) in pending.iter() {
			let age = now.duration_since(request.created);
			if age >= REQUEST_LIFETIME {
				failed.push(*destination);
			} else if age >= REQUEST_RETRY_AFTER {
				if !request.exploratory && request.attempts() < MAX_REQUEST_ATTEMPTS {
					actions.push(RequestAction::Retry(*destination));
				} else {
					if !request.exploratory {
						warn!(
							"NetDbRequests: {} not found after {} attempts",
							destination, MAX_REQUEST_ATTEMPTS
						);
					}
					failed.push(*destination);
				}
			}
		}
		for destination in failed {
			if let Some(mut request) = pending.remove(&destination) {
				request.finish(None);
			}
			actions.push(RequestAction::Fail(destination));
		}
		actions
	}

	pub fn clear(&self) {
		self.pending.lock().unwrap().clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, Ordering};

	#[test]
	fn duplicate_requests_are_rejected() {
		let requests = NetDbRequests::new();
		let dest = Hash::digest(b"dest");
		assert!(requests.create_request(&dest, false, None));
		assert!(!requests.create_request(&dest, false, None));
	}

	#[test]
	fn completion_invokes_callback_once() {
		let requests = NetDbRequests::new();
		let dest = Hash::digest(b"dest");
		let called = Arc::new(AtomicBool::new(false));
		let flag = called.clone();
		requests.create_request(
			&dest,
			false,
			Some(Box::new(move |router| {
				assert!(router.is_none());
				flag.store(true, Ordering::SeqCst);
			})),
		);
		requests.complete(&dest, None);
		assert!(called.load(Ordering::SeqCst));
		assert!(!requests.contains(&dest));
		// completing again is a no-op
		requests.complete(&dest, None);
	}

	#[test]
	fn attempts_accumulate_excluded_peers() {
		let requests = NetDbRequests::new();
		let dest = Hash::digest(b"dest");
		let from = Hash::digest(b"us");
		requests.create_request(&dest, false, None);
		for i in 0..3u8 {
			let floodfill = Hash::digest(&[i]);
			requests
				.with_request(&dest, |r| {
					r.create_request_message(&floodfill, &from, 0).unwrap()
				})
				.unwrap();
		}
		let excluded = requests.with_request(&dest, |r| r.excluded()).unwrap();
		assert_eq!(excluded.len(), 3);
	}

	#[test]
	fn exploratory_requests_never_retry() {
		let requests = NetDbRequests::new();
		let dest = Hash::digest(b"explore");
		requests.create_request(&dest, true, None);
		// nothing due yet
		assert!(requests.manage().is_empty());
	}
}
