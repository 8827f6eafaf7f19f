use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::http::Method;
use crate::proxy::DialErrorKind;

/// Short-TTL cache of recent dial failures, so a burst of identical failing
/// requests answers without re-resolving and re-dialing each time.
pub struct ErrorCache {
	ttl: Duration,
	entries: Mutex<LruCache<Key, Entry>>,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct Key {
	method: Method,
	host: String,
	path: String,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
	kind: DialErrorKind,
	inserted_at: Instant,
}

impl ErrorCache {
	pub fn new(capacity: usize, ttl: Duration) -> ErrorCache {
		ErrorCache {
			ttl,
			entries: Mutex::new(LruCache::new(
				NonZeroUsize::new(capacity.max(1)).expect("capacity is nonzero"),
			)),
		}
	}

	pub fn get(&self, method: &Method, host: &str, path: &str) -> Option<DialErrorKind> {
		let key = Key {
			method: method.clone(),
			host: host.to_string(),
			path: path.to_string(),
		};
		let mut entries = self.entries.lock();
		match entries.get(&key) {
			Some(entry) if entry.inserted_at.elapsed() <= self.ttl => Some(entry.kind),
			Some(_) => {
				entries.pop(&key);
				None
			},
			None => None,
		}
	}

	pub fn put(&self, method: &Method, host: &str, path: &str, kind: DialErrorKind) {
		let key = Key {
			method: method.clone(),
			host: host.to_string(),
			path: path.to_string(),
		};
		self.entries.lock().put(
			key,
			Entry {
				kind,
				inserted_at: Instant::now(),
			},
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn caches_until_ttl() {
		let cache = ErrorCache::new(8, Duration::from_secs(60));
		assert!(cache.get(&Method::GET, "down.example", "/").is_none());
		cache.put(&Method::GET, "down.example", "/", DialErrorKind::Refused);
		assert!(matches!(
			cache.get(&Method::GET, "down.example", "/"),
			Some(DialErrorKind::Refused)
		));
		// Distinct method or path is a different key.
		assert!(cache.get(&Method::POST, "down.example", "/").is_none());
		assert!(cache.get(&Method::GET, "down.example", "/x").is_none());
	}

	#[test]
	fn expired_entries_are_dropped() {
		let cache = ErrorCache::new(8, Duration::from_millis(0));
		cache.put(&Method::GET, "down.example", "/", DialErrorKind::Dns);
		std::thread::sleep(Duration::from_millis(5));
		assert!(cache.get(&Method::GET, "down.example", "/").is_none());
	}

	#[test]
	fn capacity_is_bounded() {
		let cache = ErrorCache::new(2, Duration::from_secs(60));
		cache.put(&Method::GET, "a", "/", DialErrorKind::Dns);
		cache.put(&Method::GET, "b", "/", DialErrorKind::Dns);
		cache.put(&Method::GET, "c", "/", DialErrorKind::Dns);
		assert!(cache.get(&Method::GET, "a", "/").is_none());
		assert!(cache.get(&Method::GET, "c", "/").is_some());
	}
}
