//! Named counters for pool/transaction introspection.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// A set of monotonically increasing counters under one label, e.g.
/// `backend1@127.0.0.1:3306`. Cheap to clone a snapshot, cheap to bump.
#[derive(Debug, Default)]
pub struct Counters {
	label: String,
	inner: Mutex<BTreeMap<String, i64>>,
}

impl Counters {
	pub fn new(label: &str) -> Self {
		Counters {
			label: label.to_string(),
			inner: Mutex::new(BTreeMap::new()),
		}
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	pub fn add(&self, key: &str, delta: i64) {
		*self.inner.lock().entry(key.to_string()).or_insert(0) += delta;
	}

	pub fn get(&self, key: &str) -> i64 {
		self.inner.lock().get(key).copied().unwrap_or(0)
	}

	pub fn snapshot(&self) -> BTreeMap<String, i64> {
		self.inner.lock().clone()
	}
}

impl std::fmt::Display for Counters {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let snap = self.snapshot();
		write!(f, "{{")?;
		for (i, (k, v)) in snap.iter().enumerate() {
			if i > 0 {
				write!(f, ", ")?;
			}
			write!(f, "{}: {}", k, v)?;
		}
		write!(f, "}}")
	}
}
