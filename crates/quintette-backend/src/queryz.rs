//! Registry of in-flight backend queries, for `SHOW PROCESSLIST`-style
//! introspection. One instance per scatter, shared by all its pools.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One in-flight query.
#[derive(Debug, Clone)]
pub struct QueryDetail {
	pub conn_id: u32,
	pub address: String,
	pub query: String,
	pub start: Instant,
}

/// A snapshot row, oldest first.
#[derive(Debug, Clone)]
pub struct QueryzRow {
	pub conn_id: u32,
	pub address: String,
	pub query: String,
	pub duration: Duration,
}

#[derive(Debug, Default)]
pub struct Queryz {
	next_id: AtomicU64,
	queries: parking_lot::Mutex<BTreeMap<u64, QueryDetail>>,
}

impl Queryz {
	pub fn new() -> Self {
		Queryz::default()
	}

	/// Register a query about to hit a backend; the returned ticket is
	/// handed back to [`remove`](Queryz::remove) when it completes.
	pub fn add(&self, conn_id: u32, address: &str, query: &str) -> u64 {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
		self.queries.lock().insert(
			id,
			QueryDetail {
				conn_id,
				address: address.to_string(),
				query: query.to_string(),
				start: Instant::now(),
			},
		);
		id
	}

	pub fn remove(&self, id: u64) {
		self.queries.lock().remove(&id);
	}

	pub fn len(&self) -> usize {
		self.queries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.queries.lock().is_empty()
	}

	/// All in-flight queries, longest-running first.
	pub fn rows(&self) -> Vec<QueryzRow> {
		let now = Instant::now();
		let mut rows: Vec<(Instant, QueryzRow)> = self
			.queries
			.lock()
			.values()
			.map(|qd| {
				(
					qd.start,
					QueryzRow {
						conn_id: qd.conn_id,
						address: qd.address.clone(),
						query: qd.query.clone(),
						duration: now.saturating_duration_since(qd.start),
					},
				)
			})
			.collect();
		rows.sort_by_key(|(start, _)| *start);
		rows.into_iter().map(|(_, row)| row).collect()
	}
}
