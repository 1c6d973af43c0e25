//! A scripted in-process backend.
//!
//! Tests register results or errors for queries (exact or regex match,
//! optionally scoped to one backend address, optionally delayed) and the
//! fake connections serve them. `KILL <id>` is handled natively so the
//! timeout/kill path can be exercised end to end without a server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quintette_base::{Field, QueryResult, Value};
use quintette_config::BackendConfig;
use regex::Regex;
use tokio::sync::mpsc;

use crate::driver::{Dialer, DriverConn, MemCheck, StreamChunk};
use crate::error::{BackendError, Result};

enum Matcher {
	Exact(String),
	Pattern(Regex),
}

impl Matcher {
	fn matches(&self, query: &str) -> bool {
		match self {
			Matcher::Exact(q) => q == query,
			Matcher::Pattern(re) => re.is_match(query),
		}
	}
}

enum Response {
	Result(QueryResult),
	Error(String),
}

struct Handler {
	address: Option<String>,
	matcher: Matcher,
	response: Response,
	delay: Option<Duration>,
}

struct ConnState {
	killed: AtomicBool,
	notify: tokio::sync::Notify,
}

#[derive(Default)]
struct Inner {
	handlers: parking_lot::Mutex<Vec<Handler>>,
	log: parking_lot::Mutex<Vec<(String, String)>>,
	pings: AtomicUsize,
	ping_error: AtomicBool,
	dial_errors: parking_lot::Mutex<HashMap<String, bool>>,
	conns: parking_lot::Mutex<HashMap<u32, Arc<ConnState>>>,
	next_id: AtomicU32,
}

/// Handle used by tests to script and observe the fake backends.
#[derive(Clone, Default)]
pub struct FakeDb {
	inner: Arc<Inner>,
}

fn normalize(query: &str) -> String {
	query.trim().to_lowercase()
}

fn pattern(p: &str) -> Regex {
	Regex::new(&format!("(?i)^(?:{p})$")).expect("bad fakedb pattern")
}

/// Build a row-less result with an affected-rows count, as an OK packet
/// would carry.
pub fn build_affected(rows_affected: u64) -> QueryResult {
	QueryResult { rows_affected, ..QueryResult::default() }
}

/// Build a result from string literals; `"NULL"` becomes SQL NULL.
pub fn build_result(fields: &[&str], rows: &[&[&str]]) -> QueryResult {
	QueryResult {
		fields: fields.iter().map(|f| Field::new(f)).collect(),
		rows: rows
			.iter()
			.map(|row| {
				row.iter()
					.map(|cell| if *cell == "NULL" { Value::null() } else { Value::text(cell) })
					.collect()
			})
			.collect(),
		rows_affected: rows.len() as u64,
	}
}

impl FakeDb {
	pub fn new() -> Self {
		FakeDb::default()
	}

	/// Backend configs pointing at this fake, named `backend1..backendN`.
	pub fn backend_confs(&self, n: usize) -> Vec<BackendConfig> {
		(1..=n)
			.map(|i| BackendConfig {
				name: format!("backend{i}"),
				address: format!("fake:{i}"),
				user: "mock".to_string(),
				password: "mock".to_string(),
				max_connections: 128,
				..BackendConfig::default()
			})
			.collect()
	}

	pub fn dialer(&self) -> Arc<dyn Dialer> {
		Arc::new(FakeDialer { inner: self.inner.clone() })
	}

	fn push(&self, handler: Handler) {
		self.inner.handlers.lock().push(handler);
	}

	pub fn add_query(&self, query: &str, result: QueryResult) {
		self.push(Handler {
			address: None,
			matcher: Matcher::Exact(normalize(query)),
			response: Response::Result(result),
			delay: None,
		});
	}

	pub fn add_query_pattern(&self, p: &str, result: QueryResult) {
		self.push(Handler {
			address: None,
			matcher: Matcher::Pattern(pattern(p)),
			response: Response::Result(result),
			delay: None,
		});
	}

	pub fn add_query_error(&self, query: &str, message: &str) {
		self.push(Handler {
			address: None,
			matcher: Matcher::Exact(normalize(query)),
			response: Response::Error(message.to_string()),
			delay: None,
		});
	}

	pub fn add_query_error_pattern(&self, p: &str, message: &str) {
		self.push(Handler {
			address: None,
			matcher: Matcher::Pattern(pattern(p)),
			response: Response::Error(message.to_string()),
			delay: None,
		});
	}

	/// Scope an error to one backend address, for asymmetric failures.
	pub fn add_query_error_pattern_on(&self, address: &str, p: &str, message: &str) {
		self.push(Handler {
			address: Some(address.to_string()),
			matcher: Matcher::Pattern(pattern(p)),
			response: Response::Error(message.to_string()),
			delay: None,
		});
	}

	/// Scope a result to one backend address.
	pub fn add_query_pattern_on(&self, address: &str, p: &str, result: QueryResult) {
		self.push(Handler {
			address: Some(address.to_string()),
			matcher: Matcher::Pattern(pattern(p)),
			response: Response::Result(result),
			delay: None,
		});
	}

	pub fn add_query_delay(&self, query: &str, result: QueryResult, delay_ms: u64) {
		self.push(Handler {
			address: None,
			matcher: Matcher::Exact(normalize(query)),
			response: Response::Result(result),
			delay: Some(Duration::from_millis(delay_ms)),
		});
	}

	pub fn reset_all(&self) {
		self.inner.handlers.lock().clear();
		self.inner.log.lock().clear();
		self.inner.pings.store(0, Ordering::SeqCst);
		self.inner.ping_error.store(false, Ordering::SeqCst);
		self.inner.dial_errors.lock().clear();
	}

	/// Every `(address, query)` executed so far, in order.
	pub fn query_log(&self) -> Vec<(String, String)> {
		self.inner.log.lock().clone()
	}

	/// How many executed queries contain `needle` (case-insensitive).
	pub fn calls_containing(&self, needle: &str) -> usize {
		let needle = needle.to_lowercase();
		self.inner.log.lock().iter().filter(|(_, q)| q.contains(&needle)).count()
	}

	pub fn ping_calls(&self) -> usize {
		self.inner.pings.load(Ordering::SeqCst)
	}

	pub fn set_ping_error(&self, broken: bool) {
		self.inner.ping_error.store(broken, Ordering::SeqCst);
	}

	pub fn set_dial_error(&self, address: &str, broken: bool) {
		self.inner.dial_errors.lock().insert(address.to_string(), broken);
	}
}

impl Inner {
	// Address-scoped handlers beat global ones regardless of order.
	fn respond(&self, address: &str, query: &str) -> Option<(Response, Option<Duration>)> {
		let handlers = self.handlers.lock();
		let mut fallback: Option<(Response, Option<Duration>)> = None;
		for h in handlers.iter() {
			if !h.matcher.matches(query) {
				continue;
			}
			let response = match &h.response {
				Response::Result(qr) => Response::Result(qr.clone()),
				Response::Error(e) => Response::Error(e.clone()),
			};
			match &h.address {
				Some(a) if a == address => return Some((response, h.delay)),
				Some(_) => {}
				None => {
					if fallback.is_none() {
						fallback = Some((response, h.delay));
					}
				}
			}
		}
		fallback
	}
}

struct FakeDialer {
	inner: Arc<Inner>,
}

#[async_trait]
impl Dialer for FakeDialer {
	async fn dial(&self, _conf: &BackendConfig, address: &str) -> Result<Box<dyn DriverConn>> {
		if self.inner.dial_errors.lock().get(address).copied().unwrap_or(false) {
			return Err(BackendError::Mysql(format!("fakedb.dial[{address}].refused")));
		}
		let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
		let state = Arc::new(ConnState { killed: AtomicBool::new(false), notify: tokio::sync::Notify::new() });
		self.inner.conns.lock().insert(id, state.clone());
		Ok(Box::new(FakeConn {
			id,
			address: address.to_string(),
			inner: self.inner.clone(),
			state,
			closed: false,
		}))
	}
}

struct FakeConn {
	id: u32,
	address: String,
	inner: Arc<Inner>,
	state: Arc<ConnState>,
	closed: bool,
}

impl FakeConn {
	fn handle_kill(&self, query: &str) -> Option<QueryResult> {
		let rest = query.strip_prefix("kill ")?;
		let id: u32 = rest.trim().parse().ok()?;
		if let Some(state) = self.inner.conns.lock().get(&id) {
			state.killed.store(true, Ordering::SeqCst);
			state.notify.notify_one();
		}
		Some(QueryResult::new())
	}
}

#[async_trait]
impl DriverConn for FakeConn {
	fn connection_id(&self) -> u32 {
		self.id
	}

	async fn ping(&mut self) -> Result<()> {
		if self.closed {
			return Err(BackendError::ServerLost);
		}
		self.inner.pings.fetch_add(1, Ordering::SeqCst);
		self.inner.log.lock().push((self.address.clone(), "#ping".to_string()));
		if self.inner.ping_error.load(Ordering::SeqCst) {
			return Err(BackendError::Mysql("fakedb.ping.error".to_string()));
		}
		Ok(())
	}

	async fn fetch_all(&mut self, query: &str, check: MemCheck<'_>) -> Result<QueryResult> {
		if self.closed {
			return Err(BackendError::ServerLost);
		}
		let query = normalize(query);
		self.inner.log.lock().push((self.address.clone(), query.clone()));

		if let Some(qr) = self.handle_kill(&query) {
			return Ok(qr);
		}
		if self.state.killed.load(Ordering::SeqCst) {
			return Err(BackendError::Mysql("fakedb.connection.is.killed".to_string()));
		}

		let (response, delay) = self
			.inner
			.respond(&self.address, &query)
			.ok_or_else(|| BackendError::Mysql(format!("fakedb.query[{query}].not.registered")))?;

		if let Some(delay) = delay {
			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = self.state.notify.notified() => {
					return Err(BackendError::Mysql("fakedb.query.is.killed".to_string()));
				}
			}
		}

		match response {
			Response::Error(message) => Err(BackendError::Mysql(message)),
			Response::Result(qr) => {
				let mut total = 0usize;
				for row in &qr.rows {
					total += QueryResult::row_bytes(row);
					check(total)?;
				}
				Ok(qr)
			}
		}
	}

	async fn stream_fetch(&mut self, query: &str, tx: mpsc::Sender<StreamChunk>) -> Result<()> {
		if self.closed {
			return Err(BackendError::ServerLost);
		}
		let query = normalize(query);
		self.inner.log.lock().push((self.address.clone(), query.clone()));

		let (response, delay) = self
			.inner
			.respond(&self.address, &query)
			.ok_or_else(|| BackendError::Mysql(format!("fakedb.query[{query}].not.registered")))?;
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		match response {
			Response::Error(message) => Err(BackendError::Mysql(message)),
			Response::Result(qr) => {
				if tx.send(StreamChunk::Fields(qr.fields.clone())).await.is_err() {
					return Ok(());
				}
				for row in qr.rows {
					if tx.send(StreamChunk::Row(row)).await.is_err() {
						return Ok(());
					}
				}
				Ok(())
			}
		}
	}

	async fn close(&mut self) {
		self.closed = true;
		self.inner.conns.lock().remove(&self.id);
	}

	fn is_closed(&self) -> bool {
		self.closed
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn exact_and_pattern_handlers() {
		let db = FakeDb::new();
		db.add_query("select 1", build_result(&["1"], &[&["1"]]));
		db.add_query_pattern("select .* from t1.*", build_result(&["id"], &[&["7"]]));

		let mut conn = db.dialer().dial(&BackendConfig::default(), "fake:1").await.unwrap();
		let mut check = |_| Ok(());

		let qr = conn.fetch_all("SELECT 1", &mut check).await.unwrap();
		assert_eq!(qr.rows[0][0].as_str(), "1");

		let qr = conn.fetch_all("select id from t1 where id=7", &mut check).await.unwrap();
		assert_eq!(qr.rows[0][0].as_str(), "7");

		let err = conn.fetch_all("select nope", &mut check).await.unwrap_err();
		assert!(err.to_string().contains("not.registered"));
	}

	#[tokio::test]
	async fn address_scoped_handler_wins() {
		let db = FakeDb::new();
		db.add_query_pattern("xa commit .*", build_result(&[], &[]));
		db.add_query_error_pattern_on("fake:2", "xa commit .*", "commit refused");

		let mut c1 = db.dialer().dial(&BackendConfig::default(), "fake:1").await.unwrap();
		let mut c2 = db.dialer().dial(&BackendConfig::default(), "fake:2").await.unwrap();
		let mut check = |_| Ok(());

		assert!(c1.fetch_all("XA COMMIT 'x'", &mut check).await.is_ok());
		assert!(c2.fetch_all("XA COMMIT 'x'", &mut check).await.is_err());
	}

	#[tokio::test]
	async fn kill_interrupts_delayed_query() {
		let db = FakeDb::new();
		db.add_query_delay("select sleep", build_result(&["x"], &[&["1"]]), 5_000);

		let dialer = db.dialer();
		let mut victim = dialer.dial(&BackendConfig::default(), "fake:1").await.unwrap();
		let victim_id = victim.connection_id();
		let mut killer = dialer.dial(&BackendConfig::default(), "fake:1").await.unwrap();

		let handle = tokio::spawn(async move {
			let mut check = |_| Ok(());
			victim.fetch_all("select sleep", &mut check).await
		});
		tokio::time::sleep(Duration::from_millis(50)).await;
		let mut check = |_| Ok(());
		killer.fetch_all(&format!("KILL {victim_id}"), &mut check).await.unwrap();

		let err = handle.await.unwrap().unwrap_err();
		assert!(err.to_string().contains("killed"));
	}
}
