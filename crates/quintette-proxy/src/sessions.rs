//! The live session registry.
//!
//! Every client connection registers here. A session carries the
//! transaction it is currently executing so that closing or killing the
//! session can abort the transaction's backend work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quintette_backend::Txn;

const SESSION_STATE_IN_TRANSACTION: &str = "In transaction";

// Bound queries are truncated for display.
const QUERY_DISPLAY_MAX: usize = 128;

fn unix_now() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}

struct SessionEntry {
	id: u32,
	user: String,
	host: String,
	db: parking_lot::Mutex<String>,
	query: parking_lot::Mutex<String>,
	txn: parking_lot::Mutex<Option<Arc<Txn>>>,
	timestamp: AtomicI64,
}

impl SessionEntry {
	// Abort whatever the session was running; the txn state guard makes
	// this a no-op for already-finished transactions.
	async fn close(&self) {
		let txn = self.txn.lock().take();
		if let Some(txn) = txn {
			let _ = txn.abort().await;
		}
	}
}

/// One row of `SHOW PROCESSLIST`-style output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
	pub id: u32,
	pub user: String,
	pub host: String,
	pub db: String,
	pub command: String,
	pub time: u32,
	pub state: String,
	pub info: String,
}

/// Registry of live sessions, keyed by session id.
#[derive(Default)]
pub struct Sessions {
	sessions: parking_lot::RwLock<HashMap<u32, Arc<SessionEntry>>>,
}

impl Sessions {
	pub fn new() -> Self {
		Sessions::default()
	}

	pub fn add(&self, id: u32, user: &str, host: &str) {
		self.sessions.write().insert(
			id,
			Arc::new(SessionEntry {
				id,
				user: user.to_string(),
				host: host.to_string(),
				db: parking_lot::Mutex::new(String::new()),
				query: parking_lot::Mutex::new(String::new()),
				txn: parking_lot::Mutex::new(None),
				timestamp: AtomicI64::new(unix_now()),
			}),
		);
	}

	/// Remove a session on client exit, aborting its transaction.
	pub async fn remove(&self, id: u32) {
		let entry = self.sessions.write().remove(&id);
		if let Some(entry) = entry {
			entry.close().await;
		}
	}

	/// Kill a live session: drop it from the registry and abort its
	/// transaction.
	pub async fn kill(&self, id: u32, reason: &str) {
		let entry = self.sessions.write().remove(&id);
		if let Some(entry) = entry {
			tracing::warn!(session = id, reason, "session killed");
			entry.close().await;
		}
	}

	/// Whether the session count reaches the configured quota.
	pub fn reaches(&self, quota: usize) -> bool {
		self.sessions.read().len() >= quota
	}

	pub fn len(&self) -> usize {
		self.sessions.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.read().is_empty()
	}

	pub fn set_db(&self, id: u32, db: &str) {
		if let Some(entry) = self.sessions.read().get(&id) {
			*entry.db.lock() = db.to_string();
		}
	}

	/// Bind the transaction running a statement to its session.
	pub fn txn_binding(&self, id: u32, txn: &Arc<Txn>, query: &str) {
		let entry = match self.sessions.read().get(&id) {
			Some(entry) => entry.clone(),
			None => return,
		};
		let display = &query[..query.len().min(QUERY_DISPLAY_MAX)];
		*entry.query.lock() = display.to_string();
		txn.set_session_id(id);
		*entry.txn.lock() = Some(txn.clone());
		entry.timestamp.store(unix_now(), Ordering::SeqCst);
	}

	/// Unbind after the statement finished.
	pub fn txn_unbinding(&self, id: u32) {
		let entry = match self.sessions.read().get(&id) {
			Some(entry) => entry.clone(),
			None => return,
		};
		entry.query.lock().clear();
		*entry.txn.lock() = None;
		entry.timestamp.store(unix_now(), Ordering::SeqCst);
	}

	/// Bind for a multiple-statement transaction; the transaction stays
	/// bound across statements until the final unbind.
	pub fn multi_stmt_txn_binding(&self, id: u32, txn: Option<&Arc<Txn>>, query: &str) {
		let entry = match self.sessions.read().get(&id) {
			Some(entry) => entry.clone(),
			None => return,
		};
		let display = &query[..query.len().min(QUERY_DISPLAY_MAX)];
		*entry.query.lock() = display.to_string();
		if let Some(txn) = txn {
			txn.set_session_id(id);
			*entry.txn.lock() = Some(txn.clone());
		}
		entry.timestamp.store(unix_now(), Ordering::SeqCst);
	}

	pub fn multi_stmt_txn_unbinding(&self, id: u32, is_end: bool) {
		let entry = match self.sessions.read().get(&id) {
			Some(entry) => entry.clone(),
			None => return,
		};
		entry.query.lock().clear();
		if is_end {
			*entry.txn.lock() = None;
		}
		entry.timestamp.store(unix_now(), Ordering::SeqCst);
	}

	pub fn txn_of(&self, id: u32) -> Option<Arc<Txn>> {
		self.sessions.read().get(&id).and_then(|entry| entry.txn.lock().clone())
	}

	fn info_of(entry: &SessionEntry, now: i64) -> SessionInfo {
		let query = entry.query.lock().clone();
		let in_txn = entry.txn.lock().is_some();
		SessionInfo {
			id: entry.id,
			user: entry.user.clone(),
			host: entry.host.clone(),
			db: entry.db.lock().clone(),
			command: if query.is_empty() { "Sleep".to_string() } else { "Query".to_string() },
			time: (now - entry.timestamp.load(Ordering::SeqCst)).max(0) as u32,
			state: if in_txn { SESSION_STATE_IN_TRANSACTION.to_string() } else { String::new() },
			info: query,
		}
	}

	/// All sessions, sorted by id.
	pub fn snapshot(&self) -> Vec<SessionInfo> {
		let now = unix_now();
		let mut infos: Vec<SessionInfo> =
			self.sessions.read().values().map(|entry| Self::info_of(entry, now)).collect();
		infos.sort_by_key(|info| info.id);
		infos
	}

	/// Sessions currently inside a transaction, sorted by id.
	pub fn snapshot_txn(&self) -> Vec<SessionInfo> {
		self.snapshot().into_iter().filter(|info| !info.state.is_empty()).collect()
	}

	/// One user's sessions, sorted by id.
	pub fn snapshot_user(&self, user: &str) -> Vec<SessionInfo> {
		self.snapshot().into_iter().filter(|info| info.user == user).collect()
	}

	/// Close every session, waiting for stragglers to drain.
	pub async fn close(&self) {
		let mut waited = 0u32;
		loop {
			let drained: Vec<Arc<SessionEntry>> = {
				let mut sessions = self.sessions.write();
				sessions.drain().map(|(_, entry)| entry).collect()
			};
			for entry in drained {
				entry.close().await;
			}
			if self.sessions.read().is_empty() {
				break;
			}
			waited += 1;
			tracing::warn!(seconds = waited, "waiting for live sessions to drain");
			tokio::time::sleep(Duration::from_secs(1)).await;
		}
	}
}
