//! One live MySQL session.
//!
//! A `Connection` is owned exclusively by either its pool's idle queue or
//! the transaction currently holding it; `Arc` is only there so a kill
//! context can reach a connection that is mid-query. Once `last_err` is
//! set the connection never returns to the idle queue.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use quintette_base::QueryResult;
use tokio::sync::{mpsc, oneshot};

use crate::driver::{DriverConn, StreamChunk};
use crate::error::{BackendError, Result};
use crate::pool::{
	PoolInner, COUNTER_BACKEND_DIAL_ERROR, COUNTER_BACKEND_EXECUTE_ALL_ERROR,
	COUNTER_BACKEND_EXECUTE_MAXRESULT, COUNTER_BACKEND_EXECUTE_TIMEOUT, COUNTER_BACKEND_KILLED,
};
use crate::Pool;

// Executed queries are truncated to this length in error logs.
const QUERY_LOG_MAX_LEN: usize = 512 * 1024;

const ERR_CLOSED: &str = "connection is closed";

pub struct Connection {
	address: String,
	driver: tokio::sync::Mutex<Option<Box<dyn DriverConn>>>,
	connection_id: AtomicU32,
	killed: Arc<AtomicBool>,
	last_err: parking_lot::Mutex<Option<String>>,
	// Recycle timestamp, unix seconds.
	timestamp: AtomicI64,
	pool: Weak<PoolInner>,
	counters: Arc<quintette_base::Counters>,
}

impl Connection {
	pub(crate) fn new(pool: &Arc<PoolInner>) -> Arc<Self> {
		Arc::new(Connection {
			address: pool.address.clone(),
			driver: tokio::sync::Mutex::new(None),
			connection_id: AtomicU32::new(0),
			killed: Arc::new(AtomicBool::new(false)),
			last_err: parking_lot::Mutex::new(None),
			timestamp: AtomicI64::new(0),
			pool: Arc::downgrade(pool),
			counters: pool.counters.clone(),
		})
	}

	/// The id the server assigned in the handshake.
	pub fn id(&self) -> u32 {
		self.connection_id.load(Ordering::SeqCst)
	}

	pub fn address(&self) -> &str {
		&self.address
	}

	pub fn set_timestamp(&self, ts: i64) {
		self.timestamp.store(ts, Ordering::SeqCst);
	}

	pub fn timestamp(&self) -> i64 {
		self.timestamp.load(Ordering::SeqCst)
	}

	pub fn last_err(&self) -> Option<String> {
		self.last_err.lock().clone()
	}

	fn set_last_err(&self, err: String) {
		*self.last_err.lock() = Some(err);
	}

	/// Establish the driver session. Any failure is surfaced to the
	/// client as a generic retryable error.
	pub async fn dial(&self) -> Result<()> {
		let pool = match self.pool.upgrade() {
			Some(pool) => pool,
			None => return Err(BackendError::PoolClosed),
		};
		match pool.dialer.dial(&pool.conf, &self.address).await {
			Ok(driver) => {
				self.connection_id.store(driver.connection_id(), Ordering::SeqCst);
				*self.driver.lock().await = Some(driver);
				Ok(())
			}
			Err(err) => {
				tracing::error!(address = %self.address, error = %err, "backend dial failed");
				self.counters.add(COUNTER_BACKEND_DIAL_ERROR, 1);
				self.close().await;
				Err(BackendError::ServerLost)
			}
		}
	}

	pub async fn ping(&self) -> Result<()> {
		let mut guard = self.driver.lock().await;
		match guard.as_mut() {
			Some(driver) => driver.ping().await,
			None => Err(BackendError::ServerLost),
		}
	}

	/// `USE <db>`, issued as a regular statement.
	pub async fn use_db(&self, db: &str) -> Result<()> {
		if !db.is_empty() {
			self.execute(&format!("use {db}")).await?;
		}
		Ok(())
	}

	/// Execute without limits.
	pub async fn execute(&self, query: &str) -> Result<QueryResult> {
		self.execute_with_limits(query, 0, 0).await
	}

	/// Execute with a deadline and a memory cap; zero disables either.
	///
	/// The deadline is enforced by a watcher task that issues a `KILL`
	/// for this connection id through a sibling pool connection; the
	/// in-flight fetch then fails and is reported as a timeout.
	pub async fn execute_with_limits(
		&self,
		query: &str,
		timeout_ms: u64,
		max_memory: usize,
	) -> Result<QueryResult> {
		let watcher = if timeout_ms > 0 { Some(self.arm_deadline(timeout_ms)) } else { None };
		let ticket = self
			.pool
			.upgrade()
			.map(|pool| (pool.queryz.clone(), pool.queryz.add(self.id(), &self.address, query)));

		let result = {
			let mut guard = self.driver.lock().await;
			match guard.as_mut() {
				Some(driver) => {
					let counters = self.counters.clone();
					let mut check = move |total: usize| {
						if max_memory > 0 && total > max_memory {
							counters.add(COUNTER_BACKEND_EXECUTE_MAXRESULT, 1);
							return Err(BackendError::MaxMemoryExceeded(max_memory));
						}
						Ok(())
					};
					driver.fetch_all(query, &mut check).await
				}
				None => Err(BackendError::ServerLost),
			}
		};

		if let Some((queryz, ticket)) = ticket {
			queryz.remove(ticket);
		}
		if let Some(watcher) = watcher {
			watcher.disarm().await;
		}

		match result {
			Ok(qr) => Ok(qr),
			Err(err) => {
				self.counters.add(COUNTER_BACKEND_EXECUTE_ALL_ERROR, 1);
				let mut end = query.len().min(QUERY_LOG_MAX_LEN);
				while !query.is_char_boundary(end) {
					end -= 1;
				}
				let logged = &query[..end];
				tracing::error!(
					address = %self.address,
					query = logged,
					error = %err,
					"backend execute failed"
				);
				self.set_last_err(err.to_string());

				if self.killed.load(Ordering::SeqCst) {
					return Err(BackendError::QueryTimeout(timeout_ms));
				}
				Err(err)
			}
		}
	}

	/// Stream `query`, pushing chunks into `tx`. The driver lock is held
	/// for the whole stream; a dropped receiver stops the producer.
	pub async fn stream_fetch(&self, query: &str, tx: mpsc::Sender<StreamChunk>) -> Result<()> {
		let mut guard = self.driver.lock().await;
		let driver = match guard.as_mut() {
			Some(driver) => driver,
			None => return Err(BackendError::ServerLost),
		};
		let result = driver.stream_fetch(query, tx).await;
		if let Err(err) = &result {
			self.set_last_err(err.to_string());
		}
		result
	}

	/// Kill whatever this connection is running, via a sibling pool
	/// connection.
	pub async fn kill(&self, reason: &str) -> Result<()> {
		self.counters.add(COUNTER_BACKEND_KILLED, 1);
		kill_by_id(&self.pool, self.id(), &self.address, reason).await
	}

	/// Return this connection to its pool; broken or errored connections
	/// are closed instead.
	pub async fn recycle(self: Arc<Self>) {
		if self.closed().await || self.last_err().is_some() {
			self.close().await;
			return;
		}
		match self.pool.upgrade() {
			Some(pool) => Pool::from_inner(pool).put(self).await,
			None => self.close().await,
		}
	}

	/// Close the driver session. Idempotent; marks the connection as
	/// never reusable.
	pub async fn close(&self) {
		self.set_last_err(ERR_CLOSED.to_string());
		if let Some(mut driver) = self.driver.lock().await.take() {
			driver.close().await;
		}
	}

	pub async fn closed(&self) -> bool {
		match self.driver.lock().await.as_ref() {
			Some(driver) => driver.is_closed(),
			None => true,
		}
	}

	fn arm_deadline(&self, timeout_ms: u64) -> DeadlineWatcher {
		let (tx, rx) = oneshot::channel::<()>();
		let killed = self.killed.clone();
		let pool = self.pool.clone();
		let counters = self.counters.clone();
		let address = self.address.clone();
		let id = self.id();

		let handle = tokio::spawn(async move {
			tokio::select! {
				_ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
					counters.add(COUNTER_BACKEND_EXECUTE_TIMEOUT, 1);
					counters.add(COUNTER_BACKEND_KILLED, 1);
					killed.store(true, Ordering::SeqCst);
					let _ = kill_by_id(&pool, id, &address, "execution timeout").await;
				}
				_ = rx => {}
			}
		});
		DeadlineWatcher { tx, handle }
	}
}

struct DeadlineWatcher {
	tx: oneshot::Sender<()>,
	handle: tokio::task::JoinHandle<()>,
}

impl DeadlineWatcher {
	// The watcher must be fully stopped before execute returns so a kill
	// can not race a recycled connection.
	async fn disarm(self) {
		let _ = self.tx.send(());
		let _ = self.handle.await;
	}
}

pub(crate) async fn kill_by_id(
	pool: &Weak<PoolInner>,
	id: u32,
	address: &str,
	reason: &str,
) -> Result<()> {
	let inner = pool.upgrade().ok_or(BackendError::PoolClosed)?;
	let killer = Pool::from_inner(inner).get().await?;
	tracing::warn!(
		address,
		conn = id,
		killer = killer.id(),
		reason,
		"killing backend connection"
	);
	let result = killer.execute(&format!("KILL {id}")).await;
	killer.recycle().await;
	match result {
		Ok(_) => Ok(()),
		Err(err) => {
			tracing::warn!(address, conn = id, error = %err, "kill failed");
			Err(err)
		}
	}
}
