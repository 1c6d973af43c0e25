//! Bounded idle caches of backend connections.
//!
//! A [`Pool`] serves one address; a [`Poolz`] pairs the normal pool with
//! the optional read-replica pool of one backend. Get prefers an idle
//! connection and falls back to dialing; Put is non-blocking and closes
//! the connection when the queue is full.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use quintette_base::Counters;
use quintette_config::BackendConfig;

use crate::connection::Connection;
use crate::driver::Dialer;
use crate::error::{BackendError, Result};
use crate::queryz::Queryz;

pub(crate) const COUNTER_POOL_PING: &str = "#pool.ping";
pub(crate) const COUNTER_POOL_PING_BROKEN: &str = "#pool.ping.broken";
pub(crate) const COUNTER_POOL_HIT: &str = "#pool.hit";
pub(crate) const COUNTER_POOL_MISS: &str = "#pool.miss";
pub(crate) const COUNTER_POOL_GET: &str = "#pool.get";
pub(crate) const COUNTER_POOL_PUT: &str = "#pool.put";
pub(crate) const COUNTER_POOL_CLOSE: &str = "#pool.close";

pub(crate) const COUNTER_BACKEND_DIAL_ERROR: &str = "#backend.dial.error";
pub(crate) const COUNTER_BACKEND_EXECUTE_TIMEOUT: &str = "#backend.execute.timeout";
pub(crate) const COUNTER_BACKEND_EXECUTE_MAXRESULT: &str = "#backend.execute.maxresult";
pub(crate) const COUNTER_BACKEND_EXECUTE_ALL_ERROR: &str = "#backend.execute.all.error";
pub(crate) const COUNTER_BACKEND_KILLED: &str = "#backend.killed";

// A connection idle longer than this is replaced instead of pinged.
const MAX_IDLE_TIME_SECS: i64 = 20;

fn unix_now() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}

pub(crate) struct PoolInner {
	pub(crate) address: String,
	pub(crate) conf: BackendConfig,
	pub(crate) counters: Arc<Counters>,
	pub(crate) dialer: Arc<dyn Dialer>,
	pub(crate) queryz: Arc<Queryz>,
	// None once the pool is closed.
	connections: parking_lot::Mutex<Option<VecDeque<Arc<Connection>>>>,
	max_idle_time: AtomicI64,
}

/// A bounded idle-connection cache for one backend address.
#[derive(Clone)]
pub struct Pool {
	inner: Arc<PoolInner>,
}

impl Pool {
	pub fn new(conf: &BackendConfig, address: &str, dialer: Arc<dyn Dialer>) -> Self {
		Pool::with_queryz(conf, address, dialer, Arc::new(Queryz::new()))
	}

	/// Build over a shared in-flight query registry; the scatter passes
	/// one registry to every pool it owns.
	pub fn with_queryz(
		conf: &BackendConfig,
		address: &str,
		dialer: Arc<dyn Dialer>,
		queryz: Arc<Queryz>,
	) -> Self {
		Pool {
			inner: Arc::new(PoolInner {
				address: address.to_string(),
				conf: conf.clone(),
				counters: Arc::new(Counters::new(&format!("{}@{}", conf.name, address))),
				dialer,
				queryz,
				connections: parking_lot::Mutex::new(Some(VecDeque::with_capacity(
					conf.max_connections,
				))),
				max_idle_time: AtomicI64::new(MAX_IDLE_TIME_SECS),
			}),
		}
	}

	pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
		Pool { inner }
	}

	pub fn address(&self) -> &str {
		&self.inner.address
	}

	pub fn counters(&self) -> &Counters {
		&self.inner.counters
	}

	/// The number of idle connections right now.
	pub fn available(&self) -> usize {
		self.inner.connections.lock().as_ref().map(VecDeque::len).unwrap_or(0)
	}

	async fn reconnect(&self) -> Result<Arc<Connection>> {
		let conn = Connection::new(&self.inner);
		conn.dial().await?;
		conn.set_timestamp(unix_now());
		Ok(conn)
	}

	/// Take an idle connection, pinging it when it sat for more than a
	/// second and replacing it when it sat past the idle cutoff; dial a
	/// fresh one when the queue is empty.
	pub async fn get(&self) -> Result<Arc<Connection>> {
		let counters = &self.inner.counters;
		counters.add(COUNTER_POOL_GET, 1);

		let conn = {
			let mut guard = self.inner.connections.lock();
			match guard.as_mut() {
				None => return Err(BackendError::PoolClosed),
				Some(queue) => queue.pop_front(),
			}
		};

		match conn {
			Some(conn) => {
				let elapsed = unix_now() - conn.timestamp();
				if elapsed > 1 {
					if elapsed > self.inner.max_idle_time.load(Ordering::SeqCst) {
						conn.close().await;
						return self.reconnect().await;
					}
					if conn.ping().await.is_err() {
						counters.add(COUNTER_POOL_PING_BROKEN, 1);
						conn.close().await;
						return self.reconnect().await;
					}
					counters.add(COUNTER_POOL_PING, 1);
				}
				counters.add(COUNTER_POOL_HIT, 1);
				Ok(conn)
			}
			None => {
				counters.add(COUNTER_POOL_MISS, 1);
				self.reconnect().await
			}
		}
	}

	/// Return a connection to the idle queue; a full or closed pool
	/// closes the connection instead.
	pub async fn put(&self, conn: Arc<Connection>) {
		self.inner.counters.add(COUNTER_POOL_PUT, 1);
		conn.set_timestamp(unix_now());

		let overflow = {
			let mut guard = self.inner.connections.lock();
			match guard.as_mut() {
				None => Some(conn),
				Some(queue) => {
					if queue.len() >= self.inner.conf.max_connections {
						Some(conn)
					} else {
						queue.push_back(conn);
						None
					}
				}
			}
		};
		if let Some(conn) = overflow {
			conn.close().await;
		}
	}

	/// Drain and close every idle connection; idempotent. Subsequent
	/// gets fail and puts close the connection.
	pub async fn close(&self) {
		self.inner.counters.add(COUNTER_POOL_CLOSE, 1);
		let drained = self.inner.connections.lock().take();
		if let Some(queue) = drained {
			for conn in queue {
				conn.close().await;
			}
		}
	}

	#[cfg(test)]
	pub(crate) fn set_max_idle_time(&self, secs: i64) {
		self.inner.max_idle_time.store(secs, Ordering::SeqCst);
	}

	pub fn json(&self) -> String {
		format!(
			"{{'name': '{}@{}', 'capacity': {}, 'counters': {}}}",
			self.inner.conf.name,
			self.inner.address,
			self.inner.conf.max_connections,
			self.inner.counters
		)
	}
}

/// The normal and optional replica pool of one backend, used to spread
/// reads onto the replica when load balancing is on.
pub struct Poolz {
	pub(crate) conf: BackendConfig,
	normal: Pool,
	replica: Option<Pool>,
}

impl Poolz {
	pub fn new(conf: &BackendConfig, dialer: Arc<dyn Dialer>, queryz: Arc<Queryz>) -> Self {
		let normal = Pool::with_queryz(conf, &conf.address, dialer.clone(), queryz.clone());
		let replica = if conf.replica.is_empty() {
			None
		} else {
			Some(Pool::with_queryz(conf, &conf.replica, dialer, queryz))
		};
		Poolz { conf: conf.clone(), normal, replica }
	}

	pub fn conf(&self) -> &BackendConfig {
		&self.conf
	}

	pub fn normal(&self) -> &Pool {
		&self.normal
	}

	pub fn replica(&self) -> Option<&Pool> {
		self.replica.as_ref()
	}

	pub async fn close(&self) {
		self.normal.close().await;
		if let Some(replica) = &self.replica {
			replica.close().await;
		}
	}

	pub fn json(&self) -> String {
		match &self.replica {
			Some(replica) => format!("{}, {}", self.normal.json(), replica.json()),
			None => self.normal.json(),
		}
	}
}
