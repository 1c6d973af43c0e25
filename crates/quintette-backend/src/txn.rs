//! A single logical transaction.
//!
//! A `Txn` borrows connections from the scatter's pools and coordinates
//! XA two-phase commit across every backend a write touches. MySQL binds
//! XA state to a session, so the 2PC bucket pins exactly one connection
//! per backend for the whole transaction; START/END/PREPARE and the
//! terminal command all travel over that connection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use quintette_base::{Counters, Field, QueryResult};
use quintette_config::NORMAL_BACKEND;
use tokio::sync::{mpsc, OwnedRwLockReadGuard};

use crate::connection::Connection;
use crate::driver::StreamChunk;
use crate::error::{BackendError, Result};
use crate::pool::Poolz;
use crate::txnmgr::TxnManager;
use crate::xcontext::{QueryTuple, RequestContext, RequestMode, TxnMode};

pub const COUNTER_TXN_CREATE: &str = "#txn.create";
pub const COUNTER_TWOPC_CONNECTION_ERROR: &str = "#get.twopc.connection.error";
pub const COUNTER_NORMAL_CONNECTION_ERROR: &str = "#get.normal.connection.error";
pub const COUNTER_REPLICA_CONNECTION_ERROR: &str = "#get.replica.connection.error";
pub const COUNTER_TXN_BEGIN: &str = "#txn.begin";
pub const COUNTER_TXN_FINISH: &str = "#txn.finish";
pub const COUNTER_TXN_ABORT: &str = "#txn.abort";

// Capacity of the per-statement streaming row channel.
const STREAM_ROW_CHANNEL_CAP: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
	Live,
	Beginning,
	ExecutingTwoPC,
	ExecutingNormal,
	Rollbacking,
	Committing,
	Finishing,
	Aborting,
	Recovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaState {
	None,
	Start,
	End,
	Prepare,
	Commit,
	Rollback,
	Committed,
	RolledBack,
}

pub struct Txn {
	id: u64,
	mgr: Arc<TxnManager>,
	// Pool snapshot taken at creation; removing a backend mid-flight
	// cannot yank pools this txn already borrowed from.
	backends: HashMap<String, Arc<Poolz>>,
	xid: parking_lot::Mutex<String>,
	session_id: AtomicU32,
	start: Instant,
	// Finish and Abort are mutually exclusive: whichever wins wins.
	finish_mu: tokio::sync::Mutex<()>,
	state: parking_lot::Mutex<TxnState>,
	xa_state: parking_lot::Mutex<XaState>,
	last_txn_mode: parking_lot::Mutex<TxnMode>,
	twopc: AtomicBool,
	is_exec_on_rep: AtomicBool,
	is_multi_stmt: AtomicBool,
	timeout_ms: AtomicU64,
	max_result: AtomicUsize,
	max_join_rows: AtomicUsize,
	errors: AtomicUsize,
	twopc_connections: parking_lot::Mutex<HashMap<String, Arc<Connection>>>,
	normal_connections: parking_lot::Mutex<Vec<Arc<Connection>>>,
	replica_connections: parking_lot::Mutex<Vec<Arc<Connection>>>,
	// The read side of the global commit lock, held from Begin to
	// Finish/Abort for 2PC writes.
	commit_guard: parking_lot::Mutex<Option<OwnedRwLockReadGuard<()>>>,
	counters: Arc<Counters>,
}

impl Txn {
	pub(crate) fn new(
		id: u64,
		mgr: Arc<TxnManager>,
		backends: HashMap<String, Arc<Poolz>>,
	) -> Arc<Self> {
		let counters = mgr.counters_arc();
		counters.add(COUNTER_TXN_CREATE, 1);
		Arc::new(Txn {
			id,
			mgr,
			backends,
			xid: parking_lot::Mutex::new(String::new()),
			session_id: AtomicU32::new(0),
			start: Instant::now(),
			finish_mu: tokio::sync::Mutex::new(()),
			state: parking_lot::Mutex::new(TxnState::Live),
			xa_state: parking_lot::Mutex::new(XaState::None),
			last_txn_mode: parking_lot::Mutex::new(TxnMode::None),
			twopc: AtomicBool::new(false),
			is_exec_on_rep: AtomicBool::new(false),
			is_multi_stmt: AtomicBool::new(false),
			timeout_ms: AtomicU64::new(0),
			max_result: AtomicUsize::new(0),
			max_join_rows: AtomicUsize::new(0),
			errors: AtomicUsize::new(0),
			twopc_connections: parking_lot::Mutex::new(HashMap::new()),
			normal_connections: parking_lot::Mutex::new(Vec::new()),
			replica_connections: parking_lot::Mutex::new(Vec::new()),
			commit_guard: parking_lot::Mutex::new(None),
			counters,
		})
	}

	pub fn tx_id(&self) -> u64 {
		self.id
	}

	/// Time since the transaction was created.
	pub fn elapsed(&self) -> Duration {
		self.start.elapsed()
	}

	pub fn xid(&self) -> String {
		self.xid.lock().clone()
	}

	pub fn state(&self) -> TxnState {
		*self.state.lock()
	}

	pub fn xa_state(&self) -> XaState {
		*self.xa_state.lock()
	}

	pub(crate) fn set_state(&self, state: TxnState) {
		*self.state.lock() = state;
	}

	fn set_xa_state(&self, state: XaState) {
		*self.xa_state.lock() = state;
	}

	pub fn set_session_id(&self, id: u32) {
		self.session_id.store(id, Ordering::SeqCst);
	}

	pub fn session_id(&self) -> u32 {
		self.session_id.load(Ordering::SeqCst)
	}

	/// Route read statements to the replica pools when possible.
	pub fn set_is_exec_on_rep(&self, on_replica: bool) {
		self.is_exec_on_rep.store(on_replica, Ordering::SeqCst);
	}

	/// Per-statement deadline in milliseconds; zero disables it.
	pub fn set_timeout(&self, timeout_ms: u64) {
		self.timeout_ms.store(timeout_ms, Ordering::SeqCst);
	}

	/// Per-statement memory cap in bytes; zero disables it.
	pub fn set_max_result(&self, max: usize) {
		self.max_result.store(max, Ordering::SeqCst);
	}

	pub fn set_max_join_rows(&self, max: usize) {
		self.max_join_rows.store(max, Ordering::SeqCst);
	}

	pub fn max_join_rows(&self) -> usize {
		self.max_join_rows.load(Ordering::SeqCst)
	}

	pub fn set_multi_stmt_txn(&self) {
		self.is_multi_stmt.store(true, Ordering::SeqCst);
	}

	pub fn errors(&self) -> usize {
		self.errors.load(Ordering::SeqCst)
	}

	fn inc_errors(&self) {
		self.errors.fetch_add(1, Ordering::SeqCst);
	}

	fn normal_backends(&self) -> Vec<String> {
		let mut names: Vec<String> = self
			.backends
			.iter()
			.filter(|(_, poolz)| poolz.conf.role == NORMAL_BACKEND)
			.map(|(name, _)| name.clone())
			.collect();
		names.sort();
		names
	}

	fn single_backend(&self) -> Option<String> {
		self.normal_backends().into_iter().next()
	}

	fn involved_backends(&self, req: &RequestContext) -> Vec<String> {
		match req.mode {
			RequestMode::Single => self.single_backend().into_iter().collect(),
			RequestMode::Scatter => self.normal_backends(),
			RequestMode::Normal => {
				let names: BTreeSet<String> =
					req.querys.iter().map(|qt| qt.backend.clone()).collect();
				names.into_iter().collect()
			}
		}
	}

	async fn twopc_connection(&self, backend: &str) -> Result<Arc<Connection>> {
		if let Some(conn) = self.twopc_connections.lock().get(backend) {
			return Ok(conn.clone());
		}
		let poolz = self.backends.get(backend).ok_or_else(|| {
			self.counters.add(COUNTER_TWOPC_CONNECTION_ERROR, 1);
			BackendError::TwopcConnection(backend.to_string())
		})?;
		let conn = poolz.normal().get().await?;
		let existing = {
			let mut bucket = self.twopc_connections.lock();
			match bucket.get(backend) {
				Some(existing) => Some(existing.clone()),
				None => {
					bucket.insert(backend.to_string(), conn.clone());
					None
				}
			}
		};
		// Lost the race; keep the first connection, XA state lives there.
		if let Some(existing) = existing {
			conn.recycle().await;
			return Ok(existing);
		}
		Ok(conn)
	}

	async fn normal_connection(&self, backend: &str) -> Result<Arc<Connection>> {
		let poolz = self.backends.get(backend).ok_or_else(|| {
			self.counters.add(COUNTER_NORMAL_CONNECTION_ERROR, 1);
			BackendError::NormalConnection(backend.to_string())
		})?;
		let conn = poolz.normal().get().await?;
		self.normal_connections.lock().push(conn.clone());
		Ok(conn)
	}

	async fn replica_connection(&self, backend: &str) -> Result<Arc<Connection>> {
		let replica = self.backends.get(backend).and_then(|poolz| poolz.replica());
		let replica = match replica {
			Some(replica) => replica,
			None => {
				self.counters.add(COUNTER_REPLICA_CONNECTION_ERROR, 1);
				return Err(BackendError::ReplicaConnection(backend.to_string()));
			}
		};
		let conn = replica.get().await?;
		self.replica_connections.lock().push(conn.clone());
		Ok(conn)
	}

	/// Pick a connection for `backend`: replica first when requested
	/// (silently falling back to the primary), the pinned 2PC connection
	/// in twopc mode, a fresh normal connection otherwise.
	async fn fetch_one_connection(&self, backend: &str) -> Result<Arc<Connection>> {
		if self.is_exec_on_rep.load(Ordering::SeqCst) {
			match self.replica_connection(backend).await {
				Ok(conn) => return Ok(conn),
				Err(err) => {
					tracing::warn!(backend, error = %err, "replica unavailable, falling back to primary");
				}
			}
		}
		if self.twopc.load(Ordering::SeqCst) {
			self.twopc_connection(backend).await
		} else {
			self.normal_connection(backend).await
		}
	}

	/// Enter 2PC mode and pin this transaction under the global commit
	/// lock. No network traffic happens here; XA START is issued when the
	/// first write executes.
	pub async fn begin(&self) -> Result<()> {
		self.counters.add(COUNTER_TXN_BEGIN, 1);
		self.twopc.store(true, Ordering::SeqCst);
		self.acquire_commit_guard().await;
		Ok(())
	}

	/// Begin a multiple-statement transaction: XA START on every normal
	/// backend immediately.
	pub async fn begin_scatter(&self) -> Result<()> {
		self.counters.add(COUNTER_TXN_BEGIN, 1);
		self.twopc.store(true, Ordering::SeqCst);
		self.acquire_commit_guard().await;
		self.xa_start(&self.normal_backends()).await
	}

	async fn acquire_commit_guard(&self) {
		let guard = self.mgr.commit_rlock().await;
		*self.commit_guard.lock() = Some(guard);
	}

	/// XA END, XA PREPARE, XA COMMIT. A PREPARE failure rolls every
	/// branch back and is reported to the client; a COMMIT failure after
	/// a successful PREPARE is persisted for the XA checker and reported.
	pub async fn commit(&self) -> Result<()> {
		self.set_state(TxnState::Committing);
		match *self.last_txn_mode.lock() {
			TxnMode::Write => self.commit_phase().await,
			_ => Ok(()),
		}
	}

	/// XA END, XA PREPARE, XA ROLLBACK.
	pub async fn rollback(&self) -> Result<()> {
		self.set_state(TxnState::Rollbacking);
		match *self.last_txn_mode.lock() {
			TxnMode::Write => {
				tracing::warn!(xid = %self.xid(), "txn rollback");
				self.rollback_phase().await
			}
			_ => Ok(()),
		}
	}

	/// Rollback for a statement that failed before PREPARE: XA END then
	/// XA ROLLBACK. Skipping PREPARE keeps the aborted branch out of the
	/// binlog.
	pub async fn rollback_phase_one(&self) -> Result<()> {
		self.set_state(TxnState::Rollbacking);
		match *self.last_txn_mode.lock() {
			TxnMode::Write => {
				tracing::warn!(xid = %self.xid(), "txn rollback phase one");
				self.xa_end().await?;
				self.xa_rollback_all(false).await
			}
			_ => Ok(()),
		}
	}

	/// Commit a multiple-statement transaction.
	pub async fn commit_scatter(&self) -> Result<()> {
		self.set_state(TxnState::Committing);
		self.commit_phase().await
	}

	/// Roll back a multiple-statement transaction.
	pub async fn rollback_scatter(&self) -> Result<()> {
		self.set_state(TxnState::Rollbacking);
		tracing::warn!(xid = %self.xid(), "txn rollback scatter");
		self.rollback_phase().await
	}

	async fn commit_phase(&self) -> Result<()> {
		self.xa_end().await?;
		if let Err(err) = self.xa_prepare().await {
			// Prepared branches are rolled back; the failed branch is
			// still IDLE, where XA ROLLBACK is equally valid.
			let _ = self.xa_rollback_all(false).await;
			return Err(err);
		}
		self.xa_commit_all().await
	}

	async fn rollback_phase(&self) -> Result<()> {
		self.xa_end().await?;
		if let Err(err) = self.xa_prepare().await {
			let _ = self.xa_rollback_all(false).await;
			return Err(err);
		}
		self.xa_rollback_all(true).await
	}

	fn assign_xid(&self) {
		let mut xid = self.xid.lock();
		if xid.is_empty() {
			*xid = format!(
				"RXID-{}-{}",
				chrono::Local::now().format("%Y%m%d%H%M%S"),
				self.id
			);
		}
	}

	fn twopc_backends(&self) -> Vec<String> {
		let mut names: Vec<String> = self.twopc_connections.lock().keys().cloned().collect();
		names.sort();
		names
	}

	async fn xa_start(&self, backends: &[String]) -> Result<()> {
		self.assign_xid();
		self.set_state(TxnState::Beginning);
		self.set_xa_state(XaState::Start);
		let query = format!("XA START '{}'", self.xid());
		self.execute_xa(backends, &query).await
	}

	async fn xa_end(&self) -> Result<()> {
		self.set_xa_state(XaState::End);
		let query = format!("XA END '{}'", self.xid());
		self.execute_xa(&self.twopc_backends(), &query).await
	}

	async fn xa_prepare(&self) -> Result<()> {
		self.set_xa_state(XaState::Prepare);
		let query = format!("XA PREPARE '{}'", self.xid());
		self.execute_xa(&self.twopc_backends(), &query).await
	}

	async fn xa_commit_all(&self) -> Result<()> {
		self.set_xa_state(XaState::Commit);
		let query = format!("XA COMMIT '{}'", self.xid());
		let result = self.execute_xa_terminal(&query, "commit").await;
		self.set_xa_state(XaState::Committed);
		result
	}

	async fn xa_rollback_all(&self, log_failures: bool) -> Result<()> {
		self.set_xa_state(XaState::Rollback);
		let query = format!("XA ROLLBACK '{}'", self.xid());
		let result = if log_failures {
			self.execute_xa_terminal(&query, "rollback").await
		} else {
			self.execute_xa(&self.twopc_backends(), &query).await
		};
		self.set_xa_state(XaState::RolledBack);
		result
	}

	async fn execute_xa(&self, backends: &[String], query: &str) -> Result<()> {
		let mut conns = Vec::with_capacity(backends.len());
		for backend in backends {
			conns.push((backend.clone(), self.twopc_connection(backend).await?));
		}
		let futs = conns.into_iter().map(|(backend, conn)| {
			let query = query.to_string();
			async move {
				if let Err(err) = conn.execute(&query).await {
					tracing::error!(backend = %backend, query = %query, error = %err, "xa command failed");
					return Err(err);
				}
				Ok(())
			}
		});
		for result in join_all(futs).await {
			result?;
		}
		Ok(())
	}

	// A failed terminal command on a prepared branch must never be
	// forgotten: persist it for the checker, then surface the error.
	async fn execute_xa_terminal(&self, query: &str, terminal_state: &str) -> Result<()> {
		match self.execute_xa(&self.twopc_backends(), query).await {
			Ok(()) => Ok(()),
			Err(err) => {
				self.inc_errors();
				tracing::warn!(
					xid = %self.xid(),
					state = terminal_state,
					error = %err,
					"xa terminal command failed, recording for recovery"
				);
				if let Err(log_err) = self.write_xa_commit_err_log(terminal_state) {
					tracing::error!(xid = %self.xid(), error = %log_err, "xa retry entry write failed");
				}
				Err(err)
			}
		}
	}

	/// Record an in-doubt branch in the XA checker's persistent log.
	pub fn write_xa_commit_err_log(&self, terminal_state: &str) -> Result<()> {
		match self.mgr.xa_check() {
			Some(checker) => checker.write_xa_commit_err_log(&self.xid(), terminal_state),
			None => {
				tracing::warn!(xid = %self.xid(), "xa checker not running, retry entry dropped");
				Ok(())
			}
		}
	}

	/// Execute a request. In twopc mode a write statement first issues
	/// XA START on every involved backend; a read statement holds the
	/// commit read-lock for its duration.
	pub async fn execute(&self, req: &RequestContext) -> Result<QueryResult> {
		*self.last_txn_mode.lock() = req.txn_mode;

		let mut _read_guard = None;
		if self.twopc.load(Ordering::SeqCst) {
			match req.txn_mode {
				TxnMode::Read => {
					// Begin already pinned the read side for write txns;
					// re-acquiring could deadlock behind a queued writer.
					if self.commit_guard.lock().is_none() {
						_read_guard = Some(self.mgr.commit_rlock().await);
					}
				}
				TxnMode::Write => {
					if !self.is_multi_stmt.load(Ordering::SeqCst) {
						self.xa_start(&self.involved_backends(req)).await?;
					}
				}
				TxnMode::None => {}
			}
		}

		match self.execute_inner(req).await {
			Ok(qr) => Ok(qr),
			Err(err) => {
				self.inc_errors();
				Err(err)
			}
		}
	}

	async fn execute_inner(&self, req: &RequestContext) -> Result<QueryResult> {
		if self.twopc.load(Ordering::SeqCst) {
			self.set_state(TxnState::ExecutingTwoPC);
		} else {
			self.set_state(TxnState::ExecutingNormal);
		}
		let timeout = self.timeout_ms.load(Ordering::SeqCst);
		let max_result = self.max_result.load(Ordering::SeqCst);

		match req.mode {
			RequestMode::Single => {
				let backend = self.single_backend().ok_or(BackendError::EmptyBackends)?;
				let queries = vec![req.raw_query.clone()];
				self.one_shard(&backend, &queries, timeout, max_result).await
			}
			RequestMode::Scatter => {
				let backends = self.normal_backends();
				if backends.is_empty() {
					return Err(BackendError::EmptyBackends);
				}
				let work: Vec<(String, Vec<String>)> = backends
					.into_iter()
					.map(|backend| (backend, vec![req.raw_query.clone()]))
					.collect();
				self.fan_out(work, timeout, max_result).await
			}
			RequestMode::Normal => {
				let mut by_backend: BTreeMap<String, Vec<String>> = BTreeMap::new();
				for qt in &req.querys {
					by_backend.entry(qt.backend.clone()).or_default().push(qt.query.clone());
				}
				self.fan_out(by_backend.into_iter().collect(), timeout, max_result).await
			}
		}
	}

	async fn one_shard(
		&self,
		backend: &str,
		queries: &[String],
		timeout: u64,
		max_result: usize,
	) -> Result<QueryResult> {
		let conn = match self.fetch_one_connection(backend).await {
			Ok(conn) => conn,
			Err(err) => {
				tracing::error!(backend, error = %err, "txn failed to fetch connection");
				return Err(err);
			}
		};
		tracing::debug!(
			conn = conn.id(),
			session = self.session_id(),
			query = queries.first().map(String::as_str).unwrap_or(""),
			"txn execute"
		);
		let mut qr = QueryResult::new();
		for query in queries {
			match conn.execute_with_limits(query, timeout, max_result).await {
				Ok(inner) => qr.append(inner),
				Err(err) => {
					tracing::error!(address = conn.address(), query = %query, error = %err, "txn execute failed");
					return Err(err);
				}
			}
		}
		Ok(qr)
	}

	// Per-backend lists run sequentially; backends run in parallel. The
	// first error wins, siblings run to completion.
	async fn fan_out(
		&self,
		work: Vec<(String, Vec<String>)>,
		timeout: u64,
		max_result: usize,
	) -> Result<QueryResult> {
		if work.len() == 1 {
			let (backend, queries) = work.into_iter().next().expect("one shard");
			return self.one_shard(&backend, &queries, timeout, max_result).await;
		}

		let futs = work.into_iter().map(|(backend, queries)| async move {
			self.one_shard(&backend, &queries, timeout, max_result).await
		});

		let mut qr = QueryResult::new();
		let mut first_err = None;
		for result in join_all(futs).await {
			match result {
				Ok(part) => qr.append(part),
				Err(err) => {
					if first_err.is_none() {
						first_err = Some(err);
					}
				}
			}
		}
		match first_err {
			Some(err) => Err(err),
			None => Ok(qr),
		}
	}

	/// Execute `query` on every normal backend.
	pub async fn execute_scatter(&self, query: &str) -> Result<QueryResult> {
		let req = RequestContext {
			mode: RequestMode::Scatter,
			raw_query: query.to_string(),
			..RequestContext::new()
		};
		self.execute(&req).await
	}

	/// Execute `query` on one normal backend.
	pub async fn execute_single(&self, query: &str) -> Result<QueryResult> {
		let req = RequestContext {
			mode: RequestMode::Single,
			raw_query: query.to_string(),
			..RequestContext::new()
		};
		self.execute(&req).await
	}

	/// Send `query` to a specific backend.
	pub async fn execute_on_this_backend(&self, backend: &str, query: &str) -> Result<QueryResult> {
		let req = RequestContext {
			querys: vec![QueryTuple::new(query, backend, "")],
			..RequestContext::new()
		};
		self.execute(&req).await
	}

	pub async fn execute_raw(&self, _database: &str, _query: &str) -> Result<QueryResult> {
		Err(BackendError::ExecuteRawUnimplemented)
	}

	/// Stream the request's per-shard queries: one producer task per
	/// shard feeds a bounded row channel, the consumer batches rows by
	/// byte budget and hands them to `callback`. Dropping the receiver
	/// unblocks every producer before this returns.
	pub async fn execute_stream_fetch<F>(
		&self,
		req: &RequestContext,
		mut callback: F,
		stream_buffer_size: usize,
	) -> Result<()>
	where
		F: FnMut(&QueryResult) -> Result<()> + Send,
	{
		let (tx, mut rx) = mpsc::channel::<StreamChunk>(STREAM_ROW_CHANNEL_CAP);
		let mut handles = Vec::new();
		for qt in &req.querys {
			let conn = self.fetch_one_connection(&qt.backend).await?;
			let query = qt.query.clone();
			let tx = tx.clone();
			handles.push(tokio::spawn(async move { conn.stream_fetch(&query, tx).await }));
		}
		drop(tx);

		let mut fields: Vec<Field> = Vec::new();
		let mut sent_fields = false;
		let mut batch = QueryResult::new();
		let mut batch_bytes = 0usize;
		let mut all_rows = 0u64;
		let mut failure: Option<BackendError> = None;

		while let Some(chunk) = rx.recv().await {
			match chunk {
				StreamChunk::Fields(f) => {
					if !sent_fields {
						sent_fields = true;
						fields = f.clone();
						batch.fields = f.clone();
						let head = QueryResult { fields: f, ..QueryResult::new() };
						if let Err(err) = callback(&head) {
							failure = Some(err);
							break;
						}
					}
				}
				StreamChunk::Row(row) => {
					batch_bytes += QueryResult::row_bytes(&row);
					all_rows += 1;
					batch.rows.push(row);
					if batch_bytes >= stream_buffer_size {
						if let Err(err) = callback(&batch) {
							failure = Some(err);
							break;
						}
						batch.rows.clear();
						batch_bytes = 0;
					}
				}
			}
		}

		drop(rx);
		for handle in handles {
			match handle.await {
				Ok(Ok(())) => {}
				Ok(Err(err)) => {
					if failure.is_none() {
						failure = Some(err);
					}
				}
				Err(join_err) => {
					if failure.is_none() {
						failure = Some(BackendError::Mysql(join_err.to_string()));
					}
				}
			}
		}
		if let Some(err) = failure {
			self.inc_errors();
			return Err(err);
		}

		if !batch.rows.is_empty() {
			callback(&batch)?;
		}
		let finished = QueryResult { fields, rows_affected: all_rows, ..QueryResult::new() };
		callback(&finished)
	}

	fn drain_connections(&self) -> Vec<Arc<Connection>> {
		let mut all: Vec<Arc<Connection>> =
			self.twopc_connections.lock().drain().map(|(_, conn)| conn).collect();
		all.extend(self.normal_connections.lock().drain(..));
		all.extend(self.replica_connections.lock().drain(..));
		all
	}

	/// Release every borrowed connection: recycle on a clean transaction,
	/// close when any statement errored. A no-op after Abort.
	pub async fn finish(&self) -> Result<()> {
		self.counters.add(COUNTER_TXN_FINISH, 1);
		let _guard = self.finish_mu.lock().await;
		if self.state() == TxnState::Aborting {
			return Ok(());
		}
		self.set_xa_state(XaState::None);
		self.set_state(TxnState::Finishing);
		self.twopc.store(false, Ordering::SeqCst);
		self.is_multi_stmt.store(false, Ordering::SeqCst);

		let had_errors = self.errors() > 0;
		for conn in self.drain_connections() {
			if had_errors {
				conn.close().await;
			} else {
				conn.recycle().await;
			}
		}
		*self.commit_guard.lock() = None;
		self.mgr.txnz().remove(self.id);
		self.mgr.remove();
		Ok(())
	}

	/// Kill every borrowed connection, e.g. on session close. A no-op
	/// after Finish.
	pub async fn abort(&self) -> Result<()> {
		self.counters.add(COUNTER_TXN_ABORT, 1);
		let _guard = self.finish_mu.lock().await;
		if self.state() == TxnState::Finishing {
			return Ok(());
		}
		self.set_state(TxnState::Aborting);
		self.twopc.store(false, Ordering::SeqCst);
		self.is_multi_stmt.store(false, Ordering::SeqCst);

		for conn in self.drain_connections() {
			let _ = conn.kill("txn.abort").await;
			conn.close().await;
		}
		*self.commit_guard.lock() = None;
		self.mgr.txnz().remove(self.id);
		self.mgr.remove();
		Ok(())
	}
}
