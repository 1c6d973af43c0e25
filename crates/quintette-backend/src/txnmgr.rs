//! Transaction manager: txn id allocation, the global commit lock, and
//! ownership of the XA checker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use quintette_base::Counters;
use quintette_config::ScatterConfig;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::error::{BackendError, Result};
use crate::pool::Poolz;
use crate::scatter::Scatter;
use crate::txn::Txn;
use crate::txnz::Txnz;
use crate::xacheck::XaCheck;

pub struct TxnManager {
	txnid: AtomicU64,
	txn_nums: AtomicI64,
	// Read side: in-flight 2PC writes and read statements. Write side:
	// control-plane mutations (backend add/remove, rebalance).
	commit_lock: Arc<RwLock<()>>,
	xa_check: parking_lot::Mutex<Option<Arc<XaCheck>>>,
	txnz: Arc<Txnz>,
	counters: Arc<Counters>,
}

impl TxnManager {
	pub fn new() -> Arc<Self> {
		Arc::new(TxnManager {
			txnid: AtomicU64::new(0),
			txn_nums: AtomicI64::new(0),
			commit_lock: Arc::new(RwLock::new(())),
			xa_check: parking_lot::Mutex::new(None),
			txnz: Arc::new(Txnz::new()),
			counters: Arc::new(Counters::new("txn")),
		})
	}

	/// The live-transaction registry.
	pub fn txnz(&self) -> &Arc<Txnz> {
		&self.txnz
	}

	/// Start the XA checker for `scatter`.
	pub fn init(&self, scatter: &Arc<Scatter>, conf: &ScatterConfig) -> Result<()> {
		let checker = XaCheck::new(Arc::downgrade(scatter), conf);
		checker.init()?;
		*self.xa_check.lock() = Some(checker);
		Ok(())
	}

	/// Stop the XA checker and wait for its worker to exit.
	pub async fn close(&self) {
		let checker = self.xa_check.lock().take();
		if let Some(checker) = checker {
			checker.close().await;
		}
	}

	pub fn xa_check(&self) -> Option<Arc<XaCheck>> {
		self.xa_check.lock().clone()
	}

	pub fn counters(&self) -> &Counters {
		&self.counters
	}

	pub(crate) fn counters_arc(&self) -> Arc<Counters> {
		self.counters.clone()
	}

	/// Allocate the next transaction id.
	pub fn get_id(&self) -> u64 {
		self.txnid.fetch_add(1, Ordering::SeqCst) + 1
	}

	pub fn add(&self) {
		self.txn_nums.fetch_add(1, Ordering::SeqCst);
	}

	pub fn remove(&self) {
		self.txn_nums.fetch_add(-1, Ordering::SeqCst);
	}

	pub fn txn_nums(&self) -> i64 {
		self.txn_nums.load(Ordering::SeqCst)
	}

	/// Create a transaction over a snapshot of the backend pools.
	pub fn create_txn(self: &Arc<Self>, backends: HashMap<String, Arc<Poolz>>) -> Result<Arc<Txn>> {
		if backends.is_empty() {
			return Err(BackendError::EmptyBackends);
		}
		let txn = Txn::new(self.get_id(), self.clone(), backends);
		self.txnz.add(&txn);
		self.add();
		Ok(txn)
	}

	/// The write side of the commit lock, held by control-plane paths.
	pub async fn commit_lock(&self) -> OwnedRwLockWriteGuard<()> {
		self.commit_lock.clone().write_owned().await
	}

	/// The read side of the commit lock, held by statements.
	pub async fn commit_rlock(&self) -> OwnedRwLockReadGuard<()> {
		self.commit_lock.clone().read_owned().await
	}

	/// Non-blocking write acquisition, for drain checks.
	pub fn try_commit_lock(&self) -> Option<OwnedRwLockWriteGuard<()>> {
		self.commit_lock.clone().try_write_owned().ok()
	}
}
