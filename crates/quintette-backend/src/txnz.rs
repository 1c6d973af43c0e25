//! Registry of live transactions, one per transaction manager.
//!
//! The registry holds weak references; a transaction that was dropped
//! without a clean Finish simply disappears from the snapshot.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::txn::{Txn, TxnState, XaState};

/// A snapshot row, oldest transaction first.
#[derive(Debug, Clone)]
pub struct TxnzRow {
	pub txn_id: u64,
	pub session_id: u32,
	pub state: TxnState,
	pub xa_state: XaState,
	pub xid: String,
	pub duration: Duration,
}

#[derive(Debug, Default)]
pub struct Txnz {
	txns: parking_lot::Mutex<BTreeMap<u64, Weak<Txn>>>,
}

impl Txnz {
	pub fn new() -> Self {
		Txnz::default()
	}

	pub fn add(&self, txn: &Arc<Txn>) {
		self.txns.lock().insert(txn.tx_id(), Arc::downgrade(txn));
	}

	pub fn remove(&self, txn_id: u64) {
		self.txns.lock().remove(&txn_id);
	}

	pub fn len(&self) -> usize {
		self.txns.lock().len()
	}

	/// All live transactions in id order (ids are monotone, so this is
	/// also creation order).
	pub fn rows(&self) -> Vec<TxnzRow> {
		self.txns
			.lock()
			.values()
			.filter_map(Weak::upgrade)
			.map(|txn| TxnzRow {
				txn_id: txn.tx_id(),
				session_id: txn.session_id(),
				state: txn.state(),
				xa_state: txn.xa_state(),
				xid: txn.xid(),
				duration: txn.elapsed(),
			})
			.collect()
	}
}
