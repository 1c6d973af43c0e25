//! Persistent recovery of in-doubt XA branches.
//!
//! When a terminal XA command fails after a successful PREPARE, the
//! transaction records the xid and its intended terminal state here.
//! A ticker worker periodically runs `XA RECOVER` across the whole
//! fleet and re-issues the terminal command wherever the xid is still
//! pending. Entries whose retry budget runs out are appended to a
//! permanent incident record and dropped from the active map.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use quintette_base::file::{append_file, write_file};
use quintette_config::ScatterConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{BackendError, Result};
use crate::scatter::Scatter;
use crate::txn::TxnState;

pub const XACHECK_JSON_FILE: &str = "xacheck.json";
pub const XACHECK_TIMESOUT_JSON_FILE: &str = "xacheck_timesout.json";

pub const XA_COMMIT_ERR_STATE_COMMIT: &str = "commit";
pub const XA_COMMIT_ERR_STATE_ROLLBACK: &str = "rollback";

/// One in-doubt branch awaiting its terminal command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct XaCommitErr {
	pub time: String,
	pub xaid: String,
	/// Intended terminal state: "commit" or "rollback".
	pub state: String,
	/// Remaining retry budget.
	pub times: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct XaCommitErrs {
	#[serde(rename = "xacommit-errs", default)]
	pub logs: Vec<XaCommitErr>,
}

enum RetryOutcome {
	/// Every backend that still knew the xid accepted the terminal
	/// command.
	Resolved,
	/// The retry budget ran out; the entry went to the incident record.
	Exhausted,
	/// Try again on a later tick.
	Again,
}

pub struct XaCheck {
	dir: PathBuf,
	times: u32,
	interval: Duration,
	scatter: Weak<Scatter>,
	retrys: parking_lot::Mutex<HashMap<String, XaCommitErr>>,
	shutdown: watch::Sender<bool>,
	worker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl XaCheck {
	pub fn new(scatter: Weak<Scatter>, conf: &ScatterConfig) -> Arc<Self> {
		let (shutdown, _) = watch::channel(false);
		Arc::new(XaCheck {
			dir: PathBuf::from(&conf.xa_check_dir),
			times: conf.xa_check_retrys,
			interval: Duration::from_secs(conf.xa_check_interval.max(1)),
			scatter,
			retrys: parking_lot::Mutex::new(HashMap::new()),
			shutdown,
			worker: parking_lot::Mutex::new(None),
		})
	}

	/// Create the check directory, load pending entries and start the
	/// ticker worker. A missing log file is fine; a malformed one is
	/// fatal.
	pub fn init(self: &Arc<Self>) -> Result<()> {
		fs::create_dir_all(&self.dir)?;
		self.load_xa_commit_err_logs()?;

		let checker = self.clone();
		let mut shutdown = self.shutdown.subscribe();
		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(checker.interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			// The interval fires immediately once; skip that.
			ticker.tick().await;
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						let _ = checker.xa_commits_retry().await;
					}
					_ = shutdown.changed() => return,
				}
			}
		});
		*self.worker.lock() = Some(handle);
		tracing::info!(dir = %self.dir.display(), "xacheck init done");
		Ok(())
	}

	/// Signal the worker to exit and wait for it.
	pub async fn close(&self) {
		let _ = self.shutdown.send(true);
		let handle = self.worker.lock().take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
	}

	pub fn xacheck_file(&self) -> PathBuf {
		self.dir.join(XACHECK_JSON_FILE)
	}

	pub fn timesout_file(&self) -> PathBuf {
		self.dir.join(XACHECK_TIMESOUT_JSON_FILE)
	}

	pub fn retrys_len(&self) -> usize {
		self.retrys.lock().len()
	}

	pub fn retry_entry(&self, xid: &str) -> Option<XaCommitErr> {
		self.retrys.lock().get(xid).cloned()
	}

	/// Test/ops helper; the retry log is far too important to remove in
	/// production.
	pub fn remove_xa_commit_err_logs(&self) -> Result<()> {
		fs::remove_dir_all(&self.dir)?;
		Ok(())
	}

	fn flush_locked(&self, retrys: &HashMap<String, XaCommitErr>) -> Result<()> {
		let mut logs = XaCommitErrs::default();
		logs.logs.extend(retrys.values().cloned());
		logs.logs.sort_by(|a, b| a.xaid.cmp(&b.xaid));
		let data = serde_json::to_vec_pretty(&logs)?;
		write_file(&self.xacheck_file(), &data)?;
		Ok(())
	}

	/// Record an in-doubt branch; rejects duplicate xids and rewrites
	/// the whole log atomically.
	pub fn write_xa_commit_err_log(&self, xid: &str, state: &str) -> Result<()> {
		let entry = XaCommitErr {
			time: chrono::Local::now().format("%Y%m%d%H%M%S").to_string(),
			xaid: xid.to_string(),
			state: state.to_string(),
			times: self.times,
		};

		let mut retrys = self.retrys.lock();
		if retrys.contains_key(xid) {
			tracing::error!(xid, "duplicate xacheck entry");
			return Err(BackendError::DuplicateXid(xid.to_string()));
		}
		tracing::info!(xid, state, "xacheck entry recorded");
		retrys.insert(xid.to_string(), entry);
		self.flush_locked(&retrys)
	}

	fn load_xa_commit_err_logs(&self) -> Result<()> {
		let file = self.xacheck_file();
		// Not created eagerly: an empty log would otherwise exist on
		// every node that never saw a 2PC failure.
		if !file.exists() {
			return Ok(());
		}
		let data = fs::read_to_string(&file)?;
		let logs: XaCommitErrs = serde_json::from_str(&data)?;

		let mut retrys = self.retrys.lock();
		for entry in logs.logs {
			if retrys.contains_key(&entry.xaid) {
				return Err(BackendError::DuplicateXid(entry.xaid));
			}
			tracing::info!(xid = %entry.xaid, "xacheck entry loaded");
			retrys.insert(entry.xaid.clone(), entry);
		}
		Ok(())
	}

	/// One recovery pass over every pending entry. Also invoked by the
	/// ticker worker.
	pub async fn xa_commits_retry(&self) -> Result<()> {
		let scatter = match self.scatter.upgrade() {
			Some(scatter) => scatter,
			None => return Ok(()),
		};
		let entries: Vec<XaCommitErr> = self.retrys.lock().values().cloned().collect();
		if !entries.is_empty() {
			tracing::info!(pending = entries.len(), "xacheck retry pass");
		}

		for retry in entries {
			match self.commit_retry_backends(&retry, &scatter).await {
				Err(err) => {
					tracing::warn!(xid = %retry.xaid, error = %err, "xacheck retry pass aborted");
					return Err(err);
				}
				Ok(RetryOutcome::Resolved) | Ok(RetryOutcome::Exhausted) => {
					let mut retrys = self.retrys.lock();
					retrys.remove(&retry.xaid);
					self.flush_locked(&retrys)?;
				}
				Ok(RetryOutcome::Again) => {
					if let Some(entry) = self.retrys.lock().get_mut(&retry.xaid) {
						entry.times = entry.times.saturating_sub(1);
					}
				}
			}
		}
		Ok(())
	}

	// One entry, one attempt:
	// 1. XA RECOVER on every backend; any failure aborts this attempt,
	//    because a partially-visible cluster must not decide anything.
	// 2. The backends whose output contains the xid form the
	//    needs-terminate set; issue the terminal command to each.
	async fn commit_retry_backends(
		&self,
		retry: &XaCommitErr,
		scatter: &Arc<Scatter>,
	) -> Result<RetryOutcome> {
		let backends = scatter.all_backends();
		if backends.is_empty() {
			tracing::error!("xacheck has no backends to recover against");
			return Err(BackendError::EmptyBackends);
		}

		let txn = scatter.create_transaction()?;
		txn.set_state(TxnState::Recovering);
		let outcome = self.retry_with_txn(retry, &txn, &backends).await;
		let _ = txn.finish().await;
		outcome
	}

	async fn retry_with_txn(
		&self,
		retry: &XaCommitErr,
		txn: &Arc<crate::txn::Txn>,
		backends: &[String],
	) -> Result<RetryOutcome> {
		let terminal = format!("xa {} '{}'", retry.state, retry.xaid);

		let mut need_terminate = Vec::new();
		for backend in backends {
			let result = txn.execute_on_this_backend(backend, "xa recover").await.map_err(|err| {
				tracing::warn!(backend = %backend, error = %err, "xa recover failed");
				err
			})?;
			if result.fields.len() == 4 {
				for row in &result.rows {
					if row.len() == 4 && row[3].as_str().eq_ignore_ascii_case(&retry.xaid) {
						tracing::info!(backend = %backend, xid = %retry.xaid, "in-doubt branch found");
						need_terminate.push(backend.clone());
					}
				}
			}
		}
		if need_terminate.is_empty() {
			tracing::info!(xid = %retry.xaid, times = retry.times, "no backend needs this retry");
		}

		let mut succeeded = 0;
		for backend in &need_terminate {
			match txn.execute_on_this_backend(backend, &terminal).await {
				Ok(_) => {
					tracing::info!(backend = %backend, query = %terminal, "xa retry succeeded");
					succeeded += 1;
				}
				Err(err) => {
					tracing::warn!(backend = %backend, query = %terminal, error = %err, "xa retry failed");
				}
			}
		}
		if succeeded > 0 && succeeded == need_terminate.len() {
			return Ok(RetryOutcome::Resolved);
		}

		if retry.times == 0 {
			tracing::warn!(xid = %retry.xaid, "xa retry budget exhausted");
			let data = serde_json::to_vec(retry)?;
			append_file(&self.timesout_file(), &data)?;
			return Ok(RetryOutcome::Exhausted);
		}
		Ok(RetryOutcome::Again)
	}
}
