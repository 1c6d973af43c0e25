//! The registry of all backends and their pools.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quintette_config::{read_backends_config, write_config, BackendConfig, BackendsConfig, ScatterConfig, NORMAL_BACKEND};

use crate::driver::{Dialer, SqlxDialer};
use crate::error::{BackendError, Result};
use crate::pool::Poolz;
use crate::queryz::Queryz;
use crate::txn::Txn;
use crate::txnmgr::TxnManager;

const BACKEND_JSON: &str = "backend.json";

pub struct Scatter {
	metadir: PathBuf,
	backends: parking_lot::RwLock<HashMap<String, Arc<Poolz>>>,
	txn_mgr: Arc<TxnManager>,
	dialer: Arc<dyn Dialer>,
	queryz: Arc<Queryz>,
}

impl Scatter {
	pub fn new(metadir: &Path) -> Arc<Self> {
		Scatter::with_dialer(metadir, Arc::new(SqlxDialer))
	}

	/// Build a scatter over a custom dialer; tests plug the fake backend
	/// in here.
	pub fn with_dialer(metadir: &Path, dialer: Arc<dyn Dialer>) -> Arc<Self> {
		Arc::new(Scatter {
			metadir: metadir.to_path_buf(),
			backends: parking_lot::RwLock::new(HashMap::new()),
			txn_mgr: TxnManager::new(),
			dialer,
			queryz: Arc::new(Queryz::new()),
		})
	}

	/// The in-flight query registry shared by every pool.
	pub fn queryz(&self) -> &Arc<Queryz> {
		&self.queryz
	}

	/// Start the XA checker.
	pub fn init(self: &Arc<Self>, conf: &ScatterConfig) -> Result<()> {
		self.txn_mgr.init(self, conf)
	}

	pub fn txn_mgr(&self) -> &Arc<TxnManager> {
		&self.txn_mgr
	}

	fn add_locked(
		&self,
		backends: &mut HashMap<String, Arc<Poolz>>,
		conf: &BackendConfig,
	) -> Result<()> {
		tracing::info!(backend = %conf.name, "scatter add");
		if backends.contains_key(&conf.name) {
			return Err(BackendError::DuplicateBackend(conf.name.clone()));
		}
		if backends.values().any(|poolz| poolz.conf.address == conf.address) {
			return Err(BackendError::DuplicateAddress(conf.address.clone()));
		}
		backends.insert(
			conf.name.clone(),
			Arc::new(Poolz::new(conf, self.dialer.clone(), self.queryz.clone())),
		);
		Ok(())
	}

	/// Register a new backend; duplicate names and duplicate physical
	/// addresses are distinct errors.
	pub fn add(&self, conf: &BackendConfig) -> Result<()> {
		let mut backends = self.backends.write();
		self.add_locked(&mut backends, conf)
	}

	/// Unregister a backend and close its pools.
	pub async fn remove(&self, name: &str) -> Result<()> {
		tracing::warn!(backend = name, "scatter remove");
		let poolz = {
			let mut backends = self.backends.write();
			backends.remove(name).ok_or_else(|| BackendError::UnknownBackend(name.to_string()))?
		};
		poolz.close().await;
		Ok(())
	}

	/// Close every pool and stop the XA checker.
	pub async fn close(&self) {
		tracing::info!("scatter preparing to close");
		let drained: Vec<Arc<Poolz>> = {
			let mut backends = self.backends.write();
			backends.drain().map(|(_, poolz)| poolz).collect()
		};
		for poolz in drained {
			poolz.close().await;
		}
		self.txn_mgr.close().await;
		tracing::info!("scatter close done");
	}

	/// All backend names, sorted.
	pub fn all_backends(&self) -> Vec<String> {
		let mut names: Vec<String> = self.backends.read().keys().cloned().collect();
		names.sort();
		names
	}

	/// Normal (non-attach) backend names, sorted.
	pub fn backends(&self) -> Vec<String> {
		let mut names: Vec<String> = self
			.backends
			.read()
			.iter()
			.filter(|(_, poolz)| poolz.conf.role == NORMAL_BACKEND)
			.map(|(name, _)| name.clone())
			.collect();
		names.sort();
		names
	}

	pub fn check_backend(&self, name: &str) -> bool {
		self.backends
			.read()
			.get(name)
			.map(|poolz| poolz.conf.role == NORMAL_BACKEND)
			.unwrap_or(false)
	}

	/// Snapshot of the pools map; transactions hold this so a concurrent
	/// remove cannot pull pools out from under them.
	pub fn poolz_clone(&self) -> HashMap<String, Arc<Poolz>> {
		self.backends.read().clone()
	}

	pub fn backend_configs_clone(&self) -> Vec<BackendConfig> {
		let mut confs: Vec<BackendConfig> =
			self.backends.read().values().map(|poolz| poolz.conf.clone()).collect();
		confs.sort_by(|a, b| a.name.cmp(&b.name));
		confs
	}

	/// Persist the backend set to `backend.json` and bump the catalog
	/// version.
	pub fn flush_config(&self) -> Result<()> {
		let file = self.metadir.join(BACKEND_JSON);
		let backends = BackendsConfig { backends: self.backend_configs_clone() };
		tracing::warn!(file = %file.display(), count = backends.backends.len(), "scatter flush config");
		write_config(&file, &backends)?;
		quintette_base::file::update_version(&self.metadir)?;
		Ok(())
	}

	/// Inverse of [`flush_config`]; the only caller is process start.
	/// A missing catalog is created empty.
	pub async fn load_config(&self) -> Result<()> {
		let drained: Vec<Arc<Poolz>> = {
			let mut backends = self.backends.write();
			backends.drain().map(|(_, poolz)| poolz).collect()
		};
		for poolz in drained {
			poolz.close().await;
		}

		let file = self.metadir.join(BACKEND_JSON);
		if !file.exists() {
			write_config(&file, &BackendsConfig::default())?;
		}
		let data = std::fs::read_to_string(&file)?;
		let conf = read_backends_config(&data)?;

		let mut backends = self.backends.write();
		for backend in &conf.backends {
			self.add_locked(&mut backends, backend)?;
			tracing::info!(backend = %backend.name, "scatter loaded backend");
		}
		Ok(())
	}

	/// Create a transaction over the current pool snapshot.
	pub fn create_transaction(&self) -> Result<Arc<Txn>> {
		self.txn_mgr.create_txn(self.poolz_clone())
	}
}
