//! The spanner: one statement end to end.
//!
//! Owns the config, scatter, router and session registry. For each
//! statement it creates a transaction over the current pool snapshot,
//! applies the per-session limits, runs the plan through the executor
//! and finishes the transaction. Backend add/remove are the
//! control-plane paths serialized against in-flight 2PC writes by the
//! commit lock.

use std::path::PathBuf;
use std::sync::Arc;

use quintette_backend::driver::Dialer;
use quintette_backend::{Scatter, Txn};
use quintette_base::QueryResult;
use quintette_config::{BackendConfig, Config};
use quintette_executor::{
	DdlExecutor, DeleteExecutor, InsertExecutor, SelectExecutor, UnionExecutor, UpdateExecutor,
};
use quintette_planner::{
	build_ddl_plan, build_delete_plan, build_insert_plan, build_join_plan, build_select_plan,
	build_union_plan, build_update_plan, DdlStatement, DmlStatement, JoinStatement, Plan, PlanNode,
	SelectStatement, UnionStatement,
};
use quintette_router::Router;

use crate::sessions::Sessions;
use crate::Result;

pub struct Proxy {
	conf: Config,
	metadir: PathBuf,
	scatter: Arc<Scatter>,
	router: Arc<Router>,
	sessions: Arc<Sessions>,
}

impl Proxy {
	pub fn new(conf: Config) -> Self {
		let metadir = PathBuf::from(&conf.proxy.meta_dir);
		let scatter = Scatter::new(&metadir);
		Proxy::assemble(conf, metadir, scatter)
	}

	/// Build over a custom dialer; tests plug the fake backend in here.
	pub fn with_dialer(conf: Config, dialer: Arc<dyn Dialer>) -> Self {
		let metadir = PathBuf::from(&conf.proxy.meta_dir);
		let scatter = Scatter::with_dialer(&metadir, dialer);
		Proxy::assemble(conf, metadir, scatter)
	}

	fn assemble(conf: Config, metadir: PathBuf, scatter: Arc<Scatter>) -> Self {
		let router = Arc::new(Router::new(&metadir, &conf.router));
		Proxy { conf, metadir, scatter, router, sessions: Arc::new(Sessions::new()) }
	}

	/// Load the persisted catalogs and start the XA checker.
	pub async fn init(&self) -> Result<()> {
		std::fs::create_dir_all(&self.metadir)?;
		self.scatter.load_config().await?;
		self.scatter.init(&self.conf.scatter)?;
		self.router.load_config()?;
		tracing::info!(metadir = %self.metadir.display(), "proxy initialized");
		Ok(())
	}

	/// Stop accepting work, drain sessions, close every pool.
	pub async fn close(&self) {
		self.sessions.close().await;
		self.scatter.close().await;
		tracing::info!("proxy closed");
	}

	pub fn conf(&self) -> &Config {
		&self.conf
	}

	pub fn scatter(&self) -> &Arc<Scatter> {
		&self.scatter
	}

	pub fn router(&self) -> &Arc<Router> {
		&self.router
	}

	pub fn sessions(&self) -> &Arc<Sessions> {
		&self.sessions
	}

	/// Register a new client session, enforcing the connection quota.
	pub fn session_inc(&self, id: u32, user: &str, host: &str) -> Result<()> {
		if self.sessions.reaches(self.conf.proxy.max_connections) {
			return Err(crate::ProxyError::TooManyConnections);
		}
		self.sessions.add(id, user, host);
		Ok(())
	}

	/// Unregister a session, aborting anything it was running.
	pub async fn session_dec(&self, id: u32) {
		self.sessions.remove(id).await;
	}

	/// Fold identifier case when `lower-case-table-names` is on.
	pub fn fold_case(&self, name: &str) -> String {
		if self.conf.proxy.lower_case_table_names == 1 {
			name.to_lowercase()
		} else {
			name.to_string()
		}
	}

	// A statement-scoped transaction with the session limits applied.
	fn statement_txn(&self, read_only: bool, timeout_ms: u64) -> Result<Arc<Txn>> {
		let txn = self.scatter.create_transaction()?;
		txn.set_timeout(timeout_ms);
		txn.set_max_result(self.conf.proxy.max_result_size);
		txn.set_max_join_rows(self.conf.proxy.max_join_rows);
		if read_only && self.conf.proxy.load_balance == 1 {
			txn.set_is_exec_on_rep(true);
		}
		Ok(txn)
	}

	async fn finish_bound(&self, session_id: u32, txn: &Arc<Txn>) {
		if let Err(err) = txn.finish().await {
			tracing::error!(session = session_id, error = %err, "txn finish failed");
		}
		self.sessions.txn_unbinding(session_id);
	}

	/// Run a SELECT plan tree for a session.
	pub async fn execute_select(
		&self,
		session_id: u32,
		stmt: &SelectStatement,
	) -> Result<QueryResult> {
		let node = build_select_plan(&self.router, stmt)?;
		self.execute_read(session_id, &node).await
	}

	/// Run a JOIN plan tree for a session.
	pub async fn execute_join(&self, session_id: u32, stmt: &JoinStatement) -> Result<QueryResult> {
		let node = build_join_plan(&self.router, stmt)?;
		self.execute_read(session_id, &node).await
	}

	/// Run a UNION plan tree for a session.
	pub async fn execute_union(
		&self,
		session_id: u32,
		stmt: &UnionStatement,
	) -> Result<QueryResult> {
		let node = build_union_plan(&self.router, stmt)?;
		let txn = self.statement_txn(true, self.conf.proxy.query_timeout)?;
		self.sessions.txn_binding(session_id, &txn, &first_query(&node));
		let result = UnionExecutor::new(&node, &txn).execute().await;
		self.finish_bound(session_id, &txn).await;
		Ok(result?)
	}

	/// Stream a SELECT's rows to `callback` in byte-budget batches
	/// instead of buffering the whole result. Plans that are not a plain
	/// per-shard pushdown fall back to buffered execution with a single
	/// callback.
	pub async fn execute_stream_select<F>(
		&self,
		session_id: u32,
		stmt: &SelectStatement,
		mut callback: F,
	) -> Result<()>
	where
		F: FnMut(&QueryResult) -> quintette_backend::Result<()> + Send,
	{
		let node = build_select_plan(&self.router, stmt)?;
		let merge = match &node {
			PlanNode::Merge(merge) if merge.children.is_empty() => merge,
			_ => {
				let qr = self.execute_read(session_id, &node).await?;
				callback(&qr).map_err(crate::ProxyError::from)?;
				return Ok(());
			}
		};

		let req = quintette_backend::RequestContext {
			mode: merge.req_mode,
			txn_mode: quintette_backend::TxnMode::Read,
			raw_query: String::new(),
			querys: merge.querys.clone(),
		};
		let txn = self.statement_txn(true, self.conf.proxy.query_timeout)?;
		self.sessions.txn_binding(session_id, &txn, &first_query(&node));
		let result = txn
			.execute_stream_fetch(&req, callback, self.conf.proxy.stream_buffer_size)
			.await;
		self.finish_bound(session_id, &txn).await;
		Ok(result?)
	}

	async fn execute_read(&self, session_id: u32, node: &PlanNode) -> Result<QueryResult> {
		let txn = self.statement_txn(true, self.conf.proxy.query_timeout)?;
		self.sessions.txn_binding(session_id, &txn, &first_query(node));
		let result = SelectExecutor::new(node, &txn).execute().await;
		self.finish_bound(session_id, &txn).await;
		Ok(result?)
	}

	/// Run an INSERT for a session; 2PC when enabled in config.
	pub async fn execute_insert(
		&self,
		session_id: u32,
		stmt: &DmlStatement,
	) -> Result<QueryResult> {
		let plan = build_insert_plan(&self.router, stmt)?;
		self.execute_write(session_id, &plan, WriteKind::Insert).await
	}

	/// Run an UPDATE for a session; 2PC when enabled in config.
	pub async fn execute_update(
		&self,
		session_id: u32,
		stmt: &DmlStatement,
	) -> Result<QueryResult> {
		let plan = build_update_plan(&self.router, stmt)?;
		self.execute_write(session_id, &plan, WriteKind::Update).await
	}

	/// Run a DELETE for a session; 2PC when enabled in config.
	pub async fn execute_delete(
		&self,
		session_id: u32,
		stmt: &DmlStatement,
	) -> Result<QueryResult> {
		let plan = build_delete_plan(&self.router, stmt)?;
		self.execute_write(session_id, &plan, WriteKind::Delete).await
	}

	async fn execute_write(
		&self,
		session_id: u32,
		plan: &Plan,
		kind: WriteKind,
	) -> Result<QueryResult> {
		let txn = self.statement_txn(false, self.conf.proxy.query_timeout)?;
		self.sessions.txn_binding(
			session_id,
			&txn,
			plan.req.querys.first().map(|qt| qt.query.as_str()).unwrap_or(""),
		);

		let twopc = self.conf.proxy.twopc_enable;
		if twopc {
			txn.begin().await?;
		}

		let result = match kind {
			WriteKind::Insert => InsertExecutor::new(plan, &txn).execute().await,
			WriteKind::Update => UpdateExecutor::new(plan, &txn).execute().await,
			WriteKind::Delete => DeleteExecutor::new(plan, &txn).execute().await,
		};

		let outcome = match result {
			Ok(qr) => {
				if twopc {
					match txn.commit().await {
						Ok(()) => Ok(qr),
						Err(err) => Err(err.into()),
					}
				} else {
					Ok(qr)
				}
			}
			Err(err) => {
				// A failed statement never reaches PREPARE.
				if twopc {
					if let Err(rb_err) = txn.rollback_phase_one().await {
						tracing::error!(error = %rb_err, "phase-one rollback failed");
					}
				}
				Err(err.into())
			}
		};

		self.finish_bound(session_id, &txn).await;
		outcome
	}

	/// Run a DDL statement under the DDL deadline; failures after the
	/// first shard are best-effort.
	pub async fn execute_ddl(&self, session_id: u32, stmt: &DdlStatement) -> Result<QueryResult> {
		let plan = build_ddl_plan(&self.router, stmt)?;
		let txn = self.statement_txn(false, self.conf.proxy.ddl_timeout)?;
		self.sessions.txn_binding(session_id, &txn, &stmt.sql);
		let result = DdlExecutor::new(&plan, &txn).execute().await;
		self.finish_bound(session_id, &txn).await;
		Ok(result?)
	}

	/// Add a backend: serialized against in-flight 2PC writes, then
	/// persisted.
	pub async fn add_backend(&self, conf: &BackendConfig) -> Result<()> {
		let _guard = self.scatter.txn_mgr().commit_lock().await;
		self.scatter.add(conf)?;
		self.scatter.flush_config()?;
		Ok(())
	}

	/// Remove a backend: serialized against in-flight 2PC writes, then
	/// persisted.
	pub async fn remove_backend(&self, name: &str) -> Result<()> {
		let _guard = self.scatter.txn_mgr().commit_lock().await;
		self.scatter.remove(name).await?;
		self.scatter.flush_config()?;
		Ok(())
	}
}

#[derive(Clone, Copy)]
enum WriteKind {
	Insert,
	Update,
	Delete,
}

fn first_query(node: &PlanNode) -> String {
	node.get_query().first().map(|qt| qt.query.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;
	use quintette_backend::fakedb::{build_affected, build_result, FakeDb};
	use quintette_planner::{KeyFilter, SelectExpr};
	use quintette_router::ShardValue;

	fn test_conf(dir: &tempfile::TempDir, twopc: bool) -> Config {
		let mut conf = Config::default();
		conf.proxy.meta_dir = dir.path().to_string_lossy().into_owned();
		conf.proxy.twopc_enable = twopc;
		conf.scatter.xa_check_dir =
			dir.path().join("xacheck").to_string_lossy().into_owned();
		conf
	}

	async fn mock_proxy(dir: &tempfile::TempDir, twopc: bool, backends: usize) -> (FakeDb, Proxy) {
		let fakedb = FakeDb::new();
		let proxy = Proxy::with_dialer(test_conf(dir, twopc), fakedb.dialer());
		proxy.init().await.unwrap();
		for conf in fakedb.backend_confs(backends) {
			proxy.add_backend(&conf).await.unwrap();
		}
		(fakedb, proxy)
	}

	fn seed_table(proxy: &Proxy) {
		proxy.router().create_database("sbtest").unwrap();
		proxy
			.router()
			.create_hash_table(
				"sbtest",
				"t1",
				"id",
				&["backend1".to_string(), "backend2".to_string()],
				None,
			)
			.unwrap();
	}

	#[tokio::test]
	async fn select_is_planned_routed_and_merged() {
		let dir = tempfile::tempdir().unwrap();
		let (fakedb, proxy) = mock_proxy(&dir, false, 2).await;
		seed_table(&proxy);
		fakedb.add_query_pattern("select .*", build_result(&["id"], &[&["1"]]));

		proxy.session_inc(1, "root", "127.0.0.1").unwrap();
		let stmt = SelectStatement {
			exprs: vec![SelectExpr::Column("id".to_string())],
			..SelectStatement::new("sbtest", "t1")
		};
		let qr = proxy.execute_select(1, &stmt).await.unwrap();
		// Full fan-out over 64 sub-tables, one row each.
		assert_eq!(qr.rows.len(), 64);
		assert!(proxy.sessions().txn_of(1).is_none());
		proxy.close().await;
	}

	#[tokio::test]
	async fn twopc_write_goes_through_the_xa_machine() {
		let dir = tempfile::tempdir().unwrap();
		let (fakedb, proxy) = mock_proxy(&dir, true, 2).await;
		seed_table(&proxy);
		fakedb.add_query_pattern("xa .*", build_affected(0));
		fakedb.add_query_pattern("delete .*", build_affected(1));

		proxy.session_inc(1, "root", "127.0.0.1").unwrap();
		let stmt = DmlStatement {
			db: "sbtest".to_string(),
			table: "t1".to_string(),
			sql: "DELETE FROM t1".to_string(),
			key: KeyFilter::All,
		};
		let qr = proxy.execute_delete(1, &stmt).await.unwrap();
		assert_eq!(qr.rows_affected, 64);
		// Both involved backends saw the full XA protocol.
		assert_eq!(fakedb.calls_containing("xa start"), 2);
		assert_eq!(fakedb.calls_containing("xa prepare"), 2);
		assert_eq!(fakedb.calls_containing("xa commit"), 2);
		proxy.close().await;
	}

	#[tokio::test]
	async fn failed_write_rolls_back_phase_one() {
		let dir = tempfile::tempdir().unwrap();
		let (fakedb, proxy) = mock_proxy(&dir, true, 2).await;
		seed_table(&proxy);
		fakedb.add_query_pattern("xa .*", build_affected(0));
		fakedb.add_query_pattern("delete .*", build_affected(1));
		fakedb.add_query_error_pattern_on("fake:2", "delete .*", "disk full");

		proxy.session_inc(1, "root", "127.0.0.1").unwrap();
		let stmt = DmlStatement {
			db: "sbtest".to_string(),
			table: "t1".to_string(),
			sql: "DELETE FROM t1".to_string(),
			key: KeyFilter::All,
		};
		assert!(proxy.execute_delete(1, &stmt).await.is_err());
		assert_eq!(fakedb.calls_containing("xa prepare"), 0);
		assert!(fakedb.calls_containing("xa rollback") > 0);
		proxy.close().await;
	}

	#[tokio::test]
	async fn insert_routes_to_one_shard() {
		let dir = tempfile::tempdir().unwrap();
		let (fakedb, proxy) = mock_proxy(&dir, false, 2).await;
		seed_table(&proxy);
		fakedb.add_query_pattern("insert .*", build_affected(1));

		proxy.session_inc(1, "root", "127.0.0.1").unwrap();
		let stmt = DmlStatement {
			db: "sbtest".to_string(),
			table: "t1".to_string(),
			sql: "INSERT INTO t1(id) VALUES (42)".to_string(),
			key: KeyFilter::Point(ShardValue::Int(42)),
		};
		let qr = proxy.execute_insert(1, &stmt).await.unwrap();
		assert_eq!(qr.rows_affected, 1);
		// jump_hash(42) = slot 571, block 8: t1_0008.
		assert_eq!(fakedb.calls_containing("t1_0008"), 1);
		proxy.close().await;
	}

	#[tokio::test]
	async fn streaming_select_batches_rows() {
		let dir = tempfile::tempdir().unwrap();
		let (fakedb, proxy) = mock_proxy(&dir, false, 2).await;
		seed_table(&proxy);
		fakedb.add_query_pattern("select .*", build_result(&["id"], &[&["1"]]));

		proxy.session_inc(1, "root", "127.0.0.1").unwrap();
		let stmt = SelectStatement {
			exprs: vec![SelectExpr::Column("id".to_string())],
			..SelectStatement::new("sbtest", "t1")
		};
		let mut rows = 0usize;
		proxy
			.execute_stream_select(1, &stmt, |qr| {
				rows += qr.rows.len();
				Ok(())
			})
			.await
			.unwrap();
		assert_eq!(rows, 64);
		proxy.close().await;
	}

	#[tokio::test]
	async fn session_quota_is_enforced() {
		let dir = tempfile::tempdir().unwrap();
		let mut conf = test_conf(&dir, false);
		conf.proxy.max_connections = 2;
		let fakedb = FakeDb::new();
		let proxy = Proxy::with_dialer(conf, fakedb.dialer());
		proxy.init().await.unwrap();

		proxy.session_inc(1, "u", "h").unwrap();
		proxy.session_inc(2, "u", "h").unwrap();
		assert!(matches!(
			proxy.session_inc(3, "u", "h"),
			Err(crate::ProxyError::TooManyConnections)
		));
		proxy.session_dec(1).await;
		proxy.session_inc(3, "u", "h").unwrap();
		proxy.close().await;
	}

	#[tokio::test]
	async fn backend_catalog_changes_persist() {
		let dir = tempfile::tempdir().unwrap();
		let (fakedb, proxy) = mock_proxy(&dir, false, 2).await;
		assert_eq!(proxy.scatter().all_backends().len(), 2);

		proxy.remove_backend("backend2").await.unwrap();
		assert_eq!(proxy.scatter().all_backends(), vec!["backend1"]);
		proxy.close().await;

		// A fresh proxy over the same meta dir sees the final catalog.
		let proxy = Proxy::with_dialer(test_conf(&dir, false), fakedb.dialer());
		proxy.init().await.unwrap();
		assert_eq!(proxy.scatter().all_backends(), vec!["backend1"]);
		proxy.close().await;
	}

	#[tokio::test]
	async fn ddl_without_table_scatters() {
		let dir = tempfile::tempdir().unwrap();
		let (fakedb, proxy) = mock_proxy(&dir, false, 2).await;
		fakedb.add_query_pattern("create database .*", build_affected(0));

		proxy.session_inc(1, "root", "127.0.0.1").unwrap();
		let stmt = DdlStatement {
			db: "sbtest".to_string(),
			table: None,
			sql: "CREATE DATABASE sbtest".to_string(),
		};
		proxy.execute_ddl(1, &stmt).await.unwrap();
		assert_eq!(fakedb.calls_containing("create database"), 2);
		proxy.close().await;
	}

	#[tokio::test]
	async fn case_folding_follows_config() {
		let dir = tempfile::tempdir().unwrap();
		let mut conf = test_conf(&dir, false);
		conf.proxy.lower_case_table_names = 1;
		let fakedb = FakeDb::new();
		let proxy = Proxy::with_dialer(conf, fakedb.dialer());
		proxy.init().await.unwrap();
		assert_eq!(proxy.fold_case("MyTable"), "mytable");

		let conf = test_conf(&dir, false);
		let proxy = Proxy::with_dialer(conf, fakedb.dialer());
		assert_eq!(proxy.fold_case("MyTable"), "MyTable");
	}

	#[tokio::test]
	async fn sessions_snapshot_reports_transactions() {
		let dir = tempfile::tempdir().unwrap();
		let (_fakedb, proxy) = mock_proxy(&dir, false, 1).await;
		proxy.session_inc(7, "root", "127.0.0.1").unwrap();
		proxy.sessions().set_db(7, "sbtest");

		let txn = proxy.scatter().create_transaction().unwrap();
		proxy.sessions().txn_binding(7, &txn, "select 1");

		let infos = proxy.sessions().snapshot();
		assert_eq!(infos.len(), 1);
		assert_eq!(infos[0].id, 7);
		assert_eq!(infos[0].command, "Query");
		assert_eq!(infos[0].state, "In transaction");
		assert_eq!(infos[0].info, "select 1");
		assert_eq!(proxy.sessions().snapshot_txn().len(), 1);
		assert_eq!(proxy.sessions().snapshot_user("root").len(), 1);
		assert!(proxy.sessions().snapshot_user("other").is_empty());

		proxy.sessions().txn_unbinding(7);
		assert_eq!(proxy.sessions().snapshot()[0].command, "Sleep");
		txn.finish().await.unwrap();
		proxy.close().await;
	}
}
