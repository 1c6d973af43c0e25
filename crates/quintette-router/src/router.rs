//! The routing catalog: databases, tables, persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use quintette_config::{
	read_table_config, write_config, AutoIncrement, PartitionConfig, RouterConfig, TableConfig,
};

use crate::partition::{
	GlobalPartition, HashPartition, ListPartition, Partition, Segment, ShardValue, SinglePartition,
};
use crate::{Result, RouterError};

pub const METHOD_HASH: &str = "HASH";
pub const METHOD_LIST: &str = "LIST";
pub const METHOD_GLOBAL: &str = "GLOBAL";
pub const METHOD_SINGLE: &str = "SINGLE";

const SYSTEM_DATABASES: &[&str] = &["mysql", "information_schema", "performance_schema", "sys"];

/// One routed table: its method, built segments and source config.
#[derive(Debug, Clone)]
pub struct Table {
	pub name: String,
	pub shard_key: String,
	pub shard_type: String,
	pub partition: Partition,
	pub auto_increment: Option<AutoIncrement>,
	conf: TableConfig,
}

impl Table {
	fn build(conf: TableConfig, slots: usize) -> Result<Self> {
		let partition = match conf.shard_type.as_str() {
			METHOD_HASH => Partition::Hash(HashPartition::build(&conf, slots)?),
			METHOD_LIST => Partition::List(ListPartition::build(&conf)?),
			METHOD_GLOBAL => Partition::Global(GlobalPartition::build(&conf)?),
			METHOD_SINGLE => Partition::Single(SinglePartition::build(&conf)?),
			other => return Err(RouterError::UnsupportedShardType(other.to_string())),
		};
		Ok(Table {
			name: conf.name.clone(),
			shard_key: conf.shard_key.clone(),
			shard_type: conf.shard_type.clone(),
			partition,
			auto_increment: conf.auto_increment.clone(),
			conf,
		})
	}

	pub fn config(&self) -> &TableConfig {
		&self.conf
	}
}

#[derive(Default)]
struct Schema {
	tables: HashMap<String, Table>,
}

/// The catalog mapping logical names to segments, persisted one JSON
/// file per table under `<meta>/<database>/`.
pub struct Router {
	metadir: PathBuf,
	conf: RouterConfig,
	schemas: parking_lot::RwLock<HashMap<String, Schema>>,
}

impl Router {
	pub fn new(metadir: &Path, conf: &RouterConfig) -> Self {
		Router {
			metadir: metadir.to_path_buf(),
			conf: conf.clone(),
			schemas: parking_lot::RwLock::new(HashMap::new()),
		}
	}

	pub fn slots(&self) -> usize {
		self.conf.slots
	}

	pub fn blocks(&self) -> usize {
		self.conf.blocks
	}

	/// Internal MySQL schemas can never be routed.
	pub fn database_acl(&self, db: &str) -> Result<()> {
		if SYSTEM_DATABASES.iter().any(|sys| sys.eq_ignore_ascii_case(db)) {
			return Err(RouterError::DatabaseAcl(db.to_string()));
		}
		Ok(())
	}

	pub fn create_database(&self, db: &str) -> Result<()> {
		self.database_acl(db)?;
		let mut schemas = self.schemas.write();
		if schemas.contains_key(db) {
			return Err(RouterError::DatabaseExists(db.to_string()));
		}
		std::fs::create_dir_all(self.metadir.join(db))?;
		schemas.insert(db.to_string(), Schema::default());
		quintette_base::file::update_version(&self.metadir)?;
		tracing::info!(db, "router created database");
		Ok(())
	}

	pub fn drop_database(&self, db: &str) -> Result<()> {
		self.database_acl(db)?;
		let mut schemas = self.schemas.write();
		if schemas.remove(db).is_none() {
			return Err(RouterError::DatabaseNotFound(db.to_string()));
		}
		let dir = self.metadir.join(db);
		if dir.exists() {
			std::fs::remove_dir_all(&dir)?;
		}
		quintette_base::file::update_version(&self.metadir)?;
		tracing::warn!(db, "router dropped database");
		Ok(())
	}

	pub fn databases(&self) -> Vec<String> {
		let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
		names.sort();
		names
	}

	pub fn tables(&self, db: &str) -> Result<Vec<String>> {
		let schemas = self.schemas.read();
		let schema = schemas.get(db).ok_or_else(|| RouterError::DatabaseNotFound(db.to_string()))?;
		let mut names: Vec<String> = schema.tables.keys().cloned().collect();
		names.sort();
		Ok(names)
	}

	// Insert a built table and persist its config.
	fn add_table(&self, db: &str, conf: TableConfig) -> Result<()> {
		let table = Table::build(conf, self.conf.slots)?;
		let mut schemas = self.schemas.write();
		let schema =
			schemas.get_mut(db).ok_or_else(|| RouterError::DatabaseNotFound(db.to_string()))?;
		if schema.tables.contains_key(&table.name) {
			return Err(RouterError::TableExists(db.to_string(), table.name));
		}
		write_config(&self.metadir.join(db).join(format!("{}.json", table.name)), table.config())?;
		schema.tables.insert(table.name.clone(), table);
		quintette_base::file::update_version(&self.metadir)?;
		Ok(())
	}

	/// Create a hash-sharded table: `slots/blocks` sub-tables named
	/// `<table>_NNNN`, each covering `blocks` slots, laid out round-robin
	/// across `backends`.
	pub fn create_hash_table(
		&self,
		db: &str,
		table: &str,
		shard_key: &str,
		backends: &[String],
		auto_increment: Option<AutoIncrement>,
	) -> Result<()> {
		if backends.is_empty() {
			return Err(RouterError::NoBackends);
		}
		let subs = self.conf.slots / self.conf.blocks;
		let partitions = (0..subs)
			.map(|i| PartitionConfig {
				table: format!("{table}_{i:04}"),
				segment: format!("{}-{}", i * self.conf.blocks, (i + 1) * self.conf.blocks),
				backend: backends[i % backends.len()].clone(),
				list_value: String::new(),
			})
			.collect();
		let conf = TableConfig {
			name: table.to_string(),
			slots: self.conf.slots,
			blocks: self.conf.blocks,
			shard_type: METHOD_HASH.to_string(),
			shard_key: shard_key.to_string(),
			partitions,
			auto_increment,
		};
		self.add_table(db, conf)?;
		tracing::info!(db, table, "router created hash table");
		Ok(())
	}

	/// Create a list table from explicit `(sub-table, backend, values)`
	/// partitions.
	pub fn create_list_table(
		&self,
		db: &str,
		table: &str,
		shard_key: &str,
		partitions: Vec<PartitionConfig>,
	) -> Result<()> {
		let conf = TableConfig {
			name: table.to_string(),
			shard_type: METHOD_LIST.to_string(),
			shard_key: shard_key.to_string(),
			partitions,
			..TableConfig::default()
		};
		self.add_table(db, conf)?;
		tracing::info!(db, table, "router created list table");
		Ok(())
	}

	/// Create a global table: one unsuffixed copy per backend.
	pub fn create_global_table(&self, db: &str, table: &str, backends: &[String]) -> Result<()> {
		if backends.is_empty() {
			return Err(RouterError::NoBackends);
		}
		let partitions = backends
			.iter()
			.map(|backend| PartitionConfig {
				table: table.to_string(),
				backend: backend.clone(),
				..PartitionConfig::default()
			})
			.collect();
		let conf = TableConfig {
			name: table.to_string(),
			shard_type: METHOD_GLOBAL.to_string(),
			partitions,
			..TableConfig::default()
		};
		self.add_table(db, conf)?;
		tracing::info!(db, table, "router created global table");
		Ok(())
	}

	/// Create a single table living on exactly one backend.
	pub fn create_single_table(&self, db: &str, table: &str, backend: &str) -> Result<()> {
		let conf = TableConfig {
			name: table.to_string(),
			shard_type: METHOD_SINGLE.to_string(),
			partitions: vec![PartitionConfig {
				table: table.to_string(),
				backend: backend.to_string(),
				..PartitionConfig::default()
			}],
			..TableConfig::default()
		};
		self.add_table(db, conf)?;
		tracing::info!(db, table, "router created single table");
		Ok(())
	}

	pub fn drop_table(&self, db: &str, table: &str) -> Result<()> {
		let mut schemas = self.schemas.write();
		let schema =
			schemas.get_mut(db).ok_or_else(|| RouterError::DatabaseNotFound(db.to_string()))?;
		if schema.tables.remove(table).is_none() {
			return Err(RouterError::TableNotFound(db.to_string(), table.to_string()));
		}
		let file = self.metadir.join(db).join(format!("{table}.json"));
		if file.exists() {
			std::fs::remove_file(&file)?;
		}
		quintette_base::file::update_version(&self.metadir)?;
		tracing::warn!(db, table, "router dropped table");
		Ok(())
	}

	/// Rename a table, its sub-tables included.
	pub fn rename_table(&self, db: &str, from: &str, to: &str) -> Result<()> {
		let mut schemas = self.schemas.write();
		let schema =
			schemas.get_mut(db).ok_or_else(|| RouterError::DatabaseNotFound(db.to_string()))?;
		if schema.tables.contains_key(to) {
			return Err(RouterError::TableExists(db.to_string(), to.to_string()));
		}
		let table = schema
			.tables
			.remove(from)
			.ok_or_else(|| RouterError::TableNotFound(db.to_string(), from.to_string()))?;

		let mut conf = table.conf;
		conf.name = to.to_string();
		let prefix = format!("{from}_");
		for part in &mut conf.partitions {
			if part.table == from {
				part.table = to.to_string();
			} else if let Some(suffix) = part.table.strip_prefix(&prefix) {
				part.table = format!("{to}_{suffix}");
			}
		}
		let rebuilt = Table::build(conf, self.conf.slots)?;

		let old_file = self.metadir.join(db).join(format!("{from}.json"));
		if old_file.exists() {
			std::fs::remove_file(&old_file)?;
		}
		write_config(&self.metadir.join(db).join(format!("{to}.json")), rebuilt.config())?;
		schema.tables.insert(to.to_string(), rebuilt);
		quintette_base::file::update_version(&self.metadir)?;
		tracing::info!(db, from, to, "router renamed table");
		Ok(())
	}

	pub fn table_config(&self, db: &str, table: &str) -> Result<TableConfig> {
		let schemas = self.schemas.read();
		let schema = schemas.get(db).ok_or_else(|| RouterError::DatabaseNotFound(db.to_string()))?;
		schema
			.tables
			.get(table)
			.map(|t| t.conf.clone())
			.ok_or_else(|| RouterError::TableNotFound(db.to_string(), table.to_string()))
	}

	/// The shard key column; empty for global and single tables.
	pub fn shard_key(&self, db: &str, table: &str) -> Result<String> {
		let schemas = self.schemas.read();
		let schema = schemas.get(db).ok_or_else(|| RouterError::DatabaseNotFound(db.to_string()))?;
		schema
			.tables
			.get(table)
			.map(|t| t.shard_key.clone())
			.ok_or_else(|| RouterError::TableNotFound(db.to_string(), table.to_string()))
	}

	pub fn shard_type(&self, db: &str, table: &str) -> Result<String> {
		let schemas = self.schemas.read();
		let schema = schemas.get(db).ok_or_else(|| RouterError::DatabaseNotFound(db.to_string()))?;
		schema
			.tables
			.get(table)
			.map(|t| t.shard_type.clone())
			.ok_or_else(|| RouterError::TableNotFound(db.to_string(), table.to_string()))
	}

	/// Route a key interval to segments; equal bounds prune to one
	/// segment on hash/list tables, anything else fans out.
	pub fn lookup(
		&self,
		db: &str,
		table: &str,
		start: Option<&ShardValue>,
		end: Option<&ShardValue>,
	) -> Result<Vec<Segment>> {
		let schemas = self.schemas.read();
		let schema = schemas.get(db).ok_or_else(|| RouterError::DatabaseNotFound(db.to_string()))?;
		let entry = schema
			.tables
			.get(table)
			.ok_or_else(|| RouterError::TableNotFound(db.to_string(), table.to_string()))?;
		entry.partition.lookup(start, end)
	}

	/// Point lookup convenience: exactly one segment for a concrete key.
	pub fn lookup_one(&self, db: &str, table: &str, key: &ShardValue) -> Result<Segment> {
		let mut segments = self.lookup(db, table, Some(key), Some(key))?;
		match segments.len() {
			1 => Ok(segments.remove(0)),
			_ => Err(RouterError::ShardKeyMissing(db.to_string(), table.to_string())),
		}
	}

	/// Rebuild the whole catalog from disk. Corrupt or inconsistent
	/// table configs fail the load.
	pub fn load_config(&self) -> Result<()> {
		let mut schemas = self.schemas.write();
		schemas.clear();

		if !self.metadir.exists() {
			std::fs::create_dir_all(&self.metadir)?;
			return Ok(());
		}
		for entry in std::fs::read_dir(&self.metadir)? {
			let entry = entry?;
			if !entry.file_type()?.is_dir() {
				continue;
			}
			let db = entry.file_name().to_string_lossy().into_owned();
			// The xacheck directory lives next to the schemas.
			if db == "xacheck" {
				continue;
			}
			let mut schema = Schema::default();
			for file in std::fs::read_dir(entry.path())? {
				let file = file?;
				let path = file.path();
				if path.extension().and_then(|e| e.to_str()) != Some("json") {
					continue;
				}
				let data = std::fs::read_to_string(&path)?;
				let conf = read_table_config(&data)?;
				let table = Table::build(conf, self.conf.slots)?;
				schema.tables.insert(table.name.clone(), table);
			}
			tracing::info!(db = %db, tables = schema.tables.len(), "router loaded database");
			schemas.insert(db, schema);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	fn test_router(dir: &Path) -> Router {
		Router::new(dir, &RouterConfig::default())
	}

	fn backends(n: usize) -> Vec<String> {
		(1..=n).map(|i| format!("backend{i}")).collect()
	}

	#[rstest]
	#[case("mysql")]
	#[case("information_schema")]
	#[case("PERFORMANCE_SCHEMA")]
	#[case("sys")]
	fn system_databases_are_rejected(#[case] db: &str) {
		let dir = tempfile::tempdir().unwrap();
		let router = test_router(dir.path());
		assert!(matches!(router.create_database(db), Err(RouterError::DatabaseAcl(_))));
	}

	#[test]
	fn database_lifecycle() {
		let dir = tempfile::tempdir().unwrap();
		let router = test_router(dir.path());

		router.create_database("sbtest").unwrap();
		assert!(matches!(
			router.create_database("sbtest"),
			Err(RouterError::DatabaseExists(_))
		));
		assert!(dir.path().join("sbtest").is_dir());
		assert_eq!(router.databases(), vec!["sbtest"]);

		router.drop_database("sbtest").unwrap();
		assert!(!dir.path().join("sbtest").exists());
		assert!(matches!(
			router.drop_database("sbtest"),
			Err(RouterError::DatabaseNotFound(_))
		));
	}

	#[test]
	fn hash_table_layout_is_round_robin() {
		let dir = tempfile::tempdir().unwrap();
		let router = test_router(dir.path());
		router.create_database("sbtest").unwrap();
		router.create_hash_table("sbtest", "t1", "id", &backends(3), None).unwrap();

		let conf = router.table_config("sbtest", "t1").unwrap();
		// 4096 slots / 64 blocks = 64 sub-tables.
		assert_eq!(conf.partitions.len(), 64);
		assert_eq!(conf.partitions[0].table, "t1_0000");
		assert_eq!(conf.partitions[0].segment, "0-64");
		assert_eq!(conf.partitions[0].backend, "backend1");
		assert_eq!(conf.partitions[1].backend, "backend2");
		assert_eq!(conf.partitions[2].backend, "backend3");
		assert_eq!(conf.partitions[3].backend, "backend1");
		assert_eq!(conf.partitions[63].segment, "4032-4096");
		assert_eq!(router.shard_key("sbtest", "t1").unwrap(), "id");
		assert_eq!(router.shard_type("sbtest", "t1").unwrap(), METHOD_HASH);
		assert!(dir.path().join("sbtest/t1.json").exists());
	}

	#[test]
	fn lookup_prunes_and_fans_out() {
		let dir = tempfile::tempdir().unwrap();
		let router = test_router(dir.path());
		router.create_database("sbtest").unwrap();
		router.create_hash_table("sbtest", "t1", "id", &backends(3), None).unwrap();

		// Point lookup hits exactly one segment.
		let key = ShardValue::Int(42);
		let seg = router.lookup_one("sbtest", "t1", &key).unwrap();
		// jump_hash(42, 4096) == 571; 571 / 64 == block 8; 8 % 3 -> backend3.
		assert_eq!(seg.table, "t1_0008");
		assert_eq!(seg.backend, "backend3");

		// Same key, same segment, every time.
		assert_eq!(router.lookup_one("sbtest", "t1", &key).unwrap(), seg);

		// Range lookups fan out to all 64 segments.
		let all = router.lookup("sbtest", "t1", None, None).unwrap();
		assert_eq!(all.len(), 64);

		assert!(matches!(
			router.lookup("nope", "t1", None, None),
			Err(RouterError::DatabaseNotFound(_))
		));
		assert!(matches!(
			router.lookup("sbtest", "nope", None, None),
			Err(RouterError::TableNotFound(_, _))
		));
	}

	#[test]
	fn global_and_single_tables() {
		let dir = tempfile::tempdir().unwrap();
		let router = test_router(dir.path());
		router.create_database("sbtest").unwrap();
		router.create_global_table("sbtest", "g", &backends(2)).unwrap();
		router.create_single_table("sbtest", "s", "backend1").unwrap();

		assert_eq!(router.lookup("sbtest", "g", None, None).unwrap().len(), 2);
		let segs = router.lookup("sbtest", "s", None, None).unwrap();
		assert_eq!(segs.len(), 1);
		assert_eq!(segs[0].backend, "backend1");
		// Unsuffixed physical names.
		assert_eq!(segs[0].table, "s");
		assert_eq!(router.shard_key("sbtest", "g").unwrap(), "");
	}

	#[test]
	fn rename_rewrites_sub_tables() {
		let dir = tempfile::tempdir().unwrap();
		let router = test_router(dir.path());
		router.create_database("sbtest").unwrap();
		router.create_hash_table("sbtest", "t1", "id", &backends(2), None).unwrap();

		router.rename_table("sbtest", "t1", "t2").unwrap();
		assert!(matches!(
			router.table_config("sbtest", "t1"),
			Err(RouterError::TableNotFound(_, _))
		));
		let conf = router.table_config("sbtest", "t2").unwrap();
		assert_eq!(conf.partitions[0].table, "t2_0000");
		assert!(!dir.path().join("sbtest/t1.json").exists());
		assert!(dir.path().join("sbtest/t2.json").exists());
	}

	#[test]
	fn drop_table_removes_file() {
		let dir = tempfile::tempdir().unwrap();
		let router = test_router(dir.path());
		router.create_database("sbtest").unwrap();
		router.create_hash_table("sbtest", "t1", "id", &backends(2), None).unwrap();
		router.drop_table("sbtest", "t1").unwrap();
		assert!(!dir.path().join("sbtest/t1.json").exists());
		assert!(matches!(
			router.drop_table("sbtest", "t1"),
			Err(RouterError::TableNotFound(_, _))
		));
	}

	#[test]
	fn reload_reconstructs_catalog_and_bumps_versions() {
		let dir = tempfile::tempdir().unwrap();
		{
			let router = test_router(dir.path());
			router.create_database("sbtest").unwrap();
			router.create_hash_table("sbtest", "t1", "id", &backends(3), None).unwrap();
			router.create_single_table("sbtest", "s", "backend1").unwrap();
		}
		// Three mutations, three bumps.
		assert_eq!(quintette_base::file::read_version(dir.path()), 3);

		let router = test_router(dir.path());
		router.load_config().unwrap();
		assert_eq!(router.databases(), vec!["sbtest"]);
		assert_eq!(router.tables("sbtest").unwrap(), vec!["s", "t1"]);
		let key = ShardValue::Int(42);
		assert_eq!(router.lookup_one("sbtest", "t1", &key).unwrap().table, "t1_0008");
	}

	#[test]
	fn corrupt_table_config_fails_load() {
		let dir = tempfile::tempdir().unwrap();
		{
			let router = test_router(dir.path());
			router.create_database("sbtest").unwrap();
		}
		std::fs::write(dir.path().join("sbtest/broken.json"), b"{not json").unwrap();
		let router = test_router(dir.path());
		assert!(router.load_config().is_err());
	}

	#[test]
	fn overlapping_segments_fail_load() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("sbtest")).unwrap();
		let bad = r#"{
			"name": "t1",
			"shardtype": "HASH",
			"shardkey": "id",
			"partitions": [
				{"table": "t1_0000", "segment": "0-2100", "backend": "b0"},
				{"table": "t1_0001", "segment": "2000-4096", "backend": "b1"}
			]
		}"#;
		std::fs::write(dir.path().join("sbtest/t1.json"), bad).unwrap();
		let router = test_router(dir.path());
		assert!(matches!(router.load_config(), Err(RouterError::OverlappingSegment(_))));
	}
}
