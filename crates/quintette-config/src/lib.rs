//! Configuration model.
//!
//! Plain serde structs mirroring the JSON files the proxy persists and
//! consumes: the process config, the backend catalog (`backend.json`)
//! and the per-table routing configs (`<db>/<table>.json`). Every
//! section fills in defaults for missing keys, so a partial config file
//! is always valid.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("config io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("config parse error: {0}")]
	Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Backend roles. Attach backends hold unsharded attached data and are
/// skipped by scattered execution.
pub const NORMAL_BACKEND: i32 = 0;
pub const ATTACH_BACKEND: i32 = 1;

/// Front-side proxy tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
	#[serde(rename = "allowip")]
	pub ips: Vec<String>,
	#[serde(rename = "meta-dir")]
	pub meta_dir: String,
	pub endpoint: String,
	#[serde(rename = "twopc-enable")]
	pub twopc_enable: bool,
	/// 0 -- disable balance, 1 -- enable balance to replica.
	#[serde(rename = "load-balance")]
	pub load_balance: i32,
	/// 0 -- case sensitive, 1 -- case insensitive.
	#[serde(rename = "lower-case-table-names")]
	pub lower_case_table_names: i32,

	#[serde(rename = "max-connections")]
	pub max_connections: usize,
	#[serde(rename = "max-result-size")]
	pub max_result_size: usize,
	#[serde(rename = "max-join-rows")]
	pub max_join_rows: usize,
	/// Milliseconds.
	#[serde(rename = "ddl-timeout")]
	pub ddl_timeout: u64,
	/// Milliseconds.
	#[serde(rename = "query-timeout")]
	pub query_timeout: u64,
	#[serde(rename = "long-query-time")]
	pub long_query_time: u64,
	#[serde(rename = "stream-buffer-size")]
	pub stream_buffer_size: usize,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		ProxyConfig {
			ips: Vec::new(),
			meta_dir: "./quintette-meta".to_string(),
			endpoint: "127.0.0.1:3308".to_string(),
			twopc_enable: false,
			load_balance: 0,
			lower_case_table_names: 0,
			max_connections: 1024,
			max_result_size: 1024 * 1024 * 1024, // 1GB
			max_join_rows: 32768,
			ddl_timeout: 10 * 3600 * 1000, // 10 hours
			query_timeout: 5 * 60 * 1000,  // 5 minutes
			long_query_time: 5,
			stream_buffer_size: 1024 * 1024 * 32, // 32MB
		}
	}
}

/// One MySQL backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BackendConfig {
	pub name: String,
	pub address: String,
	#[serde(rename = "replica-address", default)]
	pub replica: String,
	pub user: String,
	pub password: String,
	#[serde(rename = "database", default)]
	pub db_name: String,
	#[serde(default)]
	pub charset: String,
	#[serde(rename = "max-connections")]
	pub max_connections: usize,
	#[serde(default)]
	pub role: i32,
}

/// The backend catalog persisted to `backend.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BackendsConfig {
	#[serde(default)]
	pub backends: Vec<BackendConfig>,
}

/// One segment of a partitioned table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PartitionConfig {
	pub table: String,
	#[serde(default)]
	pub segment: String,
	pub backend: String,
	#[serde(rename = "listvalue", default)]
	pub list_value: String,
}

/// Auto-increment column descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoIncrement {
	pub column: String,
}

/// Routing config for one logical table, persisted to `<db>/<table>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TableConfig {
	pub name: String,
	#[serde(rename = "slots-readonly", default)]
	pub slots: usize,
	#[serde(rename = "blocks-readonly", default)]
	pub blocks: usize,
	#[serde(rename = "shardtype")]
	pub shard_type: String,
	#[serde(rename = "shardkey", default)]
	pub shard_key: String,
	#[serde(default)]
	pub partitions: Vec<PartitionConfig>,
	#[serde(rename = "auto-increment", skip_serializing_if = "Option::is_none", default)]
	pub auto_increment: Option<AutoIncrement>,
}

/// All tables of one logical database.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SchemaConfig {
	#[serde(rename = "database")]
	pub db: String,
	#[serde(default)]
	pub tables: Vec<TableConfig>,
}

/// Router tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
	#[serde(rename = "slots-readonly")]
	pub slots: usize,
	#[serde(rename = "blocks-readonly")]
	pub blocks: usize,
}

impl Default for RouterConfig {
	fn default() -> Self {
		RouterConfig { slots: 4096, blocks: 64 }
	}
}

/// XA checker tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScatterConfig {
	/// Seconds between recovery passes.
	#[serde(rename = "xa-check-interval")]
	pub xa_check_interval: u64,
	#[serde(rename = "xa-check-dir")]
	pub xa_check_dir: String,
	#[serde(rename = "xa-check-retrys")]
	pub xa_check_retrys: u32,
}

impl Default for ScatterConfig {
	fn default() -> Self {
		ScatterConfig {
			xa_check_interval: 10,
			// In production this must not point into a tmp dir.
			xa_check_dir: "./xacheck".to_string(),
			xa_check_retrys: 10,
		}
	}
}

/// Log level, consumed by whoever installs the tracing subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
	pub level: String,
}

impl Default for LogConfig {
	fn default() -> Self {
		LogConfig { level: "ERROR".to_string() }
	}
}

/// The aggregate process config.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
	pub proxy: ProxyConfig,
	pub router: RouterConfig,
	pub log: LogConfig,
	pub scatter: ScatterConfig,
}

/// Load the process config from a JSON file, filling defaults for any
/// missing section or key.
pub fn load_config(path: &Path) -> Result<Config> {
	let data = std::fs::read_to_string(path)?;
	Ok(serde_json::from_str(&data)?)
}

/// Serialize `conf` and write it atomically.
pub fn write_config<T: Serialize>(path: &Path, conf: &T) -> Result<()> {
	let data = serde_json::to_vec_pretty(conf)?;
	quintette_base::file::write_file(path, &data)?;
	Ok(())
}

/// Parse a table config from raw JSON.
pub fn read_table_config(data: &str) -> Result<TableConfig> {
	Ok(serde_json::from_str(data)?)
}

/// Parse the backend catalog from raw JSON.
pub fn read_backends_config(data: &str) -> Result<BackendsConfig> {
	Ok(serde_json::from_str(data)?)
}
