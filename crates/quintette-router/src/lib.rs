//! Shard routing: the catalog mapping `(database, table, key value)` to
//! physical segments.
//!
//! A table is partitioned by one of four methods: `HASH` (jump
//! consistent hash over a fixed slot space), `LIST` (exact value match),
//! `GLOBAL` (one copy per backend) and `SINGLE` (one backend). The
//! catalog persists as one JSON file per table under
//! `<meta>/<database>/`, with the shared catalog version bumped on every
//! mutation.

mod hash;
mod partition;
mod router;

pub use hash::{crc64, jump_hash};
pub use partition::{KeyRange, Partition, Segment, ShardValue};
pub use router::{Router, Table, METHOD_GLOBAL, METHOD_HASH, METHOD_LIST, METHOD_SINGLE};

use thiserror::Error;

/// Routing errors, classified so the front-end can map them onto the
/// right MySQL error codes.
#[derive(Error, Debug)]
pub enum RouterError {
	#[error("database '{0}' does not exist")]
	DatabaseNotFound(String),

	#[error("database '{0}' already exists")]
	DatabaseExists(String),

	#[error("access denied to system database '{0}'")]
	DatabaseAcl(String),

	#[error("table '{0}.{1}' does not exist")]
	TableNotFound(String, String),

	#[error("table '{0}.{1}' already exists")]
	TableExists(String, String),

	#[error("shard key value for table '{0}.{1}' is missing")]
	ShardKeyMissing(String, String),

	#[error("hash partition segment '{0}' is malformed")]
	MalformedSegment(String),

	#[error("hash partition segments overlap at slot {0}")]
	OverlappingSegment(usize),

	#[error("hash partition covers {0} slots, the slot space is {1}")]
	IncompleteCoverage(usize, usize),

	#[error("list partition has no segment for value '{0}'")]
	ListValueNotFound(String),

	#[error("lookup key types must be the same")]
	KeyTypeMismatch,

	#[error("unsupported shard type '{0}'")]
	UnsupportedShardType(String),

	#[error("no backends to place table segments on")]
	NoBackends,

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Config(#[from] quintette_config::ConfigError),
}

pub type Result<T> = std::result::Result<T, RouterError>;
