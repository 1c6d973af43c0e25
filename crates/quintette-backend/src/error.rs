//! Backend error kinds, with the user-facing messages the front-end
//! relays verbatim to MySQL clients.

use thiserror::Error;

/// Errors surfaced by the backend layer.
#[derive(Error, Debug)]
pub enum BackendError {
	#[error("Server maybe lost, please try again")]
	ServerLost,

	#[error("can't get connection from the closed DB")]
	PoolClosed,

	#[error("Query execution was interrupted, timeout[{0}ms] exceeded")]
	QueryTimeout(u64),

	#[error("Query execution was interrupted, max memory usage[{0} bytes] exceeded")]
	MaxMemoryExceeded(usize),

	#[error("backend '{0}' is duplicate in scatter")]
	DuplicateBackend(String),

	#[error("address '{0}' already exists in backends")]
	DuplicateAddress(String),

	#[error("backend '{0}' can not be found in scatter")]
	UnknownBackend(String),

	#[error("transaction can not get twopc connection from backend '{0}' pool")]
	TwopcConnection(String),

	#[error("transaction can not get normal connection from backend '{0}' pool")]
	NormalConnection(String),

	#[error("transaction can not get replica connection from backend '{0}' pool")]
	ReplicaConnection(String),

	#[error("xacheck entry for xid '{0}' already exists")]
	DuplicateXid(String),

	#[error("backends is empty")]
	EmptyBackends,

	#[error("execute raw is not implemented for distributed transactions")]
	ExecuteRawUnimplemented,

	#[error("{0}")]
	Mysql(String),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Config(#[from] quintette_config::ConfigError),

	#[error("serialization error: {0}")]
	Serde(#[from] serde_json::Error),
}

impl BackendError {
	/// The MySQL error number the front-end should put on the wire.
	pub fn mysql_errno(&self) -> u16 {
		match self {
			// ER_QUERY_INTERRUPTED semantics.
			BackendError::QueryTimeout(_) | BackendError::MaxMemoryExceeded(_) => 1317,
			// CR_SERVER_LOST.
			BackendError::ServerLost | BackendError::PoolClosed => 2013,
			// Everything else maps to ER_UNKNOWN_ERROR with the message kept.
			_ => 1105,
		}
	}
}

pub type Result<T> = std::result::Result<T, BackendError>;
