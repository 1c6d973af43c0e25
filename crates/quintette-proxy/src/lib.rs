//! Session glue: the layer between the wire front-end and the
//! distributed core.
//!
//! [`sessions::Sessions`] tracks every client session and the
//! transaction it is currently bound to; [`spanner::Proxy`] owns the
//! scatter, router and config and drives one statement end to end:
//! plan, create a transaction, apply per-session limits, execute,
//! finish.

pub mod sessions;
pub mod spanner;

pub use sessions::{SessionInfo, Sessions};
pub use spanner::Proxy;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
	#[error("too many connections")]
	TooManyConnections,

	#[error(transparent)]
	Backend(#[from] quintette_backend::BackendError),

	#[error(transparent)]
	Router(#[from] quintette_router::RouterError),

	#[error(transparent)]
	Planner(#[from] quintette_planner::PlannerError),

	#[error(transparent)]
	Executor(#[from] quintette_executor::ExecutorError),

	#[error(transparent)]
	Config(#[from] quintette_config::ConfigError),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
