//! Execution: walking a plan tree against a transaction.
//!
//! Leaves are merge engines (per-shard pushdown through the txn),
//! interior nodes are join or union engines; every node finishes by
//! running its child operators (aggregate merge, gather order, limit)
//! over the merged result.

pub mod engine;
pub mod executor;
pub mod operator;

pub use engine::PlanEngine;
pub use executor::{
	DdlExecutor, DeleteExecutor, InsertExecutor, SelectExecutor, UnionExecutor, UpdateExecutor,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
	#[error("unsupported: join row count exceeded the allowed limit of '{0}'")]
	JoinRowLimit(usize),

	#[error("unsupported: the used 'select' statements have a different number of columns")]
	UnionColumnsMismatch,

	#[error("unsupported: nested loop join needs a pushdown node on the right side")]
	NestLoopShape,

	#[error("unsupported: sort merge join without a join key")]
	MissingJoinKey,

	#[error(transparent)]
	Backend(#[from] quintette_backend::BackendError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
