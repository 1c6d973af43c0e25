//! Statement executors: thin wrappers binding one plan to one
//! transaction.

use quintette_backend::Txn;
use quintette_base::QueryResult;
use quintette_planner::{Plan, PlanNode};

use crate::engine::PlanEngine;
use crate::Result;

/// SELECT: walk the plan tree.
pub struct SelectExecutor<'a> {
	node: &'a PlanNode,
	txn: &'a Txn,
}

impl<'a> SelectExecutor<'a> {
	pub fn new(node: &'a PlanNode, txn: &'a Txn) -> Self {
		SelectExecutor { node, txn }
	}

	pub async fn execute(&self) -> Result<QueryResult> {
		PlanEngine::build(self.node, self.txn).execute().await
	}
}

/// UNION: same walk, the tree root is a union engine.
pub struct UnionExecutor<'a> {
	node: &'a PlanNode,
	txn: &'a Txn,
}

impl<'a> UnionExecutor<'a> {
	pub fn new(node: &'a PlanNode, txn: &'a Txn) -> Self {
		UnionExecutor { node, txn }
	}

	pub async fn execute(&self) -> Result<QueryResult> {
		PlanEngine::build(self.node, self.txn).execute().await
	}
}

macro_rules! flat_executor {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		pub struct $name<'a> {
			plan: &'a Plan,
			txn: &'a Txn,
		}

		impl<'a> $name<'a> {
			pub fn new(plan: &'a Plan, txn: &'a Txn) -> Self {
				$name { plan, txn }
			}

			pub async fn execute(&self) -> Result<QueryResult> {
				Ok(self.txn.execute(&self.plan.req).await?)
			}
		}
	};
}

flat_executor!(
	/// INSERT: run the rewritten per-segment statements.
	InsertExecutor
);
flat_executor!(
	/// UPDATE: run the rewritten per-segment statements.
	UpdateExecutor
);
flat_executor!(
	/// DELETE: run the rewritten per-segment statements.
	DeleteExecutor
);
flat_executor!(
	/// DDL: scatter or per-segment rewrite, best-effort across shards.
	DdlExecutor
);
