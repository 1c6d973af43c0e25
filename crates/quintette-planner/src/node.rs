//! The plan tree.
//!
//! Closed sums: a [`PlanNode`] is a single-backend pushdown (`Merge`), a
//! two-sided join, or a union; a [`ChildPlan`] decorates a node's merged
//! result with aggregation, ordering or a limit. The executor dispatches
//! on the tags; nothing here is extensible from outside.

use std::collections::HashMap;

use quintette_backend::xcontext::{QueryTuple, RequestMode};

#[derive(Debug, Clone)]
pub enum PlanNode {
	Merge(MergeNode),
	Join(Box<JoinNode>),
	Union(Box<UnionNode>),
}

impl PlanNode {
	pub fn children(&self) -> &[ChildPlan] {
		match self {
			PlanNode::Merge(node) => &node.children,
			PlanNode::Join(node) => &node.children,
			PlanNode::Union(node) => &node.children,
		}
	}

	/// Every leaf query in the tree, for explain output.
	pub fn get_query(&self) -> Vec<QueryTuple> {
		match self {
			PlanNode::Merge(node) => node.querys.clone(),
			PlanNode::Join(node) => {
				let mut querys = node.left.get_query();
				querys.extend(node.right.get_query());
				querys
			}
			PlanNode::Union(node) => {
				let mut querys = node.left.get_query();
				querys.extend(node.right.get_query());
				querys
			}
		}
	}

	pub fn json(&self) -> String {
		let querys: Vec<serde_json::Value> = self
			.get_query()
			.into_iter()
			.map(|qt| {
				serde_json::json!({
					"Query": qt.query,
					"Backend": qt.backend,
					"Range": qt.range,
				})
			})
			.collect();
		serde_json::to_string_pretty(&serde_json::json!({ "Partitions": querys }))
			.unwrap_or_default()
	}
}

/// Per-shard pushdown of one SELECT.
#[derive(Debug, Clone)]
pub struct MergeNode {
	pub req_mode: RequestMode,
	pub querys: Vec<QueryTuple>,
	pub children: Vec<ChildPlan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStrategy {
	/// Both children stream sorted on the join key.
	SortMerge,
	/// No key: bounded nested loop.
	Cartesian,
	/// Right side depends on the left row's values.
	NestLoop,
}

#[derive(Debug, Clone)]
pub struct JoinNode {
	pub left: PlanNode,
	pub right: PlanNode,
	pub strategy: JoinStrategy,
	/// Signed projection indices: `i < 0` takes `left[-i-1]`, `i > 0`
	/// takes `right[i-1]`.
	pub cols: Vec<i32>,
	/// Join key ordinals `(left, right)` for SortMerge.
	pub join_on: Option<(usize, usize)>,
	/// NestLoop bindings: `:name` placeholders in the right side's SQL
	/// mapped to left column ordinals.
	pub vars: HashMap<String, usize>,
	/// Left columns that must evaluate truthy for the row to join.
	pub left_tmp_cols: Vec<usize>,
	/// Right columns that must be NULL for the row to survive
	/// (anti-join filters under LEFT JOIN).
	pub right_tmp_cols: Vec<usize>,
	pub is_left_join: bool,
	pub children: Vec<ChildPlan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnionType {
	/// `UNION` / `UNION DISTINCT`.
	Distinct,
	/// `UNION ALL`.
	All,
}

#[derive(Debug, Clone)]
pub struct UnionNode {
	pub left: PlanNode,
	pub right: PlanNode,
	pub typ: UnionType,
	pub children: Vec<ChildPlan>,
}

/// How one output column merges across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrType {
	/// SUM of per-shard counts.
	Count,
	Sum,
	Min,
	Max,
	/// Pushed as SUM + COUNT; merged as their quotient.
	Avg,
	/// A grouping column.
	GroupBy,
}

#[derive(Debug, Clone)]
pub struct Aggregator {
	/// Column ordinal in the merged (pre-removal) row.
	pub index: usize,
	pub typ: AggrType,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatePlan {
	pub aggrs: Vec<Aggregator>,
	/// Helper columns (AVG's count) dropped after the merge.
	pub remove_idxs: Vec<usize>,
	/// Hash-dedupe the whole result (SELECT DISTINCT).
	pub distinct: bool,
}

impl AggregatePlan {
	pub fn is_empty(&self) -> bool {
		self.aggrs.is_empty() && self.remove_idxs.is_empty() && !self.distinct
	}
}

#[derive(Debug, Clone)]
pub struct OrderBySpec {
	pub column: String,
	/// Ordinal in the merged row.
	pub index: usize,
	pub desc: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OrderByPlan {
	pub orders: Vec<OrderBySpec>,
}

#[derive(Debug, Clone)]
pub struct LimitPlan {
	pub offset: usize,
	pub limit: usize,
}

#[derive(Debug, Clone)]
pub enum ChildPlan {
	Aggregate(AggregatePlan),
	OrderBy(OrderByPlan),
	Limit(LimitPlan),
}
