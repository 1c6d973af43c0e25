//! Planning: from a parsed statement descriptor plus the routing
//! catalog to an executable plan.
//!
//! The SQL front-end parses client statements into the descriptors in
//! [`statement`]; the builders here route them through the
//! [`quintette_router::Router`] and emit either a flat [`plan::Plan`]
//! (DDL and DML) or a [`node::PlanNode`] tree (SELECT/UNION) for the
//! executor to walk. Plans are immutable once built.

pub mod builder;
pub mod node;
pub mod plan;
pub mod statement;

pub use builder::{build_join_plan, build_select_plan, build_union_plan};
pub use node::{
	AggrType, AggregatePlan, Aggregator, ChildPlan, JoinNode, JoinStrategy, LimitPlan, MergeNode,
	OrderByPlan, OrderBySpec, PlanNode, UnionNode, UnionType,
};
pub use plan::{
	build_ddl_plan, build_delete_plan, build_insert_plan, build_update_plan, rewrite_table, Plan,
	PlanType,
};
pub use statement::{
	AggrFunc, DdlStatement, DmlStatement, JoinColumn, JoinStatement, KeyFilter, Limit, OrderBy,
	SelectExpr, SelectStatement, UnionStatement,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlannerError {
	#[error("unsupported: the used 'select' statements have a different number of columns")]
	UnionColumnsMismatch,

	#[error("order by column '{0}' must appear in the select list")]
	OrderColumnNotFound(String),

	#[error("group by column '{0}' must appear in the select list")]
	GroupColumnNotFound(String),

	#[error("join column '{0}' not found in either side")]
	JoinColumnNotFound(String),

	#[error(transparent)]
	Router(#[from] quintette_router::RouterError),
}

pub type Result<T> = std::result::Result<T, PlannerError>;
