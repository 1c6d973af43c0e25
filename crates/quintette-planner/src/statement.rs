//! Statement descriptors.
//!
//! The wire front-end owns the SQL grammar; what planning needs from a
//! parsed statement is captured here: the routed table, the shard-key
//! filter extracted from the WHERE clause, the structured projection,
//! and the clauses that merge across shards (group/order/limit).

use std::collections::HashMap;

use quintette_router::ShardValue;

use crate::node::UnionType;

/// An aggregate function in the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrFunc {
	Count,
	Sum,
	Min,
	Max,
	Avg,
}

impl AggrFunc {
	pub fn name(&self) -> &'static str {
		match self {
			AggrFunc::Count => "COUNT",
			AggrFunc::Sum => "SUM",
			AggrFunc::Min => "MIN",
			AggrFunc::Max => "MAX",
			AggrFunc::Avg => "AVG",
		}
	}
}

/// One projected column.
#[derive(Debug, Clone)]
pub enum SelectExpr {
	/// A plain column reference.
	Column(String),
	/// An aggregate over a column (`*` for `COUNT(*)`).
	Aggregate { func: AggrFunc, column: String },
	/// Any other expression, pushed through verbatim.
	Raw(String),
}

impl SelectExpr {
	/// The name this expression answers to in ORDER BY / GROUP BY.
	pub fn label(&self) -> String {
		match self {
			SelectExpr::Column(name) => name.clone(),
			SelectExpr::Aggregate { func, column } => {
				format!("{}({})", func.name().to_lowercase(), column)
			}
			SelectExpr::Raw(expr) => expr.clone(),
		}
	}
}

/// The shard-key restriction extracted from the WHERE clause.
#[derive(Debug, Clone, Default)]
pub enum KeyFilter {
	/// No usable restriction: fan out.
	#[default]
	All,
	/// An equality: prune to one segment.
	Point(ShardValue),
	/// An interval; open ends are `None`. Ranges fan out.
	Range(Option<ShardValue>, Option<ShardValue>),
}

#[derive(Debug, Clone)]
pub struct OrderBy {
	pub column: String,
	pub desc: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Limit {
	pub offset: usize,
	pub count: usize,
}

/// A single-table SELECT.
#[derive(Debug, Clone)]
pub struct SelectStatement {
	pub db: String,
	pub table: String,
	pub exprs: Vec<SelectExpr>,
	/// The predicate text, `WHERE` keyword excluded.
	pub where_sql: Option<String>,
	pub key: KeyFilter,
	pub group_by: Vec<String>,
	pub order_by: Vec<OrderBy>,
	pub limit: Option<Limit>,
	pub distinct: bool,
}

impl SelectStatement {
	pub fn new(db: &str, table: &str) -> Self {
		SelectStatement {
			db: db.to_string(),
			table: table.to_string(),
			exprs: Vec::new(),
			where_sql: None,
			key: KeyFilter::All,
			group_by: Vec::new(),
			order_by: Vec::new(),
			limit: None,
			distinct: false,
		}
	}
}

/// Which side of a join a projected column comes from.
#[derive(Debug, Clone)]
pub enum JoinColumn {
	Left(String),
	Right(String),
}

/// A two-sided join. The strategy falls out of the shape: bind
/// variables force a nested loop, an equality key pair allows a sort
/// merge, anything else is a bounded cartesian product.
#[derive(Debug, Clone)]
pub struct JoinStatement {
	pub left: SelectStatement,
	pub right: SelectStatement,
	/// Equality join `(left column, right column)`.
	pub join_on: Option<(String, String)>,
	pub is_left_join: bool,
	/// `:name` placeholders in the right side's predicate, bound to left
	/// columns per driving row.
	pub bind_vars: HashMap<String, String>,
	pub projection: Vec<JoinColumn>,
	/// Left columns that must be truthy for the row to participate.
	pub left_filter_cols: Vec<String>,
	/// Right columns required NULL for the joined row to survive.
	pub right_null_cols: Vec<String>,
}

/// A two-sided union.
#[derive(Debug, Clone)]
pub struct UnionStatement {
	pub left: SelectStatement,
	pub right: SelectStatement,
	pub typ: UnionType,
	pub order_by: Vec<OrderBy>,
	pub limit: Option<Limit>,
}

/// INSERT/UPDATE/DELETE over one routed table. `sql` references the
/// logical table; the builder rewrites it per segment.
#[derive(Debug, Clone)]
pub struct DmlStatement {
	pub db: String,
	pub table: String,
	pub sql: String,
	pub key: KeyFilter,
}

/// A DDL statement. With a routed table the DDL is rewritten per
/// segment; without one it scatters verbatim to every backend.
#[derive(Debug, Clone)]
pub struct DdlStatement {
	pub db: String,
	pub table: Option<String>,
	pub sql: String,
}
