//! Builders for the SELECT/UNION plan tree.

use quintette_backend::xcontext::{QueryTuple, RequestMode};
use quintette_router::{Router, Segment};

use crate::node::{
	AggrType, AggregatePlan, Aggregator, ChildPlan, JoinNode, JoinStrategy, LimitPlan, MergeNode,
	OrderByPlan, OrderBySpec, PlanNode, UnionNode,
};
use crate::statement::{
	AggrFunc, JoinColumn, JoinStatement, KeyFilter, OrderBy, SelectExpr, SelectStatement,
	UnionStatement,
};
use crate::{PlannerError, Result};

fn route_select(router: &Router, stmt: &SelectStatement) -> Result<Vec<Segment>> {
	let segments = match &stmt.key {
		KeyFilter::All => router.lookup(&stmt.db, &stmt.table, None, None)?,
		KeyFilter::Point(value) => router.lookup(&stmt.db, &stmt.table, Some(value), Some(value))?,
		KeyFilter::Range(start, end) => {
			router.lookup(&stmt.db, &stmt.table, start.as_ref(), end.as_ref())?
		}
	};
	// Global tables are replicated: reads go to any one copy.
	if router.shard_type(&stmt.db, &stmt.table)? == quintette_router::METHOD_GLOBAL {
		return Ok(segments.into_iter().take(1).collect());
	}
	Ok(segments)
}

fn aggr_type(func: AggrFunc) -> AggrType {
	match func {
		AggrFunc::Count => AggrType::Count,
		AggrFunc::Sum => AggrType::Sum,
		AggrFunc::Min => AggrType::Min,
		AggrFunc::Max => AggrType::Max,
		AggrFunc::Avg => AggrType::Avg,
	}
}

// The per-shard projection with its merge bookkeeping. `rewrite` is off
// for single-segment pushdowns, where the backend computes the final
// answer itself.
fn build_projection(
	stmt: &SelectStatement,
	rewrite: bool,
) -> (String, Vec<String>, AggregatePlan) {
	let mut parts = Vec::new();
	let mut labels = Vec::new();
	let mut aggregate = AggregatePlan::default();
	let mut idx = 0usize;

	for expr in &stmt.exprs {
		match expr {
			SelectExpr::Column(name) => {
				parts.push(name.clone());
				labels.push(name.clone());
				idx += 1;
			}
			SelectExpr::Aggregate { func, column } => {
				let label = expr.label();
				if rewrite && *func == AggrFunc::Avg {
					// AVG cannot merge; push its numerator and
					// denominator and divide after the gather.
					parts.push(format!("SUM({column}) AS `{label}`"));
					parts.push(format!("COUNT({column})"));
					aggregate.aggrs.push(Aggregator { index: idx, typ: AggrType::Avg });
					aggregate.remove_idxs.push(idx + 1);
					labels.push(label);
					labels.push(format!("count({column})"));
					idx += 2;
				} else {
					parts.push(format!("{}({})", func.name(), column));
					if rewrite {
						aggregate.aggrs.push(Aggregator { index: idx, typ: aggr_type(*func) });
					}
					labels.push(label);
					idx += 1;
				}
			}
			SelectExpr::Raw(raw) => {
				parts.push(raw.clone());
				labels.push(raw.clone());
				idx += 1;
			}
		}
	}
	(parts.join(", "), labels, aggregate)
}

fn order_clause(order_by: &[OrderBy]) -> String {
	if order_by.is_empty() {
		return String::new();
	}
	let parts: Vec<String> = order_by
		.iter()
		.map(|o| {
			if o.desc {
				format!("{} DESC", o.column)
			} else {
				format!("{} ASC", o.column)
			}
		})
		.collect();
	format!(" ORDER BY {}", parts.join(", "))
}

/// Build the plan for a single-table SELECT: per-segment pushdown
/// queries plus the merge operators.
pub fn build_select_plan(router: &Router, stmt: &SelectStatement) -> Result<PlanNode> {
	let segments = route_select(router, stmt)?;
	let single_route = segments.len() == 1;
	let (projection, labels, mut aggregate) = build_projection(stmt, !single_route);
	aggregate.distinct = stmt.distinct && !single_route;

	// GROUP BY columns participate in the merge as grouping keys.
	if !single_route {
		for group in &stmt.group_by {
			let index = labels
				.iter()
				.position(|l| l == group)
				.ok_or_else(|| PlannerError::GroupColumnNotFound(group.clone()))?;
			aggregate.aggrs.push(Aggregator { index, typ: AggrType::GroupBy });
		}
	}

	let distinct = if stmt.distinct { "DISTINCT " } else { "" };
	let where_clause = match &stmt.where_sql {
		Some(pred) => format!(" WHERE {pred}"),
		None => String::new(),
	};
	let group_clause = if stmt.group_by.is_empty() {
		String::new()
	} else {
		format!(" GROUP BY {}", stmt.group_by.join(", "))
	};
	let order = order_clause(&stmt.order_by);
	// The limit pushes down widened; the exact window is re-cut locally.
	let limit_clause = match stmt.limit {
		Some(limit) if !single_route => format!(" LIMIT {}", limit.offset + limit.count),
		Some(limit) => format!(" LIMIT {}, {}", limit.offset, limit.count),
		None => String::new(),
	};

	let querys = segments
		.iter()
		.map(|seg| {
			let sql = format!(
				"SELECT {}{} FROM {}.{}{}{}{}{}",
				distinct, projection, stmt.db, seg.table, where_clause, group_clause, order, limit_clause
			);
			QueryTuple::new(&sql, &seg.backend, &seg.range.to_string())
		})
		.collect();

	let mut children = Vec::new();
	if !single_route {
		if !aggregate.is_empty() {
			children.push(ChildPlan::Aggregate(aggregate));
		}
		if !stmt.order_by.is_empty() {
			let mut orders = Vec::new();
			for order in &stmt.order_by {
				let index = labels
					.iter()
					.position(|l| l == &order.column)
					.ok_or_else(|| PlannerError::OrderColumnNotFound(order.column.clone()))?;
				orders.push(OrderBySpec { column: order.column.clone(), index, desc: order.desc });
			}
			children.push(ChildPlan::OrderBy(OrderByPlan { orders }));
		}
		if let Some(limit) = stmt.limit {
			children.push(ChildPlan::Limit(LimitPlan { offset: limit.offset, limit: limit.count }));
		}
	}

	Ok(PlanNode::Merge(MergeNode { req_mode: RequestMode::Normal, querys, children }))
}

// The user-visible output labels of one side, helper columns excluded.
fn output_labels(stmt: &SelectStatement) -> Vec<String> {
	stmt.exprs.iter().map(SelectExpr::label).collect()
}

fn find_label(labels: &[String], name: &str) -> Result<usize> {
	labels
		.iter()
		.position(|l| l == name)
		.ok_or_else(|| PlannerError::JoinColumnNotFound(name.to_string()))
}

/// Build a join plan. Strategy falls out of the statement shape: bind
/// variables force NestLoop, an equality key pair allows SortMerge,
/// otherwise a bounded Cartesian product.
pub fn build_join_plan(router: &Router, stmt: &JoinStatement) -> Result<PlanNode> {
	let strategy = if !stmt.bind_vars.is_empty() {
		JoinStrategy::NestLoop
	} else if stmt.join_on.is_some() {
		JoinStrategy::SortMerge
	} else {
		JoinStrategy::Cartesian
	};

	let mut left_stmt = stmt.left.clone();
	let mut right_stmt = stmt.right.clone();
	if strategy == JoinStrategy::SortMerge {
		if let Some((lkey, rkey)) = stmt.join_on.clone() {
			// Both inputs must arrive sorted on the join key.
			left_stmt.order_by.insert(0, OrderBy { column: lkey, desc: false });
			right_stmt.order_by.insert(0, OrderBy { column: rkey, desc: false });
		}
	}

	let left_labels = output_labels(&left_stmt);
	let right_labels = output_labels(&right_stmt);

	let mut cols = Vec::with_capacity(stmt.projection.len());
	for col in &stmt.projection {
		match col {
			JoinColumn::Left(name) => cols.push(-((find_label(&left_labels, name)? as i32) + 1)),
			JoinColumn::Right(name) => cols.push((find_label(&right_labels, name)? as i32) + 1),
		}
	}

	let join_on = match &stmt.join_on {
		Some((lkey, rkey)) => {
			Some((find_label(&left_labels, lkey)?, find_label(&right_labels, rkey)?))
		}
		None => None,
	};

	let mut vars = std::collections::HashMap::new();
	for (var, column) in &stmt.bind_vars {
		vars.insert(var.clone(), find_label(&left_labels, column)?);
	}
	let left_tmp_cols = stmt
		.left_filter_cols
		.iter()
		.map(|c| find_label(&left_labels, c))
		.collect::<Result<Vec<_>>>()?;
	let right_tmp_cols = stmt
		.right_null_cols
		.iter()
		.map(|c| find_label(&right_labels, c))
		.collect::<Result<Vec<_>>>()?;

	let left = build_select_plan(router, &left_stmt)?;
	let right = build_select_plan(router, &right_stmt)?;

	Ok(PlanNode::Join(Box::new(JoinNode {
		left,
		right,
		strategy,
		cols,
		join_on,
		vars,
		left_tmp_cols,
		right_tmp_cols,
		is_left_join: stmt.is_left_join,
		children: Vec::new(),
	})))
}

/// Build a union plan; both sides must project the same number of
/// columns.
pub fn build_union_plan(router: &Router, stmt: &UnionStatement) -> Result<PlanNode> {
	if stmt.left.exprs.len() != stmt.right.exprs.len() {
		return Err(PlannerError::UnionColumnsMismatch);
	}
	let left_labels = output_labels(&stmt.left);

	let left = build_select_plan(router, &stmt.left)?;
	let right = build_select_plan(router, &stmt.right)?;

	let mut children = Vec::new();
	if !stmt.order_by.is_empty() {
		let mut orders = Vec::new();
		for order in &stmt.order_by {
			let index = left_labels
				.iter()
				.position(|l| l == &order.column)
				.ok_or_else(|| PlannerError::OrderColumnNotFound(order.column.clone()))?;
			orders.push(OrderBySpec { column: order.column.clone(), index, desc: order.desc });
		}
		children.push(ChildPlan::OrderBy(OrderByPlan { orders }));
	}
	if let Some(limit) = stmt.limit {
		children.push(ChildPlan::Limit(LimitPlan { offset: limit.offset, limit: limit.count }));
	}

	Ok(PlanNode::Union(Box::new(UnionNode { left, right, typ: stmt.typ, children })))
}
