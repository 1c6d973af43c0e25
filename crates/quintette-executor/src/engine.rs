//! Plan-tree engines.

use futures::future::BoxFuture;
use quintette_backend::xcontext::{QueryTuple, RequestContext, TxnMode};
use quintette_backend::Txn;
use quintette_base::result::cmp_values;
use quintette_base::{Field, QueryResult, Value};
use quintette_planner::{JoinNode, JoinStrategy, MergeNode, PlanNode, UnionNode, UnionType};

use crate::operator::exec_sub_plan;
use crate::{ExecutorError, Result};

/// The executable mirror of a [`PlanNode`].
pub enum PlanEngine<'a> {
	Merge(MergeEngine<'a>),
	Join(Box<JoinEngine<'a>>),
	Union(Box<UnionEngine<'a>>),
}

impl<'a> PlanEngine<'a> {
	/// Build the engine tree for a plan.
	pub fn build(node: &'a PlanNode, txn: &'a Txn) -> PlanEngine<'a> {
		match node {
			PlanNode::Merge(merge) => PlanEngine::Merge(MergeEngine { node: merge, txn }),
			PlanNode::Join(join) => PlanEngine::Join(Box::new(JoinEngine {
				node: join,
				txn,
				left: PlanEngine::build(&join.left, txn),
				right: PlanEngine::build(&join.right, txn),
			})),
			PlanNode::Union(union) => PlanEngine::Union(Box::new(UnionEngine {
				node: union,
				left: PlanEngine::build(&union.left, txn),
				right: PlanEngine::build(&union.right, txn),
			})),
		}
	}

	pub fn execute(&self) -> BoxFuture<'_, Result<QueryResult>> {
		Box::pin(async move {
			match self {
				PlanEngine::Merge(engine) => engine.execute().await,
				PlanEngine::Join(engine) => engine.execute().await,
				PlanEngine::Union(engine) => engine.execute().await,
			}
		})
	}
}

/// Pushes the node's per-shard queries through the transaction and runs
/// the decorator pipeline over the merged result.
pub struct MergeEngine<'a> {
	node: &'a MergeNode,
	txn: &'a Txn,
}

impl MergeEngine<'_> {
	pub async fn execute(&self) -> Result<QueryResult> {
		let req = RequestContext {
			mode: self.node.req_mode,
			txn_mode: TxnMode::Read,
			raw_query: self
				.node
				.querys
				.first()
				.map(|qt| qt.query.clone())
				.unwrap_or_default(),
			querys: self.node.querys.clone(),
		};
		let mut qr = self.txn.execute(&req).await?;
		exec_sub_plan(&self.node.children, &mut qr)?;
		Ok(qr)
	}
}

// max_join_rows of zero means unbounded.
fn effective_max(max: usize) -> usize {
	if max == 0 {
		usize::MAX
	} else {
		max
	}
}

fn join_fields(lfields: &[Field], rfields: &[Field], cols: &[i32]) -> Vec<Field> {
	cols.iter()
		.map(|&index| {
			if index < 0 {
				lfields.get((-index - 1) as usize).cloned().unwrap_or_else(|| Field::new(""))
			} else {
				rfields.get((index - 1) as usize).cloned().unwrap_or_else(|| Field::new(""))
			}
		})
		.collect()
}

// `rrow` is None for synthesized LEFT JOIN non-matches.
fn join_rows(lrow: &[Value], rrow: Option<&[Value]>, cols: &[i32]) -> Vec<Value> {
	cols.iter()
		.map(|&index| {
			if index < 0 {
				lrow[(-index - 1) as usize].clone()
			} else {
				match rrow {
					Some(rrow) => rrow[(index - 1) as usize].clone(),
					None => Value::null(),
				}
			}
		})
		.collect()
}

fn push_row(out: &mut QueryResult, row: Vec<Value>, maxrow: usize) -> Result<()> {
	out.rows.push(row);
	out.rows_affected += 1;
	if out.rows.len() > maxrow {
		return Err(ExecutorError::JoinRowLimit(maxrow));
	}
	Ok(())
}

fn concat_left_and_nil(
	lrows: &[Vec<Value>],
	node: &JoinNode,
	out: &mut QueryResult,
	maxrow: usize,
) -> Result<()> {
	if !node.is_left_join {
		return Ok(());
	}
	for lrow in lrows {
		push_row(out, join_rows(lrow, None, &node.cols), maxrow)?;
	}
	Ok(())
}

fn cartesian_product(
	lqr: &QueryResult,
	rqr: &QueryResult,
	node: &JoinNode,
	out: &mut QueryResult,
	maxrow: usize,
) -> Result<()> {
	for lrow in &lqr.rows {
		for rrow in &rqr.rows {
			push_row(out, join_rows(lrow, Some(rrow), &node.cols), maxrow)?;
		}
	}
	Ok(())
}

// Classic merge over two inputs sorted on the join key. NULL keys never
// match.
fn sort_merge_join(
	lqr: &QueryResult,
	rqr: &QueryResult,
	node: &JoinNode,
	out: &mut QueryResult,
	maxrow: usize,
) -> Result<()> {
	let Some((lkey, rkey)) = node.join_on else {
		return Err(ExecutorError::MissingJoinKey);
	};
	let lrows = &lqr.rows;
	let rrows = &rqr.rows;
	let mut li = 0;
	let mut ri = 0;

	while li < lrows.len() {
		if lrows[li][lkey].is_null() {
			concat_left_and_nil(std::slice::from_ref(&lrows[li]), node, out, maxrow)?;
			li += 1;
			continue;
		}
		if ri >= rrows.len() {
			concat_left_and_nil(&lrows[li..], node, out, maxrow)?;
			break;
		}
		if rrows[ri][rkey].is_null() {
			ri += 1;
			continue;
		}
		match cmp_values(&lrows[li][lkey], &rrows[ri][rkey]) {
			std::cmp::Ordering::Less => {
				concat_left_and_nil(std::slice::from_ref(&lrows[li]), node, out, maxrow)?;
				li += 1;
			}
			std::cmp::Ordering::Greater => {
				ri += 1;
			}
			std::cmp::Ordering::Equal => {
				let group_start = ri;
				let key = rrows[ri][rkey].clone();
				while ri < rrows.len() && cmp_values(&rrows[ri][rkey], &key) == std::cmp::Ordering::Equal {
					ri += 1;
				}
				while li < lrows.len()
					&& cmp_values(&lrows[li][lkey], &key) == std::cmp::Ordering::Equal
				{
					for rrow in &rrows[group_start..ri] {
						push_row(out, join_rows(&lrows[li], Some(rrow), &node.cols), maxrow)?;
					}
					li += 1;
				}
			}
		}
	}
	Ok(())
}

fn value_literal(value: &Value) -> String {
	if value.is_null() {
		return "NULL".to_string();
	}
	let text = value.as_str();
	if text.parse::<f64>().is_ok() {
		return text;
	}
	format!("'{}'", text.replace('\'', "''"))
}

/// Joins two child streams by the strategy picked at plan time.
pub struct JoinEngine<'a> {
	node: &'a JoinNode,
	txn: &'a Txn,
	left: PlanEngine<'a>,
	right: PlanEngine<'a>,
}

impl JoinEngine<'_> {
	pub async fn execute(&self) -> Result<QueryResult> {
		let maxrow = effective_max(self.txn.max_join_rows());

		let mut out = if self.node.strategy == JoinStrategy::NestLoop {
			self.exec_bind_vars(maxrow).await?
		} else {
			let (lqr, rqr) = futures::join!(self.left.execute(), self.right.execute());
			let lqr = lqr?;
			let rqr = rqr?;

			let mut out = QueryResult::new();
			out.fields = join_fields(&lqr.fields, &rqr.fields, &self.node.cols);
			if !lqr.rows.is_empty() {
				if rqr.rows.is_empty() {
					concat_left_and_nil(&lqr.rows, self.node, &mut out, maxrow)?;
				} else {
					match self.node.strategy {
						JoinStrategy::SortMerge => {
							sort_merge_join(&lqr, &rqr, self.node, &mut out, maxrow)?
						}
						_ => cartesian_product(&lqr, &rqr, self.node, &mut out, maxrow)?,
					}
				}
			}
			out
		};

		exec_sub_plan(&self.node.children, &mut out)?;
		Ok(out)
	}

	// The right side re-executes once per qualifying left row with its
	// bind variables substituted.
	async fn exec_bind_vars(&self, maxrow: usize) -> Result<QueryResult> {
		let right_node = match &self.node.right {
			PlanNode::Merge(merge) => merge,
			_ => return Err(ExecutorError::NestLoopShape),
		};
		let lqr = self.left.execute().await?;
		let mut out = QueryResult::new();

		for lrow in &lqr.rows {
			let left_match = self.node.left_tmp_cols.iter().all(|&i| lrow[i].to_bool());
			let mut match_cnt = 0usize;
			if left_match {
				let rqr = self.exec_right_bound(right_node, Some(lrow)).await?;
				if out.fields.is_empty() {
					out.fields = join_fields(&lqr.fields, &rqr.fields, &self.node.cols);
				}
				for rrow in &rqr.rows {
					match_cnt += 1;
					if self.node.right_tmp_cols.iter().all(|&i| rrow[i].is_null()) {
						push_row(&mut out, join_rows(lrow, Some(rrow), &self.node.cols), maxrow)?;
					}
				}
			}
			if match_cnt == 0 {
				concat_left_and_nil(std::slice::from_ref(lrow), self.node, &mut out, maxrow)?;
			}
		}

		// Field metadata even when nothing matched: probe the right side
		// with NULL bindings.
		if out.fields.is_empty() {
			let rqr = self.exec_right_bound(right_node, None).await?;
			out.fields = join_fields(&lqr.fields, &rqr.fields, &self.node.cols);
		}
		Ok(out)
	}

	async fn exec_right_bound(
		&self,
		right: &MergeNode,
		lrow: Option<&Vec<Value>>,
	) -> Result<QueryResult> {
		let querys: Vec<QueryTuple> = right
			.querys
			.iter()
			.map(|qt| {
				let mut sql = qt.query.clone();
				for (var, &index) in &self.node.vars {
					let literal = match lrow {
						Some(row) => value_literal(&row[index]),
						None => "NULL".to_string(),
					};
					sql = sql.replace(&format!(":{var}"), &literal);
				}
				QueryTuple { query: sql, backend: qt.backend.clone(), range: qt.range.clone() }
			})
			.collect();

		let req = RequestContext {
			mode: right.req_mode,
			txn_mode: TxnMode::Read,
			raw_query: querys.first().map(|qt| qt.query.clone()).unwrap_or_default(),
			querys,
		};
		let mut qr = self.txn.execute(&req).await?;
		exec_sub_plan(&right.children, &mut qr)?;
		Ok(qr)
	}
}

/// Evaluates both sides in parallel and concatenates, deduping for
/// `UNION` (distinct).
pub struct UnionEngine<'a> {
	node: &'a UnionNode,
	left: PlanEngine<'a>,
	right: PlanEngine<'a>,
}

impl UnionEngine<'_> {
	pub async fn execute(&self) -> Result<QueryResult> {
		let (lqr, rqr) = futures::join!(self.left.execute(), self.right.execute());
		let mut qr = lqr?;
		let rqr = rqr?;

		if qr.fields.len() != rqr.fields.len() {
			return Err(ExecutorError::UnionColumnsMismatch);
		}
		qr.append(rqr);

		if self.node.typ == UnionType::Distinct {
			let mut seen = std::collections::HashSet::new();
			qr.rows.retain(|row| {
				let key: Vec<u8> = row.iter().flat_map(|v| v.raw().to_vec()).collect();
				seen.insert(key)
			});
			qr.rows_affected = qr.rows.len() as u64;
		}

		exec_sub_plan(&self.node.children, &mut qr)?;
		Ok(qr)
	}
}
