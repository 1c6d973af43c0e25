//! Flat plans for DDL and DML: a type tag plus the rewritten per-shard
//! query list, ready for a transaction to execute.

use quintette_backend::xcontext::{QueryTuple, RequestContext, RequestMode, TxnMode};
use quintette_router::{Router, RouterError, Segment};

use crate::statement::{DdlStatement, DmlStatement, KeyFilter};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanType {
	Ddl,
	Insert,
	Update,
	Delete,
	Select,
	Union,
	Others,
}

impl std::fmt::Display for PlanType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			PlanType::Ddl => "DDL",
			PlanType::Insert => "INSERT",
			PlanType::Update => "UPDATE",
			PlanType::Delete => "DELETE",
			PlanType::Select => "SELECT",
			PlanType::Union => "UNION",
			PlanType::Others => "OTHERS",
		};
		write!(f, "{name}")
	}
}

/// An immutable flat plan.
#[derive(Debug, Clone)]
pub struct Plan {
	pub typ: PlanType,
	pub req: RequestContext,
}

impl Plan {
	pub fn json(&self) -> String {
		let querys: Vec<serde_json::Value> = self
			.req
			.querys
			.iter()
			.map(|qt| {
				serde_json::json!({
					"Query": qt.query,
					"Backend": qt.backend,
					"Range": qt.range,
				})
			})
			.collect();
		serde_json::to_string_pretty(&serde_json::json!({
			"Type": self.typ.to_string(),
			"Partitions": querys,
		}))
		.unwrap_or_default()
	}
}

fn is_ident_byte(b: u8) -> bool {
	b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'.'
}

// Replace the first whole-word occurrence of `from`.
fn replace_word(sql: &str, from: &str, to: &str) -> Option<String> {
	let bytes = sql.as_bytes();
	let mut start = 0;
	while let Some(pos) = sql[start..].find(from) {
		let abs = start + pos;
		let before_ok = abs == 0 || !is_ident_byte(bytes[abs - 1]);
		let after = abs + from.len();
		let after_ok = after >= sql.len() || !is_ident_byte(bytes[after]);
		if before_ok && after_ok {
			return Some(format!("{}{}{}", &sql[..abs], to, &sql[after..]));
		}
		start = after;
	}
	None
}

/// Rewrite the logical table reference in `sql` to one segment's
/// physical table, qualified with the database.
pub fn rewrite_table(sql: &str, db: &str, logical: &str, physical: &str) -> String {
	let qualified = format!("{db}.{logical}");
	let target = format!("{db}.{physical}");
	if let Some(out) = replace_word(sql, &qualified, &target) {
		return out;
	}
	replace_word(sql, logical, &target).unwrap_or_else(|| sql.to_string())
}

fn tuples_for(stmt_db: &str, stmt_table: &str, sql: &str, segments: &[Segment]) -> Vec<QueryTuple> {
	segments
		.iter()
		.map(|seg| {
			QueryTuple::new(
				&rewrite_table(sql, stmt_db, stmt_table, &seg.table),
				&seg.backend,
				&seg.range.to_string(),
			)
		})
		.collect()
}

/// DDL over a routed table rewrites per segment; database-level DDL
/// scatters verbatim to every backend.
pub fn build_ddl_plan(router: &Router, stmt: &DdlStatement) -> Result<Plan> {
	let req = match &stmt.table {
		Some(table) => {
			let segments = router.lookup(&stmt.db, table, None, None)?;
			RequestContext {
				mode: RequestMode::Normal,
				txn_mode: TxnMode::None,
				querys: tuples_for(&stmt.db, table, &stmt.sql, &segments),
				..RequestContext::new()
			}
		}
		None => RequestContext {
			mode: RequestMode::Scatter,
			txn_mode: TxnMode::None,
			raw_query: stmt.sql.clone(),
			..RequestContext::new()
		},
	};
	Ok(Plan { typ: PlanType::Ddl, req })
}

fn route_write(router: &Router, stmt: &DmlStatement, key_required: bool) -> Result<Vec<Segment>> {
	let shard_type = router.shard_type(&stmt.db, &stmt.table)?;
	// Writes to a global table go to every copy.
	if shard_type == quintette_router::METHOD_GLOBAL
		|| shard_type == quintette_router::METHOD_SINGLE
	{
		return Ok(router.lookup(&stmt.db, &stmt.table, None, None)?);
	}
	match &stmt.key {
		KeyFilter::Point(value) => {
			Ok(router.lookup(&stmt.db, &stmt.table, Some(value), Some(value))?)
		}
		KeyFilter::All | KeyFilter::Range(_, _) if key_required => Err(
			RouterError::ShardKeyMissing(stmt.db.clone(), stmt.table.clone()).into(),
		),
		KeyFilter::Range(start, end) => {
			Ok(router.lookup(&stmt.db, &stmt.table, start.as_ref(), end.as_ref())?)
		}
		KeyFilter::All => Ok(router.lookup(&stmt.db, &stmt.table, None, None)?),
	}
}

fn build_write_plan(
	router: &Router,
	stmt: &DmlStatement,
	typ: PlanType,
	key_required: bool,
) -> Result<Plan> {
	let segments = route_write(router, stmt, key_required)?;
	let req = RequestContext {
		mode: RequestMode::Normal,
		txn_mode: TxnMode::Write,
		querys: tuples_for(&stmt.db, &stmt.table, &stmt.sql, &segments),
		..RequestContext::new()
	};
	Ok(Plan { typ, req })
}

/// INSERT routes by the shard key value; a sharded table without one is
/// an error.
pub fn build_insert_plan(router: &Router, stmt: &DmlStatement) -> Result<Plan> {
	build_write_plan(router, stmt, PlanType::Insert, true)
}

/// UPDATE prunes on a point key and fans out otherwise.
pub fn build_update_plan(router: &Router, stmt: &DmlStatement) -> Result<Plan> {
	build_write_plan(router, stmt, PlanType::Update, false)
}

/// DELETE prunes on a point key and fans out otherwise.
pub fn build_delete_plan(router: &Router, stmt: &DmlStatement) -> Result<Plan> {
	build_write_plan(router, stmt, PlanType::Delete, false)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn word_replacement_respects_boundaries() {
		assert_eq!(
			rewrite_table("DELETE FROM t1 WHERE id = 1", "db", "t1", "t1_0008"),
			"DELETE FROM db.t1_0008 WHERE id = 1"
		);
		assert_eq!(
			rewrite_table("DELETE FROM db.t1 WHERE id = 1", "db", "t1", "t1_0008"),
			"DELETE FROM db.t1_0008 WHERE id = 1"
		);
		// `t10` must not match `t1`.
		assert_eq!(
			rewrite_table("DELETE FROM t10 WHERE id = 1", "db", "t1", "t1_0008"),
			"DELETE FROM t10 WHERE id = 1"
		);
		// Only the table reference is rewritten, not column text.
		assert_eq!(
			rewrite_table("UPDATE t1 SET t1x = 2 WHERE id = 3", "db", "t1", "t1_0001"),
			"UPDATE db.t1_0001 SET t1x = 2 WHERE id = 3"
		);
	}
}
