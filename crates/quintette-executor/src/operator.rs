//! Child-plan operators over a merged result: aggregate merge, gather
//! ordering, limit.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use quintette_base::result::cmp_values;
use quintette_base::{QueryResult, Value};
use quintette_planner::{AggrType, AggregatePlan, ChildPlan, LimitPlan, OrderByPlan};

use crate::Result;

/// Run a node's child operators in plan order.
pub fn exec_sub_plan(children: &[ChildPlan], qr: &mut QueryResult) -> Result<()> {
	for child in children {
		match child {
			ChildPlan::Aggregate(plan) => aggregate_execute(plan, qr)?,
			ChildPlan::OrderBy(plan) => orderby_execute(plan, qr),
			ChildPlan::Limit(plan) => limit_execute(plan, qr),
		}
	}
	Ok(())
}

fn add_values(a: &Value, b: &Value) -> Value {
	if a.is_null() {
		return b.clone();
	}
	if b.is_null() {
		return a.clone();
	}
	if let (Some(x), Some(y)) = (a.to_i64(), b.to_i64()) {
		return Value::text(&(x + y).to_string());
	}
	match (a.to_f64(), b.to_f64()) {
		(Some(x), Some(y)) => Value::text(&format!("{}", x + y)),
		_ => a.clone(),
	}
}

fn div_values(sum: &Value, count: &Value) -> Value {
	match (sum.to_f64(), count.to_f64()) {
		(Some(sum), Some(count)) if count != 0.0 => Value::text(&format!("{}", sum / count)),
		_ => Value::null(),
	}
}

/// Merge per-shard aggregate rows: SUM the sums and counts, keep
/// MIN/MAX extremes, divide AVG's pushed-down numerator and
/// denominator, hash-group on the grouping columns, then drop the
/// helper columns.
pub fn aggregate_execute(plan: &AggregatePlan, qr: &mut QueryResult) -> Result<()> {
	let group_idxs: Vec<usize> =
		plan.aggrs.iter().filter(|a| a.typ == AggrType::GroupBy).map(|a| a.index).collect();
	let aggrs: Vec<_> = plan.aggrs.iter().filter(|a| a.typ != AggrType::GroupBy).collect();

	if !aggrs.is_empty() || !group_idxs.is_empty() {
		// One key entry per grouping column; flattening the bytes would
		// merge ("ab","c") with ("a","bc").
		let mut slots: HashMap<Vec<Vec<u8>>, usize> = HashMap::new();
		let mut merged: Vec<Vec<Value>> = Vec::new();

		for row in std::mem::take(&mut qr.rows) {
			let key: Vec<Vec<u8>> =
				group_idxs.iter().map(|&i| row[i].raw().to_vec()).collect();
			match slots.get(&key) {
				None => {
					slots.insert(key, merged.len());
					merged.push(row);
				}
				Some(&slot) => {
					let target = &mut merged[slot];
					for aggr in &aggrs {
						let i = aggr.index;
						match aggr.typ {
							AggrType::Count | AggrType::Sum => {
								target[i] = add_values(&target[i], &row[i]);
							}
							AggrType::Avg => {
								target[i] = add_values(&target[i], &row[i]);
								target[i + 1] = add_values(&target[i + 1], &row[i + 1]);
							}
							AggrType::Min => {
								if target[i].is_null()
									|| (!row[i].is_null()
										&& cmp_values(&row[i], &target[i]) == Ordering::Less)
								{
									target[i] = row[i].clone();
								}
							}
							AggrType::Max => {
								if cmp_values(&row[i], &target[i]) == Ordering::Greater {
									target[i] = row[i].clone();
								}
							}
							AggrType::GroupBy => {}
						}
					}
				}
			}
		}

		for row in &mut merged {
			for aggr in &aggrs {
				if aggr.typ == AggrType::Avg {
					row[aggr.index] = div_values(&row[aggr.index], &row[aggr.index + 1]);
				}
			}
		}
		qr.rows = merged;
	}

	if !plan.remove_idxs.is_empty() {
		let mut idxs = plan.remove_idxs.clone();
		idxs.sort_unstable();
		for &i in idxs.iter().rev() {
			if i < qr.fields.len() {
				qr.fields.remove(i);
			}
			for row in &mut qr.rows {
				if i < row.len() {
					row.remove(i);
				}
			}
		}
	}

	if plan.distinct {
		let mut seen = HashSet::new();
		qr.rows.retain(|row| {
			let key: Vec<Vec<u8>> = row.iter().map(|v| v.raw().to_vec()).collect();
			seen.insert(key)
		});
	}

	qr.rows_affected = qr.rows.len() as u64;
	Ok(())
}

pub fn orderby_execute(plan: &OrderByPlan, qr: &mut QueryResult) {
	let keys: Vec<(usize, bool)> = plan.orders.iter().map(|o| (o.index, o.desc)).collect();
	qr.sort_by(&keys);
}

pub fn limit_execute(plan: &LimitPlan, qr: &mut QueryResult) {
	qr.limit(plan.offset, plan.limit);
	qr.rows_affected = qr.rows.len() as u64;
}

#[cfg(test)]
mod tests {
	use super::*;
	use quintette_planner::Aggregator;

	fn row(cells: &[&str]) -> Vec<Value> {
		cells.iter().map(|c| Value::text(c)).collect()
	}

	#[test]
	fn avg_merges_as_sum_over_count() {
		// Two shards holding {1,2,3} and {4,5,6}: SUM+COUNT pushdowns.
		let mut qr = QueryResult::with_fields(&["avg(x)", "count(x)"]);
		qr.rows = vec![row(&["6", "3"]), row(&["15", "3"])];

		let plan = AggregatePlan {
			aggrs: vec![Aggregator { index: 0, typ: AggrType::Avg }],
			remove_idxs: vec![1],
			distinct: false,
		};
		aggregate_execute(&plan, &mut qr).unwrap();

		assert_eq!(qr.fields.len(), 1);
		assert_eq!(qr.rows.len(), 1);
		assert_eq!(qr.rows[0][0].as_str(), "3.5");
	}

	#[test]
	fn count_sum_min_max_merge() {
		let mut qr = QueryResult::with_fields(&["count(x)", "sum(x)", "min(x)", "max(x)"]);
		qr.rows = vec![row(&["3", "10", "2", "9"]), row(&["2", "5", "1", "12"])];

		let plan = AggregatePlan {
			aggrs: vec![
				Aggregator { index: 0, typ: AggrType::Count },
				Aggregator { index: 1, typ: AggrType::Sum },
				Aggregator { index: 2, typ: AggrType::Min },
				Aggregator { index: 3, typ: AggrType::Max },
			],
			remove_idxs: vec![],
			distinct: false,
		};
		aggregate_execute(&plan, &mut qr).unwrap();

		assert_eq!(qr.rows.len(), 1);
		let got: Vec<String> = qr.rows[0].iter().map(Value::as_str).collect();
		assert_eq!(got, vec!["5", "15", "1", "12"]);
	}

	#[test]
	fn group_by_merges_within_groups() {
		let mut qr = QueryResult::with_fields(&["city", "count(x)"]);
		qr.rows = vec![
			row(&["bj", "2"]),
			row(&["sh", "1"]),
			row(&["bj", "3"]),
		];

		let plan = AggregatePlan {
			aggrs: vec![
				Aggregator { index: 0, typ: AggrType::GroupBy },
				Aggregator { index: 1, typ: AggrType::Count },
			],
			remove_idxs: vec![],
			distinct: false,
		};
		aggregate_execute(&plan, &mut qr).unwrap();

		assert_eq!(qr.rows.len(), 2);
		assert_eq!(qr.rows[0][0].as_str(), "bj");
		assert_eq!(qr.rows[0][1].as_str(), "5");
		assert_eq!(qr.rows[1][0].as_str(), "sh");
		assert_eq!(qr.rows[1][1].as_str(), "1");
	}

	#[test]
	fn group_keys_are_per_column() {
		// ("ab","c") and ("a","bc") concatenate to the same bytes; they
		// are different groups.
		let mut qr = QueryResult::with_fields(&["a", "b", "count(x)"]);
		qr.rows = vec![
			row(&["ab", "c", "1"]),
			row(&["a", "bc", "2"]),
			row(&["ab", "c", "4"]),
		];

		let plan = AggregatePlan {
			aggrs: vec![
				Aggregator { index: 0, typ: AggrType::GroupBy },
				Aggregator { index: 1, typ: AggrType::GroupBy },
				Aggregator { index: 2, typ: AggrType::Count },
			],
			remove_idxs: vec![],
			distinct: false,
		};
		aggregate_execute(&plan, &mut qr).unwrap();

		assert_eq!(qr.rows.len(), 2);
		let got: Vec<Vec<String>> =
			qr.rows.iter().map(|r| r.iter().map(Value::as_str).collect()).collect();
		assert_eq!(got[0], vec!["ab", "c", "5"]);
		assert_eq!(got[1], vec!["a", "bc", "2"]);
	}

	#[test]
	fn distinct_dedupes_rows() {
		let mut qr = QueryResult::with_fields(&["a"]);
		qr.rows = vec![row(&["1"]), row(&["2"]), row(&["1"])];
		let plan = AggregatePlan { distinct: true, ..AggregatePlan::default() };
		aggregate_execute(&plan, &mut qr).unwrap();
		assert_eq!(qr.rows.len(), 2);
		assert_eq!(qr.rows_affected, 2);
	}

	#[test]
	fn distinct_keys_are_per_column() {
		// Distinct rows whose cells concatenate identically must both
		// survive.
		let mut qr = QueryResult::with_fields(&["a", "b"]);
		qr.rows = vec![row(&["ab", "c"]), row(&["a", "bc"]), row(&["ab", "c"])];
		let plan = AggregatePlan { distinct: true, ..AggregatePlan::default() };
		aggregate_execute(&plan, &mut qr).unwrap();
		assert_eq!(qr.rows.len(), 2);
	}

	#[test]
	fn null_aware_min() {
		let mut qr = QueryResult::with_fields(&["min(x)"]);
		qr.rows = vec![row(&["NULL"]), row(&["7"])];
		qr.rows[0][0] = Value::null();
		let plan = AggregatePlan {
			aggrs: vec![Aggregator { index: 0, typ: AggrType::Min }],
			..AggregatePlan::default()
		};
		aggregate_execute(&plan, &mut qr).unwrap();
		assert_eq!(qr.rows[0][0].as_str(), "7");
	}
}
