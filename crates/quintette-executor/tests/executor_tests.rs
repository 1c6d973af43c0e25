//! Engine tests against the fake backend: aggregate merge, unions,
//! joins and the row-count cap.

use std::sync::Arc;

use quintette_backend::fakedb::{build_result, FakeDb};
use quintette_backend::xcontext::{QueryTuple, RequestMode};
use quintette_backend::{Scatter, Txn};
use quintette_executor::{ExecutorError, SelectExecutor, UnionExecutor};
use quintette_planner::{
	AggrType, AggregatePlan, Aggregator, ChildPlan, JoinNode, JoinStrategy, LimitPlan, MergeNode,
	OrderByPlan, OrderBySpec, PlanNode, UnionNode, UnionType,
};
use tempfile::TempDir;

struct Harness {
	fakedb: FakeDb,
	scatter: Arc<Scatter>,
	_dir: TempDir,
}

impl Harness {
	fn new(backends: usize) -> Self {
		let fakedb = FakeDb::new();
		let dir = TempDir::new().unwrap();
		let scatter = Scatter::with_dialer(dir.path(), fakedb.dialer());
		for conf in fakedb.backend_confs(backends) {
			scatter.add(&conf).unwrap();
		}
		Harness { fakedb, scatter, _dir: dir }
	}

	fn txn(&self) -> Arc<Txn> {
		self.scatter.create_transaction().unwrap()
	}
}

fn merge_node(querys: Vec<QueryTuple>, children: Vec<ChildPlan>) -> PlanNode {
	PlanNode::Merge(MergeNode { req_mode: RequestMode::Normal, querys, children })
}

#[tokio::test]
async fn avg_merges_across_two_shards() {
	let h = Harness::new(2);
	// Shards hold {1,2,3} and {4,5,6}; AVG(x) was pushed as SUM + COUNT.
	h.fakedb.add_query_pattern_on(
		"fake:1",
		"select .*",
		build_result(&["avg(x)", "count(x)"], &[&["6", "3"]]),
	);
	h.fakedb.add_query_pattern_on(
		"fake:2",
		"select .*",
		build_result(&["avg(x)", "count(x)"], &[&["15", "3"]]),
	);

	let node = merge_node(
		vec![
			QueryTuple::new("SELECT SUM(x) AS `avg(x)`, COUNT(x) FROM db.t_0000", "backend1", ""),
			QueryTuple::new("SELECT SUM(x) AS `avg(x)`, COUNT(x) FROM db.t_0001", "backend2", ""),
		],
		vec![ChildPlan::Aggregate(AggregatePlan {
			aggrs: vec![Aggregator { index: 0, typ: AggrType::Avg }],
			remove_idxs: vec![1],
			distinct: false,
		})],
	);

	let txn = h.txn();
	let qr = SelectExecutor::new(&node, &txn).execute().await.unwrap();
	assert_eq!(qr.fields.len(), 1);
	assert_eq!(qr.rows.len(), 1);
	assert_eq!(qr.rows[0][0].as_str(), "3.5");
	txn.finish().await.unwrap();
}

fn union_sides(h: &Harness) -> (PlanNode, PlanNode) {
	h.fakedb.add_query_pattern_on(
		"fake:1",
		"select .*",
		build_result(&["a"], &[&["1"], &["2"], &["3"]]),
	);
	h.fakedb.add_query_pattern_on("fake:2", "select .*", build_result(&["a"], &[&["3"], &["4"]]));
	let left = merge_node(vec![QueryTuple::new("SELECT a FROM db.l", "backend1", "")], vec![]);
	let right = merge_node(vec![QueryTuple::new("SELECT a FROM db.r", "backend2", "")], vec![]);
	(left, right)
}

#[tokio::test]
async fn union_distinct_dedupes() {
	let h = Harness::new(2);
	let (left, right) = union_sides(&h);
	let node = PlanNode::Union(Box::new(UnionNode {
		left,
		right,
		typ: UnionType::Distinct,
		children: vec![],
	}));

	let txn = h.txn();
	let qr = UnionExecutor::new(&node, &txn).execute().await.unwrap();
	let got: Vec<String> = qr.rows.iter().map(|r| r[0].as_str()).collect();
	assert_eq!(got, vec!["1", "2", "3", "4"]);
	txn.finish().await.unwrap();
}

#[tokio::test]
async fn union_all_keeps_duplicates() {
	let h = Harness::new(2);
	let (left, right) = union_sides(&h);
	let node = PlanNode::Union(Box::new(UnionNode {
		left,
		right,
		typ: UnionType::All,
		children: vec![],
	}));

	let txn = h.txn();
	let qr = UnionExecutor::new(&node, &txn).execute().await.unwrap();
	let got: Vec<String> = qr.rows.iter().map(|r| r[0].as_str()).collect();
	assert_eq!(got, vec!["1", "2", "3", "3", "4"]);
	txn.finish().await.unwrap();
}

#[tokio::test]
async fn union_rejects_mismatched_arity() {
	let h = Harness::new(2);
	h.fakedb.add_query_pattern_on("fake:1", "select .*", build_result(&["a", "b"], &[&["1", "2"]]));
	h.fakedb.add_query_pattern_on("fake:2", "select .*", build_result(&["a"], &[&["3"]]));
	let left = merge_node(vec![QueryTuple::new("SELECT a, b FROM db.l", "backend1", "")], vec![]);
	let right = merge_node(vec![QueryTuple::new("SELECT a FROM db.r", "backend2", "")], vec![]);
	let node = PlanNode::Union(Box::new(UnionNode {
		left,
		right,
		typ: UnionType::All,
		children: vec![],
	}));

	let txn = h.txn();
	let err = UnionExecutor::new(&node, &txn).execute().await.unwrap_err();
	assert!(matches!(err, ExecutorError::UnionColumnsMismatch));
	txn.finish().await.unwrap();
}

fn join_node(strategy: JoinStrategy, is_left_join: bool) -> PlanNode {
	let left = merge_node(vec![QueryTuple::new("SELECT id, a FROM db.l", "backend1", "")], vec![]);
	let right = merge_node(vec![QueryTuple::new("SELECT id, b FROM db.r", "backend2", "")], vec![]);
	PlanNode::Join(Box::new(JoinNode {
		left,
		right,
		strategy,
		// id, a from the left; b from the right.
		cols: vec![-1, -2, 2],
		join_on: Some((0, 0)),
		vars: std::collections::HashMap::new(),
		left_tmp_cols: vec![],
		right_tmp_cols: vec![],
		is_left_join,
		children: vec![],
	}))
}

#[tokio::test]
async fn sort_merge_join_matches_sorted_streams() {
	let h = Harness::new(2);
	h.fakedb.add_query_pattern_on(
		"fake:1",
		"select .*",
		build_result(&["id", "a"], &[&["1", "a1"], &["2", "a2"], &["3", "a3"]]),
	);
	h.fakedb.add_query_pattern_on(
		"fake:2",
		"select .*",
		build_result(&["id", "b"], &[&["2", "b1"], &["2", "b2"], &["4", "b4"]]),
	);

	let node = join_node(JoinStrategy::SortMerge, false);
	let txn = h.txn();
	let qr = SelectExecutor::new(&node, &txn).execute().await.unwrap();

	let names: Vec<&str> = qr.fields.iter().map(|f| f.name.as_str()).collect();
	assert_eq!(names, vec!["id", "a", "b"]);
	let got: Vec<Vec<String>> =
		qr.rows.iter().map(|r| r.iter().map(|v| v.as_str()).collect()).collect();
	assert_eq!(got, vec![vec!["2", "a2", "b1"], vec!["2", "a2", "b2"]]);
	txn.finish().await.unwrap();
}

#[tokio::test]
async fn left_join_synthesizes_null_rows() {
	let h = Harness::new(2);
	h.fakedb.add_query_pattern_on(
		"fake:1",
		"select .*",
		build_result(&["id", "a"], &[&["1", "a1"], &["2", "a2"]]),
	);
	h.fakedb.add_query_pattern_on(
		"fake:2",
		"select .*",
		build_result(&["id", "b"], &[&["2", "b2"]]),
	);

	let node = join_node(JoinStrategy::SortMerge, true);
	let txn = h.txn();
	let qr = SelectExecutor::new(&node, &txn).execute().await.unwrap();

	assert_eq!(qr.rows.len(), 2);
	assert_eq!(qr.rows[0][0].as_str(), "1");
	assert!(qr.rows[0][2].is_null());
	assert_eq!(qr.rows[1][2].as_str(), "b2");
	txn.finish().await.unwrap();
}

fn wide_result(prefix: &str, n: usize) -> quintette_base::QueryResult {
	let mut qr = quintette_base::QueryResult::with_fields(&["v"]);
	for i in 0..n {
		qr.rows.push(vec![quintette_base::Value::text(&format!("{prefix}{i}"))]);
	}
	qr.rows_affected = n as u64;
	qr
}

#[tokio::test]
async fn cartesian_product_respects_the_row_cap() {
	let h = Harness::new(2);
	h.fakedb.add_query_pattern_on("fake:1", "select .*", wide_result("l", 50));
	h.fakedb.add_query_pattern_on("fake:2", "select .*", wide_result("r", 50));

	let left = merge_node(vec![QueryTuple::new("SELECT v FROM db.l", "backend1", "")], vec![]);
	let right = merge_node(vec![QueryTuple::new("SELECT v FROM db.r", "backend2", "")], vec![]);
	let node = PlanNode::Join(Box::new(JoinNode {
		left,
		right,
		strategy: JoinStrategy::Cartesian,
		cols: vec![-1, 1],
		join_on: None,
		vars: std::collections::HashMap::new(),
		left_tmp_cols: vec![],
		right_tmp_cols: vec![],
		is_left_join: false,
		children: vec![],
	}));

	// 50 x 50 = 2500 rows, fine under the default cap.
	let txn = h.txn();
	txn.set_max_join_rows(32768);
	let qr = SelectExecutor::new(&node, &txn).execute().await.unwrap();
	assert_eq!(qr.rows.len(), 2500);
	txn.finish().await.unwrap();

	// Tightened cap: the query aborts partway.
	let txn = h.txn();
	txn.set_max_join_rows(1000);
	let err = SelectExecutor::new(&node, &txn).execute().await.unwrap_err();
	assert!(matches!(err, ExecutorError::JoinRowLimit(1000)));
	txn.finish().await.unwrap();
}

#[tokio::test]
async fn nest_loop_binds_left_values_into_the_right_side() {
	let h = Harness::new(2);
	h.fakedb.add_query_pattern_on(
		"fake:1",
		"select id, a from db.l",
		build_result(&["id", "a"], &[&["1", "a1"], &["2", "a2"]]),
	);
	h.fakedb.add_query_pattern_on(
		"fake:2",
		"select id, b from db.r where id = 1",
		build_result(&["id", "b"], &[&["1", "b1"]]),
	);
	h.fakedb.add_query_pattern_on(
		"fake:2",
		"select id, b from db.r where id = 2",
		build_result(&["id", "b"], &[]),
	);

	let left = merge_node(vec![QueryTuple::new("SELECT id, a FROM db.l", "backend1", "")], vec![]);
	let right = merge_node(
		vec![QueryTuple::new("SELECT id, b FROM db.r WHERE id = :v1", "backend2", "")],
		vec![],
	);
	let mut vars = std::collections::HashMap::new();
	vars.insert("v1".to_string(), 0usize);
	let node = PlanNode::Join(Box::new(JoinNode {
		left,
		right,
		strategy: JoinStrategy::NestLoop,
		cols: vec![-1, -2, 2],
		join_on: None,
		vars,
		left_tmp_cols: vec![],
		right_tmp_cols: vec![],
		is_left_join: true,
		children: vec![],
	}));

	let txn = h.txn();
	let qr = SelectExecutor::new(&node, &txn).execute().await.unwrap();

	assert_eq!(qr.rows.len(), 2);
	// id=1 matched, id=2 got a synthesized NULL right side.
	assert_eq!(qr.rows[0][2].as_str(), "b1");
	assert!(qr.rows[1][2].is_null());
	assert_eq!(h.fakedb.calls_containing("where id = 1"), 1);
	assert_eq!(h.fakedb.calls_containing("where id = 2"), 1);
	txn.finish().await.unwrap();
}

#[tokio::test]
async fn gather_merge_orders_and_limits_across_shards() {
	let h = Harness::new(2);
	// Each shard returns its rows already sorted.
	h.fakedb.add_query_pattern_on(
		"fake:1",
		"select .*",
		build_result(&["id"], &[&["1"], &["4"], &["9"]]),
	);
	h.fakedb.add_query_pattern_on(
		"fake:2",
		"select .*",
		build_result(&["id"], &[&["2"], &["3"], &["8"]]),
	);

	let node = merge_node(
		vec![
			QueryTuple::new("SELECT id FROM db.t_0000 ORDER BY id ASC LIMIT 4", "backend1", ""),
			QueryTuple::new("SELECT id FROM db.t_0001 ORDER BY id ASC LIMIT 4", "backend2", ""),
		],
		vec![
			ChildPlan::OrderBy(OrderByPlan {
				orders: vec![OrderBySpec { column: "id".to_string(), index: 0, desc: false }],
			}),
			ChildPlan::Limit(LimitPlan { offset: 1, limit: 3 }),
		],
	);

	let txn = h.txn();
	let qr = SelectExecutor::new(&node, &txn).execute().await.unwrap();
	let got: Vec<String> = qr.rows.iter().map(|r| r[0].as_str()).collect();
	assert_eq!(got, vec!["2", "3", "4"]);
	txn.finish().await.unwrap();
}
