//! Plan building against a routed catalog: shard pruning, fan-out,
//! aggregate rewrite, and strategy selection.

use quintette_backend::xcontext::TxnMode;
use quintette_config::RouterConfig;
use quintette_planner::{
	build_delete_plan, build_insert_plan, build_join_plan, build_select_plan, build_union_plan,
	AggrFunc, ChildPlan, DmlStatement, JoinColumn, JoinStatement, JoinStrategy, KeyFilter, Limit,
	OrderBy, PlanNode, PlanType, PlannerError, SelectExpr, SelectStatement, UnionStatement,
	UnionType,
};
use quintette_router::{Router, ShardValue};

// Three coarse shards over the 4096-slot space, as a rebalanced
// production table would look.
fn three_shard_router(dir: &tempfile::TempDir) -> Router {
	std::fs::create_dir_all(dir.path().join("sbtest")).unwrap();
	let conf = r#"{
		"name": "t1",
		"shardtype": "HASH",
		"shardkey": "id",
		"partitions": [
			{"table": "t1_0000", "segment": "0-1365", "backend": "b0"},
			{"table": "t1_0001", "segment": "1365-2730", "backend": "b1"},
			{"table": "t1_0002", "segment": "2730-4096", "backend": "b2"}
		]
	}"#;
	std::fs::write(dir.path().join("sbtest/t1.json"), conf).unwrap();
	let router = Router::new(dir.path(), &RouterConfig::default());
	router.load_config().unwrap();
	router
}

fn star_select(key: KeyFilter) -> SelectStatement {
	SelectStatement {
		exprs: vec![SelectExpr::Raw("*".to_string())],
		where_sql: Some("id = 42".to_string()),
		key,
		..SelectStatement::new("sbtest", "t1")
	}
}

#[test]
fn point_query_prunes_to_one_shard() {
	let dir = tempfile::tempdir().unwrap();
	let router = three_shard_router(&dir);

	// jump_hash(42, 4096) == 571, inside [0, 1365) on b0.
	let stmt = star_select(KeyFilter::Point(ShardValue::Int(42)));
	let plan = build_select_plan(&router, &stmt).unwrap();
	let querys = plan.get_query();
	assert_eq!(querys.len(), 1);
	assert_eq!(querys[0].backend, "b0");
	assert_eq!(querys[0].query, "SELECT * FROM sbtest.t1_0000 WHERE id = 42");
	assert_eq!(querys[0].range, "[0-1365)");
}

#[test]
fn range_query_fans_out_to_every_shard() {
	let dir = tempfile::tempdir().unwrap();
	let router = three_shard_router(&dir);

	let mut stmt = star_select(KeyFilter::Range(Some(ShardValue::Int(0)), None));
	stmt.where_sql = Some("id > 0".to_string());
	let plan = build_select_plan(&router, &stmt).unwrap();
	let querys = plan.get_query();
	assert_eq!(querys.len(), 3);
	let backends: Vec<&str> = querys.iter().map(|q| q.backend.as_str()).collect();
	assert_eq!(backends, vec!["b0", "b1", "b2"]);
}

#[test]
fn avg_rewrites_to_sum_and_count() {
	let dir = tempfile::tempdir().unwrap();
	let router = three_shard_router(&dir);

	let stmt = SelectStatement {
		exprs: vec![SelectExpr::Aggregate { func: AggrFunc::Avg, column: "x".to_string() }],
		..SelectStatement::new("sbtest", "t1")
	};
	let plan = build_select_plan(&router, &stmt).unwrap();
	let querys = plan.get_query();
	assert_eq!(querys.len(), 3);
	assert_eq!(
		querys[0].query,
		"SELECT SUM(x) AS `avg(x)`, COUNT(x) FROM sbtest.t1_0000"
	);

	let PlanNode::Merge(node) = &plan else { panic!("expected merge node") };
	let [ChildPlan::Aggregate(aggregate)] = &node.children[..] else {
		panic!("expected a lone aggregate child")
	};
	assert_eq!(aggregate.aggrs.len(), 1);
	assert_eq!(aggregate.remove_idxs, vec![1]);
}

#[test]
fn single_route_pushes_the_query_untouched() {
	let dir = tempfile::tempdir().unwrap();
	let router = three_shard_router(&dir);

	let stmt = SelectStatement {
		exprs: vec![SelectExpr::Aggregate { func: AggrFunc::Avg, column: "x".to_string() }],
		where_sql: Some("id = 42".to_string()),
		key: KeyFilter::Point(ShardValue::Int(42)),
		limit: Some(Limit { offset: 2, count: 3 }),
		..SelectStatement::new("sbtest", "t1")
	};
	let plan = build_select_plan(&router, &stmt).unwrap();
	let querys = plan.get_query();
	assert_eq!(querys.len(), 1);
	assert_eq!(
		querys[0].query,
		"SELECT AVG(x) FROM sbtest.t1_0000 WHERE id = 42 LIMIT 2, 3"
	);
	assert!(plan.children().is_empty());
}

#[test]
fn limit_and_order_push_down_with_local_recut() {
	let dir = tempfile::tempdir().unwrap();
	let router = three_shard_router(&dir);

	let stmt = SelectStatement {
		exprs: vec![SelectExpr::Column("id".to_string())],
		order_by: vec![OrderBy { column: "id".to_string(), desc: true }],
		limit: Some(Limit { offset: 2, count: 3 }),
		..SelectStatement::new("sbtest", "t1")
	};
	let plan = build_select_plan(&router, &stmt).unwrap();
	let querys = plan.get_query();
	// The shard cannot know the global offset: push the widened window.
	assert_eq!(querys[0].query, "SELECT id FROM sbtest.t1_0000 ORDER BY id DESC LIMIT 5");

	let children = plan.children();
	assert_eq!(children.len(), 2);
	let ChildPlan::OrderBy(order) = &children[0] else { panic!("want orderby first") };
	assert_eq!(order.orders[0].index, 0);
	assert!(order.orders[0].desc);
	let ChildPlan::Limit(limit) = &children[1] else { panic!("want limit second") };
	assert_eq!((limit.offset, limit.limit), (2, 3));
}

#[test]
fn unknown_order_column_is_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let router = three_shard_router(&dir);

	let stmt = SelectStatement {
		exprs: vec![SelectExpr::Column("id".to_string())],
		order_by: vec![OrderBy { column: "ghost".to_string(), desc: false }],
		..SelectStatement::new("sbtest", "t1")
	};
	assert!(matches!(
		build_select_plan(&router, &stmt),
		Err(PlannerError::OrderColumnNotFound(_))
	));
}

fn join_sides() -> (SelectStatement, SelectStatement) {
	let left = SelectStatement {
		exprs: vec![SelectExpr::Column("id".to_string()), SelectExpr::Column("a".to_string())],
		..SelectStatement::new("sbtest", "t1")
	};
	let right = SelectStatement {
		exprs: vec![SelectExpr::Column("id".to_string()), SelectExpr::Column("b".to_string())],
		..SelectStatement::new("sbtest", "t1")
	};
	(left, right)
}

#[test]
fn join_strategy_selection() {
	let dir = tempfile::tempdir().unwrap();
	let router = three_shard_router(&dir);
	let (left, right) = join_sides();

	let mut stmt = JoinStatement {
		left,
		right,
		join_on: Some(("id".to_string(), "id".to_string())),
		is_left_join: false,
		bind_vars: std::collections::HashMap::new(),
		projection: vec![
			JoinColumn::Left("a".to_string()),
			JoinColumn::Right("b".to_string()),
		],
		left_filter_cols: vec![],
		right_null_cols: vec![],
	};

	let plan = build_join_plan(&router, &stmt).unwrap();
	let PlanNode::Join(join) = &plan else { panic!("expected join") };
	assert_eq!(join.strategy, JoinStrategy::SortMerge);
	// a is left[1], b is right[1]: signed projection.
	assert_eq!(join.cols, vec![-2, 2]);
	assert_eq!(join.join_on, Some((0, 0)));
	// Sort-merge pushed ORDER BY onto both sides.
	let left_sql = &join.left.get_query()[0].query;
	assert!(left_sql.contains("ORDER BY id ASC"), "got {left_sql}");

	// No key: cartesian.
	stmt.join_on = None;
	let plan = build_join_plan(&router, &stmt).unwrap();
	let PlanNode::Join(join) = &plan else { panic!() };
	assert_eq!(join.strategy, JoinStrategy::Cartesian);

	// Bind vars: nested loop driven by the left side.
	stmt.bind_vars.insert("v1".to_string(), "id".to_string());
	let plan = build_join_plan(&router, &stmt).unwrap();
	let PlanNode::Join(join) = &plan else { panic!() };
	assert_eq!(join.strategy, JoinStrategy::NestLoop);
	assert_eq!(join.vars.get("v1"), Some(&0));
}

#[test]
fn union_requires_equal_arity() {
	let dir = tempfile::tempdir().unwrap();
	let router = three_shard_router(&dir);
	let (left, mut right) = join_sides();
	right.exprs.pop();

	let stmt = UnionStatement {
		left: left.clone(),
		right,
		typ: UnionType::Distinct,
		order_by: vec![],
		limit: None,
	};
	assert!(matches!(
		build_union_plan(&router, &stmt),
		Err(PlannerError::UnionColumnsMismatch)
	));

	let (_, right) = join_sides();
	let stmt = UnionStatement {
		left,
		right,
		typ: UnionType::All,
		order_by: vec![],
		limit: None,
	};
	let plan = build_union_plan(&router, &stmt).unwrap();
	assert_eq!(plan.get_query().len(), 6);
}

#[test]
fn insert_requires_the_shard_key() {
	let dir = tempfile::tempdir().unwrap();
	let router = three_shard_router(&dir);

	let stmt = DmlStatement {
		db: "sbtest".to_string(),
		table: "t1".to_string(),
		sql: "INSERT INTO t1(id, a) VALUES (42, 1)".to_string(),
		key: KeyFilter::Point(ShardValue::Int(42)),
	};
	let plan = build_insert_plan(&router, &stmt).unwrap();
	assert_eq!(plan.typ, PlanType::Insert);
	assert_eq!(plan.req.txn_mode, TxnMode::Write);
	assert_eq!(plan.req.querys.len(), 1);
	assert_eq!(plan.req.querys[0].backend, "b0");
	assert_eq!(
		plan.req.querys[0].query,
		"INSERT INTO sbtest.t1_0000(id, a) VALUES (42, 1)"
	);

	let keyless = DmlStatement { key: KeyFilter::All, ..stmt };
	assert!(build_insert_plan(&router, &keyless).is_err());
}

#[test]
fn delete_prunes_or_fans_out() {
	let dir = tempfile::tempdir().unwrap();
	let router = three_shard_router(&dir);

	let stmt = DmlStatement {
		db: "sbtest".to_string(),
		table: "t1".to_string(),
		sql: "DELETE FROM t1 WHERE id = 42".to_string(),
		key: KeyFilter::Point(ShardValue::Int(42)),
	};
	let plan = build_delete_plan(&router, &stmt).unwrap();
	assert_eq!(plan.req.querys.len(), 1);

	let full = DmlStatement {
		sql: "DELETE FROM t1".to_string(),
		key: KeyFilter::All,
		..stmt
	};
	let plan = build_delete_plan(&router, &full).unwrap();
	assert_eq!(plan.typ, PlanType::Delete);
	assert_eq!(plan.req.querys.len(), 3);
	assert_eq!(plan.req.querys[2].query, "DELETE FROM sbtest.t1_0002");
}
