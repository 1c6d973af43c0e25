//! Textual result model.
//!
//! The proxy talks to its backends over the MySQL text protocol, so every
//! cell arrives as an optional byte string. Results from several shards
//! are merged cell-by-cell by the executor, which is why the model is
//! owned data rather than borrowed driver rows.

use std::cmp::Ordering;

/// One cell of a result row: `NULL` or raw bytes as sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Value(Option<Vec<u8>>);

impl Value {
	/// The SQL `NULL` value.
	pub fn null() -> Self {
		Value(None)
	}

	/// A value from raw protocol bytes.
	pub fn from_bytes(raw: Vec<u8>) -> Self {
		Value(Some(raw))
	}

	/// A value from text, the common case in tests and fakes.
	pub fn text(s: &str) -> Self {
		Value(Some(s.as_bytes().to_vec()))
	}

	pub fn is_null(&self) -> bool {
		self.0.is_none()
	}

	/// Raw bytes; empty for `NULL`.
	pub fn raw(&self) -> &[u8] {
		self.0.as_deref().unwrap_or(&[])
	}

	pub fn len(&self) -> usize {
		self.raw().len()
	}

	pub fn is_empty(&self) -> bool {
		self.raw().is_empty()
	}

	pub fn as_str(&self) -> String {
		String::from_utf8_lossy(self.raw()).into_owned()
	}

	pub fn to_i64(&self) -> Option<i64> {
		self.as_str().trim().parse().ok()
	}

	pub fn to_u64(&self) -> Option<u64> {
		self.as_str().trim().parse().ok()
	}

	pub fn to_f64(&self) -> Option<f64> {
		self.as_str().trim().parse().ok()
	}

	/// Truthiness in the MySQL sense: non-NULL and numerically non-zero.
	pub fn to_bool(&self) -> bool {
		match &self.0 {
			None => false,
			Some(_) => self.to_f64().map(|f| f != 0.0).unwrap_or(!self.is_empty()),
		}
	}
}

/// Compare two values the way the merge operators need: numerically when
/// both sides parse as numbers, bytewise otherwise. `NULL` sorts first.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
	match (a.is_null(), b.is_null()) {
		(true, true) => return Ordering::Equal,
		(true, false) => return Ordering::Less,
		(false, true) => return Ordering::Greater,
		(false, false) => {}
	}
	if let (Some(x), Some(y)) = (a.to_f64(), b.to_f64()) {
		return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
	}
	a.raw().cmp(b.raw())
}

/// Column metadata. The text protocol carries more than the proxy needs;
/// only the name survives the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
	pub name: String,
}

impl Field {
	pub fn new(name: &str) -> Self {
		Field { name: name.to_string() }
	}
}

/// A complete result set, possibly merged from several shards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
	pub fields: Vec<Field>,
	pub rows: Vec<Vec<Value>>,
	pub rows_affected: u64,
}

impl QueryResult {
	pub fn new() -> Self {
		QueryResult::default()
	}

	pub fn with_fields(names: &[&str]) -> Self {
		QueryResult {
			fields: names.iter().map(|n| Field::new(n)).collect(),
			..QueryResult::default()
		}
	}

	/// Merge another shard's result into this one. Fields are taken from
	/// the first non-empty result; rows concatenate and affected counts
	/// add up.
	pub fn append(&mut self, other: QueryResult) {
		if self.fields.is_empty() {
			self.fields = other.fields;
		}
		self.rows_affected += other.rows_affected;
		self.rows.extend(other.rows);
	}

	/// Keep `count` rows starting at `offset`, dropping the rest.
	pub fn limit(&mut self, offset: usize, count: usize) {
		if offset >= self.rows.len() {
			self.rows.clear();
		} else {
			self.rows.drain(..offset);
			self.rows.truncate(count);
		}
	}

	/// Stable sort by the given `(column, descending)` keys.
	pub fn sort_by(&mut self, keys: &[(usize, bool)]) {
		self.rows.sort_by(|a, b| {
			for &(idx, desc) in keys {
				let ord = cmp_values(&a[idx], &b[idx]);
				let ord = if desc { ord.reverse() } else { ord };
				if ord != Ordering::Equal {
					return ord;
				}
			}
			Ordering::Equal
		});
	}

	/// Approximate wire size of one row, used by memory accounting and
	/// the stream batcher.
	pub fn row_bytes(row: &[Value]) -> usize {
		row.iter().map(Value::len).sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn value_parsing() {
		assert_eq!(Value::text("42").to_i64(), Some(42));
		assert_eq!(Value::text("3.5").to_f64(), Some(3.5));
		assert_eq!(Value::text("abc").to_i64(), None);
		assert!(Value::null().is_null());
		assert!(!Value::null().to_bool());
		assert!(Value::text("1").to_bool());
		assert!(!Value::text("0").to_bool());
	}

	#[test]
	fn value_ordering() {
		assert_eq!(cmp_values(&Value::text("9"), &Value::text("10")), Ordering::Less);
		assert_eq!(cmp_values(&Value::text("b"), &Value::text("a")), Ordering::Greater);
		assert_eq!(cmp_values(&Value::null(), &Value::text("a")), Ordering::Less);
	}

	#[test]
	fn result_append_and_limit() {
		let mut qr = QueryResult::new();
		let mut shard = QueryResult::with_fields(&["id"]);
		shard.rows = vec![vec![Value::text("1")], vec![Value::text("2")]];
		shard.rows_affected = 2;
		qr.append(shard);

		let mut shard2 = QueryResult::with_fields(&["id"]);
		shard2.rows = vec![vec![Value::text("3")]];
		shard2.rows_affected = 1;
		qr.append(shard2);

		assert_eq!(qr.fields.len(), 1);
		assert_eq!(qr.rows.len(), 3);
		assert_eq!(qr.rows_affected, 3);

		qr.limit(1, 1);
		assert_eq!(qr.rows, vec![vec![Value::text("2")]]);
	}

	#[test]
	fn result_sort() {
		let mut qr = QueryResult::with_fields(&["a"]);
		qr.rows = vec![
			vec![Value::text("3")],
			vec![Value::text("1")],
			vec![Value::text("2")],
		];
		qr.sort_by(&[(0, false)]);
		let got: Vec<String> = qr.rows.iter().map(|r| r[0].as_str()).collect();
		assert_eq!(got, vec!["1", "2", "3"]);

		qr.sort_by(&[(0, true)]);
		let got: Vec<String> = qr.rows.iter().map(|r| r[0].as_str()).collect();
		assert_eq!(got, vec!["3", "2", "1"]);
	}
}
