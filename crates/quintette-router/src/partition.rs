//! Partition methods and segments.
//!
//! A [`Segment`] is the atomic routing unit: one physical sub-table on
//! one backend covering one key range. A [`Partition`] owns a table's
//! ordered segment vector and answers lookups; there are no back
//! pointers, the router owns everything top-down.

use std::fmt;

use quintette_config::TableConfig;

use crate::hash::{crc64, jump_hash};
use crate::{Result, RouterError};

/// A shard key value as extracted from a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardValue {
	Int(i64),
	Float(f64),
	Str(String),
}

impl ShardValue {
	fn same_type(&self, other: &ShardValue) -> bool {
		std::mem::discriminant(self) == std::mem::discriminant(other)
	}

	/// The canonical text form used by list partitions.
	fn canonical(&self) -> String {
		match self {
			ShardValue::Int(v) => v.to_string(),
			ShardValue::Float(v) => v.to_string(),
			ShardValue::Str(v) => v.clone(),
		}
	}
}

/// The key range one segment covers.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyRange {
	/// `[start, end)` over the hash slot space.
	Hash { start: usize, end: usize },
	/// The exact values this segment holds.
	List(Vec<String>),
	/// Matches everything; the table is replicated per backend.
	Global,
	/// Matches everything; the table lives on one backend.
	Single,
}

impl fmt::Display for KeyRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			KeyRange::Hash { start, end } => write!(f, "[{start}-{end})"),
			KeyRange::List(values) => write!(f, "({})", values.join(",")),
			KeyRange::Global | KeyRange::Single => Ok(()),
		}
	}
}

/// The atomic routing unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
	/// Physical table name, shard suffix included.
	pub table: String,
	/// The backend this segment lives on.
	pub backend: String,
	pub range: KeyRange,
}

/// A table's partition method with its built segment vector.
#[derive(Debug, Clone)]
pub enum Partition {
	Hash(HashPartition),
	List(ListPartition),
	Global(GlobalPartition),
	Single(SinglePartition),
}

impl Partition {
	pub fn segments(&self) -> &[Segment] {
		match self {
			Partition::Hash(p) => &p.segments,
			Partition::List(p) => &p.segments,
			Partition::Global(p) => &p.segments,
			Partition::Single(p) => &p.segments,
		}
	}

	/// Lookup over an inclusive value pair; `None` on either side means
	/// an open interval. Point lookups (start == end) prune to a single
	/// segment for hash and list tables; everything else fans out.
	pub fn lookup(
		&self,
		start: Option<&ShardValue>,
		end: Option<&ShardValue>,
	) -> Result<Vec<Segment>> {
		match self {
			Partition::Hash(p) => p.lookup(start, end),
			Partition::List(p) => p.lookup(start, end),
			Partition::Global(p) => Ok(p.segments.clone()),
			Partition::Single(p) => Ok(p.segments.clone()),
		}
	}
}

/// Jump-consistent-hash partitioning over a fixed slot space.
#[derive(Debug, Clone)]
pub struct HashPartition {
	slots: usize,
	// Sorted by range start; together the ranges partition [0, slots).
	segments: Vec<Segment>,
}

impl HashPartition {
	/// Build and validate from a table config: every range well-formed,
	/// no overlap, the whole slot space covered.
	pub fn build(conf: &TableConfig, slots: usize) -> Result<Self> {
		let mut segments = Vec::with_capacity(conf.partitions.len());
		for part in &conf.partitions {
			let (start, end) = part
				.segment
				.split_once('-')
				.ok_or_else(|| RouterError::MalformedSegment(part.segment.clone()))?;
			let start: usize = start
				.parse()
				.map_err(|_| RouterError::MalformedSegment(part.segment.clone()))?;
			let end: usize = end
				.parse()
				.map_err(|_| RouterError::MalformedSegment(part.segment.clone()))?;
			if end <= start {
				return Err(RouterError::MalformedSegment(part.segment.clone()));
			}
			segments.push(Segment {
				table: part.table.clone(),
				backend: part.backend.clone(),
				range: KeyRange::Hash { start, end },
			});
		}

		segments.sort_by_key(|seg| match seg.range {
			KeyRange::Hash { start, .. } => start,
			_ => 0,
		});

		let mut covered = 0usize;
		for seg in &segments {
			let KeyRange::Hash { start, end } = &seg.range else { unreachable!() };
			if *start < covered {
				return Err(RouterError::OverlappingSegment(*start));
			}
			if *start > covered {
				return Err(RouterError::IncompleteCoverage(covered, slots));
			}
			covered = *end;
		}
		if covered != slots {
			return Err(RouterError::IncompleteCoverage(covered, slots));
		}

		Ok(HashPartition { slots, segments })
	}

	/// The slot a value hashes to. Integers hash their two's-complement
	/// bit pattern, floats their IEEE bit pattern, strings a CRC64
	/// digest.
	pub fn slot_of(&self, value: &ShardValue) -> usize {
		let key = match value {
			ShardValue::Int(v) => *v as u64,
			ShardValue::Float(v) => v.to_bits(),
			ShardValue::Str(v) => crc64(v.as_bytes()),
		};
		jump_hash(key, self.slots)
	}

	fn segment_at(&self, slot: usize) -> Result<Segment> {
		let idx = self
			.segments
			.partition_point(|seg| match seg.range {
				KeyRange::Hash { end, .. } => end <= slot,
				_ => false,
			});
		self.segments
			.get(idx)
			.cloned()
			.ok_or(RouterError::IncompleteCoverage(slot, self.slots))
	}

	fn lookup(&self, start: Option<&ShardValue>, end: Option<&ShardValue>) -> Result<Vec<Segment>> {
		let (start, end) = match (start, end) {
			(Some(start), Some(end)) => (start, end),
			// Open interval: every segment.
			_ => return Ok(self.segments.clone()),
		};
		if !start.same_type(end) {
			return Err(RouterError::KeyTypeMismatch);
		}
		if start == end {
			return Ok(vec![self.segment_at(self.slot_of(start))?]);
		}
		// Range queries fan out.
		Ok(self.segments.clone())
	}
}

/// Exact-value partitioning.
#[derive(Debug, Clone)]
pub struct ListPartition {
	segments: Vec<Segment>,
	// value -> index into segments.
	values: std::collections::HashMap<String, usize>,
}

impl ListPartition {
	pub fn build(conf: &TableConfig) -> Result<Self> {
		let mut segments = Vec::with_capacity(conf.partitions.len());
		let mut values = std::collections::HashMap::new();
		for part in &conf.partitions {
			let list: Vec<String> = part
				.list_value
				.split(',')
				.map(str::trim)
				.filter(|v| !v.is_empty())
				.map(str::to_string)
				.collect();
			if list.is_empty() {
				return Err(RouterError::MalformedSegment(part.list_value.clone()));
			}
			let idx = segments.len();
			for value in &list {
				if values.insert(value.clone(), idx).is_some() {
					return Err(RouterError::MalformedSegment(value.clone()));
				}
			}
			segments.push(Segment {
				table: part.table.clone(),
				backend: part.backend.clone(),
				range: KeyRange::List(list),
			});
		}
		Ok(ListPartition { segments, values })
	}

	fn lookup(&self, start: Option<&ShardValue>, end: Option<&ShardValue>) -> Result<Vec<Segment>> {
		let (start, end) = match (start, end) {
			(Some(start), Some(end)) => (start, end),
			_ => return Ok(self.segments.clone()),
		};
		if !start.same_type(end) {
			return Err(RouterError::KeyTypeMismatch);
		}
		if start == end {
			let value = start.canonical();
			let idx = self
				.values
				.get(&value)
				.ok_or(RouterError::ListValueNotFound(value))?;
			return Ok(vec![self.segments[*idx].clone()]);
		}
		Ok(self.segments.clone())
	}
}

/// One segment per backend; reads go to any copy, writes to all.
#[derive(Debug, Clone)]
pub struct GlobalPartition {
	segments: Vec<Segment>,
}

impl GlobalPartition {
	pub fn build(conf: &TableConfig) -> Result<Self> {
		let segments = conf
			.partitions
			.iter()
			.map(|part| Segment {
				table: part.table.clone(),
				backend: part.backend.clone(),
				range: KeyRange::Global,
			})
			.collect();
		Ok(GlobalPartition { segments })
	}
}

/// The whole table on exactly one backend.
#[derive(Debug, Clone)]
pub struct SinglePartition {
	segments: Vec<Segment>,
}

impl SinglePartition {
	pub fn build(conf: &TableConfig) -> Result<Self> {
		let segments: Vec<Segment> = conf
			.partitions
			.iter()
			.map(|part| Segment {
				table: part.table.clone(),
				backend: part.backend.clone(),
				range: KeyRange::Single,
			})
			.collect();
		Ok(SinglePartition { segments })
	}
}
