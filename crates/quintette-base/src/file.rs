//! Atomic meta-file IO.
//!
//! Every persisted catalog (backends, schemas, xa retry log) is written
//! as a whole file: temp file in the same directory, then rename. A
//! `version` file next to the catalogs is bumped after each mutation so
//! peers can detect staleness.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

const VERSION_FILE: &str = "version";

/// Write `data` to `path` atomically (temp file + rename).
pub fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
	let tmp = path.with_extension("tmp");
	{
		let mut f = fs::File::create(&tmp)?;
		f.write_all(data)?;
		f.sync_all()?;
	}
	fs::rename(&tmp, path)
}

/// Append `data` plus a newline to `path`, creating it if missing. Used
/// only for the line-delimited retry-exhaustion record.
pub fn append_file(path: &Path, data: &[u8]) -> io::Result<()> {
	let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
	f.write_all(data)?;
	f.write_all(b"\n")?;
	f.sync_all()
}

/// Read the current catalog version under `dir`; missing means zero.
pub fn read_version(dir: &Path) -> u64 {
	fs::read_to_string(dir.join(VERSION_FILE))
		.ok()
		.and_then(|s| s.trim().parse().ok())
		.unwrap_or(0)
}

/// Bump the catalog version under `dir` and return the new value.
pub fn update_version(dir: &Path) -> io::Result<u64> {
	let next = read_version(dir) + 1;
	write_file(&dir.join(VERSION_FILE), next.to_string().as_bytes())?;
	Ok(next)
}
