//! The raw driver seam.
//!
//! [`DriverConn`] is the narrow surface the backend layer needs from a
//! MySQL client session. The production implementation is
//! [`SqlxConn`] over a plain (non-pooled) sqlx connection driven through
//! the text protocol, because the session-scoped statements the proxy
//! relies on (`XA ...`, `KILL`) are not preparable. Tests substitute
//! [`crate::fakedb`] at the [`Dialer`] seam.

use async_trait::async_trait;
use quintette_base::{Field, QueryResult, Value};
use quintette_config::BackendConfig;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, Connection as _, Either, Row as _};
use tokio::sync::mpsc;

use crate::error::{BackendError, Result};

/// One unit of a streamed result: the field list (once, before any row)
/// or a single row.
#[derive(Debug, Clone)]
pub enum StreamChunk {
	Fields(Vec<Field>),
	Row(Vec<Value>),
}

/// Cumulative byte-count check invoked per fetched row; returning an
/// error aborts the fetch.
pub type MemCheck<'a> = &'a mut (dyn FnMut(usize) -> Result<()> + Send);

/// A raw MySQL client session.
#[async_trait]
pub trait DriverConn: Send {
	/// The id the server assigned in the handshake, as used by `KILL`.
	fn connection_id(&self) -> u32;

	async fn ping(&mut self) -> Result<()>;

	/// Execute `query` and collect the full result, invoking `check`
	/// with the cumulative byte count after each row.
	async fn fetch_all(&mut self, query: &str, check: MemCheck<'_>) -> Result<QueryResult>;

	/// Execute `query` and push chunks into `tx`. A closed receiver is
	/// the stop signal and ends the stream without error.
	async fn stream_fetch(&mut self, query: &str, tx: mpsc::Sender<StreamChunk>) -> Result<()>;

	async fn close(&mut self);

	fn is_closed(&self) -> bool;
}

/// Creates driver sessions for one backend address.
#[async_trait]
pub trait Dialer: Send + Sync {
	async fn dial(&self, conf: &BackendConfig, address: &str) -> Result<Box<dyn DriverConn>>;
}

fn map_sqlx_err(err: sqlx::Error) -> BackendError {
	match err {
		sqlx::Error::Io(_) | sqlx::Error::PoolClosed => BackendError::ServerLost,
		other => BackendError::Mysql(other.to_string()),
	}
}

fn row_values(row: &MySqlRow) -> Result<Vec<Value>> {
	let mut values = Vec::with_capacity(row.len());
	for i in 0..row.len() {
		let cell: Option<String> = row.try_get_unchecked(i).map_err(map_sqlx_err)?;
		values.push(match cell {
			Some(s) => Value::from_bytes(s.into_bytes()),
			None => Value::null(),
		});
	}
	Ok(values)
}

fn row_fields(row: &MySqlRow) -> Vec<Field> {
	row.columns().iter().map(|c| Field::new(c.name())).collect()
}

/// Production driver session over sqlx.
pub struct SqlxConn {
	conn: Option<MySqlConnection>,
	id: u32,
}

#[async_trait]
impl DriverConn for SqlxConn {
	fn connection_id(&self) -> u32 {
		self.id
	}

	async fn ping(&mut self) -> Result<()> {
		match self.conn.as_mut() {
			Some(conn) => conn.ping().await.map_err(map_sqlx_err),
			None => Err(BackendError::ServerLost),
		}
	}

	async fn fetch_all(&mut self, query: &str, check: MemCheck<'_>) -> Result<QueryResult> {
		use futures::StreamExt;

		let conn = self.conn.as_mut().ok_or(BackendError::ServerLost)?;
		let mut qr = QueryResult::new();
		let mut total = 0usize;

		let mut stream = sqlx::raw_sql(query).fetch_many(conn);
		while let Some(item) = stream.next().await {
			match item.map_err(map_sqlx_err)? {
				Either::Left(done) => {
					qr.rows_affected += done.rows_affected();
				}
				Either::Right(row) => {
					if qr.fields.is_empty() {
						qr.fields = row_fields(&row);
					}
					let values = row_values(&row)?;
					total += QueryResult::row_bytes(&values);
					check(total)?;
					qr.rows.push(values);
				}
			}
		}
		Ok(qr)
	}

	async fn stream_fetch(&mut self, query: &str, tx: mpsc::Sender<StreamChunk>) -> Result<()> {
		use futures::StreamExt;

		let conn = self.conn.as_mut().ok_or(BackendError::ServerLost)?;
		let mut sent_fields = false;

		let mut stream = sqlx::raw_sql(query).fetch_many(conn);
		while let Some(item) = stream.next().await {
			match item.map_err(map_sqlx_err)? {
				Either::Left(_) => {}
				Either::Right(row) => {
					if !sent_fields {
						sent_fields = true;
						if tx.send(StreamChunk::Fields(row_fields(&row))).await.is_err() {
							return Ok(());
						}
					}
					let values = row_values(&row)?;
					if tx.send(StreamChunk::Row(values)).await.is_err() {
						return Ok(());
					}
				}
			}
		}
		Ok(())
	}

	async fn close(&mut self) {
		if let Some(conn) = self.conn.take() {
			let _ = conn.close().await;
		}
	}

	fn is_closed(&self) -> bool {
		self.conn.is_none()
	}
}

/// The default dialer: a fresh sqlx connection per call.
#[derive(Debug, Default)]
pub struct SqlxDialer;

#[async_trait]
impl Dialer for SqlxDialer {
	async fn dial(&self, conf: &BackendConfig, address: &str) -> Result<Box<dyn DriverConn>> {
		dial_impl(conf, address).await
	}
}

async fn dial_impl(conf: &BackendConfig, address: &str) -> Result<Box<dyn DriverConn>> {
	use futures::StreamExt;

	let (host, port) = split_address(address)?;
	let mut options = MySqlConnectOptions::new()
		.host(host)
		.port(port)
		.username(&conf.user)
		.password(&conf.password);
	if !conf.db_name.is_empty() {
		options = options.database(&conf.db_name);
	}
	if !conf.charset.is_empty() {
		options = options.charset(&conf.charset);
	}

	let mut conn = MySqlConnection::connect_with(&options).await.map_err(map_sqlx_err)?;

	// The handshake id is what KILL needs later; sqlx does not expose
	// it, so ask the server. `fetch_one` triggers a rustc HRTB
	// limitation when called from inside a boxed async-trait future
	// (https://github.com/launchbadge/sqlx/issues/1540), so walk the
	// `fetch_many` stream (used elsewhere in this file) for the single
	// row instead.
	let mut stream = sqlx::raw_sql("SELECT CONNECTION_ID()").fetch_many(&mut conn);
	let mut row = None;
	while let Some(item) = stream.next().await {
		if let Either::Right(r) = item.map_err(map_sqlx_err)? {
			row = Some(r);
			break;
		}
	}
	drop(stream);
	let row = row.ok_or_else(|| BackendError::Mysql("no row returned for CONNECTION_ID()".into()))?;

	let id: String = row.try_get_unchecked(0).map_err(map_sqlx_err)?;
	let id = id
		.trim()
		.parse::<u32>()
		.map_err(|e| BackendError::Mysql(format!("bad connection id: {e}")))?;

	Ok(Box::new(SqlxConn { conn: Some(conn), id }))
}

fn split_address(address: &str) -> Result<(&str, u16)> {
	let (host, port) = address
		.rsplit_once(':')
		.ok_or_else(|| BackendError::Mysql(format!("malformed backend address '{address}'")))?;
	let port = port
		.parse::<u16>()
		.map_err(|_| BackendError::Mysql(format!("malformed backend address '{address}'")))?;
	Ok((host, port))
}
