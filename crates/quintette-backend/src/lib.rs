//! Backend layer: everything between the executor and the MySQL wire.
//!
//! The pieces compose bottom-up:
//!
//! - [`driver`]: the raw driver seam (`DriverConn`/`Dialer`), implemented
//!   over sqlx for real backends and by [`fakedb`] for tests;
//! - [`connection::Connection`]: one live MySQL session with kill/timeout
//!   and memory-limit handling;
//! - [`pool::Pool`]: a bounded idle cache of connections per address;
//! - [`scatter::Scatter`]: the registry of all backends, persisted to
//!   `backend.json`;
//! - [`txn::Txn`]: a single logical transaction coordinating XA two-phase
//!   commit across backends;
//! - [`xacheck::XaCheck`]: the persistent retry log for in-doubt XA
//!   branches.

pub mod connection;
pub mod driver;
mod error;
pub mod fakedb;
pub mod pool;
pub mod queryz;
pub mod scatter;
pub mod txn;
pub mod txnmgr;
pub mod txnz;
pub mod xacheck;
pub mod xcontext;

pub use connection::Connection;
pub use error::{BackendError, Result};
pub use pool::{Pool, Poolz};
pub use queryz::Queryz;
pub use scatter::Scatter;
pub use txn::{Txn, TxnState, XaState};
pub use txnmgr::TxnManager;
pub use txnz::Txnz;
pub use xacheck::{XaCheck, XaCommitErr};
pub use xcontext::{QueryTuple, RequestContext, RequestMode, TxnMode};
