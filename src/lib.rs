//! Quintette: a distributed MySQL proxy core.
//!
//! One MySQL-compatible endpoint in front of a fleet of MySQL backends:
//! the router maps logical tables onto physical segments, the scatter
//! multiplexes pooled connections across the fleet, the transaction
//! layer coordinates multi-shard writes as crash-recoverable XA
//! two-phase commits, and the executor parallelizes per-shard queries
//! with bounded-memory joins, merges and aggregate rewrites.
//!
//! This facade re-exports the workspace crates under their subsystem
//! names; the wire protocol front-end, SQL parser and admin surface
//! live outside this workspace and consume these APIs.

pub use quintette_backend as backend;
pub use quintette_base as base;
pub use quintette_config as config;
pub use quintette_executor as executor;
pub use quintette_planner as planner;
pub use quintette_proxy as proxy;
pub use quintette_router as router;

pub use quintette_backend::{Scatter, Txn, TxnManager, XaCheck};
pub use quintette_config::Config;
pub use quintette_proxy::Proxy;
pub use quintette_router::Router;
