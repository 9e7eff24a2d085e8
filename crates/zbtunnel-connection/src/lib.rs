//! Connection engine and per-tunnel pool
//!
//! A connection pairs one inbound transport (an accepted socket or the
//! stdio bridge) with an outbound transport stack built hop by hop from the
//! tunnel's chain config. The pool keeps finished chains around for reuse
//! and optionally builds spares ahead of demand.

pub mod connection;
pub mod manager;

pub use connection::{ChainContext, Connection, ConnectionError, ConnectionState, BUFFER_SIZE};
pub use manager::{ConnectionManager, PoolOptions};
