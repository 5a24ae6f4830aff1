//! contextd - context-property broker daemon library.
//!
//! Providers publish raw signal values over one Unix socket; subscribers
//! watch and query properties over another; a closed set of configured
//! rules derives higher-level properties from the raw ones. This crate
//! holds everything the `contextd` binary runs: the line protocol stack,
//! the broker coordinator task, and the connection plumbing. The pure
//! property model lives in `contextd-core`.
//!
//! # Modules
//!
//! - [`protocol`]: line protocol parsing, replies, outbound queues, sockets
//! - [`broker`]: the single coordinator task owning all broker state
//! - [`connection`]: per-connection read/write tasks
//! - [`daemon`]: accept loop and shutdown

pub mod broker;
pub mod connection;
pub mod daemon;
pub mod protocol;
