//! Core logic for the contextd context-property broker.
//!
//! Everything in this crate is synchronous and I/O-free; the daemon crate
//! wraps it in a single coordinator task and feeds it protocol traffic.
//!
//! # Modules
//!
//! - [`value`]: typed property values and their wire rendering
//! - [`store`]: the authoritative property table (types, owners, revisions)
//! - [`rules`]: derivation rules and the recomputation engine
//! - [`registry`]: subscription bookkeeping
//! - [`config`]: TOML configuration with validation

pub mod config;
pub mod registry;
pub mod rules;
pub mod store;
pub mod value;
