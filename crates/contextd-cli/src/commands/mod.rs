//! CLI subcommands.

pub mod listen;
pub mod provide;
