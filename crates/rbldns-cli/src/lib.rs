//! # rbldns-cli
//!
//! The `rbldnsd` daemon: command-line and config file handling around the
//! `rbldns-srv` request loop.

pub mod cli;

pub use cli::run;
