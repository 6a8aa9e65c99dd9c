//! Daemon internals behind the `mirage` binary, split out so integration
//! tests can drive both endpoints in-process.

pub mod client;
pub mod config;
pub mod opt;
pub mod server;
