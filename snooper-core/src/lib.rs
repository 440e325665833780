//! Domain logic for rpc-snooper.
//!
//! This crate holds everything that does not touch a socket on the proxy
//! path: JSON-RPC envelope helpers, the observer module model and its
//! filter engine, the engine-API event pipeline (router, handlers,
//! publisher, sinks), the execution-metadata fetcher and the JWT helper
//! used to authenticate against the Engine API.
//!
//! The network-facing proxy lives in `snooper-proxy` and drives these
//! types from its observation tasks.

pub mod events;
pub mod filter;
pub mod jsonrpc;
pub mod jwt;
pub mod metadata;
pub mod module;

/// Implementation string reported in event client metadata.
pub const IMPLEMENTATION: &str = "rpc-snooper";

/// Module name constant carried in event client metadata.
pub const MODULE_NAME: &str = "RPC_SNOOPER";

/// Build version of the workspace, reported in client metadata and logs.
pub fn build_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
