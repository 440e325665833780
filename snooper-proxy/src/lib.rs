//! Streaming observing reverse proxy for JSON-RPC traffic.
//!
//! # Overview
//!
//! The proxy forwards every inbound HTTP request to a configured upstream
//! and streams the response back with minimal added latency. Both bodies
//! are captured through tee streams and observed asynchronously: decoded,
//! pretty-printed, logged in call order, dispatched to observer modules
//! and fed into the engine-API event pipeline.
//!
//! ```text
//! client ──► proxy ──► tee(request body) ──► upstream
//! upstream ──► tee(response body) ──► client
//!                  │
//!                  └─► observation task: decode → render → modules → events
//! ```
//!
//! The client path never waits on observation work: tee buffers are
//! drained after the primary consumer finishes, and log-line ordering is
//! restored by a ticket-based ordered processor instead of serializing
//! the streams themselves.

pub mod api;
pub mod builtin;
pub mod call;
pub mod cli;
pub mod control;
pub mod error;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod ordered;
pub mod proxy;
pub mod server;
pub mod tee;
pub mod truncate;
