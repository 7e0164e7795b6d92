//! Queue worker library crate.
//!
//! # Purpose
//! Consumes asynchronous invocation requests from a durable queue group,
//! calls the named function over HTTP and reports each outcome to the gateway.
//! The binary wires these pieces together; integration tests drive them
//! against the in-memory broker.
//!
//! # Flow
//! `consumer` pulls one delivery at a time and hands it to `dispatch`, which
//! calls the function resolved by `resolver` and posts a completion through
//! `report`. `lifecycle` owns subscribe, drain and release.
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod errors;
pub mod lifecycle;
pub mod observability;
pub mod report;
pub mod resolver;
pub mod signals;
pub mod transport;

#[cfg(test)]
mod test_support;
