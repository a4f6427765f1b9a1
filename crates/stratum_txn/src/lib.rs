//! Concurrency control crate.
//!
//! This crate provides the transaction concurrency core used by
//! stratum_node. The API surface is intentionally small: higher layers supply
//! a `Transport` and a `RedoLog`, then drive transactions through
//! `ConcurrencyCore`.

pub mod txn;
