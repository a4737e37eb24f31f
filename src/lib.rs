//! Keylimit - Per-key Rate Limiting Core
//!
//! This crate decides whether a unit of work identified by a key (client address,
//! user id, API token) may proceed. Each key gets its own counter, either a token
//! bucket refilled by a background timer or a windowed counter reset lazily as time
//! passes. Counters are created on first use and token buckets that have fully
//! recovered are evicted periodically.

pub mod config;
pub mod error;
pub mod facade;
pub mod ratelimit;
