//! Warden - Rate Limiting Decision Engine
//!
//! This crate decides whether a request identified by user, IP, endpoint and
//! resource should be admitted under a set of declarative policies. Each
//! policy selects one of four algorithms (fixed window, sliding window,
//! token bucket, adaptive) and counters live in a pluggable store that
//! applies updates atomically per key.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod service;
