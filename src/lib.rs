//! Tollgate - per-key rate limiting
//!
//! This crate implements admission control keyed by client identity. Each key
//! gets its own token bucket, created lazily on first sight and evicted by a
//! background sweeper once the key goes idle. A tower layer wires the
//! registry into HTTP services.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod web;
