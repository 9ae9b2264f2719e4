//! Floodgate - Admission Control and Rate Limiting Engine
//!
//! This crate gates request throughput per endpoint and caller identity
//! across a fleet of processes. Counters live in Redis and are updated by
//! atomic Lua scripts; when Redis cannot answer, an in-process sliding
//! window limiter takes over. A monitor aggregates every decision and raises
//! deduplicated alerts.

pub mod clock;
pub mod config;
pub mod duration;
pub mod error;
pub mod gate;
pub mod monitor;
pub mod ratelimit;
