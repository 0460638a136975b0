//! Gatekeeper - Distributed Rate Limiting Engine
//!
//! This crate decides in real time whether a request may proceed. Requests are
//! identified by client attributes and checked against an ordered pipeline of
//! rate limiting algorithms (fixed window, sliding window, token bucket). State
//! lives either in process memory or in a shared atomic store (Redis), so
//! several service instances can enforce one limit together. The policy is a
//! versioned document that can be swapped at runtime without a restart.
//!
//! The entry point is [`ratelimit::DistributedRateLimiter`].

pub mod clock;
pub mod config;
pub mod error;
pub mod options;
pub mod ratelimit;
pub mod store;
pub mod sync;
