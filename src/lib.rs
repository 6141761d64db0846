//! Bucketgate - Multi-Rule Rate Limiter
//!
//! This crate evaluates one or more independent token bucket rules against a
//! subject key (client id, API token, IP address) and decides, through an
//! `ALL`/`ANY` combination policy, whether the subject is over its allowed rate.
//! Bucket state lives behind a compare-and-set store so several limiter
//! instances can share it.

pub mod config;
pub mod error;
pub mod ratelimit;
