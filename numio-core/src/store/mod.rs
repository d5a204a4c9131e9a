//! Store implementations.
//!
//! - [`postgres`]: the canonical store on sqlx/Postgres.
//! - [`redis`]: locks, KV cache, rate limits, pub/sub and replay streams.
//! - [`search`] clients live in [`crate::search`].
//! - [`memory`]: a single in-process implementation of every seam trait,
//!   used by unit and scenario tests.

pub mod memory;
pub mod postgres;
pub mod redis;
