//! HTTP plumbing for numio services: a REST client for internal and
//! upstream calls, axum server scaffolding, and the auth primitives
//! (bearer JWT, CSRF double-submit) consumed by the API server.

/// Bearer JWT (HS256) and CSRF double-submit verification.
pub mod auth;
/// A reqwest wrapper conforming to the numio error envelope.
pub mod rest;
/// Axum server scaffolding: layers, extractors, graceful shutdown.
pub mod server;
/// Request trace / correlation ids.
pub mod trace;
