//! Serializable API types shared by every numio service and client.
//!
//! This crate is transport-agnostic: it knows about HTTP status codes and
//! JSON shapes, but not about any particular server or client. The `axum`
//! feature enables `IntoResponse` impls for servers.

/// Helpers for building `axum` responses.
#[cfg(feature = "axum")]
pub mod axum_helpers;
/// The API error envelope and the stable error taxonomy.
pub mod error;
/// Request / response DTOs for the public HTTP API.
pub mod models;
/// Wire enums and records shared between the API and the domain.
pub mod types;
