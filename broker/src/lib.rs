//! The numio marketplace broker: the thin app layer composing the domain
//! services in `numio-core`, plus the three long-running processes (API
//! server, worker, socket server) behind one CLI.

/// CLI argument parsing and process entry.
pub mod cli;
/// Environment configuration.
pub mod config;
/// Process-wide context: stores, services, clients.
pub mod context;
/// HTTP API server: routes, handlers, middleware.
pub mod server;
/// The WebSocket fan-out server.
pub mod socket;
/// The queue worker process.
pub mod worker;
