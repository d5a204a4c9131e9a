//! Structured concurrency utilities shared by all numio processes.

/// In-process broadcast bus for observing events from a producer.
pub mod events_bus;
/// At-most-once notification channel, used for shutdown signals.
pub mod notify_once;
/// Named, panic-propagating task handles.
pub mod task;

/// Default channel capacity for bounded channels.
pub const DEFAULT_CHANNEL_SIZE: usize = 256;
