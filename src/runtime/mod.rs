//! Queue events and the background persistence task.

/// Queue event types and listeners.
pub mod events;
/// Debounced async queue saver.
pub mod saver;
