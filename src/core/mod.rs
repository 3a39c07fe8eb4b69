//! Durable, priority-ordered operation queue.

/// Offline operation queue with retry and capacity eviction.
pub mod queue;
