//! Bandwidth-side engines: delta encoding, compression, prefetching,
//! send timing and adaptive level selection.

/// Network/device driven compression level selection.
pub mod adaptive;
/// Checksummed chunking of compressed payloads.
pub mod chunk;
/// Pluggable codec backends.
pub mod codec;
/// Compression with pass-through fallback.
pub mod compression;
/// Field-level delta encoding.
pub mod delta;
/// Operation sequence mining and speculative batch cache.
pub mod prefetch;
/// Network-aware send scheduling.
pub mod timing;
