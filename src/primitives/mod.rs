//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, block devices, the block cache and the
//! write-ahead journal.

/// Byte-level utilities and encoding/decoding.
pub mod bytes;

/// Block cache with pin counts and dirty tracking.
pub mod cache;

/// File and block device abstractions.
pub mod io;

/// Write-ahead journal for crash recovery.
///
/// Every metadata and data block is logged before it reaches its home location.
pub mod journal;
