#![forbid(unsafe_code)]

//! Offline administration of filesystem images.
//!
//! These functions open an image file directly, without mounting it, so
//! they can inspect a volume whose tree is damaged or whose journal still
//! holds transactions that were never replayed.

mod dump;
mod error;
mod stats;
mod util;
mod verify;

/// Block and tree dumps.
///
/// Decodes single blocks or every reachable node into serializable views.
pub use dump::{dump_block, dump_tree, BlockDetail, BlockDump, ItemDump};

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Statistics collection and reporting.
///
/// Reports geometry, space usage, tree shape and journal position.
pub use stats::{stats, ImageSection, JournalSection, SpaceSection, StatsReport, TreeSection};

/// Helpers for opening images.
pub use util::{open_fs, open_raw, RawImage};

/// Image integrity verification.
///
/// Checks the superblock, journal header and bitmap, and at the full level
/// every node, item and object in the tree.
pub use verify::{
    verify, verify_device, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity,
};
