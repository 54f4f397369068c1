//! A disk-resident filesystem built on a single balanced tree of items.
//!
//! Every object on the volume (stat data, directory entries, file tails
//! and block pointers) is an item keyed by `(dir_id, object_id, offset,
//! type)` in one tree of formatted nodes. Mutations go through a
//! write-ahead journal so that a crash leaves either the old or the new
//! version of every transaction on disk.
//!
//! * [`primitives`] holds the block devices, the block cache and the journal.
//! * [`storage`] holds keys, items, nodes, the tree balancer, the bitmap
//!   allocator and the superblock.
//! * [`fs`] builds files and directories on top of the tree.
//! * [`admin`] inspects and verifies images offline.

#![warn(missing_docs)]

pub mod admin;
pub mod fs;
pub mod primitives;
pub mod storage;
pub mod types;

pub use fs::{Filesystem, FormatOptions, FsOptions, ObjectRef};
pub use types::{BlockNo, FsError, Result, TransId};
