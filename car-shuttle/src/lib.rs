#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_debug_implementations, missing_docs, rust_2018_idioms)]
#![deny(unreachable_pub)]

//! car-shuttle
//!
//! Packs a filesystem subtree (regular files, directories, symlinks) into
//! size-bounded CAR v1 chunks under the UnixFS data model and hands each
//! chunk to a [`CarSink`](crate::send::CarSink).
//!
//! Block payloads never pass through user space: leaves are spliced from the
//! source file straight into a reverse-filled scratch file with
//! `copy_file_range`, and the CAR envelope is prepended at upload time. Two
//! scratch files alternate between the packer and the upload worker so block
//! production overlaps with the HTTP transfer.

/// Test utilities.
#[cfg(any(test, feature = "test_utils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test_utils")))]
pub mod test_utils;

/// Block framing, CID construction and the CAR v1 envelope.
pub mod codec;

/// Shared configuration and block bookkeeping types.
pub mod common;

/// Error types raised by this crate.
pub mod error;

/// Filesystem traversal and chunk assembly.
pub mod pack;

/// Reverse-filled scratch files.
pub mod scratch;

/// The upload worker and the sink seam.
pub mod send;

/// DAG-PB and UnixFS node encoding.
pub mod unixfs;

pub use crate::{
    common::{BlockRef, Config},
    error::Error,
    pack::pack_tree,
    send::CarSink,
};
