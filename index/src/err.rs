//! Error types for the index core.

use crate::Revision;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by index construction and lookup.
///
/// The core recovers nothing: any I/O failure, short read, corrupt encoding
/// or structural inconsistency is reported to the caller immediately.  A
/// corrupt index invalidates only the operations that touch it; indexes of
/// other revisions remain usable.
#[derive(Error, Debug)]
pub enum Error {
    /// An underlying I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The index file contains data that cannot be decoded.
    #[error("corrupt index {}: {} at offset 0x{:x}", .file.display(), .reason, .offset)]
    CorruptIndex {
        /// File the corruption was detected in.
        file: PathBuf,
        /// Byte offset of the failed read.
        offset: u64,
        /// Short description of the inconsistency.
        reason: &'static str,
    },

    /// The file ended where more data was required.
    #[error("unexpected end of index file {} at offset 0x{:x}", .file.display(), .offset)]
    UnexpectedEof {
        /// File the read was issued against.
        file: PathBuf,
        /// Byte offset of the failed read.
        offset: u64,
    },

    /// The revision lies outside the range covered by the queried index.
    #[error("revision {revision} not covered by item index")]
    RevisionNotCovered {
        /// The revision that was queried.
        revision: Revision,
    },

    /// The item index exceeds the number of entries indexed for the revision.
    #[error("item index {item_index} too large in revision {revision}")]
    ItemIndexOverflow {
        /// The revision that was queried.
        revision: Revision,
        /// The out-of-range item index.
        item_index: u64,
    },

    /// The file offset lies beyond the range indexed by the phys-to-log index.
    #[error("offset 0x{offset:x} too large in revision {revision}")]
    OffsetTooLarge {
        /// The revision that was queried.
        revision: Revision,
        /// The out-of-range file offset.
        offset: u64,
    },

    /// A proto-index entry violates the builder's input contract.
    #[error("invalid proto-index entry: {0}")]
    InvalidProtoEntry(String),
}

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
