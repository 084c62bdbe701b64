use std::{collections::TryReserveError, io, path::PathBuf};

/// Errors raised while packing or uploading.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A scratch file could not be created. Both scratch files live in
    /// `Config::scratch_dir` and are opened read-write with mode 0o600.
    #[error("creating scratch file {}: {source}", .path.display())]
    Scratch {
        /// Path of the scratch file.
        path: PathBuf,
        /// The underlying failure.
        source: io::Error,
    },

    /// A filesystem operation on a user-supplied path failed during
    /// traversal.
    #[error("{op} {}: {source}", .path.display())]
    Traversal {
        /// The operation that failed (`stat`, `readdir`, `readlink`, `open`, `read`).
        op: &'static str,
        /// The path the operation was applied to.
        path: PathBuf,
        /// The underlying failure.
        source: io::Error,
    },

    /// A directory's encoding crossed the block target. Sharded (HAMT)
    /// directories use a different DAG layout and are not supported.
    #[error(
        "directory {} encodes to {encoded} bytes, over the {block_target} byte block target; \
         sharding directories is unsupported",
        .path.display()
    )]
    UnshardableDirectory {
        /// The offending directory.
        path: PathBuf,
        /// Encoded size of its DAG-PB node.
        encoded: usize,
        /// The configured block target.
        block_target: usize,
    },

    /// A single block would not fit even a freshly reset chunk. Raised only
    /// when `car_max_size` is configured smaller than one framed block.
    #[error("a {size} byte block cannot fit an empty {capacity} byte CAR chunk")]
    OversizedBlock {
        /// Framed size of the block.
        size: u64,
        /// Configured chunk capacity.
        capacity: u64,
    },

    /// Writing, splicing, syncing or reading back a scratch chunk failed.
    #[error("CAR chunk I/O: {source}")]
    ChunkIo {
        /// The underlying failure.
        source: io::Error,
    },

    /// Encoding the CAR header CBOR failed.
    #[error("encoding CAR header: {0}")]
    HeaderEncoding(#[from] serde_ipld_dagcbor::EncodeError<TryReserveError>),

    /// Building a multihash failed, i.e. a digest exceeded the 64 byte
    /// multihash table.
    #[error("building multihash: {0}")]
    Multihash(#[from] multihash::Error),

    /// The sink rejected or failed to transmit a CAR chunk.
    #[error("posting CAR chunk: {0}")]
    Sink(anyhow::Error),

    /// The upload worker went away while the packer still needed it. The
    /// worker's own error carries the root cause.
    #[error("upload worker stopped unexpectedly")]
    WorkerStopped,
}

impl Error {
    pub(crate) fn chunk_io(source: io::Error) -> Self {
        Error::ChunkIo { source }
    }
}
