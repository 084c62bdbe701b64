use cid::Cid;
use std::path::PathBuf;

/// Scratch file names, created inside [`Config::scratch_dir`].
pub(crate) const SCRATCH_A: &str = ".temp.A.car";
pub(crate) const SCRATCH_B: &str = ".temp.B.car";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Size limits for the packer and uploader.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound on any single block's payload. Files are split into
    /// leaves of this size, and inner nodes grow their fan-out until their
    /// encoding would cross it.
    pub block_target: usize,
    /// Capacity of one scratch chunk. An uploaded CAR never exceeds this
    /// plus its envelope and synthetic root blocks.
    pub car_max_size: u64,
    /// Leaves at or under this many bytes are embedded in their CID with an
    /// identity multihash instead of being written out as blocks.
    pub inline_limit: u64,
    /// Directory in which the two scratch files are created.
    pub scratch_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_target: 1024 * 1024,                                  // 1MiB
            car_max_size: 32 * 1024 * 1024 * 1024 - 128 * 1024 * 1024, // 32GiB minus upload slack
            inline_limit: 32,
            scratch_dir: PathBuf::from("."),
        }
    }
}

/// A block's CID together with size accounting for the sub-DAG below it.
///
/// `file_size` counts the user bytes the sub-DAG represents (what UnixFS
/// `blocksizes` carry); `dag_size` counts the encoded bytes of every block
/// in the sub-DAG (what `PBLink.Tsize` carries).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRef {
    /// Content identifier of the block.
    pub cid: Cid,
    /// User bytes represented by the sub-DAG rooted here.
    pub file_size: u64,
    /// Encoded bytes of all blocks in the sub-DAG rooted here.
    pub dag_size: u64,
}
