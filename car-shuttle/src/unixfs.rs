use crate::common::BlockRef;
use cid::Cid;
use prost::Message;

//--------------------------------------------------------------------------------------------------
// Wire types
//--------------------------------------------------------------------------------------------------

/// A DAG-PB node: typed links plus an opaque `Data` payload.
#[derive(Clone, PartialEq, Message)]
pub struct PbNode {
    /// Links to child blocks.
    #[prost(message, repeated, tag = "2")]
    pub links: Vec<PbLink>,
    /// Opaque payload; a [`UnixFsData`] message for every node this crate
    /// produces.
    #[prost(bytes = "vec", optional, tag = "1")]
    pub data: Option<Vec<u8>>,
}

/// One DAG-PB link.
#[derive(Clone, PartialEq, Message)]
pub struct PbLink {
    /// The child's CID bytes.
    #[prost(bytes = "vec", optional, tag = "1")]
    pub hash: Option<Vec<u8>>,
    /// Link name; set for directory entries and synthetic roots, absent on
    /// file inner nodes.
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    /// Cumulative encoded size of the linked sub-DAG.
    #[prost(uint64, optional, tag = "3")]
    pub tsize: Option<u64>,
}

/// The UnixFS `Data` record carried in [`PbNode::data`].
#[derive(Clone, PartialEq, Message)]
pub struct UnixFsData {
    /// Node type tag.
    #[prost(enumeration = "UnixFsType", optional, tag = "1")]
    pub node_type: Option<i32>,
    /// Inlined payload; the link target for symlinks.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: Option<Vec<u8>>,
    /// Total user bytes below this node.
    #[prost(uint64, optional, tag = "3")]
    pub filesize: Option<u64>,
    /// User bytes below each link, in link order. Not packed, matching the
    /// UnixFS proto2 schema.
    #[prost(uint64, repeated, packed = "false", tag = "4")]
    pub blocksizes: Vec<u64>,
}

/// UnixFS node types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum UnixFsType {
    /// Raw bytes.
    Raw = 0,
    /// A directory.
    Directory = 1,
    /// A file.
    File = 2,
    /// Metadata (unused here).
    Metadata = 3,
    /// A symbolic link.
    Symlink = 4,
    /// A sharded directory (unsupported).
    HamtShard = 5,
}

//--------------------------------------------------------------------------------------------------
// Node builders
//--------------------------------------------------------------------------------------------------

/// Build one link.
pub fn link(cid: &Cid, name: Option<String>, tsize: u64) -> PbLink {
    PbLink {
        hash: Some(cid.to_bytes()),
        name,
        tsize: Some(tsize),
    }
}

/// The constant UnixFS payload of a directory node.
pub fn directory_data() -> Vec<u8> {
    UnixFsData {
        node_type: Some(UnixFsType::Directory as i32),
        data: None,
        filesize: None,
        blocksizes: Vec::new(),
    }
    .encode_to_vec()
}

/// Encode a directory node over the given links.
pub fn directory_node(links: &[PbLink]) -> Vec<u8> {
    PbNode {
        links: links.to_vec(),
        data: Some(directory_data()),
    }
    .encode_to_vec()
}

/// Encode a file inner node linking `parts` in order. Links carry no names;
/// the UnixFS payload records the total file size and each part's share.
pub fn file_node(parts: &[BlockRef], filesize: u64) -> Vec<u8> {
    let links = parts
        .iter()
        .map(|part| link(&part.cid, None, part.dag_size))
        .collect();
    let data = UnixFsData {
        node_type: Some(UnixFsType::File as i32),
        data: None,
        filesize: Some(filesize),
        blocksizes: parts.iter().map(|part| part.file_size).collect(),
    }
    .encode_to_vec();
    PbNode {
        links,
        data: Some(data),
    }
    .encode_to_vec()
}

/// Encode a symlink node. The target is carried in the UnixFS payload;
/// the node has no links.
pub fn symlink_node(target: &[u8]) -> Vec<u8> {
    let data = UnixFsData {
        node_type: Some(UnixFsType::Symlink as i32),
        data: Some(target.to_vec()),
        filesize: None,
        blocksizes: Vec::new(),
    }
    .encode_to_vec();
    PbNode {
        links: Vec::new(),
        data: Some(data),
    }
    .encode_to_vec()
}
