use crate::{
    codec::{CarHeader, DAG_PB_CODEC, RAW_CODEC},
    unixfs::{PbNode, UnixFsData, UnixFsType},
};
use anyhow::{anyhow, bail, Context, Result};
use cid::Cid;
use prost::Message;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};

/// A parsed CAR v1 stream.
#[derive(Clone, Debug)]
pub struct DecodedCar {
    /// The single root the header names.
    pub root: Cid,
    /// Framed blocks in stream order, as `(cid, payload)`.
    pub blocks: Vec<(Cid, Vec<u8>)>,
}

/// Parse a CAR v1 byte stream back into its header root and blocks.
pub fn decode_car(bytes: &[u8]) -> Result<DecodedCar> {
    let (header_len, rest) = unsigned_varint::decode::u64(bytes)?;
    let header: CarHeader = serde_ipld_dagcbor::from_slice(&rest[..header_len as usize])?;
    if header.version != 1 {
        bail!("unexpected CAR version {}", header.version);
    }
    let root = *header.roots.first().context("CAR header names no roots")?;

    let mut blocks = Vec::new();
    let mut rest = &rest[header_len as usize..];
    while !rest.is_empty() {
        let (frame_len, after) = unsigned_varint::decode::u64(rest)?;
        let frame = &after[..frame_len as usize];
        let cid = Cid::read_bytes(frame)?;
        let payload = frame[cid.encoded_len()..].to_vec();
        if cid.hash().code() == 0x12 && cid.hash().digest() != Sha256::digest(&payload).as_slice() {
            bail!("block {cid} does not hash to its CID");
        }
        blocks.push((cid, payload));
        rest = &after[frame_len as usize..];
    }

    Ok(DecodedCar { root, blocks })
}

/// Index every block of every CAR by CID.
pub fn block_map(cars: &[Vec<u8>]) -> Result<HashMap<Cid, Vec<u8>>> {
    let mut map = HashMap::new();
    for car in cars {
        for (cid, payload) in decode_car(car)?.blocks {
            map.insert(cid, payload);
        }
    }
    Ok(map)
}

/// A block's payload, resolving identity CIDs from the CID itself.
pub fn block_payload(cid: &Cid, blocks: &HashMap<Cid, Vec<u8>>) -> Result<Vec<u8>> {
    if cid.hash().code() == 0 {
        return Ok(cid.hash().digest().to_vec());
    }
    blocks
        .get(cid)
        .cloned()
        .ok_or_else(|| anyhow!("block {cid} missing"))
}

/// Reassemble the user bytes below `cid` by walking raw leaves and file
/// inner nodes.
pub fn read_file_bytes(cid: &Cid, blocks: &HashMap<Cid, Vec<u8>>) -> Result<Vec<u8>> {
    let payload = block_payload(cid, blocks)?;
    if cid.codec() == RAW_CODEC {
        return Ok(payload);
    }

    let node = PbNode::decode(payload.as_slice())?;
    let data = UnixFsData::decode(node.data.context("node without unixfs payload")?.as_slice())?;
    if data.node_type != Some(UnixFsType::File as i32) {
        bail!("expected a file node, found type {:?}", data.node_type);
    }

    let mut out = Vec::new();
    for link in &node.links {
        let child = Cid::try_from(link.hash.clone().context("link without hash")?)?;
        out.extend_from_slice(&read_file_bytes(&child, blocks)?);
    }
    Ok(out)
}

/// Named entries of a directory node, in link order.
pub fn dir_entries(cid: &Cid, blocks: &HashMap<Cid, Vec<u8>>) -> Result<Vec<(String, Cid)>> {
    let payload = block_payload(cid, blocks)?;
    let node = PbNode::decode(payload.as_slice())?;
    let data = UnixFsData::decode(node.data.context("node without unixfs payload")?.as_slice())?;
    if data.node_type != Some(UnixFsType::Directory as i32) {
        bail!("expected a directory node, found type {:?}", data.node_type);
    }

    node.links
        .iter()
        .map(|link| {
            let child = Cid::try_from(link.hash.clone().context("link without hash")?)?;
            Ok((link.name.clone().unwrap_or_default(), child))
        })
        .collect()
}

/// The target of a symlink node.
pub fn symlink_target(cid: &Cid, blocks: &HashMap<Cid, Vec<u8>>) -> Result<Vec<u8>> {
    let payload = block_payload(cid, blocks)?;
    let node = PbNode::decode(payload.as_slice())?;
    let data = UnixFsData::decode(node.data.context("node without unixfs payload")?.as_slice())?;
    if data.node_type != Some(UnixFsType::Symlink as i32) {
        bail!("expected a symlink node, found type {:?}", data.node_type);
    }
    data.data.context("symlink node without a target")
}

/// CIDs of `car`'s own blocks reachable from its root, following DAG-PB
/// links but never leaving the CAR.
pub fn reachable_within(car: &DecodedCar) -> HashSet<Cid> {
    let present: HashMap<Cid, &Vec<u8>> = car.blocks.iter().map(|(cid, p)| (*cid, p)).collect();

    let mut reachable = HashSet::new();
    let mut frontier = VecDeque::from([car.root]);
    while let Some(cid) = frontier.pop_front() {
        let Some(payload) = present.get(&cid) else {
            continue;
        };
        if !reachable.insert(cid) {
            continue;
        }
        if cid.codec() != DAG_PB_CODEC {
            continue;
        }
        let Ok(node) = PbNode::decode(payload.as_slice()) else {
            continue;
        };
        for link in &node.links {
            if let Some(hash) = &link.hash {
                if let Ok(child) = Cid::try_from(hash.as_slice()) {
                    frontier.push_back(child);
                }
            }
        }
    }
    reachable
}
