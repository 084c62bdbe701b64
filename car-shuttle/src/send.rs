use crate::{
    codec::{self, DAG_PB_CODEC},
    common::{BlockRef, Config},
    error::Error,
    scratch::Scratch,
    unixfs,
};
use cid::Cid;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use tracing::info;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where finished CAR chunks go.
///
/// Implementations must store blocks addressed by CID across CARs: when a
/// traversal spans multiple chunks, an inner node in a later CAR links
/// children that were shipped in an earlier one, and resolving those links
/// relies on the receiver's cross-CAR block index. Estuary-style shuttles
/// behave this way.
pub trait CarSink: Send + Sync {
    /// Deliver one CAR v1 stream of exactly `len` bytes.
    fn post_car(&self, car: impl Read + Send + 'static, len: u64) -> Result<(), Error>;
}

/// A filled scratch chunk plus the roots covering every block inside it.
#[derive(Debug)]
pub struct SendJob {
    pub(crate) scratch: Scratch,
    pub(crate) roots: Vec<BlockRef>,
}

/// A link into one of a chunk's root blocks, named by a running counter so
/// synthetic directory nodes can be built over it.
struct RootLink {
    cid: Cid,
    name: String,
    tsize: u64,
}

//--------------------------------------------------------------------------------------------------
// Worker
//--------------------------------------------------------------------------------------------------

/// Drain the job channel, uploading each filled chunk and handing the
/// emptied scratch back to the packer.
pub(crate) fn run_worker<S: CarSink>(
    jobs: flume::Receiver<SendJob>,
    spare: flume::Sender<Scratch>,
    sink: &S,
    config: &Config,
) -> Result<(), Error> {
    for job in jobs.iter() {
        let scratch = send_car(job, sink, config)?;
        if spare.send(scratch).is_err() {
            // the packer is gone, nothing left to hand back
            break;
        }
    }
    Ok(())
}

/// Upload one chunk: collapse its roots to a single CID, prepend the CAR
/// envelope, and stream the result to the sink. Returns the scratch for
/// reuse.
fn send_car<S: CarSink>(job: SendJob, sink: &S, config: &Config) -> Result<Scratch, Error> {
    let SendJob { scratch, roots } = job;
    if scratch.live_len() == 0 || roots.is_empty() {
        // empty car, nothing to do
        return Ok(scratch);
    }

    let mut links: Vec<RootLink> = roots
        .iter()
        .enumerate()
        .map(|(i, root)| RootLink {
            cid: root.cid,
            name: base32_name(i as u64),
            tsize: root.dag_size,
        })
        .collect();
    let mut name_counter = roots.len() as u64;

    // Collapse multiple roots under synthetic directory nodes. These are
    // built in memory and prepended to the stream; the scratch is about to
    // be truncated, so they never touch it. Later wrappers end up in front.
    let mut synthetic: Vec<u8> = Vec::new();
    while links.len() != 1 {
        let (count, tsize_sum, node) = greedy_wrapper(&links, config.block_target);
        let cid = codec::sha256_cid(DAG_PB_CODEC, &Sha256::digest(&node))?;
        let mut block = codec::frame(&cid, &node);
        block.extend_from_slice(&synthetic);
        synthetic = block;

        links.drain(..count - 1);
        links[0] = RootLink {
            cid,
            name: base32_name(name_counter),
            tsize: tsize_sum,
        };
        name_counter += 1;
    }
    let root = links[0].cid;

    let mut head = codec::car_envelope(root)?;
    head.extend_from_slice(&synthetic);

    scratch.sync().map_err(Error::chunk_io)?;
    let live = scratch.live_reader().map_err(Error::chunk_io)?;
    let len = head.len() as u64 + scratch.live_len();

    info!(%root, bytes = len, roots = roots.len(), "uploading CAR chunk");
    sink.post_car(Cursor::new(head).chain(live), len)?;

    Ok(scratch)
}

/// The largest prefix of `links` (at least two) whose synthetic directory
/// node stays within `block_target`, with its encoded node and summed
/// tsize. Same shape as the file fold in `pack`.
fn greedy_wrapper(links: &[RootLink], block_target: usize) -> (usize, u64, Vec<u8>) {
    debug_assert!(links.len() >= 2);
    let mut count = 2;
    let mut tsize_sum = links[0].tsize + links[1].tsize;
    let mut node = wrapper_node(&links[..count]);
    while links.len() > count {
        tsize_sum += links[count].tsize;
        count += 1;
        let candidate = wrapper_node(&links[..count]);
        if candidate.len() > block_target {
            count -= 1;
            tsize_sum -= links[count].tsize;
            break;
        }
        node = candidate;
    }
    (count, tsize_sum, node)
}

fn wrapper_node(links: &[RootLink]) -> Vec<u8> {
    let pb_links: Vec<_> = links
        .iter()
        .map(|link| unixfs::link(&link.cid, Some(link.name.clone()), link.tsize))
        .collect();
    unixfs::directory_node(&pb_links)
}

/// Lowercase base-32 rendition of the synthetic link counter.
fn base32_name(mut n: u64) -> String {
    const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
    let mut out = [0u8; 13];
    let mut at = out.len();
    loop {
        at -= 1;
        out[at] = DIGITS[(n % 32) as usize];
        n /= 32;
        if n == 0 {
            break;
        }
    }
    String::from_utf8_lossy(&out[at..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::RAW_CODEC,
        test_utils::{decode_car, reachable_within, MemorySink},
        unixfs::PbNode,
    };
    use prost::Message;
    use std::path::Path;
    use testresult::TestResult;

    fn scratch_with_blocks(dir: &Path, payloads: &[&[u8]]) -> (Scratch, Vec<BlockRef>) {
        let mut scratch = Scratch::create(&dir.join(".temp.A.car"), 1024 * 1024).unwrap();
        let mut roots = Vec::new();
        for payload in payloads {
            let cid = codec::sha256_cid(RAW_CODEC, &Sha256::digest(payload)).unwrap();
            let block = codec::frame(&cid, payload);
            let off = scratch.try_take(block.len() as u64).unwrap();
            scratch.write_all_at(&block, off).unwrap();
            roots.push(BlockRef {
                cid,
                file_size: payload.len() as u64,
                dag_size: payload.len() as u64,
            });
        }
        (scratch, roots)
    }

    #[test_log::test]
    fn empty_jobs_are_skipped() -> TestResult {
        let dir = tempfile::tempdir()?;
        let scratch = Scratch::create(&dir.path().join(".temp.A.car"), 1024)?;
        let sink = MemorySink::default();

        send_car(
            SendJob {
                scratch,
                roots: Vec::new(),
            },
            &sink,
            &Config::default(),
        )?;

        assert!(sink.cars().is_empty());
        Ok(())
    }

    #[test_log::test]
    fn single_root_needs_no_wrapper() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (scratch, roots) = scratch_with_blocks(dir.path(), &[b"only block"]);
        let sink = MemorySink::default();

        let expected_root = roots[0].cid;
        send_car(SendJob { scratch, roots }, &sink, &Config::default())?;

        let cars = sink.cars();
        assert_eq!(cars.len(), 1);
        let car = decode_car(&cars[0])?;
        assert_eq!(car.root, expected_root);
        assert_eq!(car.blocks.len(), 1);
        assert_eq!(car.blocks[0].1, b"only block");
        Ok(())
    }

    #[test_log::test]
    fn multiple_roots_get_a_synthetic_directory() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (scratch, roots) = scratch_with_blocks(dir.path(), &[b"first", b"second", b"third"]);
        let sink = MemorySink::default();

        let shipped = roots.clone();
        send_car(SendJob { scratch, roots }, &sink, &Config::default())?;

        let cars = sink.cars();
        let car = decode_car(&cars[0])?;
        // synthetic root plus the three data blocks
        assert_eq!(car.blocks.len(), 4);
        // the synthetic root comes first in the stream
        assert_eq!(car.blocks[0].0, car.root);

        let node = PbNode::decode(car.blocks[0].1.as_slice())?;
        assert_eq!(node.links.len(), 3);
        for (i, (link, root)) in node.links.iter().zip(&shipped).enumerate() {
            assert_eq!(link.name.as_deref(), Some(base32_name(i as u64).as_str()));
            assert_eq!(link.hash.as_deref(), Some(root.cid.to_bytes().as_slice()));
            assert_eq!(link.tsize, Some(root.dag_size));
        }

        let reachable = reachable_within(&car);
        for (cid, _) in &car.blocks {
            assert!(reachable.contains(cid));
        }
        Ok(())
    }

    #[test_log::test]
    fn wrappers_cascade_when_one_is_not_enough() -> TestResult {
        let dir = tempfile::tempdir()?;
        let payloads: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i; 8]).collect();
        let slices: Vec<&[u8]> = payloads.iter().map(Vec::as_slice).collect();
        let (scratch, roots) = scratch_with_blocks(dir.path(), &slices);
        let sink = MemorySink::default();

        // a tiny block target forces several wrapper layers
        let config = Config {
            block_target: 256,
            ..Config::default()
        };
        send_car(SendJob { scratch, roots }, &sink, &config)?;

        let car = decode_car(&sink.cars()[0])?;
        assert!(car.blocks.len() > 41, "expected more than one wrapper layer");
        let reachable = reachable_within(&car);
        for (cid, _) in &car.blocks {
            assert!(reachable.contains(cid));
        }
        Ok(())
    }

    #[test]
    fn base32_names_match_the_counter_format() {
        assert_eq!(base32_name(0), "0");
        assert_eq!(base32_name(9), "9");
        assert_eq!(base32_name(10), "a");
        assert_eq!(base32_name(31), "v");
        assert_eq!(base32_name(32), "10");
        assert_eq!(base32_name(12345), "c1p");
    }
}
