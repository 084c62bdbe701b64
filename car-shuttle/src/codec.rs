use crate::error::Error;
use cid::Cid;
use multihash::Multihash;
use serde::{Deserialize, Serialize};
use unsigned_varint::encode as varint;

/// Multicodec tag for raw leaf payloads.
pub const RAW_CODEC: u64 = 0x55;

/// Multicodec tag for DAG-PB nodes.
pub const DAG_PB_CODEC: u64 = 0x70;

/// Largest payload an identity multihash can carry; bounded by the
/// fixed-size digest buffer inside [`Multihash`].
pub const IDENTITY_DIGEST_MAX: usize = 64;

const SHA2_256_CODE: u64 = 0x12;
const IDENTITY_CODE: u64 = 0x00;

//--------------------------------------------------------------------------------------------------
// CIDs
//--------------------------------------------------------------------------------------------------

/// Build a v1 CID over a sha2-256 digest.
pub fn sha256_cid(codec: u64, digest: &[u8]) -> Result<Cid, Error> {
    let hash = Multihash::wrap(SHA2_256_CODE, digest)?;
    Ok(Cid::new_v1(codec, hash))
}

/// Build a v1 CID that embeds `data` itself as an identity multihash.
/// No block is emitted for such CIDs.
pub fn identity_cid(codec: u64, data: &[u8]) -> Result<Cid, Error> {
    let hash = Multihash::wrap(IDENTITY_CODE, data)?;
    Ok(Cid::new_v1(codec, hash))
}

/// Byte length of a v1 CID under `codec` with a sha2-256 multihash.
/// The digest length is fixed, so the CID length is known before the
/// hash is, which lets block frames be sized up front.
pub fn cid_v1_len(codec: u64) -> Result<usize, Error> {
    Ok(sha256_cid(codec, &[0u8; 32])?.encoded_len())
}

//--------------------------------------------------------------------------------------------------
// Block framing
//--------------------------------------------------------------------------------------------------

/// Length of `frame_header(cid, payload_len)` for a sha2-256 CID of
/// `cid_len` bytes.
pub fn frame_header_len(cid_len: usize, payload_len: u64) -> u64 {
    let mut buf = varint::u64_buffer();
    let prefix = varint::u64(cid_len as u64 + payload_len, &mut buf);
    (prefix.len() + cid_len) as u64
}

/// The `varint(cid_len + payload_len) || cid` prefix of a CAR block.
pub fn frame_header(cid: &Cid, payload_len: u64) -> Vec<u8> {
    let cid_bytes = cid.to_bytes();
    let mut buf = varint::u64_buffer();
    let prefix = varint::u64(cid_bytes.len() as u64 + payload_len, &mut buf);
    let mut out = Vec::with_capacity(prefix.len() + cid_bytes.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(&cid_bytes);
    out
}

/// A complete framed CAR block: `varint || cid || payload`.
pub fn frame(cid: &Cid, payload: &[u8]) -> Vec<u8> {
    let mut out = frame_header(cid, payload.len() as u64);
    out.extend_from_slice(payload);
    out
}

//--------------------------------------------------------------------------------------------------
// CAR envelope
//--------------------------------------------------------------------------------------------------

/// The CAR v1 header record, serialized as DAG-CBOR.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarHeader {
    /// Root CIDs the archive claims. This crate always names exactly one.
    pub roots: Vec<Cid>,
    /// Format version, always 1.
    pub version: u64,
}

/// Encode the varint-prefixed CAR v1 envelope naming a single root.
pub fn car_envelope(root: Cid) -> Result<Vec<u8>, Error> {
    let header = serde_ipld_dagcbor::to_vec(&CarHeader {
        roots: vec![root],
        version: 1,
    })?;
    let mut buf = varint::u64_buffer();
    let prefix = varint::u64(header.len() as u64, &mut buf);
    let mut out = Vec::with_capacity(prefix.len() + header.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(&header);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use testresult::TestResult;
    use unsigned_varint::decode;

    #[test]
    fn v1_sha256_cids_have_fixed_length() -> TestResult {
        // version + codec + multihash prefix + 32 digest bytes
        assert_eq!(cid_v1_len(RAW_CODEC)?, 36);
        assert_eq!(cid_v1_len(DAG_PB_CODEC)?, 36);
        Ok(())
    }

    #[test]
    fn frame_starts_with_cid_plus_payload_length() -> TestResult {
        let payload = b"some leaf payload";
        let cid = sha256_cid(RAW_CODEC, &Sha256::digest(payload))?;
        let framed = frame(&cid, payload);

        let (claimed, rest) = decode::u64(&framed)?;
        assert_eq!(claimed as usize, cid.encoded_len() + payload.len());
        assert_eq!(claimed as usize, rest.len());
        assert_eq!(&rest[..cid.encoded_len()], cid.to_bytes().as_slice());
        assert_eq!(&rest[cid.encoded_len()..], payload);

        assert_eq!(framed.len() as u64, frame_header_len(cid.encoded_len(), payload.len() as u64) + payload.len() as u64);
        Ok(())
    }

    #[test]
    fn sha256_cid_commits_to_the_digest() -> TestResult {
        let payload = b"hash me";
        let digest = Sha256::digest(payload);
        let cid = sha256_cid(RAW_CODEC, &digest)?;
        assert_eq!(cid.codec(), RAW_CODEC);
        assert_eq!(cid.hash().code(), SHA2_256_CODE);
        assert_eq!(cid.hash().digest(), digest.as_slice());
        Ok(())
    }

    #[test]
    fn identity_cid_embeds_the_payload() -> TestResult {
        let cid = identity_cid(RAW_CODEC, b"helloworld")?;
        assert_eq!(cid.hash().code(), IDENTITY_CODE);
        assert_eq!(cid.hash().digest(), b"helloworld");
        Ok(())
    }

    #[test]
    fn identity_cid_rejects_oversized_payloads() {
        let too_big = vec![0u8; IDENTITY_DIGEST_MAX + 1];
        assert!(identity_cid(DAG_PB_CODEC, &too_big).is_err());
    }

    #[test]
    fn car_envelope_round_trips() -> TestResult {
        let root = sha256_cid(DAG_PB_CODEC, &Sha256::digest(b"root"))?;
        let envelope = car_envelope(root)?;

        let (header_len, rest) = decode::u64(&envelope)?;
        assert_eq!(header_len as usize, rest.len());

        let header: CarHeader = serde_ipld_dagcbor::from_slice(rest)?;
        assert_eq!(header, CarHeader { roots: vec![root], version: 1 });
        Ok(())
    }
}
