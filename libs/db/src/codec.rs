//! Byte encoding for snapshots and big map records.
//!
//! Values are serialized with MessagePack and optionally compressed with LZ4.
//! Every value starts with a one-byte header naming its encoding, so data
//! written with compression enabled stays readable after the flag is turned
//! off (and vice versa).
//!
//! Keys use plain MessagePack without a header or compression: they must
//! encode deterministically so that equal keys map to equal bytes.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

const RAW: u8 = 0;
const LZ4: u8 = 1;

/// Serialize a value, LZ4-compressing it when `compressed` is set.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T, compressed: bool) -> Result<Vec<u8>> {
    let msgpack_bytes = rmp_serde::to_vec(value).context("MessagePack encoding failed")?;

    let mut out = Vec::with_capacity(msgpack_bytes.len() + 1);
    if compressed {
        let compressed = lz4::block::compress(&msgpack_bytes, None, true)
            .map_err(|e| anyhow!("LZ4 compression failed: {}", e))?;
        out.push(LZ4);
        out.extend_from_slice(&compressed);
    } else {
        out.push(RAW);
        out.extend_from_slice(&msgpack_bytes);
    }
    Ok(out)
}

/// Decode bytes produced by [`to_bytes`], whatever the compression setting was.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (header, body) = bytes
        .split_first()
        .ok_or_else(|| anyhow!("Cannot decode an empty value"))?;

    let value = match *header {
        RAW => rmp_serde::from_slice(body),
        LZ4 => {
            let decompressed = lz4::block::decompress(body, None)
                .map_err(|e| anyhow!("LZ4 decompression failed: {}", e))?;
            rmp_serde::from_slice(&decompressed)
        }
        other => return Err(anyhow!("Unknown value encoding header: {}", other)),
    };
    value.context("MessagePack decoding failed")
}

/// Encode a map key.
pub fn key_to_bytes<K: Serialize + ?Sized>(key: &K) -> Result<Vec<u8>> {
    rmp_serde::to_vec(key).context("MessagePack key encoding failed")
}

/// Decode a map key.
pub fn key_from_bytes<K: DeserializeOwned>(bytes: &[u8]) -> Result<K> {
    rmp_serde::from_slice(bytes).context("MessagePack key decoding failed")
}
