//! Fixed-width codec for score segments.
//!
//! A score column is stored as a sequence of segments of up to
//! [`SEGMENT_SIZE`] 32-bit floats each. The wire format is the concatenation
//! of the scores as little-endian IEEE-754. NaN stands for "missing" in
//! numeric columns and "unknown code" in categorical ones; its bit pattern
//! is not otherwise interpreted.

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::err::{Error, Result};

/// Number of scores per full segment.
pub const SEGMENT_SIZE: usize = 1000;

/// Maximum payload size of one segment in bytes.
pub const MAX_PAYLOAD: usize = SEGMENT_SIZE * 4;

/// Encode scores as little-endian f32. `scores` must fit one segment.
pub fn encode(scores: &[f32]) -> Vec<u8> {
    debug_assert!(scores.len() <= SEGMENT_SIZE);
    let mut payload = vec![0u8; scores.len() * 4];
    LittleEndian::write_f32_into(scores, &mut payload);
    payload
}

/// Decode a segment payload back into scores.
pub fn decode(payload: &[u8]) -> Result<Vec<f32>> {
    if payload.len() % 4 != 0 {
        return Err(Error::Decode(format!(
            "payload length {} is not a multiple of 4",
            payload.len()
        )));
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Decode(format!(
            "payload length {} exceeds segment size {}",
            payload.len(),
            MAX_PAYLOAD
        )));
    }
    let mut scores = vec![0f32; payload.len() / 4];
    LittleEndian::read_f32_into(payload, &mut scores);
    Ok(scores)
}

/// Experimental encoder: transpose the payload into byte planes (all byte-0
/// of each float, then all byte-1, ...) and gzip the result. Plane-sorted
/// bytes compress considerably better than interleaved floats. This path is
/// not part of the storage contract; segments read through the cache must
/// use the plain codec.
pub fn encode_shuffled(scores: &[f32]) -> Result<Vec<u8>> {
    let plain = encode(scores);
    let n = scores.len();
    let mut planes = vec![0u8; plain.len()];
    for (j, b) in plain.iter().enumerate() {
        planes[(j % 4) * n + j / 4] = *b;
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&planes)?;
    Ok(encoder.finish()?)
}

/// Inverse of [`encode_shuffled`].
pub fn decode_shuffled(payload: &[u8]) -> Result<Vec<f32>> {
    let mut planes = Vec::new();
    GzDecoder::new(payload)
        .read_to_end(&mut planes)
        .map_err(|e| Error::Decode(format!("gzip: {}", e)))?;
    if planes.len() % 4 != 0 {
        return Err(Error::Decode(format!(
            "shuffled payload length {} is not a multiple of 4",
            planes.len()
        )));
    }
    let n = planes.len() / 4;
    let mut plain = vec![0u8; planes.len()];
    for (j, b) in plain.iter_mut().enumerate() {
        *b = planes[(j % 4) * n + j / 4];
    }
    decode(&plain)
}
