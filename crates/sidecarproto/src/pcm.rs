//! float32 little-endian PCM helpers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};

use crate::ProtoError;

pub fn pcm_bytes_from_samples(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 4);
    for sample in samples {
        buf.put_f32_le(*sample);
    }
    buf.freeze()
}

pub fn samples_from_pcm_bytes(bytes: &[u8]) -> Result<Vec<f32>, ProtoError> {
    if bytes.len() % 4 != 0 {
        return Err(ProtoError::UnalignedPcm(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn encode_pcm_base64(pcm: &[u8]) -> String {
    STANDARD.encode(pcm)
}

pub fn decode_pcm_base64(encoded: &str) -> Result<Vec<f32>, ProtoError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    samples_from_pcm_bytes(&bytes)
}
