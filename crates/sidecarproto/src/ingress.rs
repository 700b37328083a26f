//! Binary ingress packet codec.
//!
//! ## Wire Format
//!
//! Every integer is little-endian. The leading length covers everything
//! after itself, so a reader can frame packets without parsing headers.
//!
//! ```text
//! u32  payload length
//! u16  session id length (1..=0xFFFF)
//! [u8] session id (UTF-8)
//! u64  sequence
//! u32  sample rate
//! u16  channels
//! u32  frame count
//! u32  protocol version
//! u32  pcm byte length (> 0, multiple of 4)
//! [u8] pcm (f32 little-endian samples)
//! ```
//!
//! There is no acknowledgement channel. A frame that fails validation is not
//! sent over binary at all; the caller falls back to the JSON push path.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Hard cap on one packet's payload (everything after the length prefix).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

/// Fixed-width header bytes inside the payload, excluding the session id.
const FIXED_HEADER_BYTES: usize = 2 + 8 + 4 + 2 + 4 + 4 + 4;

/// Outbound PCM frame as handed to the push path.
///
/// Header fields are wider than their wire types on purpose: range checks
/// happen in [`encode_packet`], not at every call site.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmPushFrame {
    pub session_id: String,
    pub sequence: u64,
    pub sample_rate: u64,
    pub channels: u64,
    pub frame_count: u64,
    pub protocol_version: u64,
    /// f32 little-endian sample bytes.
    pub pcm: Bytes,
}

/// A decoded ingress packet.
#[derive(Debug, Clone, PartialEq)]
pub struct IngressPacket {
    pub session_id: String,
    pub sequence: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_count: u32,
    pub protocol_version: u32,
    pub pcm: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngressPacketError {
    #[error("session id length {0} outside 1..=65535")]
    SessionIdLength(usize),
    #[error("pcm length {0} is empty or not a multiple of 4")]
    PcmLength(usize),
    #[error("{field} value {value} out of range")]
    OutOfRange { field: &'static str, value: u64 },
    #[error("payload {size} bytes exceeds cap of {cap}")]
    TooLarge { size: usize, cap: usize },
    #[error("declared lengths disagree with payload length {0}")]
    LengthMismatch(usize),
    #[error("session id is not UTF-8")]
    InvalidUtf8,
}

fn narrow<T: TryFrom<u64>>(field: &'static str, value: u64) -> Result<T, IngressPacketError> {
    T::try_from(value).map_err(|_| IngressPacketError::OutOfRange { field, value })
}

fn positive<T: TryFrom<u64>>(field: &'static str, value: u64) -> Result<T, IngressPacketError> {
    if value == 0 {
        return Err(IngressPacketError::OutOfRange { field, value });
    }
    narrow(field, value)
}

/// Validate and encode one frame into a length-prefixed packet.
pub fn encode_packet(frame: &PcmPushFrame, max_payload: usize) -> Result<Bytes, IngressPacketError> {
    let sid = frame.session_id.as_bytes();
    if sid.is_empty() || sid.len() > u16::MAX as usize {
        return Err(IngressPacketError::SessionIdLength(sid.len()));
    }

    let pcm_len = frame.pcm.len();
    if pcm_len == 0 || pcm_len % 4 != 0 {
        return Err(IngressPacketError::PcmLength(pcm_len));
    }
    let pcm_len_u32: u32 = narrow("pcm length", pcm_len as u64)?;

    let sample_rate: u32 = positive("sample rate", frame.sample_rate)?;
    let channels: u16 = positive("channels", frame.channels)?;
    let frame_count: u32 = positive("frame count", frame.frame_count)?;
    let protocol_version: u32 = narrow("protocol version", frame.protocol_version)?;

    let payload_len = FIXED_HEADER_BYTES + sid.len() + pcm_len;
    if payload_len > max_payload {
        return Err(IngressPacketError::TooLarge {
            size: payload_len,
            cap: max_payload,
        });
    }
    let payload_len_u32: u32 = narrow("payload length", payload_len as u64)?;

    let mut buf = BytesMut::with_capacity(4 + payload_len);
    buf.put_u32_le(payload_len_u32);
    buf.put_u16_le(sid.len() as u16);
    buf.put_slice(sid);
    buf.put_u64_le(frame.sequence);
    buf.put_u32_le(sample_rate);
    buf.put_u16_le(channels);
    buf.put_u32_le(frame_count);
    buf.put_u32_le(protocol_version);
    buf.put_u32_le(pcm_len_u32);
    buf.put_slice(&frame.pcm);

    Ok(buf.freeze())
}

/// Pull one complete packet off the front of `buf`.
///
/// Returns `Ok(None)` until enough bytes have arrived. On error the
/// offending packet has been consumed so the stream can continue.
pub fn decode_packet(
    buf: &mut BytesMut,
    max_payload: usize,
) -> Result<Option<IngressPacket>, IngressPacketError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if payload_len > max_payload {
        return Err(IngressPacketError::TooLarge {
            size: payload_len,
            cap: max_payload,
        });
    }
    if buf.len() < 4 + payload_len {
        return Ok(None);
    }

    buf.advance(4);
    let mut payload = buf.split_to(payload_len).freeze();

    if payload.len() < FIXED_HEADER_BYTES {
        return Err(IngressPacketError::LengthMismatch(payload_len));
    }
    let sid_len = payload.get_u16_le() as usize;
    if sid_len == 0 {
        return Err(IngressPacketError::SessionIdLength(0));
    }
    if payload.remaining() < sid_len + FIXED_HEADER_BYTES - 2 {
        return Err(IngressPacketError::LengthMismatch(payload_len));
    }
    let session_id = std::str::from_utf8(&payload.split_to(sid_len))
        .map_err(|_| IngressPacketError::InvalidUtf8)?
        .to_string();

    let sequence = payload.get_u64_le();
    let sample_rate = payload.get_u32_le();
    let channels = payload.get_u16_le();
    let frame_count = payload.get_u32_le();
    let protocol_version = payload.get_u32_le();
    let pcm_len = payload.get_u32_le() as usize;
    if pcm_len != payload.remaining() {
        return Err(IngressPacketError::LengthMismatch(payload_len));
    }

    Ok(Some(IngressPacket {
        session_id,
        sequence,
        sample_rate,
        channels,
        frame_count,
        protocol_version,
        pcm: payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::pcm_bytes_from_samples;
    use pretty_assertions::assert_eq;

    fn frame() -> PcmPushFrame {
        PcmPushFrame {
            session_id: "vf-1".to_string(),
            sequence: 42,
            sample_rate: 48000,
            channels: 1,
            frame_count: 4,
            protocol_version: 1,
            pcm: pcm_bytes_from_samples(&[0.1, 0.2, 0.3, 0.4]),
        }
    }

    #[test]
    fn layout_is_little_endian_and_length_prefixed() {
        let packet = encode_packet(&frame(), DEFAULT_MAX_PAYLOAD_BYTES).unwrap();

        let payload_len = u32::from_le_bytes(packet[0..4].try_into().unwrap()) as usize;
        assert_eq!(payload_len, packet.len() - 4);
        assert_eq!(payload_len, FIXED_HEADER_BYTES + 4 + 16);

        assert_eq!(&packet[4..6], &4u16.to_le_bytes());
        assert_eq!(&packet[6..10], b"vf-1");
        assert_eq!(&packet[10..18], &42u64.to_le_bytes());
        assert_eq!(&packet[18..22], &48000u32.to_le_bytes());
        assert_eq!(&packet[22..24], &1u16.to_le_bytes());
        assert_eq!(&packet[24..28], &4u32.to_le_bytes());
        assert_eq!(&packet[28..32], &1u32.to_le_bytes());
        assert_eq!(&packet[32..36], &16u32.to_le_bytes());
        assert_eq!(packet.len(), 36 + 16);
    }

    #[test]
    fn decoder_frames_a_split_stream() {
        let a = encode_packet(&frame(), DEFAULT_MAX_PAYLOAD_BYTES).unwrap();
        let mut second = frame();
        second.sequence = 43;
        let b = encode_packet(&second, DEFAULT_MAX_PAYLOAD_BYTES).unwrap();

        let mut stream = BytesMut::new();
        stream.extend_from_slice(&a[..10]);
        assert_eq!(decode_packet(&mut stream, DEFAULT_MAX_PAYLOAD_BYTES).unwrap(), None);

        stream.extend_from_slice(&a[10..]);
        stream.extend_from_slice(&b);
        let first = decode_packet(&mut stream, DEFAULT_MAX_PAYLOAD_BYTES)
            .unwrap()
            .unwrap();
        let next = decode_packet(&mut stream, DEFAULT_MAX_PAYLOAD_BYTES)
            .unwrap()
            .unwrap();

        assert_eq!(first.session_id, "vf-1");
        assert_eq!(first.sequence, 42);
        assert_eq!(first.pcm, frame().pcm);
        assert_eq!(next.sequence, 43);
        assert!(stream.is_empty());
    }

    #[test]
    fn rejects_bad_session_ids() {
        let mut f = frame();
        f.session_id.clear();
        assert_eq!(
            encode_packet(&f, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(IngressPacketError::SessionIdLength(0))
        );

        f.session_id = "x".repeat(0x1_0000);
        assert_eq!(
            encode_packet(&f, usize::MAX),
            Err(IngressPacketError::SessionIdLength(0x1_0000))
        );
    }

    #[test]
    fn rejects_bad_pcm_lengths() {
        let mut f = frame();
        f.pcm = Bytes::new();
        assert_eq!(
            encode_packet(&f, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(IngressPacketError::PcmLength(0))
        );

        f.pcm = Bytes::from_static(&[0, 0, 0, 0, 0, 0]);
        assert_eq!(
            encode_packet(&f, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(IngressPacketError::PcmLength(6))
        );
    }

    #[test]
    fn rejects_out_of_domain_headers() {
        let mut f = frame();
        f.channels = 70_000;
        assert!(matches!(
            encode_packet(&f, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(IngressPacketError::OutOfRange { field: "channels", .. })
        ));

        let mut f = frame();
        f.sample_rate = u64::from(u32::MAX) + 1;
        assert!(matches!(
            encode_packet(&f, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(IngressPacketError::OutOfRange { field: "sample rate", .. })
        ));

        let mut f = frame();
        f.frame_count = 0;
        assert!(matches!(
            encode_packet(&f, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(IngressPacketError::OutOfRange { field: "frame count", .. })
        ));
    }

    #[test]
    fn enforces_payload_cap() {
        let mut f = frame();
        f.pcm = Bytes::from(vec![0u8; 1024]);
        let size = FIXED_HEADER_BYTES + 4 + 1024;

        assert!(encode_packet(&f, size).is_ok());
        assert_eq!(
            encode_packet(&f, size - 1),
            Err(IngressPacketError::TooLarge { size, cap: size - 1 })
        );
    }

    #[test]
    fn decoder_rejects_inconsistent_lengths() {
        let packet = encode_packet(&frame(), DEFAULT_MAX_PAYLOAD_BYTES).unwrap();
        let mut corrupt = BytesMut::from(&packet[..]);
        // Claim 20 pcm bytes while only 16 follow.
        corrupt[32..36].copy_from_slice(&20u32.to_le_bytes());

        assert!(matches!(
            decode_packet(&mut corrupt, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(IngressPacketError::LengthMismatch(_))
        ));
        assert!(corrupt.is_empty());
    }
}
