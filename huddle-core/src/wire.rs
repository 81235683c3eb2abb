//! Framing: length-prefix (4 bytes LE) + bincode payload.
//!
//! `encode_frame`/`decode_frame` carry anything serde can see; in practice
//! that is `ControlFrame` on handshake connections and sealed `SessionFrame`
//! records inside a session link. UDP announces skip the prefix and use the
//! bare payload codec, one datagram per frame.

use serde::de::DeserializeOwned;
use serde::Serialize;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Bare bincode, no length prefix.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    bincode::serialize(value).map_err(FrameEncodeError::Encode)
}

/// Bare bincode, no length prefix.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameDecodeError> {
    bincode::deserialize(bytes).map_err(FrameDecodeError::Decode)
}

/// Encode a value into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(value).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a value into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the value and the number
/// of bytes consumed. Call with a partial buffer; `NeedMore` means the caller
/// should retry after reading more data.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let value: T =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((value, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::protocol::{ControlFrame, SessionFrame, PROTOCOL_VERSION};

    fn sample_invite() -> ControlFrame {
        let kp = Keypair::generate();
        ControlFrame::Invite {
            protocol_version: PROTOCOL_VERSION,
            service: "jobmanager-chat".into(),
            id: kp.peer_id(),
            public_key: kp.public_key().clone(),
            display_name: "Front Desk".into(),
            context: None,
        }
    }

    #[test]
    fn roundtrip_invite() {
        let frame = sample_invite();
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, n): (ControlFrame, usize) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        match (&frame, &decoded) {
            (
                ControlFrame::Invite { id: a, service: s1, .. },
                ControlFrame::Invite { id: b, service: s2, .. },
            ) => {
                assert_eq!(a, b);
                assert_eq!(s1, s2);
            }
            _ => panic!("expected Invite"),
        }
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_frame(&sample_invite()).unwrap();
        assert!(matches!(
            decode_frame::<ControlFrame>(&bytes[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame::<ControlFrame>(&bytes[..super::LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_length_rejected_before_payload_arrives() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame::<ControlFrame>(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn consecutive_frames_split_cleanly() {
        let a = SessionFrame::Data {
            payload: b"first".to_vec(),
        };
        let b = SessionFrame::ResourceEnd {
            transfer_id: [3; 16],
            digest: [0; 32],
        };
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1): (SessionFrame, usize) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2): (SessionFrame, usize) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1, SessionFrame::Data { .. }));
        assert!(matches!(m2, SessionFrame::ResourceEnd { .. }));
    }

    #[test]
    fn payload_codec_matches_frame_payload() {
        let frame = sample_invite();
        let bare = encode_payload(&frame).unwrap();
        let framed = encode_frame(&frame).unwrap();
        assert_eq!(&framed[LEN_SIZE..], &bare[..]);
        assert!(decode_payload::<ControlFrame>(&bare).is_ok());
    }
}
