//! Bridge frame codec
//!
//! Frames are bincode-encoded [`BridgeMessage`] values. Decoding validates the
//! frame shape so the rest of the bridge can rely on it.

use super::types::{BridgeMessage, MessageKind, MAX_REQUEST_ID_LEN};
use crate::error::ProtocolError;
use bytes::Bytes;
use lazy_static::lazy_static;
use tracing::trace;

/// Serialized size of an empty frame with the largest header values
fn measure_overhead() -> usize {
    let empty = BridgeMessage {
        kind: MessageKind::Response,
        request_id: "x".repeat(MAX_REQUEST_ID_LEN),
        sequence: u32::MAX,
        total_chunks: u32::MAX,
        digest: [0u8; 32],
        payload: Bytes::new(),
    };
    // Sizing a plain struct cannot fail; fall back to a generous bound anyway.
    bincode::serialized_size(&empty).map(|n| n as usize).unwrap_or(256)
}

lazy_static! {
    /// Worst-case framing bytes added to a chunk payload
    pub static ref FRAME_OVERHEAD: usize = measure_overhead();
}

/// Encode a frame for publishing
pub fn encode_frame(msg: &BridgeMessage) -> Result<Bytes, ProtocolError> {
    validate_shape(msg)?;
    let buf = bincode::serialize(msg)
        .map_err(|e| ProtocolError::Malformed(format!("Failed to serialize frame: {}", e)))?;
    trace!(
        "Encoded {} frame {}/{} for {} ({} bytes)",
        msg.kind,
        msg.sequence + 1,
        msg.total_chunks,
        msg.request_id,
        buf.len()
    );
    Ok(Bytes::from(buf))
}

/// Decode and validate a received frame
pub fn decode_frame(data: &[u8]) -> Result<BridgeMessage, ProtocolError> {
    let msg: BridgeMessage = bincode::deserialize(data)
        .map_err(|e| ProtocolError::Malformed(format!("Failed to deserialize frame: {}", e)))?;
    validate_shape(&msg)?;
    Ok(msg)
}

/// Check the invariants every frame must satisfy
fn validate_shape(msg: &BridgeMessage) -> Result<(), ProtocolError> {
    if msg.total_chunks == 0 {
        return Err(ProtocolError::Malformed(format!(
            "Frame for {} declares zero chunks",
            msg.request_id
        )));
    }
    if msg.sequence >= msg.total_chunks {
        return Err(ProtocolError::Malformed(format!(
            "Frame for {} has sequence {} outside {} chunks",
            msg.request_id, msg.sequence, msg.total_chunks
        )));
    }
    if msg.request_id.len() > MAX_REQUEST_ID_LEN {
        return Err(ProtocolError::Malformed(format!(
            "Request id longer than {} bytes",
            MAX_REQUEST_ID_LEN
        )));
    }
    if msg.kind.is_correlated() && msg.request_id.is_empty() {
        return Err(ProtocolError::Malformed(format!(
            "{} frame without request id",
            msg.kind
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let original = BridgeMessage::new(MessageKind::Next, "r1", Bytes::from_static(b"ping"));
        let encoded = encode_frame(&original).unwrap();
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_frame_overhead_bounds_encoded_size() {
        let payload = Bytes::from(vec![7u8; 1000]);
        let msg = BridgeMessage::new(MessageKind::Response, "a".repeat(MAX_REQUEST_ID_LEN), payload);
        let encoded = encode_frame(&msg).unwrap();
        assert!(encoded.len() <= 1000 + *FRAME_OVERHEAD);
        assert!(*FRAME_OVERHEAD < 256);
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode_frame(&[0xff, 0x01]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_sequence_out_of_range_rejected() {
        let mut msg = BridgeMessage::new(MessageKind::Response, "r1", Bytes::new());
        msg.sequence = 3;
        msg.total_chunks = 3;
        assert!(matches!(
            encode_frame(&msg),
            Err(ProtocolError::Malformed(_))
        ));

        msg.total_chunks = 4;
        let bytes = bincode::serialize(&msg).unwrap();
        assert!(decode_frame(&bytes).is_ok());
    }

    #[test]
    fn test_zero_chunks_rejected() {
        let mut msg = BridgeMessage::new(MessageKind::Response, "r1", Bytes::new());
        msg.total_chunks = 0;
        let bytes = bincode::serialize(&msg).unwrap();
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn test_correlated_frame_requires_id() {
        let msg = BridgeMessage::new(MessageKind::Next, "", Bytes::new());
        assert!(encode_frame(&msg).is_err());

        // Control frames may go without an id
        let msg = BridgeMessage::new(MessageKind::Reboot, "", Bytes::new());
        assert!(encode_frame(&msg).is_ok());
    }

    #[test]
    fn test_overlong_request_id_rejected() {
        let msg = BridgeMessage::new(
            MessageKind::Next,
            "x".repeat(MAX_REQUEST_ID_LEN + 1),
            Bytes::new(),
        );
        assert!(encode_frame(&msg).is_err());
    }
}
