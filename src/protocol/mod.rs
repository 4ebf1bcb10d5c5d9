//! Bridge protocol
//!
//! Wire frames exchanged between the remote stub and the local bridge,
//! their codec, and chunking of payloads that exceed one pub/sub frame.

mod chunk;
mod codec;
mod digest;
mod types;

pub use chunk::{split, Assembly, ChunkLimits, Reassembler};
pub use codec::{decode_frame, encode_frame, FRAME_OVERHEAD};
pub use digest::{digest, digest_parts, Digest};
pub use types::{
    BridgeMessage, ErrorPayload, FunctionMetadata, InvocationRequest, InvocationType,
    MessageKind, MAX_REQUEST_ID_LEN,
};
