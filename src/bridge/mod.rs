//! Live invocation bridge
//!
//! Two endpoints share one pub/sub channel pair per stage: the [`Invoker`]
//! (remote stub side) publishes `Next` requests to the request channel and
//! awaits results on the response channel; the [`DevBridge`] (developer
//! machine) runs them locally and publishes the results back.

mod correlator;
mod dev;
mod invoker;

pub use correlator::{Correlator, Delivery, ResponseWaiter};
pub use dev::DevBridge;
pub use invoker::Invoker;

use crate::protocol::{encode_frame, split, BridgeMessage, ChunkLimits};
use crate::transport::PubSub;
use tracing::trace;

/// Request and response channel names for one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeChannels {
    /// Channel carrying `Next` and `Ping` towards the developer machine
    pub request: String,
    /// Channel carrying results and control messages back
    pub response: String,
}

impl BridgeChannels {
    /// Channels under `/{namespace}/{base}`
    pub fn new(namespace: &str, base: &str) -> Self {
        let prefix = format!(
            "/{}/{}",
            namespace.trim_matches('/'),
            base.trim_matches('/')
        );
        BridgeChannels {
            request: format!("{}/request", prefix),
            response: format!("{}/response", prefix),
        }
    }
}

/// Split a logical message into frames and publish them in order
pub(crate) async fn publish_message(
    pubsub: &dyn PubSub,
    channel: &str,
    msg: BridgeMessage,
    limits: &ChunkLimits,
) -> Result<usize, crate::error::TransportError> {
    let frames = split(msg.kind, &msg.request_id, msg.payload, limits)?;
    let count = frames.len();
    for frame in &frames {
        let wire = encode_frame(frame).map_err(crate::error::TransportError::from)?;
        pubsub.publish(channel, wire).await?;
    }
    trace!("Published {} frame(s) to {}", count, channel);
    Ok(count)
}
