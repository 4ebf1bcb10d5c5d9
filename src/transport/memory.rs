//! In-process pub/sub broker
//!
//! [`MemoryHub`] fans published frames out to every client subscribed to the
//! channel, enforcing the same frame limit as the WebSocket transport.

use super::{check_frame, InboundMessage, PubSub};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

const CLIENT_QUEUE: usize = 1024;

#[derive(Debug, Default)]
struct HubState {
    next_client: u64,
    subscribers: HashMap<String, Vec<(u64, mpsc::Sender<InboundMessage>)>>,
}

/// Shared broker; clone it to hand out to several components
#[derive(Debug, Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    max_frame_bytes: usize,
    published: Arc<AtomicU64>,
}

impl MemoryHub {
    /// Create a broker with a frame limit
    pub fn new(max_frame_bytes: usize) -> Self {
        MemoryHub {
            state: Arc::new(Mutex::new(HubState::default())),
            max_frame_bytes,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a client and its inbound receiver
    pub fn client(&self) -> (MemoryPubSub, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let id = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.next_client += 1;
            state.next_client
        };
        let client = MemoryPubSub {
            id,
            hub: self.clone(),
            inbound: tx,
            closed: AtomicBool::new(false),
        };
        (client, rx)
    }

    /// Frames published through the hub so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn subscribers(&self, channel: &str) -> Vec<mpsc::Sender<InboundMessage>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .subscribers
            .get(channel)
            .map(|subs| subs.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default()
    }

    fn remove_client(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for subs in state.subscribers.values_mut() {
            subs.retain(|(client, _)| *client != id);
        }
    }
}

/// One client of a [`MemoryHub`]
#[derive(Debug)]
pub struct MemoryPubSub {
    id: u64,
    hub: MemoryHub,
    inbound: mpsc::Sender<InboundMessage>,
    closed: AtomicBool,
}

impl MemoryPubSub {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.hub.state.lock().unwrap_or_else(|e| e.into_inner());
        let subs = state.subscribers.entry(channel.to_string()).or_default();
        if !subs.iter().any(|(client, _)| *client == self.id) {
            subs.push((self.id, self.inbound.clone()));
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        check_frame(payload.len(), self.hub.max_frame_bytes)?;
        self.hub.published.fetch_add(1, Ordering::Relaxed);

        for tx in self.hub.subscribers(channel) {
            let msg = InboundMessage {
                channel: channel.to_string(),
                payload: payload.clone(),
            };
            if tx.send(msg).await.is_err() {
                trace!("Dropping frame for a gone subscriber on {}", channel);
            }
        }
        Ok(())
    }

    fn max_frame_bytes(&self) -> usize {
        self.hub.max_frame_bytes
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.hub.remove_client(self.id);
        Ok(())
    }
}

impl Drop for MemoryPubSub {
    fn drop(&mut self) {
        self.hub.remove_client(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[tokio::test]
    async fn test_fan_out() {
        let hub = MemoryHub::new(1024);
        let (a, mut a_rx) = hub.client();
        let (b, mut b_rx) = hub.client();
        let (c, _c_rx) = hub.client();

        a.subscribe("/ns/x").await.unwrap();
        b.subscribe("/ns/x").await.unwrap();
        b.subscribe("/ns/x").await.unwrap();

        c.publish("/ns/x", Bytes::from_static(b"hello")).await.unwrap();
        c.publish("/ns/other", Bytes::from_static(b"nobody")).await.unwrap();

        assert_eq!(a_rx.recv().await.unwrap().payload, Bytes::from_static(b"hello"));
        let msg = b_rx.recv().await.unwrap();
        assert_eq!(msg.channel, "/ns/x");
        assert!(b_rx.try_recv().is_err());
        assert_eq!(hub.published(), 2);
    }

    #[tokio::test]
    async fn test_frame_limit() {
        let hub = MemoryHub::new(6);
        let (a, _rx) = hub.client();
        a.publish("/c", Bytes::from_static(b"123")).await.unwrap();
        let err = a.publish("/c", Bytes::from_static(b"1234")).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::FrameTooLarge { size: 10, max: 6 })
        ));
        assert_eq!(a.max_frame_bytes(), 6);
    }

    #[tokio::test]
    async fn test_close() {
        let hub = MemoryHub::new(64);
        let (a, _a_rx) = hub.client();
        let (b, mut b_rx) = hub.client();
        b.subscribe("/c").await.unwrap();
        b.close().await.unwrap();

        a.publish("/c", Bytes::from_static(b"x")).await.unwrap();
        assert!(b_rx.try_recv().is_err());
        assert!(matches!(
            b.publish("/c", Bytes::new()).await,
            Err(TransportError::Closed)
        ));
    }
}
