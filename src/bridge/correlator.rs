//! Request/response correlation
//!
//! Each outstanding request owns a oneshot waiter and, once chunks start to
//! arrive, a partial [`Assembly`]. Completed and expired ids are tombstoned for
//! a while so late chunks are dropped silently instead of being reported as
//! unknown traffic.

use crate::error::{ProtocolError, TimeoutError};
use crate::protocol::{Assembly, BridgeMessage};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// How long finished request ids are remembered
const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(120);

type Waiter = oneshot::Sender<Result<BridgeMessage, TimeoutError>>;

/// Outcome of delivering a result frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The message is complete and was handed to its waiter
    Completed,
    /// The chunk was buffered; more are expected
    Buffered,
    /// No request with this id was ever registered (or it is long gone)
    Unknown,
    /// The request already finished; the chunk was discarded
    Dropped,
}

struct PendingRequest {
    created: Instant,
    deadline: Instant,
    assembly: Option<Assembly>,
    waiter: Waiter,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, PendingRequest>,
    tombstones: HashMap<String, Instant>,
    closed: bool,
}

impl Inner {
    fn tombstone(&mut self, request_id: String, now: Instant) {
        self.tombstones.insert(request_id, now);
    }
}

/// Receives the response to one registered request
#[derive(Debug)]
pub struct ResponseWaiter {
    request_id: String,
    timeout: Duration,
    rx: oneshot::Receiver<Result<BridgeMessage, TimeoutError>>,
}

impl ResponseWaiter {
    /// Request this waiter belongs to
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response or the timeout
    pub async fn wait(self) -> Result<BridgeMessage, TimeoutError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(TimeoutError {
                request_id: self.request_id,
                after: self.timeout,
            }),
        }
    }
}

/// Table of outstanding requests
pub struct Correlator {
    inner: Mutex<Inner>,
    tombstone_ttl: Duration,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Create an empty correlator
    pub fn new() -> Self {
        Self::with_tombstone_ttl(DEFAULT_TOMBSTONE_TTL)
    }

    /// Create a correlator remembering finished ids for `ttl`
    pub fn with_tombstone_ttl(ttl: Duration) -> Self {
        Correlator {
            inner: Mutex::new(Inner::default()),
            tombstone_ttl: ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a request that expires after `timeout`
    pub fn register(&self, request_id: &str, timeout: Duration) -> Result<ResponseWaiter, ProtocolError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ProtocolError::Malformed(format!(
                "Correlator is shut down, cannot register {}",
                request_id
            )));
        }
        if inner.pending.contains_key(request_id) {
            return Err(ProtocolError::DuplicateRequest(request_id.to_string()));
        }

        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        inner.tombstones.remove(request_id);
        inner.pending.insert(
            request_id.to_string(),
            PendingRequest {
                created: now,
                deadline: now + timeout,
                assembly: None,
                waiter: tx,
            },
        );
        trace!("Registered request {} (timeout {:?})", request_id, timeout);

        Ok(ResponseWaiter {
            request_id: request_id.to_string(),
            timeout,
            rx,
        })
    }

    /// Deliver a `Response` or `Error` frame
    pub fn deliver(&self, msg: BridgeMessage) -> Result<Delivery, ProtocolError> {
        if !msg.kind.is_result() {
            return Err(ProtocolError::Malformed(format!(
                "{} frame cannot complete a request",
                msg.kind
            )));
        }

        let mut inner = self.lock();
        if inner.tombstones.contains_key(&msg.request_id) {
            trace!("Dropping late chunk for finished request {}", msg.request_id);
            return Ok(Delivery::Dropped);
        }

        let request_id = msg.request_id.clone();
        let Some(entry) = inner.pending.get_mut(&request_id) else {
            return Ok(Delivery::Unknown);
        };

        let assembly = entry.assembly.get_or_insert_with(|| Assembly::new(&msg));
        if !assembly.insert(msg)? {
            return Ok(Delivery::Buffered);
        }

        let finished = entry.assembly.take().map(Assembly::finish);
        let message = match finished {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                // Keep the request alive; a clean retransmission may still arrive
                warn!("Discarding corrupt response for {}: {}", request_id, e);
                return Err(e);
            }
            None => return Ok(Delivery::Buffered),
        };

        let now = Instant::now();
        let Some(entry) = inner.pending.remove(&request_id) else {
            return Ok(Delivery::Unknown);
        };
        inner.tombstone(request_id.clone(), now);

        debug!(
            "Request {} completed with {} after {:?}",
            request_id,
            message.kind,
            now.duration_since(entry.created)
        );
        if entry.waiter.send(Ok(message)).is_err() {
            trace!("Waiter for {} is gone", request_id);
        }
        Ok(Delivery::Completed)
    }

    /// Fail every request whose deadline passed; returns how many expired
    pub fn sweep(&self, now: Instant) -> usize {
        let mut inner = self.lock();

        let expired: Vec<String> = inner
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = inner.pending.remove(id) {
                let after = now.saturating_duration_since(entry.created);
                let buffered = entry.assembly.as_ref().map(Assembly::buffered).unwrap_or(0);
                debug!(
                    "Request {} timed out after {:?} ({} bytes discarded)",
                    id, after, buffered
                );
                let _ = entry.waiter.send(Err(TimeoutError {
                    request_id: id.clone(),
                    after,
                }));
                inner.tombstone(id.clone(), now);
            }
        }

        let ttl = self.tombstone_ttl;
        inner
            .tombstones
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);

        expired.len()
    }

    /// Forget a request whose frames could not be sent
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.pending.remove(request_id) {
            Some(_) => {
                inner.tombstone(request_id.to_string(), Instant::now());
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request and refuse new ones
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        let now = Instant::now();
        for (id, entry) in inner.pending.drain() {
            let _ = entry.waiter.send(Err(TimeoutError {
                request_id: id,
                after: now.saturating_duration_since(entry.created),
            }));
        }
    }

    /// Number of outstanding requests
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether `request_id` is outstanding
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.lock().pending.contains_key(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{split, ChunkLimits, MessageKind};
    use bytes::Bytes;

    fn small_limits() -> ChunkLimits {
        ChunkLimits {
            chunk_size: 4,
            max_chunks: 16,
            sync_limit: 1024,
            async_limit: 1024,
        }
    }

    #[tokio::test]
    async fn test_single_frame_completion() {
        let correlator = Correlator::new();
        let waiter = correlator.register("r1", Duration::from_secs(5)).unwrap();

        let response = BridgeMessage::new(MessageKind::Response, "r1", Bytes::from_static(b"pong"));
        assert_eq!(correlator.deliver(response).unwrap(), Delivery::Completed);

        let msg = waiter.wait().await.unwrap();
        assert_eq!(&msg.payload[..], b"pong");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_register() {
        let correlator = Correlator::new();
        let _waiter = correlator.register("r1", Duration::from_secs(5)).unwrap();
        assert_eq!(
            correlator.register("r1", Duration::from_secs(5)).unwrap_err(),
            ProtocolError::DuplicateRequest("r1".to_string())
        );
    }

    #[tokio::test]
    async fn test_chunked_out_of_order() {
        let correlator = Correlator::new();
        let waiter = correlator.register("big", Duration::from_secs(5)).unwrap();

        let frames = split(
            MessageKind::Response,
            "big",
            Bytes::from_static(b"0123456789ab"),
            &small_limits(),
        )
        .unwrap();
        assert_eq!(frames.len(), 3);

        assert_eq!(correlator.deliver(frames[2].clone()).unwrap(), Delivery::Buffered);
        assert_eq!(correlator.deliver(frames[0].clone()).unwrap(), Delivery::Buffered);
        assert_eq!(correlator.deliver(frames[1].clone()).unwrap(), Delivery::Completed);

        // A retransmitted chunk after completion is dropped silently
        assert_eq!(correlator.deliver(frames[1].clone()).unwrap(), Delivery::Dropped);

        let msg = waiter.wait().await.unwrap();
        assert_eq!(&msg.payload[..], b"0123456789ab");
    }

    #[test]
    fn test_unknown_request() {
        let correlator = Correlator::new();
        let msg = BridgeMessage::new(MessageKind::Error, "nobody", Bytes::new());
        assert_eq!(correlator.deliver(msg).unwrap(), Delivery::Unknown);
    }

    #[test]
    fn test_non_result_rejected() {
        let correlator = Correlator::new();
        let msg = BridgeMessage::new(MessageKind::Next, "r1", Bytes::new());
        assert!(correlator.deliver(msg).is_err());
    }

    #[tokio::test]
    async fn test_sweep_times_out() {
        let correlator = Correlator::new();
        let waiter = correlator.register("slow", Duration::from_millis(10)).unwrap();
        let _fresh = correlator.register("fresh", Duration::from_secs(60)).unwrap();

        assert_eq!(correlator.sweep(Instant::now()), 0);
        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(correlator.sweep(later), 1);

        let err = waiter.wait().await.unwrap_err();
        assert_eq!(err.request_id, "slow");
        assert!(correlator.is_pending("fresh"));

        // Response arriving after the timeout is dropped
        let late = BridgeMessage::new(MessageKind::Response, "slow", Bytes::new());
        assert_eq!(correlator.deliver(late).unwrap(), Delivery::Dropped);
    }

    #[test]
    fn test_tombstones_pruned() {
        let correlator = Correlator::with_tombstone_ttl(Duration::from_millis(10));
        let _waiter = correlator.register("r1", Duration::from_secs(5)).unwrap();
        let msg = BridgeMessage::new(MessageKind::Response, "r1", Bytes::new());
        correlator.deliver(msg.clone()).unwrap();
        assert_eq!(correlator.deliver(msg.clone()).unwrap(), Delivery::Dropped);

        correlator.sweep(Instant::now() + Duration::from_secs(1));
        assert_eq!(correlator.deliver(msg).unwrap(), Delivery::Unknown);
    }

    #[tokio::test]
    async fn test_corrupt_response_keeps_request() {
        let correlator = Correlator::new();
        let waiter = correlator.register("c", Duration::from_secs(5)).unwrap();

        let mut bad = BridgeMessage::new(MessageKind::Response, "c", Bytes::from_static(b"ok"));
        bad.payload = Bytes::from_static(b"no");
        assert!(matches!(
            correlator.deliver(bad),
            Err(ProtocolError::ChecksumMismatch(_))
        ));
        assert!(correlator.is_pending("c"));

        let good = BridgeMessage::new(MessageKind::Response, "c", Bytes::from_static(b"ok"));
        assert_eq!(correlator.deliver(good).unwrap(), Delivery::Completed);
        assert_eq!(&waiter.wait().await.unwrap().payload[..], b"ok");
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters() {
        let correlator = Correlator::new();
        let waiter = correlator.register("r1", Duration::from_secs(60)).unwrap();
        correlator.shutdown();

        assert!(waiter.wait().await.is_err());
        assert!(correlator.register("r2", Duration::from_secs(1)).is_err());
    }
}
