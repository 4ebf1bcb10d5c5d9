//! Chunking and reassembly of oversized payloads
//!
//! A logical message is split into frames that share a request id and a
//! digest. [`Assembly`] collects the frames of one message in any order,
//! and [`Reassembler`] keeps one assembly per request id with explicit
//! eviction so abandoned messages cannot pile up.

use super::digest::{digest, digest_parts};
use super::types::{BridgeMessage, InvocationType, MessageKind};
use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Chunking limits shared by both ends of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    /// Payload bytes per chunk
    pub chunk_size: usize,
    /// Maximum chunks per message
    pub max_chunks: usize,
    /// Runtime limit for request/response payloads
    pub sync_limit: usize,
    /// Runtime limit for event payloads
    pub async_limit: usize,
}

impl ChunkLimits {
    /// Largest payload the relay can carry for an invocation type
    pub fn effective_limit(&self, invocation_type: InvocationType) -> usize {
        let relay_budget = self.chunk_size.saturating_mul(self.max_chunks);
        let runtime = match invocation_type {
            InvocationType::Event => self.async_limit,
            InvocationType::RequestResponse | InvocationType::DryRun => self.sync_limit,
        };
        runtime.min(relay_budget)
    }

    /// Reject a payload the relay cannot carry
    pub fn check(&self, size: usize, invocation_type: InvocationType) -> Result<(), ProtocolError> {
        let max = self.effective_limit(invocation_type);
        if size > max {
            return Err(ProtocolError::PayloadTooLarge { size, max });
        }
        Ok(())
    }
}

/// Split a payload into frames of at most `chunk_size` bytes
///
/// An empty payload still yields one (empty) frame.
pub fn split(
    kind: MessageKind,
    request_id: &str,
    payload: Bytes,
    limits: &ChunkLimits,
) -> Result<Vec<BridgeMessage>, ProtocolError> {
    let chunk_size = limits.chunk_size.max(1);
    let total = payload.len().div_ceil(chunk_size).max(1);
    if total > limits.max_chunks {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: chunk_size.saturating_mul(limits.max_chunks),
        });
    }

    let sum = digest(&payload);
    let frames = (0..total)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(payload.len());
            BridgeMessage {
                kind,
                request_id: request_id.to_string(),
                sequence: i as u32,
                total_chunks: total as u32,
                digest: sum,
                payload: payload.slice(start..end),
            }
        })
        .collect();
    Ok(frames)
}

/// Frames of one logical message collected so far
#[derive(Debug)]
pub struct Assembly {
    kind: MessageKind,
    request_id: String,
    total_chunks: u32,
    digest: super::digest::Digest,
    chunks: BTreeMap<u32, Bytes>,
    buffered: usize,
}

impl Assembly {
    /// Start an assembly from its first received frame
    pub fn new(first: &BridgeMessage) -> Self {
        Assembly {
            kind: first.kind,
            request_id: first.request_id.clone(),
            total_chunks: first.total_chunks,
            digest: first.digest,
            chunks: BTreeMap::new(),
            buffered: 0,
        }
    }

    /// Add a frame; returns `true` once every chunk is present
    ///
    /// Identical duplicates are ignored. A frame that disagrees with the
    /// frames already seen is rejected and leaves the assembly unchanged.
    pub fn insert(&mut self, msg: BridgeMessage) -> Result<bool, ProtocolError> {
        let mismatch = |reason: String| ProtocolError::ShapeMismatch {
            request_id: self.request_id.clone(),
            reason,
        };
        if msg.kind != self.kind {
            return Err(mismatch(format!("kind {} != {}", msg.kind, self.kind)));
        }
        if msg.total_chunks != self.total_chunks {
            return Err(mismatch(format!(
                "total_chunks {} != {}",
                msg.total_chunks, self.total_chunks
            )));
        }
        if msg.digest != self.digest {
            return Err(mismatch("digest differs between chunks".to_string()));
        }
        if msg.sequence >= self.total_chunks {
            return Err(mismatch(format!(
                "sequence {} outside {} chunks",
                msg.sequence, self.total_chunks
            )));
        }

        match self.chunks.get(&msg.sequence) {
            Some(existing) if *existing == msg.payload => {
                trace!("Duplicate chunk {} for {}", msg.sequence, self.request_id);
            }
            Some(_) => {
                return Err(mismatch(format!(
                    "conflicting bytes for chunk {}",
                    msg.sequence
                )));
            }
            None => {
                self.buffered += msg.payload.len();
                self.chunks.insert(msg.sequence, msg.payload);
            }
        }

        Ok(self.is_complete())
    }

    /// Whether every chunk is present
    pub fn is_complete(&self) -> bool {
        self.chunks.len() == self.total_chunks as usize
    }

    /// Bytes buffered so far
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Concatenate the chunks in sequence order and verify the digest
    pub fn finish(self) -> Result<BridgeMessage, ProtocolError> {
        if !self.is_complete() {
            return Err(ProtocolError::Malformed(format!(
                "Message {} finished with {}/{} chunks",
                self.request_id,
                self.chunks.len(),
                self.total_chunks
            )));
        }

        let sum = digest_parts(self.chunks.values().map(|b| b.as_ref()));
        if sum != self.digest {
            return Err(ProtocolError::ChecksumMismatch(self.request_id));
        }

        let payload = if self.chunks.len() == 1 {
            self.chunks.into_values().next().unwrap_or_default()
        } else {
            let mut buf = BytesMut::with_capacity(self.buffered);
            for chunk in self.chunks.values() {
                buf.extend_from_slice(chunk);
            }
            buf.freeze()
        };

        Ok(BridgeMessage {
            kind: self.kind,
            request_id: self.request_id,
            sequence: 0,
            total_chunks: 1,
            digest: self.digest,
            payload,
        })
    }
}

/// Arena of in-progress assemblies keyed by request id
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<String, (Instant, Assembly)>,
    max_pending: usize,
}

impl Reassembler {
    /// Create an arena holding at most `max_pending` partial messages
    pub fn new(max_pending: usize) -> Self {
        Reassembler {
            pending: HashMap::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Feed a frame; returns the whole message once it is complete
    pub fn accept(&mut self, msg: BridgeMessage) -> Result<Option<BridgeMessage>, ProtocolError> {
        if msg.is_complete() && !self.pending.contains_key(&msg.request_id) {
            let mut assembly = Assembly::new(&msg);
            assembly.insert(msg)?;
            return assembly.finish().map(Some);
        }

        if !self.pending.contains_key(&msg.request_id) && self.pending.len() >= self.max_pending {
            return Err(ProtocolError::Malformed(format!(
                "Too many partial messages ({}), dropping chunk for {}",
                self.pending.len(),
                msg.request_id
            )));
        }

        let id = msg.request_id.clone();
        let (_, assembly) = self
            .pending
            .entry(id.clone())
            .or_insert_with(|| (Instant::now(), Assembly::new(&msg)));

        if !assembly.insert(msg)? {
            return Ok(None);
        }

        match self.pending.remove(&id) {
            Some((_, assembly)) => assembly.finish().map(Some),
            None => Ok(None),
        }
    }

    /// Drop the partial message for `request_id`
    pub fn evict(&mut self, request_id: &str) -> bool {
        self.pending.remove(request_id).is_some()
    }

    /// Drop partial messages older than `max_age`, returning their ids
    pub fn expire(&mut self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, (started, _))| now.duration_since(*started) >= max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some((_, assembly)) = self.pending.remove(id) {
                debug!(
                    "Expired partial message {} ({} bytes buffered)",
                    id,
                    assembly.buffered()
                );
            }
        }
        expired
    }

    /// Number of partial messages
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no partial message is buffered
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
