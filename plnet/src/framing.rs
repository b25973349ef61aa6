//! # Data-channel framing
//!
//! Application payloads are split into JSON chunks that each fit well under
//! typical SCTP message limits. Chunks of one logical message share a
//! `msgId` and may arrive in any order; the [`Assembler`] buffers them per
//! message and hands the payload out exactly once, when the last chunk is
//! in. Reassembly state is bounded: past the cap, the oldest incomplete
//! message is evicted.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// The payload needs more chunks than the index field can count.
    #[error("payload would need more than {} chunks", u16::MAX)]
    TooManyChunks,
}

/// One fragment of a logical message, as it travels over the data channel.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub channel: String,
    pub msg_id: String,
    pub total: u16,
    pub index: u16,
    #[serde_as(as = "Base64")]
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("chunk serialization cannot fail")
    }

    /// Parses one wire chunk; malformed input is dropped with a debug log.
    pub fn decode(text: &str) -> Option<Chunk> {
        match serde_json::from_str(text) {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                log::debug!("Dropping malformed chunk: {e}");
                None
            }
        }
    }
}

/// Splits a payload into chunks of at most `chunk_bytes` raw bytes. An
/// empty payload still produces one (empty) chunk so the receiver sees it.
pub fn chunkify(channel: &str, payload: &[u8], chunk_bytes: usize) -> Result<Vec<Chunk>, FramingError> {
    let chunk_bytes = chunk_bytes.max(1);
    let total = payload.len().div_ceil(chunk_bytes).max(1);
    if total > u16::MAX as usize {
        return Err(FramingError::TooManyChunks);
    }
    let msg_id = Uuid::new_v4().to_string();
    Ok((0..total)
        .map(|index| {
            let start = index * chunk_bytes;
            let end = (start + chunk_bytes).min(payload.len());
            Chunk {
                channel: channel.to_string(),
                msg_id: msg_id.clone(),
                total: total as u16,
                index: index as u16,
                payload: payload[start..end].to_vec(),
            }
        })
        .collect())
}

struct Partial {
    channel: String,
    total: u16,
    parts: HashMap<u16, Vec<u8>>,
}

/// Per-peer reassembly buffer.
pub struct Assembler {
    cap: usize,
    pending: HashMap<String, Partial>,
    // Insertion order of pending message ids, for eviction.
    order: VecDeque<String>,
}

impl Assembler {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            pending: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Feeds one chunk in. Returns the `(channel, payload)` of the logical
    /// message once its last chunk arrived.
    pub fn insert(&mut self, chunk: Chunk) -> Option<(String, Vec<u8>)> {
        if chunk.total == 0 || chunk.index >= chunk.total {
            log::debug!(
                "Dropping chunk with index {} of {}",
                chunk.index,
                chunk.total
            );
            return None;
        }

        if !self.pending.contains_key(&chunk.msg_id) {
            if self.pending.len() >= self.cap {
                self.evict_oldest();
            }
            self.pending.insert(
                chunk.msg_id.clone(),
                Partial {
                    channel: chunk.channel.clone(),
                    total: chunk.total,
                    parts: HashMap::new(),
                },
            );
            self.order.push_back(chunk.msg_id.clone());
        }

        let partial = self.pending.get_mut(&chunk.msg_id).expect("just inserted");
        if partial.total != chunk.total {
            log::debug!("Dropping chunk with a mismatching total");
            return None;
        }
        // Duplicates keep the first copy.
        partial.parts.entry(chunk.index).or_insert(chunk.payload);

        if partial.parts.len() < partial.total as usize {
            return None;
        }

        let msg_id = chunk.msg_id;
        let mut done = self.pending.remove(&msg_id).expect("complete message");
        self.order.retain(|id| id != &msg_id);
        let mut payload = vec![];
        for index in 0..done.total {
            payload.extend(done.parts.remove(&index).expect("all chunks present"));
        }
        Some((done.channel, payload))
    }

    /// Drops all reassembly state, e.g. when the peer goes away.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.order.clear();
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self.order.pop_front() {
            log::debug!("Evicting incomplete message {oldest}");
            self.pending.remove(&oldest);
        }
    }
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Assembler({} pending)", self.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_round_trip() {
        let chunks = chunkify("chat", b"hi", 1024).unwrap();
        assert_eq!(1, chunks.len());
        let mut assembler = Assembler::new(4);
        let decoded = Chunk::decode(&chunks[0].encode()).unwrap();
        assert_eq!(
            Some(("chat".to_string(), b"hi".to_vec())),
            assembler.insert(decoded)
        );
    }

    #[test]
    fn out_of_order_chunks_deliver_once() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut chunks = chunkify("bulk", &payload, 1024).unwrap();
        assert_eq!(10, chunks.len());
        chunks.reverse();
        // A duplicate in the middle must not cause a double delivery.
        chunks.insert(3, chunks[3].clone());

        let mut assembler = Assembler::new(4);
        let mut delivered = vec![];
        for chunk in chunks {
            if let Some(done) = assembler.insert(chunk) {
                delivered.push(done);
            }
        }
        assert_eq!(1, delivered.len());
        assert_eq!(payload, delivered[0].1);
    }

    #[test]
    fn empty_payload_still_travels() {
        let chunks = chunkify("chat", b"", 1024).unwrap();
        assert_eq!(1, chunks.len());
        let mut assembler = Assembler::new(4);
        assert_eq!(
            Some(("chat".to_string(), vec![])),
            assembler.insert(chunks[0].clone())
        );
    }

    #[test]
    fn bad_indices_are_dropped() {
        let mut assembler = Assembler::new(4);
        let chunk = Chunk {
            channel: "chat".into(),
            msg_id: "m".into(),
            total: 2,
            index: 2,
            payload: vec![1],
        };
        assert_eq!(None, assembler.insert(chunk));
        let chunk = Chunk {
            channel: "chat".into(),
            msg_id: "m".into(),
            total: 0,
            index: 0,
            payload: vec![1],
        };
        assert_eq!(None, assembler.insert(chunk));
    }

    #[test]
    fn cap_evicts_the_oldest_incomplete() {
        let mut assembler = Assembler::new(2);
        for id in ["a", "b", "c"] {
            assembler.insert(Chunk {
                channel: "chat".into(),
                msg_id: id.into(),
                total: 2,
                index: 0,
                payload: vec![1],
            });
        }
        // "a" was evicted: its second chunk starts a fresh partial message.
        assert_eq!(
            None,
            assembler.insert(Chunk {
                channel: "chat".into(),
                msg_id: "a".into(),
                total: 2,
                index: 1,
                payload: vec![2],
            })
        );
        // "c" is still there and completes.
        assert!(assembler
            .insert(Chunk {
                channel: "chat".into(),
                msg_id: "c".into(),
                total: 2,
                index: 1,
                payload: vec![2],
            })
            .is_some());
    }

    #[test]
    fn oversized_payload_is_refused() {
        let payload = vec![0u8; 70_000];
        assert_eq!(
            Err(FramingError::TooManyChunks),
            chunkify("bulk", &payload, 1)
        );
    }
}
