//! Framing for unordered, lossy channels: one logical payload is cut
//! into size-bounded chunks tagged with a request id, and reassembled
//! on the far side by that id alone, whatever the arrival order.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;
use webkad_logic::Id;

/// One wire frame: `{ id, count?, i?, chunk }`. Only the first chunk
/// of a payload carries `count`; a missing `i` means chunk zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i: Option<u32>,
    pub chunk: String,
}

// Chunk indices come off the wire and size the reassembly buffer;
// nothing legitimate needs more pieces than this.
const MAX_CHUNKS: usize = 4096;

/// Splits a payload into chunk frames of at most `mtu` encoded bytes.
/// Always produces at least one frame, so empty payloads round-trip.
pub fn chop(id: Id, payload: &[u8], mtu: usize) -> Vec<ChunkFrame> {
    assert!(mtu >= 1, "mtu must be at least 1");
    let encoded = base64::encode(payload);

    // base64 text is plain ASCII, byte slicing is char-safe
    let mut pieces: Vec<String> = encoded
        .as_bytes()
        .chunks(mtu)
        .map(|x| String::from_utf8(x.to_vec()).expect("base64 is ascii"))
        .collect();
    if pieces.is_empty() {
        pieces.push(String::new());
    }

    let count = pieces.len() as u32;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| ChunkFrame {
            id,
            count: (i == 0).then(|| count),
            i: (i > 0).then(|| i as u32),
            chunk,
        })
        .collect()
}

#[derive(Debug, Default)]
struct ReassemblyEntry {
    // Learned from the first chunk that carries it
    count: Option<usize>,
    chunks: Vec<Option<String>>,
    // Set once dispatched; later chunks for the same id are ignored
    complete: bool,
}

impl ReassemblyEntry {
    fn store(&mut self, index: usize, chunk: String) {
        if self.chunks.len() <= index {
            self.chunks.resize(index + 1, None);
        }
        self.chunks[index] = Some(chunk);
    }

    fn try_finish(&mut self) -> Option<Vec<u8>> {
        let count = self.count?;
        if self.chunks.len() < count || self.chunks[..count].iter().any(Option::is_none) {
            return None;
        }
        self.complete = true;
        let payload: String = self.chunks[..count]
            .iter_mut()
            .map(|x| x.take().unwrap())
            .collect();
        match base64::decode(&payload) {
            Ok(x) => Some(x),
            Err(x) => {
                warn!("Discarding undecodable payload: {x}");
                None
            }
        }
    }
}

/// Per-peer reassembly state, keyed by request id. Bounded: once
/// `cap` ids are tracked the oldest entry is abandoned, so a peer
/// that never completes its payloads cannot grow the table forever.
#[derive(Debug)]
pub struct ReassemblyTable {
    entries: HashMap<Id, ReassemblyEntry>,
    order: VecDeque<Id>,
    cap: usize,
}

impl ReassemblyTable {
    pub fn new(cap: usize) -> Self {
        ReassemblyTable {
            entries: HashMap::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Feeds one frame in; returns the payload exactly once, when its
    /// last missing chunk arrives.
    pub fn push(&mut self, frame: ChunkFrame) -> Option<Vec<u8>> {
        if !self.entries.contains_key(&frame.id) {
            if self.entries.len() >= self.cap {
                if let Some(oldest) = self.order.pop_front() {
                    warn!("Abandoning stale reassembly {oldest}");
                    self.entries.remove(&oldest);
                }
            }
            self.order.push_back(frame.id);
            self.entries.insert(frame.id, ReassemblyEntry::default());
        }

        let entry = self.entries.get_mut(&frame.id).unwrap();
        if entry.complete {
            // This payload was dispatched already
            return None;
        }

        if entry.count.is_none() {
            entry.count = frame.count.map(|x| x as usize);
        }
        let index = frame.i.unwrap_or(0) as usize;
        if index >= entry.count.unwrap_or(MAX_CHUNKS).min(MAX_CHUNKS) {
            warn!("Discarding chunk {index} outside the bounds of {}", frame.id);
            return None;
        }
        entry.store(index, frame.chunk);
        entry.try_finish()
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::SliceRandom;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn reassemble(frames: Vec<ChunkFrame>) -> Option<Vec<u8>> {
        let mut table = ReassemblyTable::new(16);
        let mut res = None;
        for frame in frames {
            if let Some(payload) = table.push(frame) {
                assert!(res.is_none(), "dispatched more than once");
                res = Some(payload);
            }
        }
        res
    }

    #[test]
    fn round_trip_any_permutation_any_mtu() {
        let mut rng = StdRng::seed_from_u64(11);
        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
        for mtu in [1usize, 2, 3, 7, 16, 1024] {
            let mut frames = chop(rng.gen(), &payload, mtu);
            frames.shuffle(&mut rng);
            assert_eq!(reassemble(frames), Some(payload.clone()), "mtu {mtu}");
        }
    }

    #[test]
    fn hello_mtu_two_reversed() {
        let id = Id::from_hex("0123");
        // "hello" -> base64 "aGVsbG8=" -> 4 chunks at mtu 2
        let mut frames = chop(id, b"hello", 2);
        assert_eq!(frames[0].count, Some(4));
        frames.reverse();
        assert_eq!(reassemble(frames), Some(b"hello".to_vec()));
    }

    #[test]
    fn double_delivery_dispatches_once() {
        let id = Id::from_hex("ff");
        let frames = chop(id, b"ping", 3);
        let mut table = ReassemblyTable::new(4);
        let mut dispatched = 0;
        for frame in frames.iter().cloned().chain(frames.iter().cloned()) {
            if table.push(frame).is_some() {
                dispatched += 1;
            }
        }
        assert_eq!(dispatched, 1);
    }

    #[test]
    fn empty_payload() {
        let frames = chop(Id::from_hex("01"), b"", 8);
        assert_eq!(frames.len(), 1);
        assert_eq!(reassemble(frames), Some(Vec::new()));
    }

    #[test]
    fn interleaved_ids_do_not_mix() {
        let a = chop(Id::from_hex("0a"), b"first message", 4);
        let b = chop(Id::from_hex("0b"), b"second one", 4);
        let mut table = ReassemblyTable::new(8);
        let mut results = Vec::new();

        // Chunks of distinct ids interleave arbitrarily
        for (x, y) in a.iter().zip(b.iter().rev()) {
            if let Some(p) = table.push(y.clone()) {
                results.push(p);
            }
            if let Some(p) = table.push(x.clone()) {
                results.push(p);
            }
        }
        for frame in a.iter().skip(b.len()).cloned() {
            if let Some(p) = table.push(frame) {
                results.push(p);
            }
        }
        results.sort();
        let mut expect = vec![b"first message".to_vec(), b"second one".to_vec()];
        expect.sort();
        assert_eq!(results, expect);
    }

    #[test]
    fn hostile_chunk_index_is_discarded() {
        let id = Id::from_hex("0bad");
        let mut table = ReassemblyTable::new(4);
        // An index near u32::MAX must not size the buffer
        let hostile = ChunkFrame {
            id,
            count: None,
            i: Some(u32::MAX - 1),
            chunk: "AA".to_owned(),
        };
        assert_eq!(table.push(hostile), None);

        // Indices past the declared count are discarded too
        let mut frames = chop(id, b"hi", 64).into_iter();
        assert_eq!(table.push(frames.next().unwrap()), Some(b"hi".to_vec()));
        let beyond = ChunkFrame {
            id: Id::from_hex("0bae"),
            count: Some(2),
            i: None,
            chunk: "AA".to_owned(),
        };
        assert_eq!(table.push(beyond), None);
        let past = ChunkFrame {
            id: Id::from_hex("0bae"),
            count: None,
            i: Some(7),
            chunk: "AA".to_owned(),
        };
        assert_eq!(table.push(past), None);
    }

    #[test]
    fn stale_entries_are_bounded() {
        let mut table = ReassemblyTable::new(4);
        // Eight half-delivered payloads; the table must not track more
        // than its cap
        for n in 0u8..8 {
            let frames = chop(Id::from_hex(&format!("{n:02x}")), b"never finished", 4);
            table.push(frames[0].clone());
        }
        assert!(table.len() <= 4);
    }
}
