//! Circular per-session output buffer.
//!
//! Single-writer (the capture task), multi-reader (attachments take
//! immutable snapshots). Sequence numbers are monotonic and gap-free within
//! the retained window; once the byte cap is exceeded, the oldest chunks are
//! dropped and `start_sequence` advances past them.

use crate::constants::OUTPUT_BUFFER_CAP_BYTES;

/// One retained chunk of output.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub sequence: u64,
    pub data: Vec<u8>,
}

/// Describes a replay request that fell behind the retained window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSkipped {
    pub requested_sequence: u64,
    pub resumed_at_sequence: u64,
}

#[derive(Debug)]
pub struct OutputBuffer {
    chunks: Vec<Chunk>,
    bytes_retained: usize,
    next_sequence: u64,
    cap_bytes: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::with_capacity(OUTPUT_BUFFER_CAP_BYTES)
    }

    pub fn with_capacity(cap_bytes: usize) -> Self {
        Self { chunks: Vec::new(), bytes_retained: 0, next_sequence: 0, cap_bytes }
    }

    /// Append a chunk, assigning it the next sequence number, evicting the
    /// oldest retained chunks if the byte cap is now exceeded.
    pub fn append(&mut self, data: Vec<u8>) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.bytes_retained += data.len();
        self.chunks.push(Chunk { sequence, data });

        while self.bytes_retained > self.cap_bytes && self.chunks.len() > 1 {
            let evicted = self.chunks.remove(0);
            self.bytes_retained -= evicted.data.len();
        }
        sequence
    }

    /// The sequence number of the oldest retained chunk, or `next_sequence`
    /// if the buffer is empty.
    pub fn start_sequence(&self) -> u64 {
        self.chunks.first().map(|c| c.sequence).unwrap_or(self.next_sequence)
    }

    /// The sequence number that will be assigned to the next appended chunk.
    pub fn current_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Replay chunks from `from_sequence` (inclusive). If `from_sequence` is
    /// older than `start_sequence`, replay starts from `start_sequence`
    /// instead and the gap is reported via the returned [`OutputSkipped`].
    pub fn replay_from(&self, from_sequence: u64) -> (Option<OutputSkipped>, Vec<Chunk>) {
        let start = self.start_sequence();
        let (skipped, effective_from) = if from_sequence < start {
            (Some(OutputSkipped { requested_sequence: from_sequence, resumed_at_sequence: start }), start)
        } else {
            (None, from_sequence)
        };

        let chunks = self.chunks.iter().filter(|c| c.sequence >= effective_from).cloned().collect();
        (skipped, chunks)
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes_retained = 0;
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_monotonic_and_gap_free() {
        let mut buffer = OutputBuffer::new();
        let a = buffer.append(b"one".to_vec());
        let b = buffer.append(b"two".to_vec());
        let c = buffer.append(b"three".to_vec());
        assert_eq!([a, b, c], [0, 1, 2]);
        assert_eq!(buffer.current_sequence(), 3);
    }

    #[test]
    fn replay_from_current_start_returns_everything_with_no_gap() {
        let mut buffer = OutputBuffer::new();
        buffer.append(b"a".to_vec());
        buffer.append(b"b".to_vec());
        let (skipped, chunks) = buffer.replay_from(0);
        assert!(skipped.is_none());
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn eviction_advances_start_sequence_and_reports_the_gap() {
        let mut buffer = OutputBuffer::with_capacity(10);
        for _ in 0..5 {
            buffer.append(vec![b'x'; 4]);
        }
        let start = buffer.start_sequence();
        assert!(start > 0);

        let (skipped, chunks) = buffer.replay_from(0);
        let skipped = skipped.expect("requesting an evicted sequence must report a gap");
        assert_eq!(skipped.requested_sequence, 0);
        assert_eq!(skipped.resumed_at_sequence, start);
        assert_eq!(chunks.first().unwrap().sequence, start);
    }

    #[test]
    fn clear_resets_retained_chunks_but_not_the_sequence_counter() {
        let mut buffer = OutputBuffer::new();
        buffer.append(b"a".to_vec());
        buffer.clear();
        assert_eq!(buffer.start_sequence(), 1);
        assert_eq!(buffer.current_sequence(), 1);
    }
}
