use std::fmt;

use gantry_utils::safe_assert;
use tracing::trace;

/// Front slack tolerated before the buffer shifts pending bytes back to
/// offset zero.
const COMPACT_THRESHOLD: usize = 16 * 1024;

/// Per-socket byte queue with a consume cursor.
///
/// `append` never fails (the backing vec grows); `consume` advances the
/// cursor and reclaims the front lazily. Pending bytes survive arbitrarily
/// interleaved partial reads and writes, which is the whole point: the kernel
/// hands us fragments, the framing layer consumes whole frames.
#[derive(Default)]
pub struct ByteBuf {
    data: Vec<u8>,
    start: usize,
}

impl ByteBuf {
    pub fn with_capacity(cap: usize) -> Self {
        Self { data: Vec::with_capacity(cap), start: 0 }
    }

    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.data.len() - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Up to `n` pending bytes without consuming them. Short when fewer are
    /// pending.
    #[inline]
    pub fn peek(&self, n: usize) -> &[u8] {
        let end = (self.start + n).min(self.data.len());
        &self.data[self.start..end]
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Advance the cursor. Consuming more than `pending()` is a caller bug.
    pub fn consume(&mut self, n: usize) {
        safe_assert!(n <= self.pending(), "consume {n} > pending {}", self.pending());
        self.start = (self.start + n).min(self.data.len());

        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        } else if self.start > COMPACT_THRESHOLD {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }

    /// Consume and return the next `n` pending bytes (short when fewer are
    /// pending).
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        let out = self.peek(n).to_vec();
        self.consume(out.len());
        out
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf").field("pending", &self.pending()).finish()
    }
}

/// Which way bytes are moving, for the hexdump tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ingress => "recv",
            Self::Egress => "send",
        })
    }
}

/// Trace-level hexdump of a buffer slice, 16 bytes per row with an ASCII
/// gutter. Callers gate on their debug flags; the dump itself never mutates
/// anything.
pub fn hexdump(dir: Direction, conn_id: u64, data: &[u8]) {
    trace!("hexdump {dir} conn={conn_id} len={}", data.len());
    for (row, chunk) in data.chunks(16).enumerate() {
        let mut hex = String::with_capacity(48);
        let mut ascii = String::with_capacity(16);
        for b in chunk {
            hex.push_str(&format!("{b:02x} "));
            ascii.push(if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' });
        }
        trace!("{:08x}  {hex:<48} {ascii}", row * 16);
    }
}
