use log::trace;

use crate::codec::{STX, find_message};

/// Cuts a byte stream, delivered in chunks of any size, into complete frames.
///
/// Whatever is not yet part of a complete frame stays buffered for the next
/// chunk. Noise in front of an STX is dropped once that STX is found.
///
/// A frame that never validates (a corrupt sum) blocks the splitter until the
/// stream ends, since every later byte is then scanned as part of it.
#[derive(Debug, Default)]
pub struct MessageSplitter {
    buf: Vec<u8>,
}

impl MessageSplitter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Add a chunk without extracting anything.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Remove and return the next complete frame, if the buffer holds one.
    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        let start = self.buf.iter().position(|b| *b == STX)?;
        if start > 0 {
            trace!("dropping {start} bytes ahead of STX");
            self.buf.drain(..start);
        }
        let end = find_message(&self.buf)?;
        Some(self.buf.drain(..=end).collect())
    }

    /// Add a chunk and return every frame it completed, in arrival order.
    pub fn ingest(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.push(chunk);
        std::iter::from_fn(|| self.next_message()).collect()
    }

    /// Take whatever is left once the stream has ended.
    ///
    /// The result has not been validated and is usually a truncated frame.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}
