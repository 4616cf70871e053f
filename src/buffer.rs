//! FIFO byte buffer with block-chunked storage.
//!
//! Bytes are appended in fixed-size blocks and consumed from the front.
//! When the buffer drains to empty its last block is dropped so that the
//! next `append` can hand the buffer a fresh block outright instead of
//! growing an existing (possibly oversized) allocation.

use std::collections::VecDeque;

/// Size of an individual storage block, matching the original protocol
/// proxy's line-reading chunk size.
const BLOCK_SIZE: usize = 128;

/// An ordered, owned sequence of bytes backed by a deque of fixed blocks.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    blocks: VecDeque<Vec<u8>>,
    size: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        ByteBuffer {
            blocks: VecDeque::new(),
            size: 0,
        }
    }

    /// Total number of unread bytes currently held.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Appends `data` to the end of the buffer, filling the final
    /// partially-used block before allocating new ones.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.size += data.len();
        let mut rest = data;

        if let Some(last) = self.blocks.back_mut() {
            if last.len() < BLOCK_SIZE {
                let take = (BLOCK_SIZE - last.len()).min(rest.len());
                last.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
            }
        }

        while !rest.is_empty() {
            let take = rest.len().min(BLOCK_SIZE);
            self.blocks.push_back(rest[..take].to_vec());
            rest = &rest[take..];
        }
    }

    /// Copies up to `dst.len()` bytes into `dst`, returning the number of
    /// bytes actually read.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let mut written = 0;
        while written < dst.len() {
            let block = match self.blocks.front_mut() {
                Some(b) => b,
                None => break,
            };
            let take = (dst.len() - written).min(block.len());
            dst[written..written + take].copy_from_slice(&block[..take]);
            written += take;
            block.drain(..take);
            self.size -= take;
            if block.is_empty() {
                self.blocks.pop_front();
            }
        }
        written
    }

    /// Removes and returns up to `n` bytes, detaching the backing storage
    /// without a copy when the whole buffer is a single block being
    /// consumed in full.
    pub fn read_alloc(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.size);
        if self.blocks.len() == 1 && self.blocks[0].len() == n {
            self.size -= n;
            return self.blocks.pop_front().unwrap();
        }
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let block = self.blocks.front_mut().expect("size accounting bug");
            let take = (n - out.len()).min(block.len());
            out.extend_from_slice(&block[..take]);
            block.drain(..take);
            self.size -= take;
            if block.is_empty() {
                self.blocks.pop_front();
            }
        }
        out
    }

    /// Drains every byte currently buffered.
    pub fn slurp(&mut self) -> Vec<u8> {
        self.read_alloc(self.size)
    }

    /// Position of the first occurrence of `byte`, scanning block by
    /// block, or `None` if absent.
    fn find(&self, byte: u8) -> Option<usize> {
        let mut offset = 0;
        for block in &self.blocks {
            if let Some(pos) = block.iter().position(|&b| b == byte) {
                return Some(offset + pos);
            }
            offset += block.len();
        }
        None
    }

    /// Returns the next `\n`- or `\r\n`-terminated line with the
    /// terminator stripped, or `None` if no full line is buffered yet.
    pub fn read_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.find(b'\n')?;
        let mut line = self.read_alloc(pos + 1);
        line.pop(); // trailing \n
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    /// Returns the next chunk terminated by `terminator`, with the
    /// terminator stripped, or `None` if not yet fully buffered.
    pub fn read_chunk(&mut self, terminator: u8) -> Option<Vec<u8>> {
        let pos = self.find(terminator)?;
        let mut chunk = self.read_alloc(pos + 1);
        chunk.pop();
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn append_then_read_into_preserves_order() {
        let mut buf = ByteBuffer::new();
        buf.append(b"hello, ");
        buf.append(b"world");
        assert_eq!(buf.size(), 12);
        let mut out = vec![0u8; 12];
        let n = buf.read_into(&mut out);
        assert_eq!(n, 12);
        assert_eq!(&out, b"hello, world");
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn read_into_is_prefix_of_concatenated_input() {
        let mut buf = ByteBuffer::new();
        let chunks: &[&[u8]] = &[b"abc", b"defgh", b"ij"];
        let mut all = Vec::new();
        for c in chunks {
            buf.append(c);
            all.extend_from_slice(c);
        }
        let mut out = vec![0u8; 5];
        let n = buf.read_into(&mut out);
        assert_eq!(n, 5);
        assert_eq!(&out[..n], &all[..5]);
        assert_eq!(buf.size(), all.len() - 5);
    }

    #[test]
    fn read_line_strips_crlf() {
        let mut buf = ByteBuffer::new();
        buf.append(b"MOIN 1 abc123\r\n");
        let line = buf.read_line().unwrap();
        assert_eq!(line, b"MOIN 1 abc123");
        assert!(buf.is_empty());
    }

    #[test]
    fn read_line_strips_bare_lf() {
        let mut buf = ByteBuffer::new();
        buf.append(b"PING\n");
        let line = buf.read_line().unwrap();
        assert_eq!(line, b"PING");
    }

    #[test]
    fn read_line_returns_none_without_terminator() {
        let mut buf = ByteBuffer::new();
        buf.append(b"incomplete");
        assert!(buf.read_line().is_none());
        assert_eq!(buf.size(), 10);
    }

    #[test]
    fn read_chunk_strips_custom_terminator() {
        let mut buf = ByteBuffer::new();
        buf.append(b"h1\tdisk\t0\x1b");
        let chunk = buf.read_chunk(0x1b).unwrap();
        assert_eq!(chunk, b"h1\tdisk\t0");
    }

    #[test]
    fn zero_copy_detach_on_single_block_full_drain() {
        let mut buf = ByteBuffer::new();
        buf.append(b"short");
        assert_eq!(buf.blocks.len(), 1);
        let out = buf.read_alloc(5);
        assert_eq!(out, b"short");
        // draining to empty must drop the now-empty block
        assert!(buf.blocks.is_empty());
    }

    #[test]
    fn spans_many_blocks() {
        let mut buf = ByteBuffer::new();
        let data = vec![7u8; BLOCK_SIZE * 3 + 17];
        buf.append(&data);
        assert_eq!(buf.size(), data.len());
        let out = buf.slurp();
        assert_eq!(out, data);
        assert!(buf.is_empty());
        assert!(buf.blocks.is_empty());
    }

    #[test]
    fn slurp_drains_everything() {
        let mut buf = ByteBuffer::new();
        buf.append(b"one");
        buf.append(b"two");
        let out = buf.slurp();
        assert_eq!(out, b"onetwo");
        assert_eq!(buf.size(), 0);
    }
}
