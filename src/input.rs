//! Non-blocking input reader for the submitter: pulls bytes from stdin
//! (or any `AsyncRead`, for testing) and hands back owned chunks split
//! on a caller-chosen separator.
//!
//! Grounded on the original client's `input_start`/`input_read_chunk`/
//! `read_cb` trio: the reader only ever pulls more bytes when a chunk
//! has been requested and none is already buffered, and on EOF any
//! residual bytes are delivered as one final chunk before signalling
//! end of input.

use crate::buffer::ByteBuffer;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of each individual read into the underlying source.
const READ_CHUNK_SIZE: usize = 4096;

pub struct InputReader<R> {
    source: R,
    buffer: ByteBuffer,
    separator: u8,
    eof_seen: bool,
}

impl<R> InputReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(source: R, separator: u8) -> Self {
        InputReader {
            source,
            buffer: ByteBuffer::new(),
            separator,
            eof_seen: false,
        }
    }

    /// Returns the next record, reading more input as needed. `Ok(None)`
    /// signals clean end of input with nothing left to deliver.
    pub async fn read_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(chunk) = self.buffer.read_chunk(self.separator) {
                return Ok(Some(chunk));
            }
            if self.eof_seen {
                return Ok(if self.buffer.is_empty() {
                    None
                } else {
                    Some(self.buffer.slurp())
                });
            }

            let mut tmp = [0u8; READ_CHUNK_SIZE];
            let n = self.source.read(&mut tmp).await?;
            if n == 0 {
                self.eof_seen = true;
                continue;
            }
            self.buffer.append(&tmp[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn splits_on_separator() {
        let mut reader = InputReader::new(Cursor::new(b"h1\t0\tOK\x1bh2\t0\tCRIT\x1b".to_vec()), 0x1b);
        assert_eq!(reader.read_chunk().await.unwrap().unwrap(), b"h1\t0\tOK");
        assert_eq!(reader.read_chunk().await.unwrap().unwrap(), b"h2\t0\tCRIT");
        assert_eq!(reader.read_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn residual_bytes_flushed_as_final_chunk_on_eof() {
        let mut reader = InputReader::new(Cursor::new(b"only-one-chunk-no-separator".to_vec()), 0x1b);
        assert_eq!(
            reader.read_chunk().await.unwrap().unwrap(),
            b"only-one-chunk-no-separator"
        );
        assert_eq!(reader.read_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_input_yields_no_chunks() {
        let mut reader = InputReader::new(Cursor::new(Vec::new()), 0x1b);
        assert_eq!(reader.read_chunk().await.unwrap(), None);
    }
}
