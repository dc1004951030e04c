//! Fixed-size chunk reader used by the streaming-chunked codec path.
//!
//! Spec §4.6 step 6 calls for splitting a large file into `chunk_size`-byte
//! pieces (not content-defined chunking); this reads a `chunk_size` buffer
//! at a time from any `Read`, handling short reads the way the teacher's own
//! `tools::file_chunker` does, until EOF. The final chunk may be shorter.

use std::io::{ErrorKind, Read};

pub struct FixedSizeChunker<R: Read> {
    inner: R,
    chunk_size: usize,
    eof: bool,
}

impl<R: Read> FixedSizeChunker<R> {
    pub fn new(inner: R, chunk_size: usize) -> Self {
        Self { inner, chunk_size, eof: false }
    }

    /// Returns `Ok(None)` once the underlying reader is exhausted.
    pub fn next_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        if self.eof {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn splits_into_fixed_chunks_with_short_tail() {
        let data = vec![7u8; 10];
        let mut chunker = FixedSizeChunker::new(Cursor::new(data), 4);
        assert_eq!(chunker.next_chunk().unwrap().unwrap().len(), 4);
        assert_eq!(chunker.next_chunk().unwrap().unwrap().len(), 4);
        assert_eq!(chunker.next_chunk().unwrap().unwrap().len(), 2);
        assert!(chunker.next_chunk().unwrap().is_none());
    }

    #[test]
    fn exact_multiple_has_no_empty_tail_chunk() {
        let data = vec![1u8; 8];
        let mut chunker = FixedSizeChunker::new(Cursor::new(data), 4);
        assert_eq!(chunker.next_chunk().unwrap().unwrap().len(), 4);
        assert_eq!(chunker.next_chunk().unwrap().unwrap().len(), 4);
        assert!(chunker.next_chunk().unwrap().is_none());
    }
}
