use std::{collections::VecDeque, io};

use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Errors that can occur while reading from a [`RingBuffer`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingBufferError {
    /// More bytes were requested than the buffer currently holds
    #[error("Cannot read {requested} bytes from ring buffer holding only {available} bytes")]
    Insufficient { requested: usize, available: usize },

    /// The sink passed to `read_to` failed
    #[error("Ring buffer sink failed after {written} bytes: {message}")]
    SinkFailed { written: usize, message: String },
}

/// Growable byte queue made of fixed-size chunks.
///
/// Bytes are appended at the tail chunk and consumed from the head chunk. Chunks
/// that have been fully consumed go to a free list and are reused by later
/// writes instead of being reallocated.
pub struct RingBuffer {
    chunk_size: usize,
    chunks: VecDeque<Box<[u8]>>,
    free_chunks: Vec<Box<[u8]>>,
    // read cursor inside the head chunk
    first_index: usize,
    // write cursor inside the tail chunk
    last_index: usize,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// # Panics
    /// Panics if `chunk_size` is zero
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "ring buffer chunk size must be non-zero");
        Self {
            chunk_size,
            chunks: VecDeque::new(),
            free_chunks: Vec::new(),
            first_index: 0,
            last_index: 0,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes written and not yet read
    pub fn len(&self) -> usize {
        if self.chunks.is_empty() {
            return 0;
        }
        (self.chunks.len() - 1) * self.chunk_size + self.last_index - self.first_index
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunks currently holding (or ready to hold) data
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunks waiting on the free list
    pub fn free_chunk_count(&self) -> usize {
        self.free_chunks.len()
    }

    pub fn write(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.chunks.is_empty() || self.last_index == self.chunk_size {
                self.push_chunk();
            }
            let Some(tail) = self.chunks.back_mut() else {
                return;
            };
            let count = bytes.len().min(self.chunk_size - self.last_index);
            tail[self.last_index..self.last_index + count].copy_from_slice(&bytes[..count]);
            self.last_index += count;
            bytes = &bytes[count..];
        }
    }

    /// Copies `out.len()` bytes into `out` and consumes them
    pub fn read_into(&mut self, out: &mut [u8]) -> Result<(), RingBufferError> {
        self.check_available(out.len())?;
        let mut written = 0;
        while written < out.len() {
            let (count, chunk_drained) = self.copy_from_head(&mut out[written..]);
            if count == 0 && !chunk_drained {
                break;
            }
            written += count;
            if chunk_drained {
                self.recycle_head();
            }
        }
        Ok(())
    }

    /// Consumes and returns `count` bytes
    pub fn read(&mut self, count: usize) -> Result<Vec<u8>, RingBufferError> {
        let mut out = vec![0u8; count];
        self.read_into(&mut out)?;
        Ok(out)
    }

    /// Moves `count` bytes into `sink`, chunk by chunk
    pub fn read_to<W: io::Write>(
        &mut self,
        sink: &mut W,
        count: usize,
    ) -> Result<(), RingBufferError> {
        self.check_available(count)?;
        let mut written = 0;
        while written < count {
            let Some(head) = self.chunks.front() else {
                break;
            };
            let end = if self.chunks.len() == 1 {
                self.last_index
            } else {
                self.chunk_size
            };
            let take = (end - self.first_index).min(count - written);
            sink.write_all(&head[self.first_index..self.first_index + take])
                .map_err(|err| RingBufferError::SinkFailed {
                    written,
                    message: err.to_string(),
                })?;
            self.first_index += take;
            written += take;
            if self.first_index == self.chunk_size {
                self.recycle_head();
            }
        }
        Ok(())
    }

    /// Copies the first `out.len()` bytes into `out` without consuming them
    pub fn peek_into(&self, out: &mut [u8]) -> Result<(), RingBufferError> {
        self.check_available(out.len())?;
        let mut written = 0;
        let mut offset = self.first_index;
        for (index, chunk) in self.chunks.iter().enumerate() {
            if written == out.len() {
                break;
            }
            let end = if index + 1 == self.chunks.len() {
                self.last_index
            } else {
                self.chunk_size
            };
            let take = (end - offset).min(out.len() - written);
            out[written..written + take].copy_from_slice(&chunk[offset..offset + take]);
            written += take;
            offset = 0;
        }
        Ok(())
    }

    /// Drops `count` bytes from the head
    pub fn skip(&mut self, mut count: usize) -> Result<(), RingBufferError> {
        self.check_available(count)?;
        while count > 0 {
            let end = if self.chunks.len() == 1 {
                self.last_index
            } else {
                self.chunk_size
            };
            let take = (end - self.first_index).min(count);
            self.first_index += take;
            count -= take;
            if self.first_index == self.chunk_size {
                self.recycle_head();
            }
        }
        Ok(())
    }

    /// Discards all content, keeping every chunk for reuse
    pub fn clear(&mut self) {
        while let Some(chunk) = self.chunks.pop_front() {
            self.free_chunks.push(chunk);
        }
        self.first_index = 0;
        self.last_index = 0;
    }

    fn check_available(&self, requested: usize) -> Result<(), RingBufferError> {
        let available = self.len();
        if requested > available {
            return Err(RingBufferError::Insufficient {
                requested,
                available,
            });
        }
        Ok(())
    }

    // Returns the number of bytes copied and whether the head chunk is now exhausted
    fn copy_from_head(&mut self, out: &mut [u8]) -> (usize, bool) {
        let single = self.chunks.len() == 1;
        let Some(head) = self.chunks.front() else {
            return (0, false);
        };
        let end = if single {
            self.last_index
        } else {
            self.chunk_size
        };
        let count = (end - self.first_index).min(out.len());
        out[..count].copy_from_slice(&head[self.first_index..self.first_index + count]);
        self.first_index += count;
        (count, self.first_index == self.chunk_size)
    }

    fn push_chunk(&mut self) {
        let chunk = self
            .free_chunks
            .pop()
            .unwrap_or_else(|| vec![0u8; self.chunk_size].into_boxed_slice());
        self.chunks.push_back(chunk);
        self.last_index = 0;
    }

    fn recycle_head(&mut self) {
        if let Some(chunk) = self.chunks.pop_front() {
            self.free_chunks.push(chunk);
        }
        self.first_index = 0;
        if self.chunks.is_empty() {
            self.last_index = 0;
        }
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Write for RingBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RingBuffer::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for RingBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len().min(self.len());
        self.read_into(&mut buf[..count])
            .map_err(|err| io::Error::new(io::ErrorKind::UnexpectedEof, err))?;
        Ok(count)
    }
}
