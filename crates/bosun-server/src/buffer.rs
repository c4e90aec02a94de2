//! The in-memory log that captures everything a job writes to one of its
//! output streams, and the cursors through which clients read it back.
//!
//! An [`OutputBuffer`] is append-only: bytes are only ever added at the
//! tail, and once the buffer is closed it never changes again. That gives
//! every reader a stable view of history, so any number of [`ByteStream`]s
//! can replay the stream from the first byte while the producer is still
//! writing. The producer never blocks on readers; memory use is bounded
//! only by how much the job writes, which is a known limitation of this
//! design.

use std::fmt::{self, Display};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Largest chunk a single [`ByteStream::next`] call will return. Keeps any
/// one response message comfortably under the transport's message size
/// limit.
const MAX_CHUNK: u64 = 64 * 1024;

#[derive(Debug, Eq, PartialEq)]
pub enum BufferError {
    /// Write attempted after the buffer was closed.
    Closed,
    /// Read attempted past the end of the buffer.
    OffsetOutOfRange { offset: u64, size: u64 },
}

impl Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::Closed => write!(f, "buffer is closed"),
            BufferError::OffsetOutOfRange { offset, size } => {
                write!(f, "offset {offset} is beyond the buffer size {size}")
            }
        }
    }
}

impl std::error::Error for BufferError {}

#[derive(Default, Debug)]
struct Inner {
    bytes: Vec<u8>,
    closed: bool,
}

#[derive(Debug)]
pub struct OutputBuffer {
    inner: Mutex<Inner>,
    // Bumped on every write and on close; readers park on the receiver side.
    version: watch::Sender<()>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        let (version, _) = watch::channel(());
        OutputBuffer {
            inner: Mutex::new(Inner::default()),
            version,
        }
    }

    /// Append `data` and wake every blocked reader.
    pub fn write(&self, data: &[u8]) -> Result<(), BufferError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(BufferError::Closed);
            }
            inner.bytes.extend_from_slice(data);
        }
        self.version.send_replace(());
        Ok(())
    }

    /// Mark the buffer terminal and wake every blocked reader. Idempotent.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.version.send_replace(());
    }

    pub fn closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().bytes.len() as u64
    }

    /// Copy bytes starting at `offset` into `dest`, returning how many were
    /// copied: `min(dest.len(), size - offset)`, which is 0 exactly at the
    /// tail. An `offset` beyond the tail is an error.
    pub fn read_at(&self, dest: &mut [u8], offset: u64) -> Result<usize, BufferError> {
        let inner = self.inner.lock().unwrap();
        let size = inner.bytes.len() as u64;
        if offset > size {
            return Err(BufferError::OffsetOutOfRange { offset, size });
        }
        let count = dest.len().min((size - offset) as usize);
        dest[..count].copy_from_slice(&inner.bytes[offset as usize..offset as usize + count]);
        Ok(count)
    }
}

/// A reader cursor over an [`OutputBuffer`]. Streams are independent: each
/// starts at offset 0, observes the identical byte sequence, and can be
/// closed without affecting the buffer or any other stream.
pub struct ByteStream {
    buffer: Arc<OutputBuffer>,
    offset: u64,
    updates: watch::Receiver<()>,
    cancel: CancellationToken,
}

impl ByteStream {
    /// A new reader cursor over `buffer`, positioned at the first byte.
    pub fn new(buffer: Arc<OutputBuffer>) -> Self {
        let updates = buffer.version.subscribe();
        ByteStream {
            buffer,
            offset: 0,
            updates,
            cancel: CancellationToken::new(),
        }
    }

    /// The next non-empty run of bytes at the cursor, at most [`MAX_CHUNK`]
    /// long. Blocks until bytes arrive, the buffer closes, or this stream is
    /// closed; `None` means end of stream.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            {
                let inner = self.buffer.inner.lock().unwrap();
                let size = inner.bytes.len() as u64;
                if self.offset < size {
                    let end = size.min(self.offset + MAX_CHUNK);
                    let chunk = inner.bytes[self.offset as usize..end as usize].to_vec();
                    self.offset = end;
                    return Some(chunk);
                }
                if inner.closed {
                    return None;
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.updates.changed() => {
                    if result.is_err() {
                        // The buffer is gone; nothing more will arrive.
                        return None;
                    }
                }
            }
        }
    }

    /// Stop this stream. A blocked or subsequent `next` returns `None`.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}
