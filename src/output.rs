//! Captured gateway output
//!
//! Each generation of the gateway gets its own [`OutputBuffer`]. Stdout and
//! stderr are pumped into the same buffer chunk by chunk, so the buffer holds
//! the merged stream in arrival order.

use hyper::body::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::debug;

/// Appended once when the buffer reaches its limit
pub const TRUNCATION_MARKER: &[u8] = b"\n[gwplay: output truncated]\n";

const READ_CHUNK_SIZE: usize = 8 * 1024;

struct Inner {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

/// Shared, bounded byte buffer holding one generation's output
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl OutputBuffer {
    /// Create an empty buffer keeping at most `limit` bytes of output
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: Vec::new(),
                limit,
                truncated: false,
            })),
        }
    }

    /// Append a chunk, keeping the head of the stream once the limit is hit
    pub fn append(&self, chunk: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.truncated {
            return;
        }

        let room = inner.limit.saturating_sub(inner.data.len());
        if chunk.len() <= room {
            inner.data.extend_from_slice(chunk);
        } else {
            inner.data.extend_from_slice(&chunk[..room]);
            inner.data.extend_from_slice(TRUNCATION_MARKER);
            inner.truncated = true;
        }
    }

    /// Copy of everything captured so far
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().data)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.inner.lock().truncated
    }
}

/// Copy a child's output stream into `buffer` until EOF.
///
/// After cancellation the stream is still drained, but nothing more is
/// captured. Closing the pipe early would hand a gateway that is still
/// shutting down a SIGPIPE.
pub(crate) async fn pump<R>(
    mut reader: R,
    buffer: OutputBuffer,
    mut cancel: watch::Receiver<bool>,
    stream: &'static str,
    generation: u64,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut capturing = !*cancel.borrow();
    loop {
        tokio::select! {
            biased;

            changed = cancel.changed(), if capturing => {
                if changed.is_err() || *cancel.borrow() {
                    debug!(generation, stream, "Output capture cancelled, draining");
                    capturing = false;
                }
            }
            read = reader.read(&mut chunk) => {
                match read {
                    Ok(0) => break,
                    Ok(n) if capturing => buffer.append(&chunk[..n]),
                    Ok(_) => {}
                    Err(e) => {
                        debug!(generation, stream, error = %e, "Output stream read failed");
                        break;
                    }
                }
            }
        }
    }
    debug!(generation, stream, "Output pump finished");
}
