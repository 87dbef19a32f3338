//! Pass-through reader that hashes every byte it forwards.

use sha2::{Digest, Sha256};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use thiserror::Error;
use tokio::io::{AsyncRead, BufReader, ReadBuf};

/// Read-ahead buffer placed over the hashing reader. This is the only
/// payload-sized allocation an upload makes, whatever the total size.
pub const STREAM_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    #[error("source stream failed; digest is invalid")]
    SourceFailed,
    #[error("source stream not drained after {0} bytes; digest is incomplete")]
    NotDrained(u64),
}

/// Wraps a source stream, feeding each byte read into SHA-256.
///
/// The digest is only released once the source has reported end of stream
/// without error; a failed or partially read source never yields one.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
    drained: bool,
    failed: bool,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
            drained: false,
            failed: false,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Lowercase hex SHA-256 over every byte read.
    pub fn finalize(self) -> Result<String, HashError> {
        if self.failed {
            return Err(HashError::SourceFailed);
        }
        if !self.drained {
            return Err(HashError::NotDrained(self.bytes_read));
        }
        Ok(hex::encode(self.hasher.finalize()))
    }
}

impl<R: AsyncRead + Unpin> HashingReader<R> {
    /// Hashing reader behind a fixed-size read-ahead buffer.
    pub fn buffered(inner: R) -> BufReader<Self> {
        BufReader::with_capacity(STREAM_BUFFER_BYTES, Self::new(inner))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let had_room = buf.remaining() > 0;

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[before..];
                if fresh.is_empty() {
                    if had_room {
                        this.drained = true;
                    }
                } else {
                    this.hasher.update(fresh);
                    this.bytes_read += fresh.len() as u64;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                this.failed = true;
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
