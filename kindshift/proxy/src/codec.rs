//! Framing for watch streams.
//!
//! The streaming serializer writes one JSON document per line, so framing is
//! purely "find the next newline"; it knows nothing about what the bytes
//! mean. Decoding the frame into a watch event happens one layer up, which
//! keeps both pieces independently testable.

use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::codec::Decoder;

/// Splits a byte stream into newline-delimited frames.
///
/// Empty lines (keep-alive newlines) are swallowed; a final unterminated
/// frame is surfaced at EOF.
#[derive(Debug)]
pub struct WatchFrameCodec {
    max_frame_size: usize,
}

impl WatchFrameCodec {
    /// Upper bound well above the largest object an API backend will emit;
    /// crossing it means the peer is not speaking line-framed JSON.
    const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for WatchFrameCodec {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for WatchFrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        loop {
            let Some(newline) = src.iter().position(|byte| *byte == b'\n') else {
                if src.len() > self.max_frame_size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "watch frame exceeds maximum size",
                    ));
                }
                return Ok(None);
            };

            let mut frame = src.split_to(newline + 1);
            frame.truncate(newline);
            if frame.last() == Some(&b'\r') {
                frame.truncate(frame.len() - 1);
            }

            if frame.is_empty() {
                continue;
            }
            return Ok(Some(frame.freeze()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        if src.is_empty() {
            return Ok(None);
        }

        let mut frame = src.split();
        if frame.last() == Some(&b'\r') {
            frame.truncate(frame.len() - 1);
        }
        if frame.is_empty() {
            return Ok(None);
        }
        Ok(Some(frame.freeze()))
    }
}

/// [`AsyncRead`] wrapper counting bytes as they pass through.
///
/// The counter is atomic because it is read for logging from a different
/// task than the one driving the read.
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn counter(&self) -> Arc<AtomicU64> {
        self.count.clone()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                this.count.fetch_add(read as u64, Ordering::Relaxed);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
