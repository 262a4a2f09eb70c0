//! Byte-counting reader that feeds the status machine.
//!
//! [`ProgressReader`] wraps the raw source stream, so the counted bytes are
//! transport bytes and the percentage lines up with the advertised source
//! length. When the length is unknown every report carries the `-1`
//! sentinel instead of a made-up figure.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use sprout_events::PROGRESS_UNKNOWN;
use tokio::io::{AsyncRead, ReadBuf};

use crate::status::StatusMachine;

/// Shared byte counter, kept alive by the pipeline after the reader itself
/// has been consumed by the archive walk.
pub struct ProgressShared {
    machine: Arc<StatusMachine>,
    total: Option<u64>,
    bytes: AtomicU64,
}

impl ProgressShared {
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn percentage(&self) -> i32 {
        match self.total {
            Some(total) if total > 0 => {
                let bytes = self.bytes_transferred().min(total);
                ((bytes * 100) / total) as i32
            }
            _ => PROGRESS_UNKNOWN,
        }
    }

    /// Snap the counter to the full length and report `100`.
    ///
    /// Called on the success path only. Trailing archive padding is not
    /// always read to the last byte, so without this the cycle could end
    /// at 99. Does nothing when the length was never known.
    pub fn finish(&self) {
        if let Some(total) = self.total.filter(|t| *t > 0) {
            self.bytes.store(total, Ordering::Relaxed);
            self.machine.report_progress(100);
        }
    }

    fn record_chunk(&self, len: u64) {
        if len == 0 {
            return;
        }
        let bytes = self.bytes.fetch_add(len, Ordering::Relaxed) + len;
        if let Some(total) = self.total {
            if bytes > total {
                self.bytes.store(total, Ordering::Relaxed);
            }
        }
        self.machine.report_progress(self.percentage());
    }
}

/// `AsyncRead` adapter that records every chunk it passes through.
pub struct ProgressReader<R> {
    inner: R,
    shared: Arc<ProgressShared>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, total: Option<u64>, machine: Arc<StatusMachine>) -> Self {
        Self {
            inner,
            shared: Arc::new(ProgressShared {
                machine,
                total,
                bytes: AtomicU64::new(0),
            }),
        }
    }

    pub fn shared(&self) -> Arc<ProgressShared> {
        Arc::clone(&self.shared)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                self.shared.record_chunk(read as u64);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
