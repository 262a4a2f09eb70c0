//! Tee reader that feeds every payload byte into a streaming verifier.
//!
//! The verifier sees the bytes exactly as they come off the archive, before
//! decompression, so the signature covers the compressed image. Only after
//! the stream has been drained does the pipeline ask for the verdict.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use sprout_signing::StreamingVerifier;
use tokio::io::{AsyncRead, ReadBuf};

pub struct VerifyingReader<R> {
    inner: R,
    verifier: Arc<Mutex<Box<dyn StreamingVerifier>>>,
}

impl<R> VerifyingReader<R> {
    pub fn new(inner: R, verifier: Box<dyn StreamingVerifier>) -> Self {
        Self {
            inner,
            verifier: Arc::new(Mutex::new(verifier)),
        }
    }

    /// Handle used to finalize the verifier once the stream is exhausted.
    pub fn verifier(&self) -> Arc<Mutex<Box<dyn StreamingVerifier>>> {
        Arc::clone(&self.verifier)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for VerifyingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[before..];
                if !fresh.is_empty() {
                    self.verifier.lock().unwrap().update(fresh);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
