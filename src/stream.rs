//! `MuxStream`: the object a Session hands back from `Open`/`Accept` (§6, §9).
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::error::Error;
use crate::frame::{Frame, OpCode, MAX_PAYLOAD};
use crate::send::WriteOutcome;
use bytes::Bytes;
use futures_util::task::AtomicWaker;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Session state a `MuxStream` needs to submit frames and return credit,
/// without owning (or being owned by) the Session itself (§9).
pub(crate) trait StreamHost: Send + Sync {
    fn max_frame_size(&self) -> u32;
    fn try_submit_data(&self, frame: Frame) -> crate::Result<oneshot::Receiver<WriteOutcome>>;
    fn is_closed(&self) -> bool;
    fn return_tokens(&self, n: u32);
    fn stream_closed(&self, sid: u32, recycled: u32);
    /// `Some(max_stream_buffer)` when `EnableStreamBuffer` is on, in which
    /// case a stream emits EMP once its buffered bytes drop back under this
    /// threshold after having crossed it.
    fn stream_buffer_threshold(&self) -> Option<u32>;
}

/// A logical, ordered, bidirectional byte stream multiplexed over a
/// [`Session`](crate::Session)'s transport.
///
/// `MuxStream` implements [`AsyncRead`] and [`AsyncWrite`] so it can be used
/// as a drop-in byte stream by application code (§6).
pub struct MuxStream {
    id: u32,
    host: Arc<dyn StreamHost>,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    recv_buf: Bytes,
    reset: Arc<AtomicBool>,
    read_waker: Arc<AtomicWaker>,
    pause_write: Arc<AtomicBool>,
    write_waker: Arc<AtomicWaker>,
    buffered: Arc<AtomicI64>,
    fin_sent: AtomicBool,
    pending_write: Option<PendingWrite>,
}

enum PendingWrite {
    Reply(oneshot::Receiver<WriteOutcome>),
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.id).finish_non_exhaustive()
    }
}

impl MuxStream {
    pub(crate) fn new(
        id: u32,
        host: Arc<dyn StreamHost>,
        data_rx: mpsc::UnboundedReceiver<Bytes>,
        reset: Arc<AtomicBool>,
        read_waker: Arc<AtomicWaker>,
        pause_write: Arc<AtomicBool>,
        write_waker: Arc<AtomicWaker>,
        buffered: Arc<AtomicI64>,
    ) -> Self {
        Self {
            id,
            host,
            data_rx,
            recv_buf: Bytes::new(),
            reset,
            read_waker,
            pause_write,
            write_waker,
            buffered,
            fin_sent: AtomicBool::new(false),
            pending_write: None,
        }
    }

    /// This stream's identifier.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the peer has sent FIN (further reads will observe EOF once
    /// buffered bytes are drained).
    #[must_use]
    pub fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    /// Unread bytes still buffered locally: one in `recv_buf`, the rest
    /// queued in the channel. Drains the channel as a side effect, which is
    /// only safe to do once the stream is being torn down.
    fn recycle_tokens(&mut self) -> u32 {
        let mut total = u32::try_from(self.recv_buf.len()).unwrap_or(u32::MAX);
        self.recv_buf = Bytes::new();
        while let Ok(chunk) = self.data_rx.try_recv() {
            total = total.saturating_add(u32::try_from(chunk.len()).unwrap_or(u32::MAX));
        }
        total
    }

    /// Record that `n` bytes were just handed to the reader, and emit EMP if
    /// that drains `buffered` back under the stream-buffer threshold.
    fn note_drained(&self, n: usize) {
        let Some(threshold) = self.host.stream_buffer_threshold() else {
            return;
        };
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        let before = self.buffered.fetch_sub(n, Ordering::AcqRel);
        let after = before - n;
        if before >= i64::from(threshold) && after < i64::from(threshold) {
            let _ = self.host.try_submit_data(Frame::control(OpCode::Emp, self.id));
        }
    }

    /// Half-close this stream: send FIN and stop further writes. Idempotent.
    pub async fn close(&mut self) {
        if self.fin_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(rx) = self
            .host
            .try_submit_data(Frame::control(OpCode::Fin, self.id))
        {
            let _ = rx.await;
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let recycled = self.recycle_tokens();
        trace!(sid = self.id, recycled, "stream dropped");
        self.host.stream_closed(self.id, recycled);
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.recv_buf.is_empty() {
                let n = self.recv_buf.len().min(buf.remaining());
                buf.put_slice(&self.recv_buf[..n]);
                self.recv_buf = self.recv_buf.split_off(n);
                self.host.return_tokens(u32::try_from(n).unwrap_or(u32::MAX));
                self.note_drained(n);
                return Poll::Ready(Ok(()));
            }

            match self.data_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    self.recv_buf = chunk;
                    continue;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => {}
            }

            if self.reset.load(Ordering::Acquire) {
                return Poll::Ready(Ok(()));
            }
            self.read_waker.register(cx.waker());
            // Re-check after registering to close the race between the
            // `reset` store in `StreamEntry::mark_reset` and our waker
            // registration.
            if self.reset.load(Ordering::Acquire) {
                return Poll::Ready(Ok(()));
            }
            return Poll::Pending;
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            if let Some(PendingWrite::Reply(rx)) = &mut self.pending_write {
                return match Pin::new(rx).poll(cx) {
                    Poll::Ready(Ok(WriteOutcome { n, err: None })) => {
                        self.pending_write = None;
                        Poll::Ready(Ok(n))
                    }
                    Poll::Ready(Ok(WriteOutcome { err: Some(e), .. })) => {
                        self.pending_write = None;
                        Poll::Ready(Err(e.into()))
                    }
                    Poll::Ready(Err(_)) => {
                        self.pending_write = None;
                        Poll::Ready(Err(Error::BrokenPipe.into()))
                    }
                    Poll::Pending => Poll::Pending,
                };
            }

            if self.fin_sent.load(Ordering::Acquire) || self.host.is_closed() {
                return Poll::Ready(Err(Error::BrokenPipe.into()));
            }

            if self.pause_write.load(Ordering::Acquire) {
                self.write_waker.register(cx.waker());
                if !self.pause_write.load(Ordering::Acquire) {
                    continue;
                }
                return Poll::Pending;
            }

            let chunk_len = buf.len().min(self.host.max_frame_size() as usize).min(MAX_PAYLOAD);
            if chunk_len == 0 {
                return Poll::Ready(Ok(0));
            }
            let frame = Frame::push(self.id, Bytes::copy_from_slice(&buf[..chunk_len]));
            match self.host.try_submit_data(frame) {
                Ok(rx) => self.pending_write = Some(PendingWrite::Reply(rx)),
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Frames are written by the serializer as soon as they are
        // scheduled; there is no local buffering left to flush.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.fin_sent.swap(true, Ordering::AcqRel) {
            return Poll::Ready(Ok(()));
        }
        let frame = Frame::control(OpCode::Fin, self.id);
        match self.host.try_submit_data(frame) {
            Ok(mut rx) => {
                let _ = ready!(Pin::new(&mut rx).poll(cx));
                Poll::Ready(Ok(()))
            }
            Err(_) => Poll::Ready(Ok(())),
        }
    }
}
