//! Inbound receive loop: one frame at a time, dispatched per command (§4.2).
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use super::SessionShared;
use crate::frame::{Frame, Framer, OpCode};
use crate::registry::StreamEntry;
use crate::stream::{MuxStream, StreamHost};
use futures_util::task::AtomicWaker;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub(super) async fn run<R>(shared: Arc<SessionShared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut framer = Framer::new();
    loop {
        tokio::select! {
            biased;
            () = shared.die.notified() => {
                debug!("recv loop: session closing");
                break;
            }
            () = shared.bucket.wait_positive() => {}
        }
        if shared.closed.load(Ordering::Acquire) {
            break;
        }

        let decoded = tokio::select! {
            biased;
            () = shared.die.notified() => {
                debug!("recv loop: session closing mid-read");
                break;
            }
            decoded = framer.decode(&mut reader) => decoded,
        };
        let frame = match decoded {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("recv loop: transport EOF");
                let _ = shared.close().await;
                break;
            }
            Err(e) => {
                warn!("recv loop: {e}");
                let _ = shared.close().await;
                break;
            }
        };
        shared.data_ready.store(true, Ordering::Release);
        dispatch(&shared, frame).await;
    }
    debug!("recv loop exiting");
}

/// Handle one decoded frame. By the time a [`Frame`] reaches here, `Framer`
/// has already rejected unknown protocol versions and commands, so every
/// variant of [`OpCode`] is handled.
async fn dispatch(shared: &Arc<SessionShared>, frame: Frame) {
    match frame.cmd {
        OpCode::Nop => {
            if shared.config.enable_stream_buffer {
                if let Err(e) = shared
                    .send
                    .submit(Frame::control(OpCode::Ack, frame.sid), &shared.closed)
                    .await
                {
                    trace!("recv loop: failed to ack nop: {e}");
                }
            }
        }
        OpCode::Ack => {
            if frame.sid == shared.rtt_sn.load(Ordering::Acquire) {
                if let Some(sent_at) = shared.rtt_test_sent_at.lock().take() {
                    let rtt = sent_at.elapsed();
                    trace!(?rtt, "rtt sample");
                    *shared.rtt.lock() = Some(rtt);
                }
            }
        }
        OpCode::Syn => {
            if frame.sid != 0 {
                admit_stream(shared, frame.sid).await;
            }
        }
        OpCode::Psh => {
            let len = i64::try_from(frame.payload.len()).unwrap_or(i64::MAX);
            // A PSH for a sid with no registry entry is dropped without
            // touching the bucket: nothing will ever call `return_tokens`
            // for it, so charging the bucket would leak credit forever.
            let crossed = shared.registry.with(frame.sid, |entry| {
                shared.bucket.consume(u32::try_from(frame.payload.len()).unwrap_or(u32::MAX));
                let _ = entry.data_tx.send(frame.payload.clone());
                entry.read_waker.wake();
                if !shared.config.enable_stream_buffer {
                    return false;
                }
                let before = entry.buffered.fetch_add(len, Ordering::AcqRel);
                let threshold = i64::from(shared.config.max_stream_buffer);
                before < threshold && before + len >= threshold
            });
            match crossed {
                None => trace!(sid = frame.sid, "psh for unknown stream dropped"),
                Some(true) => {
                    let _ = shared
                        .send
                        .try_submit_data(Frame::control(OpCode::Ful, frame.sid), &shared.closed);
                }
                Some(false) => {}
            }
        }
        OpCode::Fin => {
            shared.registry.with(frame.sid, StreamEntry::mark_reset);
        }
        OpCode::Ful => {
            shared.registry.with(frame.sid, StreamEntry::pause);
        }
        OpCode::Emp => {
            shared.registry.with(frame.sid, StreamEntry::resume);
        }
    }
}

/// Admit a newly SYN'd inbound stream: register it and push it onto the
/// accept queue. A duplicate SYN for an already-registered sid is ignored.
/// If the accept queue is full but the Session is healthy, this blocks until
/// a slot frees up rather than dropping the stream; it only drops without
/// blocking once the Session is dying.
async fn admit_stream(shared: &Arc<SessionShared>, sid: u32) {
    if shared.registry.contains(sid) {
        trace!(sid, "duplicate syn ignored");
        return;
    }

    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let reset = Arc::new(AtomicBool::new(false));
    let read_waker = Arc::new(AtomicWaker::new());
    let pause_write = Arc::new(AtomicBool::new(false));
    let write_waker = Arc::new(AtomicWaker::new());
    let buffered = Arc::new(AtomicI64::new(0));
    let entry = StreamEntry {
        data_tx,
        reset: Arc::clone(&reset),
        read_waker: Arc::clone(&read_waker),
        pause_write: Arc::clone(&pause_write),
        write_waker: Arc::clone(&write_waker),
        buffered: Arc::clone(&buffered),
    };
    if !shared.registry.insert(sid, entry) {
        // Lost a race against another admission of the same sid; extremely
        // unlikely since only this loop ever admits inbound streams.
        return;
    }

    let stream = MuxStream::new(
        sid,
        Arc::clone(shared) as Arc<dyn StreamHost>,
        data_rx,
        reset,
        read_waker,
        pause_write,
        write_waker,
        buffered,
    );
    match shared.accept_tx.try_send(stream) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!(sid, "accept queue closed, dropping admitted stream");
            shared.registry.remove_and_recycle(sid, 0, &shared.bucket);
        }
        Err(mpsc::error::TrySendError::Full(stream)) => {
            trace!(sid, "accept queue full, backpressuring admission");
            tokio::select! {
                biased;
                () = shared.die.notified() => {
                    warn!(sid, "accept queue full and session dying, dropping admitted stream");
                    shared.registry.remove_and_recycle(sid, 0, &shared.bucket);
                }
                res = shared.accept_tx.send(stream) => {
                    if res.is_err() {
                        warn!(sid, "accept queue closed, dropping admitted stream");
                        shared.registry.remove_and_recycle(sid, 0, &shared.bucket);
                    }
                }
            }
        }
    }
}
