//! Outbound send pipeline: classifier, fair scheduler, serializer (§4.3).
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::{Config, SERIALIZER_CHANNEL_DEPTH};
use crate::error::{Error, Result};
use crate::frame::{Frame, Framer, OpCode};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

/// What the serializer reports back to a submitter once a frame has
/// actually been written to the transport (or has failed to be).
#[derive(Debug)]
pub struct WriteOutcome {
    /// Payload bytes written, i.e. bytes written minus the header, clamped to 0.
    pub n: usize,
    /// Set if the write failed.
    pub err: Option<Error>,
}

struct QueuedFrame {
    frame: Frame,
    reply: oneshot::Sender<WriteOutcome>,
}

struct FairState {
    queues: Mutex<HashMap<u32, VecDeque<QueuedFrame>>>,
    pending: AtomicUsize,
    write_notify: Notify,
    space_notify: Notify,
}

enum Mode {
    /// Single-stage pipeline used by [`Config::test`]: every frame goes
    /// straight to the serializer in arrival order.
    Simple,
    /// The default two-stage fair scheduler (§4.3).
    Fair(FairState),
}

/// Owns the outbound half of a Session: the per-stream queues (fair mode),
/// the scheduler, and the serializer task that actually writes to the
/// transport.
pub struct SendPipeline {
    mode: Mode,
    serializer_tx: mpsc::Sender<QueuedFrame>,
    queue_capacity: usize,
}

impl std::fmt::Debug for SendPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPipeline")
            .field("fair", &matches!(self.mode, Mode::Fair(_)))
            .finish_non_exhaustive()
    }
}

impl SendPipeline {
    /// Spawn the serializer task (and, unless `config.test`, the scheduler
    /// task), returning a handle the classifier (submit path) uses. `die` is
    /// the Session's shutdown signal: both tasks exit and the serializer
    /// shuts the transport down once it fires, so the transport is closed
    /// exactly once per Session close.
    pub fn spawn<W>(config: &Config, writer: W, die: Arc<Notify>) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (serializer_tx, serializer_rx) = mpsc::channel(SERIALIZER_CHANNEL_DEPTH);
        let mode = if config.test {
            Mode::Simple
        } else {
            Mode::Fair(FairState {
                queues: Mutex::new(HashMap::new()),
                pending: AtomicUsize::new(0),
                write_notify: Notify::new(),
                space_notify: Notify::new(),
            })
        };
        let pipeline = Arc::new(Self {
            mode,
            serializer_tx,
            queue_capacity: config.write_request_queue_size,
        });

        tokio::spawn(serializer_task(writer, serializer_rx, Arc::clone(&die)));
        if let Mode::Fair(_) = &pipeline.mode {
            tokio::spawn(scheduler_task(Arc::clone(&pipeline), die));
        }
        pipeline
    }

    /// Submit `frame` and wait for the serializer's result (§4.3 "Submit
    /// contract"). Returns [`Error::BrokenPipe`] if `closed` is already set.
    pub async fn submit(&self, frame: Frame, closed: &AtomicBool) -> Result<usize> {
        if closed.load(Ordering::Acquire) {
            return Err(Error::BrokenPipe);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(QueuedFrame {
            frame,
            reply: reply_tx,
        })
        .await?;
        match reply_rx.await {
            Ok(WriteOutcome { n, err: None }) => Ok(n),
            Ok(WriteOutcome { err: Some(e), .. }) => Err(e),
            Err(_) => Err(Error::BrokenPipe),
        }
    }

    /// Non-blocking enqueue of a PSH or FIN frame from a stream's write
    /// path. Per spec this never blocks: PSH/FIN use try-enqueue with
    /// rotate-on-full, and in `Simple` mode the bounded serializer channel
    /// is attempted with `try_send` (falling back to the same rotate policy
    /// conceptually absent since Simple mode has only one global queue —
    /// a full channel there simply reports `BrokenPipe`-free backpressure
    /// by returning the frame for the caller to retry).
    ///
    /// Returns the reply receiver to poll for the write outcome.
    pub fn try_submit_data(
        self: &Arc<Self>,
        frame: Frame,
        closed: &AtomicBool,
    ) -> Result<oneshot::Receiver<WriteOutcome>> {
        if closed.load(Ordering::Acquire) {
            return Err(Error::BrokenPipe);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let qf = QueuedFrame {
            frame,
            reply: reply_tx,
        };
        match &self.mode {
            Mode::Simple => match self.serializer_tx.try_send(qf) {
                Ok(()) => Ok(reply_rx),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Report the frame as dropped-for-now; the caller (a
                    // poll_write) will be retried by its executor.
                    Err(Error::BrokenPipe)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::BrokenPipe),
            },
            Mode::Fair(state) => {
                self.try_enqueue_fair(state, qf);
                Ok(reply_rx)
            }
        }
    }

    async fn enqueue(&self, qf: QueuedFrame) -> Result<()> {
        match &self.mode {
            Mode::Simple => self
                .serializer_tx
                .send(qf)
                .await
                .map_err(|_| Error::BrokenPipe),
            Mode::Fair(state) => {
                if qf.frame.cmd == OpCode::Syn {
                    self.enqueue_syn_blocking(state, qf).await
                } else {
                    self.try_enqueue_fair(state, qf);
                    Ok(())
                }
            }
        }
    }

    /// SYN is the one command that blocks on a full per-stream queue (§4.3).
    async fn enqueue_syn_blocking(&self, state: &FairState, mut qf: QueuedFrame) -> Result<()> {
        let sid = qf.frame.sid;
        loop {
            {
                let mut queues = state.queues.lock();
                let q = queues.entry(sid).or_default();
                if q.len() < self.queue_capacity {
                    q.push_back(qf);
                    drop(queues);
                    state.pending.fetch_add(1, Ordering::AcqRel);
                    state.write_notify.notify_one();
                    return Ok(());
                }
            }
            state.space_notify.notified().await;
        }
    }

    /// PSH/FIN: try-enqueue, rotating the queue head to the serializer on
    /// full; anything else bypasses the queues entirely. Never blocks; may
    /// perform a best-effort, fire-and-forget send of the rotated/bypassed
    /// frame onto the bounded serializer channel.
    fn try_enqueue_fair(&self, state: &FairState, qf: QueuedFrame) {
        let sid = qf.frame.sid;
        match qf.frame.cmd {
            OpCode::Psh | OpCode::Fin => {
                let is_fin = qf.frame.cmd == OpCode::Fin;
                enum Outcome {
                    Queued,
                    Bypass(QueuedFrame),
                    Rotated(QueuedFrame),
                }
                let outcome = {
                    let mut queues = state.queues.lock();
                    if let Some(q) = queues.get_mut(&sid) {
                        if q.len() < self.queue_capacity {
                            q.push_back(qf);
                            Outcome::Queued
                        } else {
                            let evicted = q.pop_front().expect("len >= 1 when full");
                            q.push_back(qf);
                            Outcome::Rotated(evicted)
                        }
                    } else if is_fin {
                        Outcome::Bypass(qf)
                    } else {
                        let mut q = VecDeque::with_capacity(1);
                        q.push_back(qf);
                        queues.insert(sid, q);
                        Outcome::Queued
                    }
                };
                match outcome {
                    Outcome::Queued => {
                        state.pending.fetch_add(1, Ordering::AcqRel);
                        state.write_notify.notify_one();
                    }
                    Outcome::Rotated(evicted) => {
                        state.pending.fetch_add(1, Ordering::AcqRel);
                        state.write_notify.notify_one();
                        self.bypass_best_effort(evicted);
                    }
                    Outcome::Bypass(qf) => self.bypass_best_effort(qf),
                }
            }
            _ => self.bypass_best_effort(qf),
        }
    }

    fn bypass_best_effort(&self, qf: QueuedFrame) {
        let tx = self.serializer_tx.clone();
        tokio::spawn(async move {
            if let Err(mpsc::error::SendError(qf)) = tx.send(qf).await {
                let _ = qf.reply.send(WriteOutcome {
                    n: 0,
                    err: Some(Error::BrokenPipe),
                });
            }
        });
    }
}

async fn scheduler_task(pipeline: Arc<SendPipeline>, die: Arc<Notify>) {
    let Mode::Fair(state) = &pipeline.mode else {
        return;
    };
    loop {
        tokio::select! {
            biased;
            () = die.notified() => break,
            () = state.write_notify.notified() => {}
        }
        while state.pending.load(Ordering::Acquire) > 0 {
            let sids: Vec<u32> = {
                let queues = state.queues.lock();
                let mut v: Vec<u32> = queues.keys().copied().collect();
                v.sort_unstable();
                v
            };
            if sids.is_empty() {
                // Pending count and map contents can momentarily disagree
                // right after a rotate; nothing to schedule this pass.
                break;
            }
            for sid in sids {
                let item = {
                    let mut queues = state.queues.lock();
                    let dequeued = queues.get_mut(&sid).and_then(VecDeque::pop_front);
                    if let Some(qf) = &dequeued {
                        if qf.frame.cmd == OpCode::Fin {
                            queues.remove(&sid);
                        }
                    }
                    dequeued
                };
                let Some(qf) = item else { continue };
                state.pending.fetch_sub(1, Ordering::AcqRel);
                state.space_notify.notify_one();
                tokio::select! {
                    biased;
                    () = die.notified() => {
                        debug!("scheduler: session closing, exiting");
                        return;
                    }
                    res = pipeline.serializer_tx.send(qf) => {
                        if res.is_err() {
                            debug!("scheduler: serializer task gone, exiting");
                            return;
                        }
                    }
                }
            }
        }
    }
    debug!("scheduler task exiting");
}

async fn serializer_task<W>(mut writer: W, mut rx: mpsc::Receiver<QueuedFrame>, die: Arc<Notify>)
where
    W: AsyncWrite + Unpin,
{
    let mut framer = Framer::new();
    loop {
        let qf = tokio::select! {
            biased;
            () = die.notified() => break,
            qf = rx.recv() => match qf {
                Some(qf) => qf,
                None => break,
            },
        };
        let QueuedFrame { frame, reply } = qf;
        let outcome = match framer.encode(&mut writer, &frame).await {
            Ok(written) => {
                trace!(sid = frame.sid, cmd = ?frame.cmd, written, "frame written");
                WriteOutcome {
                    n: written.saturating_sub(crate::frame::HEADER_SIZE),
                    err: None,
                }
            }
            Err(e) => {
                warn!("serializer: transport write failed: {e}");
                WriteOutcome {
                    n: 0,
                    err: Some(Error::Transport(e.into())),
                }
            }
        };
        let fatal = outcome.err.is_some();
        let _ = reply.send(outcome);
        if fatal {
            break;
        }
    }
    // Close the transport exactly once, regardless of which path got us here:
    // the shutdown signal, a fatal write, or the channel draining naturally.
    if let Err(e) = writer.shutdown().await {
        warn!("serializer: transport shutdown failed: {e}");
    }
    debug!("serializer task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;
    use tokio::io::duplex;

    #[tokio::test]
    async fn simple_mode_preserves_arrival_order() {
        let (client, mut server) = duplex(4096);
        let config = Config::test();
        let pipeline = SendPipeline::spawn(&config, client, Arc::new(Notify::new()));
        let closed = AtomicBool::new(false);

        for i in 0..5u32 {
            let n = pipeline
                .submit(Frame::push(1, Bytes::from(vec![i as u8])), &closed)
                .await
                .unwrap();
            assert_eq!(n, 1);
        }

        let mut framer = Framer::new();
        for i in 0..5u32 {
            let frame = framer.decode(&mut server).await.unwrap().unwrap();
            assert_eq!(frame.sid, 1);
            assert_eq!(frame.payload[0], i as u8);
        }
    }

    #[tokio::test]
    async fn fair_mode_round_robins_across_streams() {
        let (client, mut server) = duplex(1 << 20);
        let config = Config::default();
        let pipeline = SendPipeline::spawn(&config, client, Arc::new(Notify::new()));

        let mut handles = Vec::new();
        for sid in [3u32, 5, 7] {
            let pipeline = Arc::clone(&pipeline);
            handles.push(tokio::spawn(async move {
                let closed = AtomicBool::new(false);
                for _ in 0..30 {
                    pipeline
                        .submit(Frame::push(sid, Bytes::from_static(b"x")), &closed)
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut framer = Framer::new();
        let mut order = Vec::new();
        for _ in 0..90 {
            let frame = framer.decode(&mut server).await.unwrap().unwrap();
            order.push(frame.sid);
        }
        // No sid should occupy two consecutive slots throughout steady state
        // (skip the initial ramp-up before all three queues are populated).
        let mut max_consecutive_repeat = 0;
        let mut run = 1;
        for w in order.windows(2) {
            if w[0] == w[1] {
                run += 1;
            } else {
                run = 1;
            }
            max_consecutive_repeat = max_consecutive_repeat.max(run);
        }
        assert!(
            max_consecutive_repeat <= 2,
            "expected roughly round-robin delivery, got run length {max_consecutive_repeat} in {order:?}"
        );
    }
}
