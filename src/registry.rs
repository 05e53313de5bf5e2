//! Stream registry: sid → Stream mapping, admission and teardown (§3, §4.4).
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::bucket::Bucket;
use bytes::Bytes;
use futures_util::task::AtomicWaker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What the Session keeps about a live stream, independent of whether the
/// owning [`MuxStream`](crate::MuxStream) handle is still alive on the
/// caller's side.
///
/// This is deliberately *not* the `MuxStream` itself: `MuxStream` holds a
/// back-reference to the Session, so if the registry also held `MuxStream`
/// the two would form a reference cycle. Keeping only the narrow channel +
/// atomics here (mirroring `StreamState` in the smux-style reference
/// session) means the registry can outlive a dropped `MuxStream` handle
/// without leaking the Session.
#[derive(Debug)]
pub struct StreamEntry {
    /// Delivers inbound PSH payloads to the owning `MuxStream`.
    pub data_tx: mpsc::UnboundedSender<Bytes>,
    /// Set when a FIN arrives for this sid; the read side observes EOF.
    pub reset: Arc<AtomicBool>,
    /// Woken when `reset` flips, since the data channel itself is not
    /// closed on FIN (the local side may still be writing).
    pub read_waker: Arc<AtomicWaker>,
    /// Set by an inbound FUL frame, cleared by an inbound EMP frame.
    pub pause_write: Arc<AtomicBool>,
    /// Woken when `pause_write` clears, or when the Session closes.
    pub write_waker: Arc<AtomicWaker>,
    /// Bytes of inbound payload delivered to this stream but not yet read
    /// out by its owner. Only meaningful when `EnableStreamBuffer` is set;
    /// otherwise always zero and never checked.
    pub buffered: Arc<AtomicI64>,
}

impl StreamEntry {
    /// Mark this stream as reset by the peer (inbound FIN) and wake readers.
    pub fn mark_reset(&self) {
        self.reset.store(true, Ordering::Release);
        self.read_waker.wake();
    }

    /// Pause the writer (inbound FUL).
    pub fn pause(&self) {
        self.pause_write.store(true, Ordering::Release);
    }

    /// Resume the writer and wake pending readers (inbound EMP). EMP also
    /// notifies read-wakers per §4.2 so a stream blocked reading wakes to
    /// re-check its state alongside its writer.
    pub fn resume(&self) {
        self.pause_write.store(false, Ordering::Release);
        self.write_waker.wake();
        self.read_waker.wake();
    }
}

/// The sid → Stream mapping plus the operations that must happen atomically
/// with a membership change (insertion, credit recycling on removal).
#[derive(Debug, Default)]
pub struct Registry {
    streams: Mutex<HashMap<u32, StreamEntry>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry for `sid`. Returns `false` (and does not insert)
    /// if `sid` is already present, upholding "Open never returns a sid
    /// already present in the registry" and "duplicate SYN is ignored".
    pub fn insert(&self, sid: u32, entry: StreamEntry) -> bool {
        match self.streams.lock().entry(sid) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(entry);
                true
            }
        }
    }

    /// Whether `sid` is currently registered.
    #[must_use]
    pub fn contains(&self, sid: u32) -> bool {
        self.streams.lock().contains_key(&sid)
    }

    /// Number of live streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    /// Run `f` with the entry for `sid`, if any, without cloning it out.
    pub fn with<R>(&self, sid: u32, f: impl FnOnce(&StreamEntry) -> R) -> Option<R> {
        self.streams.lock().get(&sid).map(f)
    }

    /// Remove `sid` and atomically return `recycled` bytes of credit to
    /// `bucket`. Called when a Stream is closed by its owner (§4.4).
    pub fn remove_and_recycle(&self, sid: u32, recycled: u32, bucket: &Bucket) {
        {
            let mut streams = self.streams.lock();
            streams.remove(&sid);
            bucket.restore(recycled);
        }
    }

    /// Drain every entry, marking each as reset and waking its wakers. Used
    /// by `Session::close` to cascade shutdown into all live streams.
    pub fn close_all(&self) {
        let mut streams = self.streams.lock();
        for (_, entry) in streams.drain() {
            entry.reset.store(true, Ordering::Release);
            entry.read_waker.wake();
            entry.write_waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> (StreamEntry, mpsc::UnboundedReceiver<Bytes>) {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        (
            StreamEntry {
                data_tx,
                reset: Arc::new(AtomicBool::new(false)),
                read_waker: Arc::new(AtomicWaker::new()),
                pause_write: Arc::new(AtomicBool::new(false)),
                write_waker: Arc::new(AtomicWaker::new()),
                buffered: Arc::new(AtomicI64::new(0)),
            },
            data_rx,
        )
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let registry = Registry::new();
        let (e1, _r1) = entry();
        let (e2, _r2) = entry();
        assert!(registry.insert(1, e1));
        assert!(!registry.insert(1, e2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_and_recycle_restores_bucket() {
        let registry = Registry::new();
        let bucket = Bucket::new(10);
        bucket.consume(10);
        let (e1, _r1) = entry();
        registry.insert(1, e1);
        registry.remove_and_recycle(1, 6, &bucket);
        assert_eq!(bucket.get(), 6);
        assert!(!registry.contains(1));
    }

    #[test]
    fn close_all_marks_reset() {
        let registry = Registry::new();
        let (e1, _r1) = entry();
        let reset_flag = Arc::clone(&e1.reset);
        registry.insert(1, e1);
        registry.close_all();
        assert!(reset_flag.load(Ordering::Acquire));
        assert!(registry.is_empty());
    }
}
