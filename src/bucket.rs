//! Session-wide receive-credit bucket (§3, §5).
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A signed receive-credit counter with a coalescing "became positive"
/// notification.
///
/// The counter is signed and wider than 32 bits internally so that a burst
/// of PSH frames decrementing concurrently with an Open stream's
/// `return_tokens` cannot overflow; the protocol-level values it holds never
/// exceed `MaxReceiveBuffer` (a u32).
#[derive(Debug)]
pub struct Bucket {
    value: AtomicI64,
    notify: Arc<Notify>,
}

impl Bucket {
    /// Create a bucket initialized to `max_receive_buffer`.
    #[must_use]
    pub fn new(max_receive_buffer: u32) -> Self {
        Self {
            value: AtomicI64::new(i64::from(max_receive_buffer)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Current value. May be negative (and is during a flow-control pause).
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Subtract `n` bytes of credit (an inbound PSH frame consumed them).
    pub fn consume(&self, n: u32) {
        self.value.fetch_sub(i64::from(n), Ordering::AcqRel);
    }

    /// Return `n` bytes of credit (a Stream consumed/discarded buffered
    /// bytes). If this transitions the bucket from `<= 0` to `> 0`, wakes
    /// anyone waiting in [`Bucket::wait_positive`].
    pub fn restore(&self, n: u32) {
        if n == 0 {
            return;
        }
        let before = self.value.fetch_add(i64::from(n), Ordering::AcqRel);
        if before <= 0 && before + i64::from(n) > 0 {
            self.notify.notify_one();
        }
    }

    /// Wait until the bucket is `> 0`. Returns immediately if it already is.
    /// Callers must also race this against the Session's `die` signal; this
    /// type has no notion of Session lifecycle.
    pub async fn wait_positive(&self) {
        loop {
            if self.get() > 0 {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering interest to avoid a lost wakeup
            // between the check above and `notified()` starting to listen.
            if self.get() > 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wake anyone waiting on the bucket unconditionally, used by
    /// `Session::close` and the keepalive probe (§4.5) so blocked waiters
    /// can re-check Session liveness.
    pub fn pulse(&self) {
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn consume_and_restore_round_trip() {
        let bucket = Bucket::new(10);
        bucket.consume(10);
        assert_eq!(bucket.get(), 0);
        bucket.restore(4);
        assert_eq!(bucket.get(), 4);
    }

    #[tokio::test]
    async fn wait_positive_unblocks_on_restore() {
        let bucket = Arc::new(Bucket::new(10));
        bucket.consume(10);
        let waiter = {
            let bucket = Arc::clone(&bucket);
            tokio::spawn(async move {
                bucket.wait_positive().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        bucket.restore(4);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_positive should unblock")
            .unwrap();
    }

    #[tokio::test]
    async fn never_exceeds_max_at_observation_points() {
        let bucket = Bucket::new(10);
        bucket.restore(0); // no-op, must not notify or change value
        assert_eq!(bucket.get(), 10);
    }
}
