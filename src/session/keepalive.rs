//! Keepalive probe and timeout tickers (§4.5).
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use super::SessionShared;
use crate::frame::{Frame, OpCode};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

pub(super) async fn run(shared: Arc<SessionShared>) {
    let mut probe = interval(shared.config.keep_alive_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // `interval()`'s first tick fires immediately, which is what the probe
    // wants ("at startup and on every probe tick"). The timeout ticker must
    // not inherit that: its first tick has to land a full `keep_alive_timeout`
    // after construction, or the session would self-close before any inbound
    // frame had a chance to arrive.
    let mut timeout = interval_at(
        Instant::now() + shared.config.keep_alive_timeout,
        shared.config.keep_alive_timeout,
    );
    timeout.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shared.die.notified() => break,
            _ = probe.tick() => probe_tick(&shared).await,
            _ = timeout.tick() => {
                if !timeout_tick(&shared) {
                    break;
                }
            }
        }
    }
    debug!("keepalive task exiting");
}

/// Bump `rtt_sn`, record when the probe went out, and submit a `Nop` carrying
/// it as the sid. The matching `Ack` (§4.2) closes the RTT sample.
async fn probe_tick(shared: &Arc<SessionShared>) {
    let sn = shared.rtt_sn.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
    *shared.rtt_test_sent_at.lock() = Some(Instant::now());
    shared.bucket.pulse();
    if let Err(e) = shared
        .send
        .submit(Frame::control(OpCode::Nop, sn), &shared.closed)
        .await
    {
        trace!("keepalive probe failed: {e}");
    }
}

/// Check whether any frame arrived since the last timeout tick; if not, the
/// peer is unresponsive and the Session closes itself. Returns whether the
/// keepalive task should keep running.
fn timeout_tick(shared: &Arc<SessionShared>) -> bool {
    if shared.data_ready.swap(false, Ordering::AcqRel) {
        return true;
    }
    warn!("keepalive timeout: no frames received, closing session");
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let _ = shared.close().await;
    });
    false
}
