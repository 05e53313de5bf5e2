//! Session tunables (§6).
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::time::Duration;

/// Protocol version this crate speaks. A peer advertising any other version
/// causes [`Error::InvalidProtocol`](crate::Error::InvalidProtocol).
pub const PROTO_VERSION: u8 = 2;

/// Size of the accept queue for inbound streams (§3).
pub const ACCEPT_BACKLOG: usize = 1024;

/// Capacity of the bounded channel feeding the serializer task (§4.3).
pub const SERIALIZER_CHANNEL_DEPTH: usize = 32;

/// Tunables for a [`Session`](crate::Session).
///
/// `Config` is plain data; loading it from a file or environment is left to
/// the embedding application.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum payload bytes per PSH frame. Writes larger than this are split.
    pub max_frame_size: u32,
    /// Initial (and maximum) size of the session-wide receive bucket, in bytes.
    pub max_receive_buffer: u32,
    /// Advisory per-stream buffer target used to size a stream's initial read buffer.
    pub max_stream_buffer: u32,
    /// Advisory duration after which a consistently-saturated stream may grow
    /// its buffer towards `max_stream_buffer`.
    pub boost_timeout: Duration,
    /// If true, the receive loop replies ACK to inbound NOP and streams emit
    /// FUL/EMP signals as their buffers fill and drain.
    pub enable_stream_buffer: bool,
    /// Depth of each per-stream outbound write queue (§3).
    pub write_request_queue_size: usize,
    /// Interval between keepalive probes.
    pub keep_alive_interval: Duration,
    /// Maximum time without an inbound frame before the Session closes itself.
    pub keep_alive_timeout: Duration,
    /// Selects the simple (single-stage, unfair) send pipeline instead of the
    /// default fair scheduler. Intended for tests.
    pub test: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 32 * 1024,
            max_receive_buffer: 4 * 1024 * 1024,
            max_stream_buffer: 64 * 1024,
            boost_timeout: Duration::from_secs(30),
            enable_stream_buffer: false,
            write_request_queue_size: 4096,
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(90),
            test: false,
        }
    }
}

impl Config {
    /// A `Config` tuned for fast, deterministic unit tests: short keepalive
    /// timers and the simple send pipeline.
    #[must_use]
    pub fn test() -> Self {
        Self {
            keep_alive_interval: Duration::from_millis(100),
            keep_alive_timeout: Duration::from_millis(300),
            test: true,
            ..Self::default()
        }
    }

    /// Basic sanity checks on the configuration. Does not catch every
    /// misconfiguration, only values that would make the Session's
    /// invariants impossible to uphold.
    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.max_frame_size == 0 || self.max_frame_size > u32::from(u16::MAX) {
            return Err(crate::Error::Transport(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "max_frame_size must be in 1..=65535",
            )));
        }
        if self.write_request_queue_size == 0 {
            return Err(crate::Error::Transport(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "write_request_queue_size must be >= 1",
            )));
        }
        Ok(())
    }
}
