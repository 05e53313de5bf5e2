//! `Session`: the public entry point tying the registry, bucket, stream id
//! allocator and send pipeline to a single transport (§3, §4).
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

mod keepalive;
mod recv;

use crate::bucket::Bucket;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::{Frame, OpCode};
use crate::registry::{Registry, StreamEntry};
use crate::send::{SendPipeline, WriteOutcome};
use crate::stream::{MuxStream, StreamHost};
use crate::stream_id::StreamIdAllocator;
use bytes::Bytes;
use futures_util::task::AtomicWaker;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::debug;

/// A multiplexing session over a single reliable, full-duplex transport.
///
/// Cloning a `Session` is cheap (it is a thin handle over an `Arc`); every
/// clone refers to the same underlying transport and stream set.
#[derive(Clone, Debug)]
pub struct Session {
    shared: Arc<SessionShared>,
}

pub(crate) struct SessionShared {
    config: Config,
    registry: Registry,
    bucket: Bucket,
    send: Arc<SendPipeline>,
    id_alloc: StreamIdAllocator,
    accept_tx: mpsc::Sender<MuxStream>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    accept_deadline: parking_lot::Mutex<Option<Instant>>,
    closed: AtomicBool,
    die: Arc<Notify>,
    data_ready: AtomicBool,
    rtt_sn: AtomicU32,
    rtt_test_sent_at: parking_lot::Mutex<Option<Instant>>,
    rtt: parking_lot::Mutex<Option<std::time::Duration>>,
}

impl std::fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionShared")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("streams", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build a Session over `transport`, acting as the client (odd local
    /// stream ids) or server (even local stream ids) side of the protocol.
    pub fn new<T>(transport: T, config: Config, is_client: bool) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;
        let (reader, writer) = tokio::io::split(transport);
        // Shared with the send pipeline's scheduler/serializer tasks so a
        // single `close()` tears down every task, including the transport
        // writer, exactly once.
        let die = Arc::new(Notify::new());
        let send = SendPipeline::spawn(&config, writer, Arc::clone(&die));
        let (accept_tx, accept_rx) = mpsc::channel(crate::config::ACCEPT_BACKLOG);
        let shared = Arc::new(SessionShared {
            bucket: Bucket::new(config.max_receive_buffer),
            registry: Registry::new(),
            send,
            id_alloc: StreamIdAllocator::new(is_client),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            accept_deadline: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            die,
            data_ready: AtomicBool::new(false),
            rtt_sn: AtomicU32::new(0),
            rtt_test_sent_at: parking_lot::Mutex::new(None),
            rtt: parking_lot::Mutex::new(None),
            config,
        });

        tokio::spawn(recv::run(Arc::clone(&shared), reader));
        tokio::spawn(keepalive::run(Arc::clone(&shared)));

        Ok(Self { shared })
    }

    /// Build a client-side Session (local stream ids are odd).
    pub fn client<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(transport, config, true)
    }

    /// Build a server-side Session (local stream ids are even).
    pub fn server<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(transport, config, false)
    }

    /// Open a new outbound stream: allocate a sid, submit SYN (blocking until
    /// the serializer confirms it was written), then register the stream.
    pub async fn open(&self) -> Result<MuxStream> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::BrokenPipe);
        }
        let sid = self.shared.id_alloc.allocate()?;
        self.shared
            .send
            .submit(Frame::control(OpCode::Syn, sid), &self.shared.closed)
            .await?;

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
        // `sid` was just minted by our own allocator, so this cannot collide.
        self.shared.registry.insert(sid, entry);

        Ok(MuxStream::new(
            sid,
            Arc::clone(&self.shared) as Arc<dyn StreamHost>,
            data_rx,
            reset,
            read_waker,
            pause_write,
            write_waker,
            buffered,
        ))
    }

    /// Accept the next inbound stream, or fail with [`Error::Timeout`] if a
    /// deadline is set via [`Session::set_accept_deadline`] and elapses
    /// first, or [`Error::BrokenPipe`] once the Session has died.
    pub async fn accept(&self) -> Result<MuxStream> {
        let deadline = *self.shared.accept_deadline.lock();
        let mut rx = self.shared.accept_rx.lock().await;
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.shared.die.notified() => Err(Error::BrokenPipe),
                    stream = rx.recv() => stream.ok_or(Error::BrokenPipe),
                    () = tokio::time::sleep_until(deadline) => Err(Error::Timeout),
                }
            }
            None => {
                tokio::select! {
                    biased;
                    () = self.shared.die.notified() => Err(Error::BrokenPipe),
                    stream = rx.recv() => stream.ok_or(Error::BrokenPipe),
                }
            }
        }
    }

    /// Set (or, with `None`, clear) the deadline for future [`Session::accept`] calls.
    pub fn set_accept_deadline(&self, deadline: Option<Instant>) {
        *self.shared.accept_deadline.lock() = deadline;
    }

    /// Number of currently live streams. `0` once the Session is closed.
    #[must_use]
    pub fn num_streams(&self) -> usize {
        if self.shared.closed.load(Ordering::Acquire) {
            0
        } else {
            self.shared.registry.len()
        }
    }

    /// Whether this Session has been closed (locally or by the peer/transport).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Most recent round-trip sample from the keepalive probe, if any.
    #[must_use]
    pub fn rtt(&self) -> Option<std::time::Duration> {
        *self.shared.rtt.lock()
    }

    /// Submit a session-level control frame (sid `0`) built from one of the
    /// known commands, for application-level signaling that piggybacks on
    /// the control plane instead of opening a stream.
    pub async fn write_custom_command(&self, cmd: OpCode, payload: Bytes) -> Result<usize> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::BrokenPipe);
        }
        let frame = Frame {
            ver: crate::config::PROTO_VERSION,
            cmd,
            sid: 0,
            payload,
        };
        self.shared.send.submit(frame, &self.shared.closed).await
    }

    /// Close this Session: idempotent. Latches `go_away`, wakes every blocked
    /// reader/writer/accepter, and drops every live stream's registry entry.
    /// The same signal tells the scheduler and serializer tasks to exit; the
    /// serializer shuts the transport down as it does, so the transport is
    /// closed exactly once.
    pub async fn close(&self) -> Result<()> {
        self.shared.close().await
    }
}

impl SessionShared {
    pub(crate) async fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("session closing");
        self.id_alloc.latch_go_away();
        self.registry.close_all();
        self.bucket.pulse();
        self.die.notify_waiters();
        Ok(())
    }
}

impl StreamHost for SessionShared {
    fn max_frame_size(&self) -> u32 {
        self.config.max_frame_size
    }

    fn try_submit_data(&self, frame: Frame) -> Result<oneshot::Receiver<WriteOutcome>> {
        self.send.try_submit_data(frame, &self.closed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn return_tokens(&self, n: u32) {
        self.bucket.restore(n);
    }

    fn stream_closed(&self, sid: u32, recycled: u32) {
        self.registry.remove_and_recycle(sid, recycled, &self.bucket);
    }

    fn stream_buffer_threshold(&self) -> Option<u32> {
        self.config.enable_stream_buffer.then_some(self.config.max_stream_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn open_and_accept_round_trip() {
        let (client_io, server_io) = duplex(4096);
        let client = Session::client(client_io, Config::test()).unwrap();
        let server = Session::server(server_io, Config::test()).unwrap();

        let client_stream = tokio::spawn(async move { client.open().await.unwrap() });
        let server_stream = server.accept().await.unwrap();
        let client_stream = client_stream.await.unwrap();

        assert_eq!(client_stream.id(), server_stream.id());
    }

    #[tokio::test]
    async fn accept_times_out() {
        let (_client_io, server_io) = duplex(4096);
        let server = Session::server(server_io, Config::test()).unwrap();
        server.set_accept_deadline(Some(Instant::now() + std::time::Duration::from_millis(20)));
        let err = server.accept().await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reflected_in_num_streams() {
        let (client_io, server_io) = duplex(4096);
        let client = Session::client(client_io, Config::test()).unwrap();
        let _server = Session::server(server_io, Config::test()).unwrap();
        let _stream = client.open().await.unwrap();
        assert_eq!(client.num_streams(), 1);
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());
        assert_eq!(client.num_streams(), 0);
    }

    #[tokio::test]
    async fn echo_small_message_round_trips() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client_io, server_io) = duplex(4096);
        let client = Session::client(client_io, Config::test()).unwrap();
        let server = Session::server(server_io, Config::test()).unwrap();

        let mut client_stream = client.open().await.unwrap();
        let accept = tokio::spawn(async move { server.accept().await.unwrap() });
        let mut server_stream = accept.await.unwrap();

        client_stream.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        server_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn flow_control_pauses_and_resumes_writer() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut config = Config::test();
        config.enable_stream_buffer = true;
        config.max_stream_buffer = 4;
        config.max_frame_size = 4;
        let (client_io, server_io) = duplex(1 << 16);
        let client = Session::client(client_io, config.clone()).unwrap();
        let server = Session::server(server_io, config).unwrap();

        let mut client_stream = client.open().await.unwrap();
        let accept = tokio::spawn(async move { server.accept().await.unwrap() });
        let mut server_stream = accept.await.unwrap();

        // First chunk crosses the threshold and the peer emits FUL; until
        // EMP comes back a second write should not be able to make progress
        // instantly, but the Session must not deadlock: draining the first
        // chunk on the reader unblocks the writer via the EMP round trip.
        client_stream.write_all(b"abcd").await.unwrap();
        let mut buf = [0u8; 4];
        server_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");

        client_stream.write_all(b"efgh").await.unwrap();
        server_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"efgh");
    }

    #[tokio::test]
    async fn invalid_protocol_version_closes_session() {
        use tokio::io::AsyncWriteExt;

        let (mut local, io) = duplex(64);
        let session = Session::client(io, Config::test()).unwrap();
        // ver=0xFF cmd=Nop(3) length=0 sid=0
        local
            .write_all(&[0xFF, 3, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !session.is_closed() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session should close on invalid protocol version");
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_timeout_closes_a_silent_session() {
        let (io, _peer) = duplex(4096);
        let mut config = Config::test();
        config.keep_alive_interval = std::time::Duration::from_millis(10);
        config.keep_alive_timeout = std::time::Duration::from_millis(50);
        let session = Session::client(io, config).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_timeout_does_not_fire_immediately() {
        let (io, _peer) = duplex(4096);
        let mut config = Config::test();
        config.keep_alive_interval = std::time::Duration::from_millis(10);
        config.keep_alive_timeout = std::time::Duration::from_millis(50);
        let session = Session::client(io, config).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        assert!(!session.is_closed());
    }
}
