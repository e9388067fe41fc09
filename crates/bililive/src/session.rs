//! Room session.
//!
//! One session owns one relay connection for one room:
//!
//! `Idle → Connecting → Authenticated → Streaming → (Reconnecting → Connecting) → Closed`
//!
//! The read loop forwards every outer frame to the splitter as a raw buffer.
//! Read, validation, dial and auth failures all go through the same bounded
//! reconnect path described by [`ReconnectPolicy`]. The one exception is a
//! rejected room on the very first lookup, which ends the session at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::RoomId;
use crate::config::{ReconnectPolicy, Viewer};
use crate::discovery::{Discovery, Endpoint, Route, extract_cookie_value, generate_fake_buvid3};
use crate::error::{DanmakuError, Result};
use crate::protocol::{FrameHeader, HEADER_LEN, Operation, RawBuffer, encode};

/// Protocol version requesting brotli-compressed message frames.
const PROTOCOL_VERSION: u32 = 3;

const PLATFORM: &str = "web";

const CLIENT_VERSION: &str = "2.6.42";

/// Auth type for the web client.
const AUTH_TYPE: u32 = 2;

/// Base for synthetic anonymous uids.
const ANONYMOUS_UID_BASE: u64 = 10_000_000_000;

/// A bidirectional byte stream to a relay endpoint.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// Opens transports to relay endpoints.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>>;
}

/// Plain TCP [`Connector`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| DanmakuError::connection(format!("dial {} failed: {}", endpoint, e)))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Lifecycle state of a room session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Authenticated = 2,
    Streaming = 3,
    Reconnecting = 4,
    Closed = 5,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Authenticated,
            3 => Self::Streaming,
            4 => Self::Reconnecting,
            5 => Self::Closed,
            _ => Self::Idle,
        }
    }
}

/// State and failure counter shared between a session and its owner.
#[derive(Debug, Default)]
pub(crate) struct SessionStatus {
    state: AtomicU8,
    failures: AtomicU32,
}

impl SessionStatus {
    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    fn reset_failures(&self) {
        self.failures.store(0, Ordering::Release);
    }
}

/// Collaborators and settings shared by every session of an engine.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) discovery: Discovery,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) max_frame_len: usize,
    pub(crate) raw_tx: mpsc::Sender<RawBuffer>,
}

type SharedWriter = Arc<Mutex<Option<WriteHalf<Box<dyn Transport>>>>>;

#[derive(Debug, Serialize)]
struct AuthPayload<'a> {
    uid: u64,
    roomid: RoomId,
    protover: u32,
    platform: &'static str,
    clientver: &'static str,
    #[serde(rename = "type")]
    auth_type: u32,
    key: &'a str,
    buvid: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthReply {
    code: i64,
}

pub(crate) struct RoomSession {
    room_id: RoomId,
    viewer: Viewer,
    uid: u64,
    buvid: String,
    ctx: SessionContext,
    route: Option<Route>,
    cursor: usize,
    writer: SharedWriter,
    status: Arc<SessionStatus>,
    cancel: CancellationToken,
}

impl RoomSession {
    pub(crate) fn new(
        room_id: RoomId,
        viewer: Viewer,
        ctx: SessionContext,
        status: Arc<SessionStatus>,
        cancel: CancellationToken,
    ) -> Self {
        let (uid, buvid) = match &viewer {
            Viewer::Anonymous => (
                ANONYMOUS_UID_BASE + u64::from(rand::random::<u32>()),
                generate_fake_buvid3(),
            ),
            Viewer::Authenticated { uid, cookie } => (
                *uid,
                extract_cookie_value(cookie, "buvid3").unwrap_or_else(generate_fake_buvid3),
            ),
        };

        Self {
            room_id,
            viewer,
            uid,
            buvid,
            ctx,
            route: None,
            cursor: 0,
            writer: Arc::new(Mutex::new(None)),
            status,
            cancel,
        }
    }

    /// Run until cancelled or until the room is declared broken.
    pub(crate) async fn run(mut self) -> Result<()> {
        let heartbeat_cancel = self.cancel.child_token();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.room_id,
            self.writer.clone(),
            self.ctx.heartbeat_interval,
            heartbeat_cancel.clone(),
        ));

        let result = self.read_loop().await;

        heartbeat_cancel.cancel();
        if let Err(e) = heartbeat.await {
            warn!(room_id = self.room_id, "heartbeat task failed: {}", e);
        }
        self.close().await;

        result
    }

    async fn read_loop(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        let mut reader: Option<ReadHalf<Box<dyn Transport>>> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            if reader.is_none() {
                let established = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    established = self.establish() => established,
                };
                match established {
                    Ok(r) => reader = Some(r),
                    Err(e) => {
                        // No route yet: the first resolution was rejected.
                        let fatal = self.route.is_none() && e.is_rejection();
                        self.on_failure(e, fatal, &cancel).await?;
                        continue;
                    }
                }
            }

            let Some(r) = reader.as_mut() else {
                continue;
            };

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                read = read_packet(r, self.ctx.max_frame_len) => read,
            };

            let handled = match read {
                Ok(data) => self.handle_packet(data, &cancel).await,
                Err(e) => Err(e),
            };

            match handled {
                Ok(true) => self.status.reset_failures(),
                Ok(false) => return Ok(()),
                Err(e) => {
                    reader = None;
                    self.on_failure(e, false, &cancel).await?;
                }
            }
        }
    }

    /// Returns `Ok(false)` when the splitter is gone.
    async fn handle_packet(&self, data: Bytes, cancel: &CancellationToken) -> Result<bool> {
        let header = FrameHeader::parse(&data)?;
        trace!(
            room_id = self.room_id,
            len = header.total_len,
            operation = header.operation.code(),
            "read frame"
        );

        if header.operation == Operation::AuthReply {
            check_auth_reply(&data[HEADER_LEN..])?;
            self.status.set_state(SessionState::Streaming);
            info!(room_id = self.room_id, "authenticated with relay");
            return Ok(true);
        }

        let raw = RawBuffer {
            room_id: self.room_id,
            data,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(true),
            sent = self.ctx.raw_tx.send(raw) => Ok(sent.is_ok()),
        }
    }

    async fn on_failure(
        &self,
        err: DanmakuError,
        fatal: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.drop_writer().await;

        if fatal {
            error!(room_id = self.room_id, "room session aborted: {}", err);
            return Err(err);
        }

        let failures = self.status.record_failure();
        if !self.ctx.policy.should_retry(failures) {
            error!(
                room_id = self.room_id,
                failures, "giving up after consecutive failures: {}", err
            );
            return Err(err);
        }

        let delay = self.ctx.policy.backoff(failures);
        warn!(
            room_id = self.room_id,
            failures,
            delay_ms = delay.as_millis() as u64,
            "session failed, reconnecting: {}",
            err
        );
        self.status.set_state(SessionState::Reconnecting);

        tokio::select! {
            _ = cancel.cancelled() => {},
            _ = tokio::time::sleep(delay) => {},
        }
        Ok(())
    }

    /// Connect and authenticate, returning the read half.
    async fn establish(&mut self) -> Result<ReadHalf<Box<dyn Transport>>> {
        self.status.set_state(SessionState::Connecting);

        let stream = self.connect().await?;
        let (reader, mut writer) = tokio::io::split(stream);
        self.authenticate(&mut writer).await?;
        writer.write_all(&encode(Operation::Heartbeat, &[])).await?;

        *self.writer.lock().await = Some(writer);
        self.status.set_state(SessionState::Authenticated);
        Ok(reader)
    }

    /// Walk the endpoint list from the cursor, rediscovering once when it runs out.
    async fn connect(&mut self) -> Result<Box<dyn Transport>> {
        let mut rediscovered = false;
        if self.route.is_none() {
            self.refresh_route().await?;
            rediscovered = true;
        }

        loop {
            let endpoints = self
                .route
                .as_ref()
                .map(|route| route.endpoints.clone())
                .unwrap_or_default();

            while let Some(endpoint) = endpoints.get(self.cursor) {
                if let Some(stream) = self.dial_with_retry(endpoint).await {
                    self.cursor = 0;
                    return Ok(stream);
                }
                self.cursor += 1;
            }

            self.cursor = 0;
            if rediscovered {
                return Err(DanmakuError::connection(format!(
                    "all {} relay endpoints failed",
                    endpoints.len()
                )));
            }
            debug!(room_id = self.room_id, "endpoint list exhausted, rediscovering");
            self.refresh_route().await?;
            rediscovered = true;
        }
    }

    async fn dial_with_retry(&self, endpoint: &Endpoint) -> Option<Box<dyn Transport>> {
        let policy = &self.ctx.policy;
        let attempts = policy.dial_attempts.max(1);

        for attempt in 1..=attempts {
            let dialed =
                match tokio::time::timeout(policy.connect_timeout, self.ctx.connector.dial(endpoint))
                    .await
                {
                    Ok(dialed) => dialed,
                    Err(_) => Err(DanmakuError::connection(format!("dial {} timed out", endpoint))),
                };

            match dialed {
                Ok(stream) => {
                    info!(room_id = self.room_id, endpoint = %endpoint, "connected to relay");
                    return Some(stream);
                }
                Err(e) => {
                    warn!(
                        room_id = self.room_id,
                        endpoint = %endpoint,
                        attempt,
                        "dial failed: {}",
                        e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(policy.dial_retry_delay).await;
                    }
                }
            }
        }
        None
    }

    async fn refresh_route(&mut self) -> Result<()> {
        let route = self
            .ctx
            .discovery
            .resolve(self.room_id, self.viewer.cookie())
            .await?;
        self.route = Some(route);
        Ok(())
    }

    async fn authenticate(&self, writer: &mut WriteHalf<Box<dyn Transport>>) -> Result<()> {
        let route = self
            .route
            .as_ref()
            .ok_or_else(|| DanmakuError::connection("authenticate without a route"))?;

        let payload = serde_json::to_vec(&AuthPayload {
            uid: self.uid,
            roomid: route.room_id,
            protover: PROTOCOL_VERSION,
            platform: PLATFORM,
            clientver: CLIENT_VERSION,
            auth_type: AUTH_TYPE,
            key: &route.token,
            buvid: &self.buvid,
        })?;

        writer.write_all(&encode(Operation::Auth, &payload)).await?;
        writer.flush().await?;
        debug!(
            room_id = self.room_id,
            canonical = route.room_id,
            "sent auth frame"
        );
        Ok(())
    }

    async fn drop_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn close(&self) {
        self.drop_writer().await;
        self.status.set_state(SessionState::Closed);
        debug!(room_id = self.room_id, "room session closed");
    }
}

/// Read one outer frame (header and payload) from `reader`.
async fn read_packet<R>(reader: &mut R, max_frame_len: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let parsed = FrameHeader::parse(&header)?;
    let total_len = parsed.total_len as usize;
    if total_len > max_frame_len {
        return Err(DanmakuError::protocol(format!(
            "frame length {} exceeds limit {}",
            total_len, max_frame_len
        )));
    }

    let mut buf = BytesMut::with_capacity(total_len);
    buf.extend_from_slice(&header);
    buf.resize(total_len, 0);
    reader.read_exact(&mut buf[HEADER_LEN..]).await?;
    Ok(buf.freeze())
}

fn check_auth_reply(payload: &[u8]) -> Result<()> {
    let reply: AuthReply = serde_json::from_slice(payload)
        .map_err(|e| DanmakuError::protocol(format!("malformed auth reply: {}", e)))?;
    if reply.code != 0 {
        return Err(DanmakuError::protocol(format!(
            "auth rejected with code {}",
            reply.code
        )));
    }
    Ok(())
}

async fn heartbeat_loop(
    room_id: RoomId,
    writer: SharedWriter,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let frame = encode(Operation::Heartbeat, &[]);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            guard = writer.lock() => guard,
        };
        let Some(w) = guard.as_mut() else {
            continue;
        };
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tokio::time::timeout(interval, w.write_all(&frame)) => sent,
        };
        match sent {
            Ok(Ok(())) => trace!(room_id, "sent heartbeat"),
            Ok(Err(e)) => warn!(room_id, "failed to send heartbeat: {}", e),
            Err(_) => {
                // The peer stopped reading and part of a frame may be queued.
                warn!(room_id, "heartbeat write stalled, dropping writer");
                guard.take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};

    use tokio::io::{DuplexStream, ReadBuf};

    use super::*;
    use crate::discovery::tests::StaticFetcher;
    use crate::discovery::{DANMU_CONF_URL, Fetcher, ROOM_INIT_URL};

    /// Accepts writes, fails every read.
    struct ResetStream;

    impl AsyncRead for ResetStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset",
            )))
        }
    }

    impl AsyncWrite for ResetStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Fails every write, never yields data.
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn write_half(stream: impl Transport) -> WriteHalf<Box<dyn Transport>> {
        let stream: Box<dyn Transport> = Box::new(stream);
        tokio::io::split(stream).1
    }

    /// Serves the room once, then answers room_init as if it had been closed.
    struct ClosedAfterFirstLookup {
        inner: StaticFetcher,
        room_inits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Fetcher for ClosedAfterFirstLookup {
        async fn fetch(&self, url: &str, cookie: Option<&str>) -> Result<Bytes> {
            if url.starts_with(ROOM_INIT_URL) && self.room_inits.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(Bytes::from_static(br#"{"code":60004,"message":"room not exist"}"#));
            }
            self.inner.fetch(url, cookie).await
        }
    }

    /// Hands out failing streams for the first `failures` dials, then a
    /// duplex pre-loaded with `script`.
    struct ScriptedConnector {
        failures: usize,
        script: Vec<Bytes>,
        dials: AtomicUsize,
        refused: Vec<String>,
        dialed: parking_lot::Mutex<Vec<String>>,
        servers: parking_lot::Mutex<Vec<DuplexStream>>,
        buffer: usize,
    }

    impl ScriptedConnector {
        fn new(failures: usize, script: Vec<Bytes>) -> Self {
            Self {
                failures,
                script,
                dials: AtomicUsize::new(0),
                refused: Vec::new(),
                dialed: parking_lot::Mutex::new(Vec::new()),
                servers: parking_lot::Mutex::new(Vec::new()),
                buffer: 64 * 1024,
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn dial(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
            self.dialed.lock().push(endpoint.host.clone());
            if self.refused.contains(&endpoint.host) {
                return Err(DanmakuError::connection("refused"));
            }
            if self.dials.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Ok(Box::new(ResetStream));
            }

            let (client, mut server) = tokio::io::duplex(self.buffer);
            for frame in &self.script {
                server.write_all(frame).await?;
            }
            self.servers.lock().push(server);
            Ok(Box::new(client))
        }
    }

    fn auth_ack(code: i64) -> Bytes {
        encode(
            Operation::AuthReply,
            format!("{{\"code\":{}}}", code).as_bytes(),
        )
    }

    fn context(
        fetcher: impl Fetcher,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
    ) -> (SessionContext, mpsc::Receiver<RawBuffer>) {
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let ctx = SessionContext {
            discovery: Discovery::new(Arc::new(fetcher)),
            connector,
            policy,
            heartbeat_interval: Duration::from_secs(30),
            max_frame_len: 1024 * 1024,
            raw_tx,
        };
        (ctx, raw_rx)
    }

    fn room(endpoints: &[Endpoint]) -> StaticFetcher {
        StaticFetcher::default().with_room(100, 5050, endpoints)
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failed_reads() {
        let frames = vec![
            encode(Operation::Message, br#"{"cmd":"A"}"#),
            encode(Operation::Message, br#"{"cmd":"B"}"#),
        ];
        let mut script = vec![auth_ack(0)];
        script.extend(frames.iter().cloned());

        let connector = Arc::new(ScriptedConnector::new(3, script));
        let (ctx, mut raw_rx) = context(
            room(&[Endpoint::new("relay", 2243)]),
            connector.clone(),
            ReconnectPolicy::default(),
        );
        let status = Arc::new(SessionStatus::default());
        let cancel = CancellationToken::new();
        let session = RoomSession::new(100, Viewer::Anonymous, ctx, status.clone(), cancel.clone());
        let task = tokio::spawn(session.run());

        for expected in &frames {
            let raw = raw_rx.recv().await.unwrap();
            assert_eq!(raw.room_id, 100);
            assert_eq!(&raw.data, expected);
        }

        assert_eq!(connector.dials.load(Ordering::SeqCst), 4);
        assert_eq!(status.consecutive_failures(), 0);
        assert_eq!(status.state(), SessionState::Streaming);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(status.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_failures() {
        let connector = Arc::new(ScriptedConnector::new(usize::MAX, Vec::new()));
        let policy = ReconnectPolicy {
            max_consecutive_failures: 3,
            ..Default::default()
        };
        let (ctx, _raw_rx) = context(room(&[Endpoint::new("relay", 2243)]), connector.clone(), policy);
        let status = Arc::new(SessionStatus::default());
        let session =
            RoomSession::new(100, Viewer::Anonymous, ctx, status.clone(), CancellationToken::new());

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, DanmakuError::Io(_)));
        assert_eq!(status.consecutive_failures(), 3);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 3);
        assert_eq!(status.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_auth_counts_as_failure() {
        let connector = Arc::new(ScriptedConnector::new(0, vec![auth_ack(-101)]));
        let policy = ReconnectPolicy {
            max_consecutive_failures: 2,
            ..Default::default()
        };
        let (ctx, _raw_rx) = context(room(&[Endpoint::new("relay", 2243)]), connector.clone(), policy);
        let status = Arc::new(SessionStatus::default());
        let session =
            RoomSession::new(100, Viewer::Anonymous, ctx, status.clone(), CancellationToken::new());

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, DanmakuError::Protocol(_)));
        assert_eq!(status.consecutive_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_over_to_next_endpoint() {
        let mut connector = ScriptedConnector::new(0, vec![auth_ack(0)]);
        connector.refused = vec!["bad".to_string()];
        let connector = Arc::new(connector);
        let policy = ReconnectPolicy {
            dial_attempts: 2,
            ..Default::default()
        };
        let (ctx, _raw_rx) = context(
            room(&[Endpoint::new("bad", 1), Endpoint::new("good", 2)]),
            connector.clone(),
            policy,
        );
        let status = Arc::new(SessionStatus::default());
        let mut session =
            RoomSession::new(100, Viewer::Anonymous, ctx, status, CancellationToken::new());

        session.establish().await.unwrap();

        assert_eq!(*connector.dialed.lock(), vec!["bad", "bad", "good"]);
        assert_eq!(session.cursor, 0);
        assert_eq!(session.route.as_ref().unwrap().room_id, 5050);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscovers_once_when_all_endpoints_fail() {
        let mut connector = ScriptedConnector::new(0, Vec::new());
        connector.refused = vec!["bad".to_string()];
        let connector = Arc::new(connector);
        let policy = ReconnectPolicy {
            dial_attempts: 1,
            ..Default::default()
        };
        let fetcher = room(&[Endpoint::new("bad", 1)]);
        let (ctx, _raw_rx) = context(fetcher, connector.clone(), policy);
        let mut session = RoomSession::new(
            100,
            Viewer::Anonymous,
            ctx,
            Arc::new(SessionStatus::default()),
            CancellationToken::new(),
        );

        session.route = Some(Route {
            room_id: 5050,
            anchor_uid: None,
            endpoints: vec![Endpoint::new("bad", 1)],
            token: "stale".to_string(),
        });

        let err = session.connect().await.err().unwrap();
        assert!(matches!(err, DanmakuError::Connection(_)));
        // Stale list, then the rediscovered one.
        assert_eq!(*connector.dialed.lock(), vec!["bad", "bad"]);
        assert_eq!(session.route.as_ref().unwrap().token, "tok");
    }

    #[tokio::test]
    async fn test_room_not_found_is_fatal() {
        let fetcher = StaticFetcher::default().with_body(
            format!("{}{}", ROOM_INIT_URL, 404),
            serde_json::json!({"code": 60004, "message": "room not exist"}),
        );
        let connector = Arc::new(ScriptedConnector::new(0, Vec::new()));
        let (ctx, _raw_rx) = context(fetcher, connector.clone(), ReconnectPolicy::default());
        let status = Arc::new(SessionStatus::default());
        let session =
            RoomSession::new(404, Viewer::Anonymous, ctx, status.clone(), CancellationToken::new());

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, DanmakuError::RoomNotFound(404)));
        assert_eq!(status.consecutive_failures(), 0);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_conf_without_endpoints_is_fatal_on_first_lookup() {
        let connector = Arc::new(ScriptedConnector::new(0, Vec::new()));
        let (ctx, _raw_rx) = context(room(&[]), connector.clone(), ReconnectPolicy::default());
        let status = Arc::new(SessionStatus::default());
        let session =
            RoomSession::new(100, Viewer::Anonymous, ctx, status.clone(), CancellationToken::new());

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, DanmakuError::Discovery(_)));
        assert_eq!(status.consecutive_failures(), 0);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscovery_rejection_uses_retry_budget() {
        let room_inits = Arc::new(AtomicUsize::new(0));
        let fetcher = ClosedAfterFirstLookup {
            inner: room(&[Endpoint::new("relay", 2243)]),
            room_inits: room_inits.clone(),
        };
        let mut connector = ScriptedConnector::new(0, Vec::new());
        connector.refused = vec!["relay".to_string()];
        let connector = Arc::new(connector);
        let policy = ReconnectPolicy {
            dial_attempts: 1,
            max_consecutive_failures: 3,
            ..Default::default()
        };
        let (ctx, _raw_rx) = context(fetcher, connector.clone(), policy);
        let status = Arc::new(SessionStatus::default());
        let session =
            RoomSession::new(100, Viewer::Anonymous, ctx, status.clone(), CancellationToken::new());

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, DanmakuError::RoomNotFound(100)));
        assert_eq!(status.consecutive_failures(), 3);
        assert_eq!(room_inits.load(Ordering::SeqCst), 3);
        assert_eq!(connector.dialed.lock().len(), 3);
        assert_eq!(status.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ticks_through_write_errors() {
        let interval = Duration::from_secs(30);
        let heartbeat = encode(Operation::Heartbeat, &[]);
        let (client, mut server) = tokio::io::duplex(4096);
        let writer: SharedWriter = Arc::new(Mutex::new(Some(write_half(client))));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(heartbeat_loop(100, writer.clone(), interval, cancel.clone()));

        assert_eq!(read_packet(&mut server, 1024).await.unwrap(), heartbeat);
        let start = tokio::time::Instant::now();
        for _ in 0..2 {
            assert_eq!(read_packet(&mut server, 1024).await.unwrap(), heartbeat);
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= interval * 2 && elapsed < interval * 3);

        *writer.lock().await = Some(write_half(BrokenPipe));
        tokio::time::sleep(interval * 3).await;
        assert!(!task.is_finished());
        assert!(writer.lock().await.is_some());

        let (client, mut server) = tokio::io::duplex(4096);
        *writer.lock().await = Some(write_half(client));
        assert_eq!(read_packet(&mut server, 1024).await.unwrap(), heartbeat);

        cancel.cancel();
        tokio::time::timeout(interval, task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_not_blocked_by_stalled_peer() {
        // The relay acks auth, then never reads what the client writes.
        let mut connector = ScriptedConnector::new(0, vec![auth_ack(0)]);
        connector.buffer = 1024;
        let connector = Arc::new(connector);
        let (ctx, _raw_rx) = context(
            room(&[Endpoint::new("relay", 2243)]),
            connector.clone(),
            ReconnectPolicy::default(),
        );
        let status = Arc::new(SessionStatus::default());
        let cancel = CancellationToken::new();
        let session = RoomSession::new(100, Viewer::Anonymous, ctx, status.clone(), cancel.clone());
        let writer = session.writer.clone();
        let task = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
        assert!(writer.lock().await.is_none());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_authenticated_viewer_sends_cookie_and_buvid() {
        let fetcher = Arc::new(room(&[Endpoint::new("relay", 2243)]));
        let viewer = Viewer::authenticated(42, "SESSDATA=s; buvid3=DEVICEinfoc");
        let (raw_tx, _raw_rx) = mpsc::channel(1);
        let ctx = SessionContext {
            discovery: Discovery::new(fetcher.clone()),
            connector: Arc::new(ScriptedConnector::new(0, Vec::new())),
            policy: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            max_frame_len: 1024,
            raw_tx,
        };
        let mut session = RoomSession::new(
            100,
            viewer,
            ctx,
            Arc::new(SessionStatus::default()),
            CancellationToken::new(),
        );

        assert_eq!(session.uid, 42);
        assert_eq!(session.buvid, "DEVICEinfoc");

        session.refresh_route().await.unwrap();
        let requests = fetcher.requests.lock();
        assert_eq!(requests[1].0, format!("{}{}", DANMU_CONF_URL, 5050));
        assert!(
            requests
                .iter()
                .all(|(_, cookie)| cookie.as_deref() == Some("SESSDATA=s; buvid3=DEVICEinfoc"))
        );
    }

    #[tokio::test]
    async fn test_auth_frame_payload() {
        let (raw_tx, _raw_rx) = mpsc::channel(1);
        let ctx = SessionContext {
            discovery: Discovery::new(Arc::new(StaticFetcher::default())),
            connector: Arc::new(TcpConnector),
            policy: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            max_frame_len: 1024,
            raw_tx,
        };
        let mut session = RoomSession::new(
            100,
            Viewer::Anonymous,
            ctx,
            Arc::new(SessionStatus::default()),
            CancellationToken::new(),
        );
        session.route = Some(Route {
            room_id: 5050,
            anchor_uid: None,
            endpoints: vec![Endpoint::new("relay", 2243)],
            token: "secret".to_string(),
        });

        let (client, mut server) = tokio::io::duplex(4096);
        let stream: Box<dyn Transport> = Box::new(client);
        let (_reader, mut writer) = tokio::io::split(stream);
        session.authenticate(&mut writer).await.unwrap();

        let data = read_packet(&mut server, 4096).await.unwrap();
        let header = FrameHeader::parse(&data).unwrap();
        assert_eq!(header.operation, Operation::Auth);

        let auth: serde_json::Value = serde_json::from_slice(&data[HEADER_LEN..]).unwrap();
        assert_eq!(auth["roomid"], 5050);
        assert_eq!(auth["key"], "secret");
        assert_eq!(auth["protover"], 3);
        assert_eq!(auth["platform"], "web");
        assert_eq!(auth["type"], 2);
        assert!(auth["uid"].as_u64().unwrap() >= ANONYMOUS_UID_BASE);
        assert!(auth["buvid"].as_str().unwrap().ends_with("infoc"));
    }

    #[tokio::test]
    async fn test_read_packet_validates_length() {
        let mut short = encode(Operation::Message, b"{}").to_vec();
        short[0..4].copy_from_slice(&8u32.to_be_bytes());
        let err = read_packet(&mut short.as_slice(), 1024).await.unwrap_err();
        assert!(matches!(err, DanmakuError::Protocol(_)));

        let big = encode(Operation::Message, &[0u8; 64]);
        let err = read_packet(&mut &big[..], 32).await.unwrap_err();
        assert!(matches!(err, DanmakuError::Protocol(_)));

        let ok = read_packet(&mut &big[..], 1024).await.unwrap();
        assert_eq!(ok, big);
    }

    #[test]
    fn test_auth_reply() {
        assert!(check_auth_reply(br#"{"code":0}"#).is_ok());
        assert!(check_auth_reply(br#"{"code":-101}"#).is_err());
        assert!(check_auth_reply(b"garbage").is_err());
    }
}
