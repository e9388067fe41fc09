//! Multi-room orchestrator.
//!
//! The engine owns the room registry and one shared pipeline:
//!
//! ```text
//! sessions ──raw buffers──▶ splitter ──plain frames──▶ dispatcher workers ──▶ handlers
//! ```
//!
//! Both queues are bounded, so a slow handler eventually stalls the read
//! loops instead of growing memory.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::RoomId;
use crate::config::{EngineConfig, ReconnectPolicy, Viewer};
use crate::discovery::{Discovery, Fetcher, HttpFetcher};
use crate::dispatcher::{self, Dispatcher};
use crate::error::{DanmakuError, Result};
use crate::handler::Handlers;
use crate::protocol::{Packet, RawBuffer, splitter};
use crate::session::{Connector, RoomSession, SessionContext, SessionState, SessionStatus, TcpConnector};
use crate::storm::StormFilter;

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    connector: Option<Arc<dyn Connector>>,
    pub(crate) handlers: Handlers,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of dispatcher workers. Per-room ordering only holds with 1.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers.max(1);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn storm_filter(mut self, enabled: bool) -> Self {
        self.config.storm_filter = enabled;
        self
    }

    /// Identity used by [`Engine::join`].
    pub fn viewer(mut self, viewer: Viewer) -> Self {
        self.config.viewer = viewer;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn raw_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.raw_queue_capacity = capacity;
        self
    }

    pub fn frame_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.frame_queue_capacity = capacity;
        self
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.config.max_frame_len = len;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Discovery transport. Defaults to [`HttpFetcher`].
    pub fn fetcher(mut self, fetcher: impl Fetcher) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Relay transport. Defaults to [`TcpConnector`].
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn build(self) -> Result<Engine> {
        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new()?),
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector) as Arc<dyn Connector>);

        let config = self.config;
        let (raw_tx, raw_rx) = mpsc::channel(config.raw_queue_capacity.max(1));
        let (frame_tx, frame_rx) = flume::bounded(config.frame_queue_capacity.max(1));

        let storm = Arc::new(StormFilter::new());
        let registered = self.handlers.registered();
        let dispatcher = Arc::new(Dispatcher::new(
            self.handlers,
            storm.clone(),
            config.debug,
            config.storm_filter,
        ));

        let ctx = SessionContext {
            discovery: Discovery::new(fetcher),
            connector,
            policy: config.reconnect.clone(),
            heartbeat_interval: config.heartbeat_interval,
            max_frame_len: config.max_frame_len,
            raw_tx,
        };

        Ok(Engine {
            inner: Arc::new(Inner {
                config,
                ctx,
                dispatcher,
                storm,
                registered,
                pipeline: Mutex::new(Some(Pipeline {
                    raw_rx,
                    frame_tx,
                    frame_rx,
                })),
                registry: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        })
    }
}

/// Queue ends handed to the splitter and workers on start.
struct Pipeline {
    raw_rx: mpsc::Receiver<RawBuffer>,
    frame_tx: flume::Sender<Packet>,
    frame_rx: flume::Receiver<Packet>,
}

struct RoomEntry {
    /// Distinguishes a re-joined room from the session it replaced.
    generation: u64,
    status: Arc<SessionStatus>,
    cancel: CancellationToken,
}

struct Inner {
    config: EngineConfig,
    ctx: SessionContext,
    dispatcher: Arc<Dispatcher>,
    storm: Arc<StormFilter>,
    registered: Vec<&'static str>,
    pipeline: Mutex<Option<Pipeline>>,
    registry: Mutex<HashMap<RoomId, RoomEntry>>,
    next_generation: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    fn is_running(&self) -> bool {
        self.pipeline.lock().is_none() && !self.cancel.is_cancelled()
    }

    /// Drop a room whose session exited on its own.
    fn deregister(&self, room_id: RoomId, generation: u64) {
        let mut registry = self.registry.lock();
        if registry
            .get(&room_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            registry.remove(&room_id);
            self.storm.untrack(room_id);
            info!(room_id, "room removed after session ended");
        }
    }
}

/// Danmaku client engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Launch the splitter and dispatcher workers. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let Some(pipeline) = self.inner.pipeline.lock().take() else {
            return Err(DanmakuError::AlreadyStarted);
        };
        let Pipeline {
            raw_rx,
            frame_tx,
            frame_rx,
        } = pipeline;

        let inner = &self.inner;
        inner
            .tracker
            .spawn(splitter::run(raw_rx, frame_tx, inner.cancel.clone()));

        let workers = inner.config.workers.max(1);
        for id in 0..workers {
            inner.tracker.spawn(dispatcher::run_worker(
                id,
                inner.dispatcher.clone(),
                frame_rx.clone(),
                inner.cancel.clone(),
            ));
        }

        info!(
            workers,
            handlers = ?inner.registered,
            debug = inner.config.debug,
            storm_filter = inner.config.storm_filter,
            "engine started"
        );
        Ok(())
    }

    /// Join rooms as the configured viewer.
    pub fn join(&self, room_ids: &[RoomId]) -> Result<()> {
        self.join_as(self.inner.config.viewer.clone(), room_ids)
    }

    /// Join rooms as `viewer`.
    ///
    /// The whole batch is rejected if any room is already registered (or
    /// listed twice).
    pub fn join_as(&self, viewer: Viewer, room_ids: &[RoomId]) -> Result<()> {
        if !self.inner.is_running() {
            return Err(DanmakuError::NotStarted);
        }

        let mut registry = self.inner.registry.lock();

        let mut batch = HashSet::with_capacity(room_ids.len());
        for &room_id in room_ids {
            if registry.contains_key(&room_id) || !batch.insert(room_id) {
                return Err(DanmakuError::RoomExists(room_id));
            }
        }

        for &room_id in room_ids {
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let status = Arc::new(SessionStatus::default());
            let cancel = self.inner.cancel.child_token();

            let session = RoomSession::new(
                room_id,
                viewer.clone(),
                self.inner.ctx.clone(),
                status.clone(),
                cancel.clone(),
            );

            self.inner.storm.track(room_id);
            registry.insert(
                room_id,
                RoomEntry {
                    generation,
                    status,
                    cancel,
                },
            );

            let engine: Weak<Inner> = Arc::downgrade(&self.inner);
            self.inner.tracker.spawn(async move {
                match session.run().await {
                    Ok(()) => debug!(room_id, "room session stopped"),
                    Err(e) => error!(room_id, "room session failed: {}", e),
                }
                if let Some(inner) = engine.upgrade() {
                    inner.deregister(room_id, generation);
                }
            });
        }

        info!(rooms = ?room_ids, "joined rooms");
        Ok(())
    }

    /// Stop and deregister rooms. Unknown ids are skipped.
    pub fn remove(&self, room_ids: &[RoomId]) {
        let mut registry = self.inner.registry.lock();
        for room_id in room_ids {
            match registry.remove(room_id) {
                Some(entry) => {
                    entry.cancel.cancel();
                    self.inner.storm.untrack(*room_id);
                    info!(room_id, "room removed");
                }
                None => debug!(room_id, "remove for unknown room"),
            }
        }
    }

    /// Registered room ids, sorted.
    pub fn rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.inner.registry.lock().keys().copied().collect();
        rooms.sort_unstable();
        rooms
    }

    pub fn session_state(&self, room_id: RoomId) -> Option<SessionState> {
        self.inner
            .registry
            .lock()
            .get(&room_id)
            .map(|entry| entry.status.state())
    }

    /// Consecutive failures of a room's session since its last good frame.
    pub fn consecutive_failures(&self, room_id: RoomId) -> Option<u32> {
        self.inner
            .registry
            .lock()
            .get(&room_id)
            .map(|entry| entry.status.consecutive_failures())
    }

    /// Cancel every session, the splitter and the workers.
    pub fn shutdown(&self) {
        info!("shutting down engine");
        self.inner.cancel.cancel();
        self.inner.tracker.close();
    }

    /// Resolve once every task has exited. Only completes after [`Engine::shutdown`].
    pub async fn wait(&self) {
        self.inner.tracker.wait().await;
        debug!("engine stopped");
    }
}
