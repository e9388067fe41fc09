//! # bililive
//!
//! Client engine for the Bilibili live danmaku relay.
//!
//! The engine resolves rooms through the discovery API, keeps one
//! authenticated socket per room alive (heartbeats, endpoint failover,
//! bounded reconnects), splits and decompresses the multiplexed frame stream
//! and dispatches typed events to registered handlers.
//!
//! ```no_run
//! use bililive::Engine;
//!
//! # async fn run() -> bililive::Result<()> {
//! let engine = Engine::builder()
//!     .storm_filter(true)
//!     .on_chat(|room_id, msg| println!("[{}] {}: {}", room_id, msg.user_name, msg.text))
//!     .on_popularity(|room_id, count| println!("[{}] popularity {}", room_id, count))
//!     .build()?;
//!
//! engine.start()?;
//! engine.join(&[21852])?;
//! tokio::signal::ctrl_c().await?;
//! engine.shutdown();
//! engine.wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! Events of one room are delivered in receipt order as long as a single
//! dispatcher worker is configured (the default).

pub mod config;
pub mod discovery;
mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
mod handler;
pub mod protocol;
pub mod session;
pub mod storm;

/// Room identifier as used by the platform.
pub type RoomId = u64;

pub use config::{EngineConfig, ReconnectPolicy, Viewer};
pub use discovery::{Discovery, Endpoint, Fetcher, HttpFetcher, Route};
pub use engine::{Engine, EngineBuilder};
pub use error::{DanmakuError, Result};
pub use event::*;
pub use handler::Handler;
pub use session::{Connector, SessionState, TcpConnector, Transport};
