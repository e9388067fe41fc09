//! Room discovery.
//!
//! Resolves a (possibly short) room id to the canonical room id, the relay
//! endpoints serving it and the session token the relay expects in the auth
//! frame. HTTP access goes through the [`Fetcher`] trait so the transport can
//! be swapped out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use rustls::ClientConfig;
use rustls_platform_verifier::BuilderVerifierExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::RoomId;
use crate::error::{DanmakuError, Result};

pub(crate) const DEFAULT_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

const REFERER: &str = "https://live.bilibili.com/";

/// Maps short/alias room ids to canonical ones.
pub const ROOM_INIT_URL: &str = "https://api.live.bilibili.com/room/v1/Room/room_init?id=";

/// Relay endpoints and token for a canonical room id.
pub const DANMU_CONF_URL: &str =
    "https://api.live.bilibili.com/room/v1/Danmu/getConf?platform=pc&player=web&room_id=";

/// Fetches a discovery document.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// GET `url`, sending `cookie` when present, and return the response body.
    async fn fetch(&self, url: &str, cookie: Option<&str>) -> Result<Bytes>;
}

/// [`Fetcher`] backed by `reqwest`.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Build a client with the platform certificate verifier.
    pub fn new() -> Result<Self> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let tls_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| DanmakuError::connection(format!("TLS setup failed: {}", e)))?
            .with_platform_verifier()
            .map_err(|e| DanmakuError::connection(format!("TLS verifier setup failed: {}", e)))?
            .with_no_client_auth();

        let client = Client::builder()
            .use_preconfigured_tls(tls_config)
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, cookie: Option<&str>) -> Result<Bytes> {
        let mut req = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, DEFAULT_UA)
            .header(reqwest::header::REFERER, REFERER);
        if let Some(cookie) = cookie {
            req = req.header(reqwest::header::COOKIE, cookie);
        }

        let body = req.send().await?.error_for_status()?.bytes().await?;
        Ok(body)
    }
}

/// One relay endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything a session needs to connect to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Canonical room id.
    pub room_id: RoomId,
    /// Uid of the room's anchor, when the platform reports it.
    pub anchor_uid: Option<u64>,
    /// Candidate endpoints, in the platform's order of preference. Never empty.
    pub endpoints: Vec<Endpoint>,
    /// Session token for the auth frame.
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct RoomInitData {
    room_id: u64,
    #[serde(default)]
    uid: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DanmuConfData {
    token: String,
    host: Option<String>,
    port: Option<u16>,
    #[serde(alias = "host_server_list")]
    host_list: Vec<HostEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HostEntry {
    host: String,
    port: u16,
}

/// Discovery client.
#[derive(Clone)]
pub struct Discovery {
    fetcher: Arc<dyn Fetcher>,
}

impl Discovery {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }

    /// Resolve `room_id` to a [`Route`].
    pub async fn resolve(&self, room_id: RoomId, cookie: Option<&str>) -> Result<Route> {
        let (canonical, anchor_uid) = self.room_init(room_id, cookie).await?;
        let (endpoints, token) = self.danmu_conf(canonical, cookie).await?;

        debug!(
            room_id,
            canonical,
            endpoints = endpoints.len(),
            "resolved room"
        );

        Ok(Route {
            room_id: canonical,
            anchor_uid,
            endpoints,
            token,
        })
    }

    async fn room_init(&self, room_id: RoomId, cookie: Option<&str>) -> Result<(RoomId, Option<u64>)> {
        let body = self
            .fetcher
            .fetch(&format!("{}{}", ROOM_INIT_URL, room_id), cookie)
            .await?;
        let resp: ApiResponse = serde_json::from_slice(&body)
            .map_err(|e| DanmakuError::discovery(format!("Failed to parse room info: {}", e)))?;

        if resp.code != 0 || resp.data.is_null() {
            debug!(
                room_id,
                code = resp.code,
                message = resp.message.as_deref().unwrap_or(""),
                "room init rejected"
            );
            return Err(DanmakuError::RoomNotFound(room_id));
        }

        let data = RoomInitData::deserialize(&resp.data)
            .map_err(|e| DanmakuError::discovery(format!("Invalid room data: {}", e)))?;
        Ok((data.room_id, data.uid.filter(|uid| *uid != 0)))
    }

    async fn danmu_conf(
        &self,
        room_id: RoomId,
        cookie: Option<&str>,
    ) -> Result<(Vec<Endpoint>, String)> {
        let body = self
            .fetcher
            .fetch(&format!("{}{}", DANMU_CONF_URL, room_id), cookie)
            .await?;
        let resp: ApiResponse = serde_json::from_slice(&body)
            .map_err(|e| DanmakuError::discovery(format!("Failed to parse danmu config: {}", e)))?;

        if resp.code != 0 {
            return Err(DanmakuError::discovery(format!(
                "Danmu config returned code {}: {}",
                resp.code,
                resp.message.as_deref().unwrap_or("unknown")
            )));
        }
        if resp.data.is_null() {
            return Err(DanmakuError::discovery("Missing data field in danmu config"));
        }

        let data = DanmuConfData::deserialize(&resp.data)
            .map_err(|e| DanmakuError::discovery(format!("Invalid danmu config: {}", e)))?;
        let token = data.token.clone();
        Ok((normalize_endpoints(data)?, token))
    }
}

/// Accept either a list of alternates or a single flat host/port pair.
fn normalize_endpoints(data: DanmuConfData) -> Result<Vec<Endpoint>> {
    let endpoints: Vec<Endpoint> = data
        .host_list
        .into_iter()
        .filter(|h| !h.host.is_empty() && h.port != 0)
        .map(|h| Endpoint::new(h.host, h.port))
        .collect();
    if !endpoints.is_empty() {
        return Ok(endpoints);
    }

    match (data.host, data.port) {
        (Some(host), Some(port)) if !host.is_empty() && port != 0 => {
            Ok(vec![Endpoint::new(host, port)])
        }
        _ => Err(DanmakuError::discovery("No relay endpoints in danmu config")),
    }
}

/// Extract a cookie value by name.
pub(crate) fn extract_cookie_value(cookies: &str, name: &str) -> Option<String> {
    for cookie in cookies.split(';') {
        let parts: Vec<&str> = cookie.trim().splitn(2, '=').collect();
        if parts.len() == 2 && parts[0] == name && !parts[1].is_empty() {
            return Some(parts[1].to_string());
        }
    }
    None
}

/// Generates a fake BUVID3 device identifier.
///
/// The format is `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXXinfoc` where X are
/// uppercase hexadecimal characters.
pub(crate) fn generate_fake_buvid3() -> String {
    let u_str = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!(
        "{}-{}-{}-{}-{}infoc",
        &u_str[0..8],
        &u_str[8..12],
        &u_str[12..16],
        &u_str[16..20],
        &u_str[20..]
    )
}
