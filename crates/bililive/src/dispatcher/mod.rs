//! Command dispatcher.
//!
//! Workers pop plain frames off the shared queue, decode the JSON command
//! envelope of message frames and route each command through a static
//! registry to its typed decoder and handler.

mod chat;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use byteorder::{BigEndian, ByteOrder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::RoomId;
use crate::error::{DanmakuError, Result};
use crate::event::{Event, RawCommand, StormLifecycle};
use crate::handler::Handlers;
use crate::protocol::{Frame, Operation, Packet};
use crate::storm::StormFilter;

/// A parsed `{"cmd": ..., "info": [...], "data": {...}}` message.
#[derive(Debug, Clone)]
pub(crate) struct CommandEnvelope {
    cmd: String,
    body: Value,
}

impl CommandEnvelope {
    pub(crate) fn parse(payload: &[u8]) -> Result<Self> {
        let body: Value = serde_json::from_slice(payload)?;
        let cmd = body
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| DanmakuError::decode("message without cmd"))?
            .to_string();
        Ok(Self { cmd, body })
    }

    /// Command name without protocol suffixes (`DANMU_MSG:4:0:2` → `DANMU_MSG`).
    pub(crate) fn name(&self) -> &str {
        self.cmd.split_once(':').map_or(self.cmd.as_str(), |(name, _)| name)
    }

    pub(crate) fn info(&self) -> &[Value] {
        self.body
            .get("info")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The `data` object, or the whole envelope when `data` is absent.
    pub(crate) fn data(&self) -> &Value {
        match self.body.get("data") {
            Some(data) if !data.is_null() => data,
            _ => &self.body,
        }
    }
}

type Decoder = fn(&CommandEnvelope) -> Result<Event>;

struct CommandSpec {
    decode: Decoder,
    /// Whether anyone is listening for the decoded event.
    wants: fn(&Handlers) -> bool,
}

fn from_data<T: DeserializeOwned>(envelope: &CommandEnvelope) -> Result<T> {
    T::deserialize(envelope.data())
        .map_err(|e| DanmakuError::decode(format!("{}: {}", envelope.name(), e)))
}

fn from_envelope<T: DeserializeOwned>(envelope: &CommandEnvelope) -> Result<T> {
    T::deserialize(&envelope.body)
        .map_err(|e| DanmakuError::decode(format!("{}: {}", envelope.name(), e)))
}

fn from_info(envelope: &CommandEnvelope) -> Result<crate::event::ChatMessage> {
    chat::decode(envelope.info())
}

/// Storm notices sit under `data["39"]` of `SPECIAL_GIFT`.
fn from_special_gift(envelope: &CommandEnvelope) -> Result<StormLifecycle> {
    let storm = envelope
        .data()
        .get("39")
        .ok_or_else(|| DanmakuError::decode("SPECIAL_GIFT without storm entry"))?;
    StormLifecycle::deserialize(storm)
        .map_err(|e| DanmakuError::decode(format!("SPECIAL_GIFT: {}", e)))
}

macro_rules! command_registry {
    ( $( $cmd:literal => $variant:ident via $decode:ident if $field:ident ),+ $(,)? ) => {
        [
            $(
                (
                    $cmd,
                    CommandSpec {
                        decode: |envelope| $decode(envelope).map(Event::$variant),
                        wants: |handlers| handlers.$field.is_some(),
                    },
                ),
            )+
        ]
    };
}

static COMMANDS: LazyLock<HashMap<&'static str, CommandSpec>> = LazyLock::new(|| {
    HashMap::from(command_registry![
        "DANMU_MSG" => Chat via from_info if chat,
        "DANMU_MSG_MIRROR" => Chat via from_info if chat,
        "SEND_GIFT" => Gift via from_data if gift,
        "COMBO_SEND" => ComboStart via from_data if combo_start,
        "COMBO_END" => ComboEnd via from_data if combo_end,
        "GUARD_BUY" => GuardPurchase via from_data if guard_purchase,
        "WELCOME" => UserEnter via from_data if user_enter,
        "WELCOME_GUARD" => GuardEnter via from_data if guard_enter,
        "ROOM_CHANGE" => RoomChange via from_data if room_change,
        "ROOM_REAL_TIME_MESSAGE_UPDATE" => FansUpdate via from_data if fans_update,
        "ROOM_RANK" => RankUpdate via from_data if rank_update,
        "SPECIAL_GIFT" => Storm via from_special_gift if storm,
        "SUPER_CHAT_MESSAGE" => SuperChat via from_data if super_chat,
        "SYS_MSG" => System via from_envelope if system,
        "ENTRY_EFFECT" => EntryEffect via from_data if entry_effect,
        "INTERACT_WORD" => InteractWord via from_data if interact_word,
        "PK_BATTLE_START_NEW" => PkBattleStart via from_envelope if pk_battle_start,
        "PK_BATTLE_PROCESS_NEW" => PkBattleProcess via from_envelope if pk_battle_process,
        "PK_BATTLE_END" => PkBattleEnd via from_envelope if pk_battle_end,
        "LIVE" => LiveStart via from_envelope if live_start,
        "PREPARING" => LiveEnd via from_envelope if live_end,
        "CLOSE" => LiveEnd via from_envelope if live_end,
        "END" => LiveEnd via from_envelope if live_end,
    ])
});

const STORM_COMMAND: &str = "SPECIAL_GIFT";

/// Known commands that carry nothing worth decoding.
const IGNORED_COMMANDS: &[&str] = &[
    "NOTICE_MSG",
    "ONLINE_RANK_COUNT",
    "ONLINE_RANK_V2",
    "ONLINE_RANK_TOP3",
    "WATCHED_CHANGE",
    "STOP_LIVE_ROOM_LIST",
    "HOT_RANK_CHANGED",
    "HOT_RANK_CHANGED_V2",
    "HOT_ROOM_NOTIFY",
    "WIDGET_BANNER",
    "LIKE_INFO_V3_UPDATE",
    "LIKE_INFO_V3_CLICK",
    "POPULARITY_RED_POCKET_START",
    "ANCHOR_LOT_START",
    "ANCHOR_LOT_END",
    "ANCHOR_LOT_AWARD",
    "GIFT_STAR_PROCESS",
    "ROOM_BLOCK_MSG",
    "USER_TOAST_MSG",
    "ENTRY_EFFECT_MUST_RECEIVE",
    "COMMON_NOTICE_DANMAKU",
    "WEALTH_NOTIFY",
    "SPREAD_SHOW_FEET_V2",
];

pub(crate) fn is_ignored(name: &str) -> bool {
    IGNORED_COMMANDS.contains(&name)
}

/// Routes plain frames to handlers. Shared by every worker.
pub(crate) struct Dispatcher {
    handlers: Handlers,
    storm: Arc<StormFilter>,
    debug: bool,
    storm_filter: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        handlers: Handlers,
        storm: Arc<StormFilter>,
        debug: bool,
        storm_filter: bool,
    ) -> Self {
        // Suppression only matters when someone receives chat.
        let storm_filter = storm_filter && handlers.chat.is_some();
        Self {
            handlers,
            storm,
            debug,
            storm_filter,
        }
    }

    pub(crate) fn dispatch(&self, packet: Packet) {
        let Packet { room_id, frame } = packet;
        match frame.operation {
            Operation::HeartbeatReply => self.dispatch_popularity(room_id, &frame),
            Operation::Message => self.dispatch_message(room_id, frame),
            other => trace!(room_id, operation = other.code(), "ignoring frame"),
        }
    }

    fn dispatch_popularity(&self, room_id: RoomId, frame: &Frame) {
        if frame.payload.len() < 4 {
            debug!(room_id, len = frame.payload.len(), "short heartbeat reply");
            return;
        }
        let count = BigEndian::read_u32(&frame.payload[..4]);
        trace!(room_id, count, "popularity");
        self.handlers.popularity(room_id, count);
    }

    fn dispatch_message(&self, room_id: RoomId, frame: Frame) {
        let envelope = match CommandEnvelope::parse(&frame.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.log_decode_failure(room_id, &frame, &e);
                return;
            }
        };

        let name = envelope.name();
        let Some(spec) = COMMANDS.get(name) else {
            if !is_ignored(name) {
                debug!(room_id, cmd = name, "unrecognized command");
            }
            if self.debug {
                self.handlers.raw(
                    room_id,
                    RawCommand {
                        cmd: envelope.cmd.clone(),
                        payload: frame.payload,
                    },
                );
            }
            return;
        };

        let tracks_storm = self.storm_filter && name == STORM_COMMAND;
        if !tracks_storm && !(spec.wants)(&self.handlers) {
            return;
        }

        let event = match (spec.decode)(&envelope) {
            Ok(event) => event,
            Err(e) => {
                self.log_decode_failure(room_id, &frame, &e);
                return;
            }
        };

        match &event {
            Event::Storm(storm) if self.storm_filter => self.storm.apply(room_id, storm),
            Event::Chat(msg) if self.storm_filter && self.storm.should_suppress(room_id, &msg.text) => {
                debug!(room_id, "suppressed storm duplicate");
                return;
            }
            _ => {}
        }

        self.handlers.deliver(room_id, event);
    }

    fn log_decode_failure(&self, room_id: RoomId, frame: &Frame, err: &DanmakuError) {
        if self.debug {
            debug!(
                room_id,
                payload = %String::from_utf8_lossy(&frame.payload),
                "failed to decode message: {}",
                err
            );
        } else {
            debug!(room_id, "failed to decode message: {}", err);
        }
    }
}

/// Dispatcher worker: pops frames until cancelled or the queue closes.
pub(crate) async fn run_worker(
    id: usize,
    dispatcher: Arc<Dispatcher>,
    frame_rx: flume::Receiver<Packet>,
    cancel: CancellationToken,
) {
    debug!("dispatcher worker {} started", id);

    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            packet = frame_rx.recv_async() => match packet {
                Ok(packet) => packet,
                Err(_) => break,
            },
        };
        dispatcher.dispatch(packet);
    }

    debug!("dispatcher worker {} stopped", id);
}
