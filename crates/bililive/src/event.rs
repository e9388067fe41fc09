//! Typed events decoded from relay commands.
//!
//! Each event is an immutable value built from a single JSON payload. Only
//! the fields consumers commonly need are modelled; everything else in the
//! payload is ignored. Missing fields fall back to their defaults.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Fan medal shown next to a chat sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medal {
    pub level: u32,
    pub name: String,
    pub anchor_name: String,
    pub anchor_room_id: u64,
}

/// `DANMU_MSG`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    pub user_id: u64,
    pub user_name: String,
    pub user_level: u32,
    pub guard_level: u32,
    /// Send time as reported by the platform (seconds or milliseconds).
    pub timestamp: i64,
    pub medal: Option<Medal>,
    pub wealth_level: Option<u32>,
    /// RGB text color.
    pub color: Option<u32>,
    /// Id of the sticker sent instead of text.
    pub emoticon: Option<String>,
}

impl ChatMessage {
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        timestamp_to_datetime(self.timestamp)
    }
}

/// `SEND_GIFT`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GiftEvent {
    #[serde(rename = "giftName")]
    pub gift_name: String,
    #[serde(rename = "giftId")]
    pub gift_id: u64,
    pub num: u32,
    pub uname: String,
    pub uid: u64,
    pub price: u64,
    pub total_coin: u64,
    pub coin_type: String,
    pub action: String,
    pub face: String,
    #[serde(rename = "super_gift_num")]
    pub combo: u32,
    pub batch_combo_id: String,
    pub timestamp: i64,
}

/// `COMBO_SEND`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComboStart {
    pub uid: u64,
    pub uname: String,
    pub gift_id: u64,
    pub gift_name: String,
    pub combo_num: u32,
    pub total_num: u32,
    pub action: String,
    pub combo_id: String,
    pub batch_combo_id: String,
}

/// `COMBO_END`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComboEnd {
    pub uid: u64,
    pub uname: String,
    pub gift_id: u64,
    pub gift_name: String,
    pub combo_num: u32,
    pub price: u64,
    pub guard_level: u32,
    pub start_time: i64,
    pub end_time: i64,
}

/// `GUARD_BUY`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardPurchase {
    pub uid: u64,
    pub username: String,
    pub guard_level: u32,
    pub num: u32,
    pub price: u64,
    pub gift_id: u64,
    pub gift_name: String,
    pub start_time: i64,
    pub end_time: i64,
}

/// `WELCOME`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserEnter {
    pub uid: u64,
    pub uname: String,
    pub is_admin: bool,
    pub vip: u32,
    pub svip: u32,
}

/// `WELCOME_GUARD`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardEnter {
    pub uid: u64,
    pub username: String,
    pub guard_level: u32,
}

/// `ROOM_CHANGE`: title or category update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomChange {
    pub title: String,
    pub area_id: u64,
    pub parent_area_id: u64,
    pub area_name: String,
    pub parent_area_name: String,
}

/// `ROOM_REAL_TIME_MESSAGE_UPDATE`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FansUpdate {
    #[serde(deserialize_with = "flexible::u64")]
    pub roomid: u64,
    pub fans: u64,
    pub red_notice: i64,
    pub fans_club: u64,
}

/// `ROOM_RANK`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankUpdate {
    #[serde(deserialize_with = "flexible::u64")]
    pub roomid: u64,
    pub rank_desc: String,
    pub color: String,
    pub h5_url: String,
    pub web_url: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StormAction {
    Start,
    End,
    #[default]
    #[serde(other)]
    Unknown,
}

/// `SPECIAL_GIFT` storm start/end notice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StormLifecycle {
    pub action: StormAction,
    /// String on start, number on end; normalized to a string.
    #[serde(deserialize_with = "flexible::string")]
    pub id: String,
    pub content: String,
    pub num: u64,
    pub time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuperChatUser {
    pub uname: String,
    pub face: String,
    pub guard_level: u32,
    pub user_level: u32,
}

/// `SUPER_CHAT_MESSAGE`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuperChatMessage {
    #[serde(deserialize_with = "flexible::u64")]
    pub id: u64,
    #[serde(deserialize_with = "flexible::u64")]
    pub uid: u64,
    pub price: u64,
    pub message: String,
    pub message_trans: String,
    pub background_color: String,
    pub start_time: i64,
    pub end_time: i64,
    /// Seconds the message stays pinned.
    pub time: u64,
    pub user_info: SuperChatUser,
}

/// `SYS_MSG`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemMessage {
    pub msg: String,
    pub msg_text: String,
    pub url: String,
    #[serde(deserialize_with = "flexible::u64")]
    pub real_roomid: u64,
}

/// `ENTRY_EFFECT`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryEffect {
    pub id: u64,
    pub uid: u64,
    pub target_id: u64,
    pub mock_effect: u64,
    pub face: String,
    pub privilege_type: u32,
    pub copy_writing: String,
    pub copy_color: String,
    pub highlight_color: String,
    pub priority: u32,
    pub basemap_url: String,
    pub effective_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FansMedal {
    pub medal_level: u32,
    pub medal_name: String,
    pub target_id: u64,
    pub anchor_roomid: u64,
}

/// `INTERACT_WORD`: enter, follow or share notices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractWord {
    pub uid: u64,
    pub uname: String,
    /// 1 enter, 2 follow, 3 share, 4 special follow, 5 mutual follow.
    pub msg_type: u32,
    pub roomid: u64,
    pub timestamp: i64,
    pub fans_medal: Option<FansMedal>,
}

/// One side of a PK battle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PkSide {
    pub room_id: u64,
    pub votes: u64,
    pub best_uname: String,
    pub winner_type: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PkStartData {
    pub battle_type: u32,
    pub final_hit_votes: u64,
    pub pk_start_time: i64,
    pub pk_frozen_time: i64,
    pub pk_end_time: i64,
    pub pk_votes_type: u32,
    pub pk_votes_add: u64,
    pub pk_votes_name: String,
}

/// `PK_BATTLE_START_NEW`, decoded from the whole envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PkBattleStart {
    #[serde(deserialize_with = "flexible::u64")]
    pub pk_id: u64,
    pub pk_status: u32,
    pub timestamp: i64,
    pub data: PkStartData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PkProcessData {
    pub battle_type: u32,
    pub init_info: PkSide,
    pub match_info: PkSide,
}

/// `PK_BATTLE_PROCESS_NEW`, decoded from the whole envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PkBattleProcess {
    #[serde(deserialize_with = "flexible::u64")]
    pub pk_id: u64,
    pub pk_status: u32,
    pub timestamp: i64,
    pub data: PkProcessData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PkEndData {
    pub battle_type: u32,
    pub timer: u64,
    pub init_info: PkSide,
    pub match_info: PkSide,
}

/// `PK_BATTLE_END`, decoded from the whole envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PkBattleEnd {
    #[serde(deserialize_with = "flexible::u64")]
    pub pk_id: u64,
    pub pk_status: u32,
    pub timestamp: i64,
    pub data: PkEndData,
}

/// `LIVE`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveStart {
    #[serde(deserialize_with = "flexible::u64")]
    pub roomid: u64,
    pub live_time: i64,
    pub live_platform: String,
    pub live_key: String,
}

/// `PREPARING`, `CLOSE` or `END`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveEnd {
    #[serde(deserialize_with = "flexible::u64")]
    pub roomid: u64,
    /// The command that ended the stream.
    #[serde(rename = "cmd")]
    pub command: String,
}

/// A command surfaced undecoded (debug mode only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    pub cmd: String,
    pub payload: Bytes,
}

/// Any decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Chat(ChatMessage),
    Gift(GiftEvent),
    ComboStart(ComboStart),
    ComboEnd(ComboEnd),
    GuardPurchase(GuardPurchase),
    UserEnter(UserEnter),
    GuardEnter(GuardEnter),
    RoomChange(RoomChange),
    FansUpdate(FansUpdate),
    RankUpdate(RankUpdate),
    Storm(StormLifecycle),
    SuperChat(SuperChatMessage),
    System(SystemMessage),
    EntryEffect(EntryEffect),
    InteractWord(InteractWord),
    PkBattleStart(PkBattleStart),
    PkBattleProcess(PkBattleProcess),
    PkBattleEnd(PkBattleEnd),
    LiveStart(LiveStart),
    LiveEnd(LiveEnd),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat",
            Self::Gift(_) => "gift",
            Self::ComboStart(_) => "combo_start",
            Self::ComboEnd(_) => "combo_end",
            Self::GuardPurchase(_) => "guard_purchase",
            Self::UserEnter(_) => "user_enter",
            Self::GuardEnter(_) => "guard_enter",
            Self::RoomChange(_) => "room_change",
            Self::FansUpdate(_) => "fans_update",
            Self::RankUpdate(_) => "rank_update",
            Self::Storm(_) => "storm",
            Self::SuperChat(_) => "super_chat",
            Self::System(_) => "system",
            Self::EntryEffect(_) => "entry_effect",
            Self::InteractWord(_) => "interact_word",
            Self::PkBattleStart(_) => "pk_battle_start",
            Self::PkBattleProcess(_) => "pk_battle_process",
            Self::PkBattleEnd(_) => "pk_battle_end",
            Self::LiveStart(_) => "live_start",
            Self::LiveEnd(_) => "live_end",
        }
    }
}

/// Interpret a platform timestamp that may be in seconds or milliseconds.
pub(crate) fn timestamp_to_datetime(ts: i64) -> Option<DateTime<Utc>> {
    if ts <= 0 {
        return None;
    }
    let ts_ms = if ts > 1_000_000_000_000 { ts } else { ts * 1000 };
    Utc.timestamp_millis_opt(ts_ms).single()
}

/// Deserializers for fields whose wire type changes between payloads.
pub(crate) mod flexible {
    use serde::{Deserialize, Deserializer, de::Error};
    use serde_json::Value;

    pub(crate) fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        match Value::deserialize(d)? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Null => Ok(String::new()),
            other => Err(D::Error::custom(format!(
                "expected string or number, got {}",
                other
            ))),
        }
    }

    pub(crate) fn u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        match Value::deserialize(d)? {
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| D::Error::custom(format!("{} is not an unsigned integer", n))),
            Value::String(s) if s.is_empty() => Ok(0),
            Value::String(s) => s.trim().parse().map_err(D::Error::custom),
            Value::Null => Ok(0),
            other => Err(D::Error::custom(format!(
                "expected integer or numeric string, got {}",
                other
            ))),
        }
    }
}
