//! Positional `DANMU_MSG` decoder.
//!
//! Chat messages carry their fields in a heterogeneous `info` array rather
//! than a named object. Positions used:
//!
//! | index | content                                               |
//! |-------|-------------------------------------------------------|
//! | 0     | metadata; `[3]` text color, `[13]` emoticon object    |
//! | 1     | text (required)                                       |
//! | 2     | `[uid, name, ...]` (required)                         |
//! | 3     | `[level, name, anchor_name, anchor_room_id, ...]` medal |
//! | 4     | `[user_level, ...]`                                   |
//! | 7     | guard level                                           |
//! | 9     | `{"ts": ...}`                                         |
//! | 16    | `[wealth_level, ...]`, possibly nested one level more |
//!
//! Every optional position is bounds-checked.

use serde_json::Value;

use crate::error::{DanmakuError, Result};
use crate::event::{ChatMessage, Medal};

const META: usize = 0;
const TEXT: usize = 1;
const USER: usize = 2;
const MEDAL: usize = 3;
const USER_LEVEL: usize = 4;
const GUARD: usize = 7;
const TIMESTAMP: usize = 9;
const WEALTH: usize = 16;

/// Decode a chat message from the `info` array of a `DANMU_MSG` envelope.
pub(crate) fn decode(info: &[Value]) -> Result<ChatMessage> {
    let text = info
        .get(TEXT)
        .and_then(Value::as_str)
        .ok_or_else(|| DanmakuError::decode("DANMU_MSG without text at info[1]"))?
        .to_string();

    let user = info
        .get(USER)
        .and_then(Value::as_array)
        .ok_or_else(|| DanmakuError::decode("DANMU_MSG without user at info[2]"))?;

    let meta = info.get(META).and_then(Value::as_array);

    Ok(ChatMessage {
        text,
        user_id: user.first().and_then(as_u64).unwrap_or(0),
        user_name: user
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        user_level: info
            .get(USER_LEVEL)
            .and_then(Value::as_array)
            .and_then(|level| level.first())
            .and_then(as_u32)
            .unwrap_or(0),
        guard_level: info.get(GUARD).and_then(as_u32).unwrap_or(0),
        timestamp: info
            .get(TIMESTAMP)
            .and_then(|v| v.get("ts"))
            .and_then(|ts| ts.as_i64().or_else(|| ts.as_f64().map(|f| f as i64)))
            .unwrap_or(0),
        medal: info.get(MEDAL).and_then(decode_medal),
        wealth_level: info.get(WEALTH).and_then(decode_wealth),
        color: meta.and_then(|m| m.get(3)).and_then(as_u32),
        emoticon: meta.map(Vec::as_slice).and_then(decode_emoticon),
    })
}

fn decode_medal(value: &Value) -> Option<Medal> {
    let medal = value.as_array()?;
    if medal.len() < 4 {
        return None;
    }
    Some(Medal {
        level: as_u32(&medal[0]).unwrap_or(0),
        name: medal[1].as_str().unwrap_or_default().to_string(),
        anchor_name: medal[2].as_str().unwrap_or_default().to_string(),
        anchor_room_id: as_u64(&medal[3]).unwrap_or(0),
    })
}

fn decode_wealth(value: &Value) -> Option<u32> {
    match value.as_array()?.first()? {
        Value::Array(inner) => inner.first().and_then(as_u32),
        level => as_u32(level),
    }
}

/// `info[0][13].emoticon_unique`, falling back to the JSON string in `info[0][15].extra`.
fn decode_emoticon(meta: &[Value]) -> Option<String> {
    let direct = meta
        .get(13)
        .and_then(|e| e.get("emoticon_unique"))
        .and_then(Value::as_str)
        .map(str::to_string);

    direct
        .or_else(|| {
            let extra = meta.get(15)?.get("extra")?.as_str()?;
            let extra: Value = serde_json::from_str(extra).ok()?;
            extra
                .get("emoticon_unique")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|id| !id.is_empty())
}

fn as_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn as_u32(value: &Value) -> Option<u32> {
    as_u64(value).and_then(|v| u32::try_from(v).ok())
}
