//! MESSAGE payload parsing.
//!
//! MESSAGE frame bodies are JSON objects with a `cmd` field. Chat, gift and
//! super chat commands become [`DanmuMessage`]s, room state commands become
//! control events, and everything else is passed through untyped.

use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::event::{DanmuControlEvent, LiveEvent};
use crate::message::DanmuMessage;

/// Parse one MESSAGE body into a live event.
pub fn parse_notification(body: &[u8]) -> Result<LiveEvent> {
    let json: Value = serde_json::from_slice(body)?;
    let cmd = json
        .get("cmd")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // DANMU_MSG arrives with suffixes such as "DANMU_MSG:4:0:2:2:2:0"
    let cmd_base = cmd.split(':').next().unwrap_or(&cmd);

    let parsed = match cmd_base {
        "DANMU_MSG" | "DANMU_MSG_MIRROR" => parse_danmu_msg(&json).map(LiveEvent::Danmu),
        "SEND_GIFT" => parse_gift(&json).map(LiveEvent::Danmu),
        "SUPER_CHAT_MESSAGE" => parse_super_chat(&json).map(LiveEvent::Danmu),
        "ROOM_CHANGE" => parse_room_change(&json),
        "ROOM_LOCK" | "CUT_OFF" | "PREPARING" => Some(parse_stream_closed(cmd_base, &json)),
        "WATCHED_CHANGE" => parse_counter(&json, "watched", "num"),
        "ONLINE_RANK_COUNT" => parse_counter(&json, "online_rank", "count"),
        _ => None,
    };

    Ok(parsed.unwrap_or(LiveEvent::Notification { cmd, payload: json }))
}

/// Parse DANMU_MSG into DanmuMessage.
fn parse_danmu_msg(json: &Value) -> Option<DanmuMessage> {
    let info = json.get("info")?.as_array()?;

    // info[1] = content
    let content = info.get(1)?.as_str()?.to_string();

    // info[2][0] = uid, info[2][1] = name
    let user_info = info.get(2)?.as_array()?;
    let uid = user_info.first()?.as_u64().unwrap_or(0);
    let name = user_info.get(1)?.as_str().unwrap_or("").to_string();

    // info[0][3] = color, info[0][4] = send time (ms), info[0][15].extra = json string
    let meta = info.first()?.as_array()?;
    let color = meta
        .get(3)
        .and_then(Value::as_u64)
        .map(|c| format!("#{:06X}", c as u32));
    let sent_at = meta
        .get(4)
        .and_then(Value::as_i64)
        .filter(|ts| *ts > 0)
        .and_then(|ts| Utc.timestamp_millis_opt(ts).single());

    let extra = meta
        .get(15)
        .and_then(|v| v.get("extra"))
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str::<Value>(s).ok());

    let content = extra
        .as_ref()
        .and_then(|e| e.get("emoticon_unique"))
        .and_then(Value::as_str)
        .filter(|e| !e.is_empty())
        .map(|e| format!("[表情:{}]", e))
        .unwrap_or(content);

    let weight = extra
        .as_ref()
        .and_then(|e| e.get("recommend_score"))
        .and_then(Value::as_u64)
        .map(|w| w.min(u32::MAX as u64) as u32);

    let mut danmu = DanmuMessage::chat(uid.to_string(), name, content);
    if let Some(c) = color {
        danmu = danmu.with_color(c);
    }
    if let Some(w) = weight {
        danmu = danmu.with_weight(w);
    }
    if let Some(ts) = sent_at {
        danmu = danmu.with_timestamp(ts);
    }

    Some(danmu)
}

/// Seconds or milliseconds since the epoch, whichever the field holds.
fn timestamp_millis(value: Option<&Value>) -> Option<i64> {
    value
        .and_then(|v| v.as_i64().or_else(|| v.as_u64().map(|u| u as i64)))
        .map(|ts| if ts > 1_000_000_000_000 { ts } else { ts * 1000 })
}

fn as_u64_lenient(value: Option<&Value>) -> Option<u64> {
    value.and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
}

/// Parse SEND_GIFT into DanmuMessage.
fn parse_gift(json: &Value) -> Option<DanmuMessage> {
    let data = json.get("data")?;

    let name = data.get("uname")?.as_str()?.to_string();
    let uid = data.get("uid")?.as_u64()?;
    let gift_name = data.get("giftName")?.as_str()?.to_string();
    let num = data.get("num").and_then(Value::as_u64).unwrap_or(1) as u32;
    let price = as_u64_lenient(data.get("price").or_else(|| data.get("total_coin"))).unwrap_or(0);

    let mut msg = DanmuMessage::gift(uid.to_string(), name, gift_name, num)
        .with_metadata("price", serde_json::json!(price));

    if let Some(ts_ms) = timestamp_millis(data.get("timestamp"))
        && let Some(dt) = Utc.timestamp_millis_opt(ts_ms).single()
    {
        msg = msg.with_timestamp(dt);
    }

    Some(msg)
}

/// Parse SUPER_CHAT_MESSAGE into DanmuMessage.
fn parse_super_chat(json: &Value) -> Option<DanmuMessage> {
    let data = json.get("data")?;

    let name = data.get("user_info")?.get("uname")?.as_str()?.to_string();
    let uid = data.get("uid")?.as_u64()?;
    let content = data.get("message")?.as_str()?.to_string();
    let price = as_u64_lenient(data.get("price")).unwrap_or(0);
    let keep_time = as_u64_lenient(data.get("time")).unwrap_or(0);

    let mut msg = DanmuMessage::super_chat(uid.to_string(), name, content, price)
        .with_metadata("keep_time", serde_json::json!(keep_time));

    if let Some(ts_ms) = timestamp_millis(data.get("ts").or_else(|| data.get("timestamp")))
        && let Some(dt) = Utc.timestamp_millis_opt(ts_ms).single()
    {
        msg = msg.with_timestamp(dt);
    }

    Some(msg)
}

fn non_empty_str(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Parse ROOM_CHANGE (title / area update) into a control event.
fn parse_room_change(json: &Value) -> Option<LiveEvent> {
    let data = json.get("data")?;

    Some(LiveEvent::Control(DanmuControlEvent::RoomInfoChanged {
        title: non_empty_str(data, "title"),
        category: non_empty_str(data, "area_name"),
        parent_category: non_empty_str(data, "parent_area_name"),
    }))
}

fn parse_stream_closed(cmd: &str, json: &Value) -> LiveEvent {
    let message = json
        .get("data")
        .and_then(|d| {
            ["message", "msg", "reason", "text"]
                .iter()
                .find_map(|key| non_empty_str(d, key))
        })
        .or_else(|| json.get("msg").and_then(Value::as_str).map(ToString::to_string))
        .or_else(|| Some(cmd.to_string()));

    LiveEvent::Control(DanmuControlEvent::StreamClosed { message })
}

fn parse_counter(json: &Value, kind: &str, field: &str) -> Option<LiveEvent> {
    let value = json.get("data")?.get(field)?.as_u64()?;
    Some(LiveEvent::Control(DanmuControlEvent::Counter {
        kind: kind.to_string(),
        value,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DanmuType;

    fn parse(json: Value) -> LiveEvent {
        parse_notification(&serde_json::to_vec(&json).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_danmu_msg() {
        let event = parse(serde_json::json!({
            "cmd": "DANMU_MSG:4:0:2:2:2:0",
            "info": [
                [0, 1, 25, 16777215, 1700000000123_i64, 0, 0, "", 0, 0, 0, "", 0, "{}", "{}",
                    {"extra": "{\"recommend_score\":7}"}],
                "Hello World",
                [12345, "TestUser", 0, 0, 0, 0, 0, ""]
            ]
        }));

        let msg = event.as_danmu().expect("chat message");
        assert_eq!(msg.content, "Hello World");
        assert_eq!(msg.username, "TestUser");
        assert_eq!(msg.user_id, "12345");
        assert_eq!(msg.color.as_deref(), Some("#FFFFFF"));
        assert_eq!(msg.weight, Some(7));
        assert_eq!(msg.timestamp.timestamp_millis(), 1700000000123);
    }

    #[test]
    fn test_parse_danmu_msg_emoticon() {
        let event = parse(serde_json::json!({
            "cmd": "DANMU_MSG",
            "info": [
                [0, 1, 25, 16777215, 0, 0, 0, "", 0, 0, 0, "", 0, "{}", "{}",
                    {"extra": "{\"emoticon_unique\":\"room_1_2\"}"}],
                "x",
                [1, "u"]
            ]
        }));
        assert_eq!(event.as_danmu().unwrap().content, "[表情:room_1_2]");
    }

    #[test]
    fn test_parse_send_gift() {
        let event = parse(serde_json::json!({
            "cmd": "SEND_GIFT",
            "data": {
                "uname": "GiftUser",
                "uid": 42,
                "giftName": "Rocket",
                "num": 5,
                "price": 100,
                "timestamp": 1700000000
            }
        }));

        let msg = event.as_danmu().expect("gift message");
        assert_eq!(msg.message_type, DanmuType::Gift);
        assert_eq!(msg.content, "赠送 Rocket x5");
        assert_eq!(msg.timestamp.timestamp(), 1700000000);
        assert_eq!(msg.metadata.as_ref().unwrap().get("price").unwrap(), 100);
    }

    #[test]
    fn test_parse_super_chat() {
        let event = parse(serde_json::json!({
            "cmd": "SUPER_CHAT_MESSAGE",
            "data": {
                "uid": 99,
                "price": 30,
                "time": 60,
                "ts": 1700000000456_i64,
                "message": "Hello",
                "user_info": {"uname": "SCUser"}
            }
        }));

        let msg = event.as_danmu().expect("super chat");
        assert_eq!(msg.message_type, DanmuType::SuperChat);
        assert_eq!(msg.username, "SCUser");
        let meta = msg.metadata.as_ref().unwrap();
        assert_eq!(meta.get("price").unwrap(), 30);
        assert_eq!(meta.get("keep_time").unwrap(), 60);
    }

    #[test]
    fn test_parse_room_change() {
        let event = parse(serde_json::json!({
            "cmd": "ROOM_CHANGE",
            "data": {"title": "New Title", "area_name": "Area", "parent_area_name": ""}
        }));

        assert_eq!(
            event,
            LiveEvent::Control(DanmuControlEvent::RoomInfoChanged {
                title: Some("New Title".into()),
                category: Some("Area".into()),
                parent_category: None,
            })
        );
    }

    #[test]
    fn test_parse_cut_off() {
        let event = parse(serde_json::json!({"cmd": "CUT_OFF", "data": {"msg": "cut off"}}));
        assert_eq!(
            event,
            LiveEvent::Control(DanmuControlEvent::StreamClosed {
                message: Some("cut off".into())
            })
        );
    }

    #[test]
    fn test_parse_watched_change() {
        let event = parse(serde_json::json!({"cmd": "WATCHED_CHANGE", "data": {"num": 1234}}));
        assert_eq!(
            event,
            LiveEvent::Control(DanmuControlEvent::Counter {
                kind: "watched".into(),
                value: 1234
            })
        );
    }

    #[test]
    fn test_unknown_cmd_passes_through() {
        let json = serde_json::json!({"cmd": "INTERACT_WORD", "data": {"uname": "x"}});
        match parse(json.clone()) {
            LiveEvent::Notification { cmd, payload } => {
                assert_eq!(cmd, "INTERACT_WORD");
                assert_eq!(payload, json);
            }
            other => panic!("Unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_danmu_falls_back_to_notification() {
        let event = parse(serde_json::json!({"cmd": "DANMU_MSG", "info": "broken"}));
        assert!(matches!(event, LiveEvent::Notification { ref cmd, .. } if cmd == "DANMU_MSG"));
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(parse_notification(b"not json").is_err());
    }
}
