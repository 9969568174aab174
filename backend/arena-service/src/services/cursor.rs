//! Opaque pagination cursors (URL-safe base64)
//!
//! - feed: `"{score}:{item_id}"`, the last item kept on the previous page
//! - active battles: `"{secs}:{nanos}:{battle_id}"`, the last battle returned

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::BattleListCursor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedCursor {
    pub score: f64,
    pub item_id: Uuid,
}

fn invalid(what: &str) -> AppError {
    AppError::Validation(format!("Invalid cursor {}", what))
}

fn decode_raw(cursor: &str) -> Result<String> {
    let bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(cursor.trim())
        .map_err(|_| invalid("format"))?;
    String::from_utf8(bytes).map_err(|_| invalid("encoding"))
}

pub fn encode_feed_cursor(score: f64, item_id: Uuid) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(format!("{}:{}", score, item_id))
}

pub fn decode_feed_cursor(cursor: &str) -> Result<FeedCursor> {
    let raw = decode_raw(cursor)?;
    let (score, id) = raw.split_once(':').ok_or_else(|| invalid("value"))?;
    let score = score.parse::<f64>().map_err(|_| invalid("score"))?;
    if !score.is_finite() {
        return Err(invalid("score"));
    }
    let item_id = Uuid::parse_str(id).map_err(|_| invalid("item id"))?;
    Ok(FeedCursor { score, item_id })
}

pub fn encode_battle_cursor(ends_at: DateTime<Utc>, id: Uuid) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(format!(
        "{}:{}:{}",
        ends_at.timestamp(),
        ends_at.timestamp_subsec_nanos(),
        id
    ))
}

pub fn decode_battle_cursor(cursor: &str) -> Result<BattleListCursor> {
    let raw = decode_raw(cursor)?;
    let mut parts = raw.splitn(3, ':');
    let (Some(secs), Some(nanos), Some(id)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid("value"));
    };
    let secs = secs.parse::<i64>().map_err(|_| invalid("timestamp"))?;
    let nanos = nanos.parse::<u32>().map_err(|_| invalid("timestamp"))?;
    let ends_at = Utc
        .timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| invalid("timestamp"))?;
    let id = Uuid::parse_str(id).map_err(|_| invalid("battle id"))?;
    Ok(BattleListCursor { ends_at, id })
}
