pub use crate::model::ChatMessage;
use crate::model::User;
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use uuid::Uuid;

/// Append a chat message. The sender's name and avatar are copied into the
/// row so history renders without further profile lookups; the row is never
/// edited or deleted afterwards.
pub fn send_message(
    conn: &Connection,
    event_id: &Uuid,
    sender: &User,
    text: &str,
) -> Result<ChatMessage> {
    if text.trim().is_empty() {
        return Err(anyhow!("empty_message"));
    }
    let attending: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM event_attendees WHERE event_id = ?1 AND user_id = ?2",
            params![event_id.to_string(), sender.id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if attending.is_none() {
        return Err(anyhow!("not_attending"));
    }
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO messages (id, event_id, sender_id, text, created_at, sender_name, sender_avatar_url) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id.to_string(),
            event_id.to_string(),
            sender.id.to_string(),
            text,
            now,
            sender.name,
            sender.profile_image_url,
        ],
    )?;
    Ok(ChatMessage {
        id,
        event_id: *event_id,
        sender_id: sender.id,
        text: text.into(),
        created_at: now,
        sender_name: sender.name.clone(),
        sender_avatar_url: sender.profile_image_url.clone(),
    })
}

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap_or_default(),
        event_id: Uuid::parse_str(row.get::<_, String>(1)?.as_str()).unwrap_or_default(),
        sender_id: Uuid::parse_str(row.get::<_, String>(2)?.as_str()).unwrap_or_default(),
        text: row.get(3)?,
        created_at: row.get(4)?,
        sender_name: row.get(5)?,
        sender_avatar_url: row.get(6)?,
    })
}

/// List an event's messages in ascending timestamp order, ties broken by id
/// so the order is stable.
pub fn list_messages(conn: &Connection, event_id: &Uuid) -> Result<Vec<ChatMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, event_id, sender_id, text, created_at, sender_name, sender_avatar_url \
         FROM messages WHERE event_id = ?1 ORDER BY created_at, id",
    )?;
    let msgs = stmt
        .query_map([event_id.to_string()], row_to_msg)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(msgs)
}
