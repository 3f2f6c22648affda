pub use crate::model::{Coordinates, Event, RsvpStatus};
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// Fields supplied by the host when creating an event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub title: String,
    pub event_date: i64,
    pub location_name: String,
    pub coordinates: Option<Coordinates>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub participant_limit: Option<u32>,
}

/// Create an event. The creator is written into the attendee map as
/// `going` in the same transaction, so the invariant holds from creation.
pub fn create_event(conn: &mut Connection, creator_id: &Uuid, new: NewEvent) -> Result<Event> {
    if new.title.trim().is_empty() {
        return Err(anyhow!("empty_title"));
    }
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tags_json = new
        .tags
        .as_ref()
        .map(|t| serde_json::to_string(t))
        .transpose()?;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO events (id, title, event_date, location_name, lat, lng, description, creator_id, created_at, tags, participant_limit) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id.to_string(),
            new.title,
            new.event_date,
            new.location_name,
            new.coordinates.map(|c| c.lat),
            new.coordinates.map(|c| c.lng),
            new.description,
            creator_id.to_string(),
            now,
            tags_json,
            new.participant_limit,
        ],
    )?;
    tx.execute(
        "INSERT INTO event_attendees (event_id, user_id, status) VALUES (?1, ?2, ?3)",
        params![
            id.to_string(),
            creator_id.to_string(),
            RsvpStatus::Going.as_str()
        ],
    )?;
    tx.commit()?;
    let mut attendees = HashMap::new();
    attendees.insert(*creator_id, RsvpStatus::Going);
    Ok(Event {
        id,
        title: new.title,
        event_date: new.event_date,
        location_name: new.location_name,
        coordinates: new.coordinates,
        description: new.description,
        image_url: None,
        creator_id: *creator_id,
        attendees,
        created_at: now,
        tags: new.tags,
        participant_limit: new.participant_limit,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let lat: Option<f64> = row.get(4)?;
    let lng: Option<f64> = row.get(5)?;
    let tags: Option<String> = row.get(9)?;
    Ok(Event {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap_or_default(),
        title: row.get(1)?,
        event_date: row.get(2)?,
        location_name: row.get(3)?,
        coordinates: match (lat, lng) {
            (Some(lat), Some(lng)) => Some(Coordinates { lat, lng }),
            _ => None,
        },
        description: row.get(6)?,
        image_url: row.get(7)?,
        creator_id: Uuid::parse_str(row.get::<_, String>(8)?.as_str()).unwrap_or_default(),
        attendees: HashMap::new(),
        created_at: row.get(10)?,
        tags: tags.and_then(|t| serde_json::from_str(&t).ok()),
        participant_limit: row.get(11)?,
    })
}

const EVENT_COLS: &str = "id, title, event_date, location_name, lat, lng, description, image_url, creator_id, tags, created_at, participant_limit";

fn load_attendees(conn: &Connection, events: &mut [Event]) -> Result<()> {
    let mut stmt =
        conn.prepare("SELECT user_id, status FROM event_attendees WHERE event_id = ?1")?;
    for event in events.iter_mut() {
        let rows = stmt.query_map([event.id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (user_id, status) = row?;
            if let (Ok(uid), Some(status)) = (Uuid::parse_str(&user_id), RsvpStatus::parse(&status))
            {
                event.attendees.insert(uid, status);
            }
        }
    }
    Ok(())
}

pub fn get_event(conn: &Connection, id: &Uuid) -> Result<Option<Event>> {
    let mut stmt = conn.prepare(&format!("SELECT {EVENT_COLS} FROM events WHERE id = ?1"))?;
    let event = stmt.query_row([id.to_string()], row_to_event).optional()?;
    let Some(event) = event else { return Ok(None) };
    let mut events = [event];
    load_attendees(conn, &mut events)?;
    let [event] = events;
    Ok(Some(event))
}

pub fn list_all_events(conn: &Connection) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLS} FROM events ORDER BY event_date"
    ))?;
    let mut events = stmt
        .query_map([], row_to_event)?
        .collect::<Result<Vec<_>, _>>()?;
    load_attendees(conn, &mut events)?;
    Ok(events)
}

/// List events where the user appears in the attendee map, any status.
pub fn list_events_for_user(conn: &Connection, user_id: &Uuid) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLS} FROM events WHERE id IN \
         (SELECT event_id FROM event_attendees WHERE user_id = ?1) ORDER BY event_date"
    ))?;
    let mut events = stmt
        .query_map([user_id.to_string()], row_to_event)?
        .collect::<Result<Vec<_>, _>>()?;
    load_attendees(conn, &mut events)?;
    Ok(events)
}

/// Upsert a user's RSVP. Joining as `going` is refused once the going-count
/// has reached the participant limit, unless the user is already going.
pub fn set_rsvp(
    conn: &Connection,
    event_id: &Uuid,
    user_id: &Uuid,
    status: RsvpStatus,
) -> Result<()> {
    let mut stmt = conn.prepare("SELECT participant_limit FROM events WHERE id = ?1")?;
    let limit: Option<Option<u32>> = stmt
        .query_row([event_id.to_string()], |row| row.get(0))
        .optional()?;
    let Some(limit) = limit else {
        return Err(anyhow!("not_found"));
    };
    if status == RsvpStatus::Going {
        if let Some(limit) = limit {
            let going: u32 = conn.query_row(
                "SELECT COUNT(*) FROM event_attendees WHERE event_id = ?1 AND status = ?2 AND user_id <> ?3",
                params![
                    event_id.to_string(),
                    RsvpStatus::Going.as_str(),
                    user_id.to_string()
                ],
                |row| row.get(0),
            )?;
            if going >= limit {
                return Err(anyhow!("event_full"));
            }
        }
    }
    conn.execute(
        "INSERT INTO event_attendees (event_id, user_id, status) VALUES (?1, ?2, ?3) \
         ON CONFLICT(event_id, user_id) DO UPDATE SET status = excluded.status",
        params![event_id.to_string(), user_id.to_string(), status.as_str()],
    )?;
    Ok(())
}

/// Remove a user from the attendee map. Removing an absent key is a no-op.
pub fn remove_rsvp(conn: &Connection, event_id: &Uuid, user_id: &Uuid) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM events WHERE id = ?1",
            [event_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(anyhow!("not_found"));
    }
    conn.execute(
        "DELETE FROM event_attendees WHERE event_id = ?1 AND user_id = ?2",
        params![event_id.to_string(), user_id.to_string()],
    )?;
    Ok(())
}

pub fn set_event_image(conn: &Connection, event_id: &Uuid, url: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE events SET image_url = ?2 WHERE id = ?1",
        params![event_id.to_string(), url],
    )?;
    if changed == 0 {
        anyhow::bail!("not_found");
    }
    Ok(())
}

/// Delete an event. Only the creator may delete; attendee rows and messages
/// cascade. Returns the cover image URL so the caller can remove the object.
pub fn delete_event(conn: &Connection, event_id: &Uuid, caller: &Uuid) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT creator_id, image_url FROM events WHERE id = ?1")?;
    let row: Option<(String, Option<String>)> = stmt
        .query_row([event_id.to_string()], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()?;
    let Some((creator_id, image_url)) = row else {
        return Err(anyhow!("not_found"));
    };
    if creator_id != caller.to_string() {
        return Err(anyhow!("forbidden"));
    }
    conn.execute("DELETE FROM events WHERE id = ?1", [event_id.to_string()])?;
    Ok(image_url)
}
