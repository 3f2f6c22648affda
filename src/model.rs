use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attendance intent for an event. Wire spelling matches the original
/// document format stored by the mobile clients.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RsvpStatus {
    Going,
    Maybe,
    CantGo,
    Pending,
}

impl RsvpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RsvpStatus::Going => "going",
            RsvpStatus::Maybe => "maybe",
            RsvpStatus::CantGo => "cantGo",
            RsvpStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "going" => Some(RsvpStatus::Going),
            "maybe" => Some(RsvpStatus::Maybe),
            "cantGo" => Some(RsvpStatus::CantGo),
            "pending" => Some(RsvpStatus::Pending),
            _ => None,
        }
    }
}

/// A user profile document. Created on first sign-in, never deleted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub email: Option<String>,
    pub name: Option<String>,
    pub birth_date: Option<i64>,
    pub bio: Option<String>,
    pub profile_image_url: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    pub event_date: i64,
    pub location_name: String,
    pub coordinates: Option<Coordinates>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub creator_id: Uuid,
    /// RSVP map keyed by user id. The creator is `going` from creation.
    pub attendees: HashMap<Uuid, RsvpStatus>,
    pub created_at: i64,
    pub tags: Option<Vec<String>>,
    pub participant_limit: Option<u32>,
}

/// Immutable chat message. Sender name and avatar are denormalized
/// snapshots taken at send time so history renders without profile lookups.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub event_id: Uuid,
    pub sender_id: Uuid,
    pub text: String,
    pub created_at: i64,
    pub sender_name: Option<String>,
    pub sender_avatar_url: Option<String>,
}
