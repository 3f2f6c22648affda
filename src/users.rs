use crate::auth::Account;
pub use crate::model::User;
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use uuid::Uuid;

/// Where to send a user after login, based on profile completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStep {
    ProfileDetails,
    ProfilePhoto,
    Main,
}

/// Post-login routing: no name -> enter details, no photo -> add one,
/// otherwise straight to the main app.
pub fn onboarding_step(user: &User) -> OnboardingStep {
    match (&user.name, &user.profile_image_url) {
        (Some(name), _) if name.is_empty() => OnboardingStep::ProfileDetails,
        (None, _) => OnboardingStep::ProfileDetails,
        (Some(_), Some(url)) if !url.is_empty() => OnboardingStep::Main,
        (Some(_), _) => OnboardingStep::ProfilePhoto,
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap_or_default(),
        email: row.get(1)?,
        name: row.get(2)?,
        birth_date: row.get(3)?,
        bio: row.get(4)?,
        profile_image_url: row.get(5)?,
        created_at: row.get(6)?,
    })
}

const USER_COLS: &str = "id, email, name, birth_date, bio, profile_image_url, created_at";

/// Fetch the profile for an account, creating a blank one on first sign-in.
pub fn fetch_or_create(conn: &Connection, account: &Account) -> Result<User> {
    if let Some(user) = get_user(conn, &account.id)? {
        return Ok(user);
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO users (id, email, created_at) VALUES (?1, ?2, ?3)",
        params![account.id.to_string(), account.email, now],
    )?;
    Ok(User {
        id: account.id,
        email: Some(account.email.clone()),
        name: None,
        birth_date: None,
        bio: None,
        profile_image_url: None,
        created_at: now,
    })
}

pub fn get_user(conn: &Connection, id: &Uuid) -> Result<Option<User>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {USER_COLS} FROM users WHERE id = ?1"))?;
    let user = stmt.query_row([id.to_string()], row_to_user).optional()?;
    Ok(user)
}

/// Fetch multiple profiles by id. Unknown ids are skipped.
pub fn get_users(conn: &Connection, ids: &[Uuid]) -> Result<Vec<User>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT {USER_COLS} FROM users WHERE id IN ({placeholders})");
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    let users = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Field-level profile update: only the provided fields change.
pub fn update_profile(
    conn: &Connection,
    id: &Uuid,
    name: Option<&str>,
    birth_date: Option<i64>,
    bio: Option<&str>,
) -> Result<()> {
    if let Some(name) = name {
        conn.execute(
            "UPDATE users SET name = ?2 WHERE id = ?1",
            params![id.to_string(), name],
        )?;
    }
    if let Some(birth_date) = birth_date {
        conn.execute(
            "UPDATE users SET birth_date = ?2 WHERE id = ?1",
            params![id.to_string(), birth_date],
        )?;
    }
    if let Some(bio) = bio {
        conn.execute(
            "UPDATE users SET bio = ?2 WHERE id = ?1",
            params![id.to_string(), bio],
        )?;
    }
    Ok(())
}

pub fn update_profile_image(conn: &Connection, id: &Uuid, url: &str) -> Result<()> {
    conn.execute(
        "UPDATE users SET profile_image_url = ?2 WHERE id = ?1",
        params![id.to_string(), url],
    )?;
    Ok(())
}
