use anyhow::{anyhow, Result};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration as StdDuration, Instant},
};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// An authentication account. Profile documents share its id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub verified: bool,
    pub created_at: i64,
}

/// Kind of one-time token handed to an account owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Verify,
    Reset,
}

impl TokenKind {
    fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Verify => "verify",
            TokenKind::Reset => "reset",
        }
    }
}

/// Hash a password using argon2id.
pub fn hash_password(pass: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(pass.as_bytes(), &salt)
        .map_err(|e| anyhow!(e))?
        .to_string();
    Ok(hash)
}

/// Verify a password against an encoded hash.
pub fn verify_password(pass: &str, hash: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        Argon2::default()
            .verify_password(pass.as_bytes(), &parsed)
            .is_ok()
    } else {
        false
    }
}

/// Claims stored within issued JWTs. `sub` is the account id.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| anyhow!("bad_subject"))
    }
}

/// Issue a JWT for a given account valid for the provided duration.
pub fn issue_jwt(secret: &[u8], sub: &str, valid_for: Duration) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: sub.into(),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a JWT and return its claims if valid.
pub fn verify_jwt(secret: &[u8], token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(data.claims)
}

/// Fetch the signing secret, generating and persisting it on first run.
pub fn jwt_secret(conn: &Connection) -> Result<Vec<u8>> {
    let existing: Option<Vec<u8>> = conn
        .query_row("SELECT jwt_secret FROM server_config WHERE id = 1", [], |r| {
            r.get(0)
        })
        .optional()?;
    if let Some(secret) = existing {
        return Ok(secret);
    }
    use rand::RngCore;
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    conn.execute(
        "INSERT INTO server_config (id, jwt_secret, created_at) VALUES (1, ?1, ?2)",
        params![secret, OffsetDateTime::now_utc().unix_timestamp()],
    )?;
    Ok(secret)
}

/// Create an account with a freshly hashed password. Fails on duplicate email.
pub fn create_account(conn: &Connection, email: &str, password: &str) -> Result<Account> {
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let hash = hash_password(password)?;
    let res = conn.execute(
        "INSERT INTO accounts (id, email, password_hash, verified, created_at) VALUES (?1, ?2, ?3, 0, ?4)",
        params![id.to_string(), email, hash, now],
    );
    match res {
        Ok(_) => Ok(Account {
            id,
            email: email.into(),
            verified: false,
            created_at: now,
        }),
        Err(e) => {
            if matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ) {
                Err(anyhow!("email_in_use"))
            } else {
                Err(e.into())
            }
        }
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Account, String)> {
    let id: String = row.get(0)?;
    Ok((
        Account {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            email: row.get(1)?,
            verified: row.get::<_, i64>(3)? != 0,
            created_at: row.get(4)?,
        },
        row.get(2)?,
    ))
}

/// Look up an account and its password hash by email (case-insensitive).
pub fn find_by_email(conn: &Connection, email: &str) -> Result<Option<(Account, String)>> {
    let mut stmt = conn.prepare(
        "SELECT id, email, password_hash, verified, created_at FROM accounts WHERE email = ?1 COLLATE NOCASE",
    )?;
    let account = stmt.query_row([email], row_to_account).optional()?;
    Ok(account)
}

pub fn get_account(conn: &Connection, id: &Uuid) -> Result<Option<Account>> {
    let mut stmt = conn.prepare(
        "SELECT id, email, password_hash, verified, created_at FROM accounts WHERE id = ?1",
    )?;
    let account = stmt
        .query_row([id.to_string()], row_to_account)
        .optional()?;
    Ok(account.map(|(a, _)| a))
}

/// Issue a one-time token for verification or password reset.
pub fn issue_token(
    conn: &Connection,
    account_id: &Uuid,
    kind: TokenKind,
    valid_for: Duration,
) -> Result<String> {
    use rand::RngCore;
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let token = URL_SAFE_NO_PAD.encode(raw);
    let expires = (OffsetDateTime::now_utc() + valid_for).unix_timestamp();
    conn.execute(
        "INSERT INTO account_tokens (token, account_id, kind, expires_at) VALUES (?1, ?2, ?3, ?4)",
        params![token, account_id.to_string(), kind.as_str(), expires],
    )?;
    Ok(token)
}

/// Consume a one-time token, returning the owning account id.
/// Expired and unknown tokens are rejected alike.
pub fn consume_token(conn: &Connection, token: &str, kind: TokenKind) -> Result<Uuid> {
    let mut stmt = conn.prepare(
        "SELECT account_id, expires_at FROM account_tokens WHERE token = ?1 AND kind = ?2",
    )?;
    let row: Option<(String, i64)> = stmt
        .query_row(params![token, kind.as_str()], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .optional()?;
    let Some((account_id, expires_at)) = row else {
        return Err(anyhow!("invalid_token"));
    };
    conn.execute("DELETE FROM account_tokens WHERE token = ?1", [token])?;
    if expires_at < OffsetDateTime::now_utc().unix_timestamp() {
        return Err(anyhow!("invalid_token"));
    }
    Uuid::parse_str(&account_id).map_err(|_| anyhow!("invalid_token"))
}

/// Mark an account's email as verified.
pub fn mark_verified(conn: &Connection, account_id: &Uuid) -> Result<()> {
    let changed = conn.execute(
        "UPDATE accounts SET verified = 1 WHERE id = ?1",
        [account_id.to_string()],
    )?;
    if changed == 0 {
        anyhow::bail!("not_found");
    }
    Ok(())
}

/// Replace an account's password hash.
pub fn set_password(conn: &Connection, account_id: &Uuid, password: &str) -> Result<()> {
    let hash = hash_password(password)?;
    let changed = conn.execute(
        "UPDATE accounts SET password_hash = ?2 WHERE id = ?1",
        params![account_id.to_string(), hash],
    )?;
    if changed == 0 {
        anyhow::bail!("not_found");
    }
    Ok(())
}

/// Delete expired verification and reset tokens.
pub fn purge_expired_tokens(conn: &Connection) -> Result<usize> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let n = conn.execute("DELETE FROM account_tokens WHERE expires_at < ?1", [now])?;
    Ok(n)
}

/// Simple in-memory login rate limiter keyed by email.
#[derive(Clone)]
pub struct LoginRateLimiter {
    inner: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
    max: usize,
    window: StdDuration,
}

impl LoginRateLimiter {
    pub fn new(max: usize, window: StdDuration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max,
            window,
        }
    }

    /// Returns true if the attempt is allowed, false if rate limited.
    /// Keys with no attempts left in the window are dropped so the map
    /// stays bounded under attacker-chosen emails.
    pub fn check(&self, key: &str) -> bool {
        let mut guard = self.inner.lock();
        let now = Instant::now();
        guard.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < self.window);
            !attempts.is_empty()
        });
        let entry = guard.entry(key.to_string()).or_default();
        if entry.len() >= self.max {
            return false;
        }
        entry.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::time::Duration as StdDuration;

    #[test]
    fn hash_and_verify() {
        let hash = hash_password("secret").unwrap();
        assert!(verify_password("secret", &hash));
        assert!(!verify_password("bad", &hash));
    }

    #[test]
    fn jwt_issue_and_verify() {
        let secret = b"secret";
        let token = issue_jwt(secret, "user", Duration::seconds(60)).unwrap();
        let claims = verify_jwt(secret, &token).unwrap();
        assert_eq!(claims.sub, "user");
    }

    #[test]
    fn jwt_expiry() {
        let secret = b"secret";
        let token = issue_jwt(secret, "user", Duration::seconds(-10)).unwrap();
        assert!(verify_jwt(secret, &token).is_err());
    }

    #[test]
    fn secret_is_stable_across_calls() {
        let conn = db::init_db(":memory:").unwrap();
        let a = jwt_secret(&conn).unwrap();
        let b = jwt_secret(&conn).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn duplicate_email_case_insensitive() {
        let conn = db::init_db(":memory:").unwrap();
        create_account(&conn, "Alice@example.com", "password1").unwrap();
        let err = create_account(&conn, "alice@EXAMPLE.com", "password2").unwrap_err();
        assert_eq!(err.to_string(), "email_in_use");
    }

    #[test]
    fn verify_token_round_trip() {
        let conn = db::init_db(":memory:").unwrap();
        let acct = create_account(&conn, "a@b.com", "password1").unwrap();
        let token = issue_token(&conn, &acct.id, TokenKind::Verify, Duration::hours(1)).unwrap();
        let id = consume_token(&conn, &token, TokenKind::Verify).unwrap();
        assert_eq!(id, acct.id);
        // single use
        assert!(consume_token(&conn, &token, TokenKind::Verify).is_err());
        mark_verified(&conn, &acct.id).unwrap();
        let (found, _) = find_by_email(&conn, "A@B.COM").unwrap().unwrap();
        assert!(found.verified);
    }

    #[test]
    fn expired_token_rejected_and_purged() {
        let conn = db::init_db(":memory:").unwrap();
        let acct = create_account(&conn, "a@b.com", "password1").unwrap();
        let token =
            issue_token(&conn, &acct.id, TokenKind::Reset, Duration::seconds(-5)).unwrap();
        assert!(consume_token(&conn, &token, TokenKind::Reset).is_err());
        let token2 =
            issue_token(&conn, &acct.id, TokenKind::Reset, Duration::seconds(-5)).unwrap();
        assert_eq!(purge_expired_tokens(&conn).unwrap(), 1);
        assert!(consume_token(&conn, &token2, TokenKind::Reset).is_err());
    }

    #[test]
    fn token_kind_is_checked() {
        let conn = db::init_db(":memory:").unwrap();
        let acct = create_account(&conn, "a@b.com", "password1").unwrap();
        let token = issue_token(&conn, &acct.id, TokenKind::Verify, Duration::hours(1)).unwrap();
        assert!(consume_token(&conn, &token, TokenKind::Reset).is_err());
    }

    #[test]
    fn password_replacement() {
        let conn = db::init_db(":memory:").unwrap();
        let acct = create_account(&conn, "a@b.com", "password1").unwrap();
        set_password(&conn, &acct.id, "password2").unwrap();
        let (_, hash) = find_by_email(&conn, "a@b.com").unwrap().unwrap();
        assert!(!verify_password("password1", &hash));
        assert!(verify_password("password2", &hash));
    }

    #[test]
    fn rate_limiter_blocks() {
        let limiter = LoginRateLimiter::new(2, StdDuration::from_secs(60));
        assert!(limiter.check("a@b.com"));
        assert!(limiter.check("a@b.com"));
        assert!(!limiter.check("a@b.com"));
        assert!(limiter.check("other@b.com"));
    }

    #[test]
    fn rate_limiter_drops_stale_keys() {
        let limiter = LoginRateLimiter::new(2, StdDuration::from_millis(10));
        assert!(limiter.check("a@b.com"));
        std::thread::sleep(StdDuration::from_millis(20));
        assert!(limiter.check("other@b.com"));
        let guard = limiter.inner.lock();
        assert!(!guard.contains_key("a@b.com"));
        assert_eq!(guard.len(), 1);
    }
}
