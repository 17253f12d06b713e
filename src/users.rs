//! Staff accounts: bcrypt-hashed passwords and PINs, login verification.

use bcrypt::{hash, verify, DEFAULT_COST};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::audit;
use crate::db::DbState;
use crate::error::{PosError, PosResult};

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub full_name: Option<String>,
    pub role: String,
    pub active: bool,
}

pub struct NewUser<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub pin: Option<&'a str>,
    pub full_name: Option<&'a str>,
    pub role: &'a str,
}

pub fn add_user(db: &DbState, input: &NewUser) -> PosResult<i64> {
    if input.username.trim().is_empty() {
        return Err(PosError::validation("username is required"));
    }
    if input.password.len() < 4 {
        return Err(PosError::validation("password must be at least 4 characters"));
    }

    let conn = db.lock();

    let taken: Option<i64> = conn
        .query_row(
            "SELECT id FROM users WHERE username = ?1",
            params![input.username.trim()],
            |row| row.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(PosError::conflict(format!(
            "username '{}' is already taken",
            input.username.trim()
        )));
    }

    let password_hash = hash(input.password, DEFAULT_COST)
        .map_err(|e| PosError::Database(format!("hash password: {e}")))?;
    let pin_hash = match input.pin {
        Some(pin) => Some(
            hash(pin, DEFAULT_COST).map_err(|e| PosError::Database(format!("hash pin: {e}")))?,
        ),
        None => None,
    };

    conn.execute(
        "INSERT INTO users (username, password_hash, pin_hash, full_name, role)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            input.username.trim(),
            password_hash,
            pin_hash,
            input.full_name,
            input.role
        ],
    )
    .map_err(|e| PosError::db("insert user", e))?;

    let id = conn.last_insert_rowid();
    info!(user_id = id, username = input.username, "user created");
    Ok(id)
}

/// Verify username + password. Inactive accounts cannot log in.
pub fn verify_login(db: &DbState, username: &str, password: &str) -> PosResult<User> {
    let conn = db.lock();

    let row: Option<(i64, String, Option<String>, String, bool, String)> = conn
        .query_row(
            "SELECT id, username, full_name, role, active, password_hash
             FROM users WHERE username = ?1",
            params![username],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;

    let Some((id, username, full_name, role, active, password_hash)) = row else {
        return Err(PosError::validation("invalid username or password"));
    };

    if !active {
        return Err(PosError::conflict("account is disabled"));
    }

    let ok = verify(password, &password_hash)
        .map_err(|e| PosError::Database(format!("verify password: {e}")))?;
    if !ok {
        return Err(PosError::validation("invalid username or password"));
    }

    audit::record(&conn, Some(id), audit::ACTION_LOGIN, &format!("user {username} logged in"));

    Ok(User {
        id,
        username,
        full_name,
        role,
        active,
    })
}

/// Verify a user's quick-access PIN.
pub fn verify_pin(db: &DbState, user_id: i64, pin: &str) -> PosResult<bool> {
    let conn = db.lock();

    let pin_hash: Option<String> = conn
        .query_row(
            "SELECT pin_hash FROM users WHERE id = ?1 AND active = 1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| PosError::not_found(format!("user {user_id} not found")))?;

    let Some(pin_hash) = pin_hash else {
        return Ok(false);
    };

    verify(pin, &pin_hash).map_err(|e| PosError::Database(format!("verify pin: {e}")))
}

pub fn set_user_active(db: &DbState, user_id: i64, active: bool) -> PosResult<()> {
    let conn = db.lock();
    let changed = conn.execute(
        "UPDATE users SET active = ?1 WHERE id = ?2",
        params![active, user_id],
    )?;
    if changed == 0 {
        return Err(PosError::not_found(format!("user {user_id} not found")));
    }
    info!(user_id, active, "user active flag changed");
    Ok(())
}

pub fn list_users(db: &DbState, include_inactive: bool) -> PosResult<Vec<User>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT id, username, full_name, role, active FROM users
         WHERE active = 1 OR ?1
         ORDER BY username",
    )?;
    let rows = stmt.query_map(params![include_inactive], |row| {
        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            full_name: row.get(2)?,
            role: row.get(3)?,
            active: row.get(4)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ===========================================================================
// Tests
// ===========================================================================
