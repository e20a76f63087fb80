//! Persistence layer for the device authorization grant.
//!
//! Plain record structs over hand-written SQL. Reads return
//! `Result<Option<T>>` so callers can tell "no such record" apart from a
//! storage fault. Expiry is never evaluated here: rows come back as stored
//! and callers revalidate `expires_at` against the injected clock, because
//! the TTL reaper offers no precision guarantee.
//!
//! The conditional updaters ([`update_device_token`],
//! [`update_request_limit`]) run the caller's closure between a read and a
//! write inside one database transaction. That transaction is the critical
//! section every cross-request invariant leans on: an updater either sees
//! the latest committed row and replaces it, or the whole attempt fails.

use crate::errors::PerigeeError;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use rand::RngCore;
use sea_orm::{
    ConnectionTrait, Database, DatabaseConnection, DbBackend, QueryResult, SqlErr, Statement,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};

pub const DEVICE_TOKEN_PENDING: &str = "pending";
pub const DEVICE_TOKEN_COMPLETE: &str = "complete";

/// A pending device-initiated authorization, keyed by the code the user
/// types into the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub user_code: String,
    pub device_code: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub expires_at: i64,
}

/// Token-issuance state for one device code.
///
/// `status` moves from [`DEVICE_TOKEN_PENDING`] to [`DEVICE_TOKEN_COMPLETE`]
/// exactly once; `token` is empty until that transition and immutable after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceToken {
    pub device_code: String,
    pub status: String,
    pub token: String,
    pub expires_at: i64,
    pub last_request_time: i64,
    pub poll_interval_seconds: i64,
}

/// Rate-limiter state for one `method-ip-path` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLimit {
    pub key: String,
    pub interval: i64,
    pub last_seen: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    pub client_secret: String,
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewClient {
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub subject: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub consumed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub client_id: String,
    pub subject: String,
    pub scope: String,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub token: String,
    pub client_id: String,
    pub subject: String,
    pub scope: String,
    pub created_at: i64,
    pub expires_at: i64,
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, PerigeeError> {
    let db = Database::connect(&cfg.url).await?;
    // bootstrap schema
    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        "PRAGMA foreign_keys = ON",
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"
        CREATE TABLE IF NOT EXISTS clients (
            client_id TEXT PRIMARY KEY,
            client_secret TEXT NOT NULL,
            client_name TEXT,
            redirect_uris TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"
        CREATE TABLE IF NOT EXISTS auth_codes (
            code TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            redirect_uri TEXT NOT NULL,
            scope TEXT NOT NULL,
            subject TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            consumed INTEGER NOT NULL DEFAULT 0
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"
        CREATE TABLE IF NOT EXISTS access_tokens (
            token TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            scope TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"
        CREATE TABLE IF NOT EXISTS refresh_tokens (
            token TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            scope TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"
        CREATE TABLE IF NOT EXISTS device_requests (
            user_code TEXT PRIMARY KEY,
            device_code TEXT NOT NULL,
            client_id TEXT NOT NULL,
            scopes TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        "CREATE INDEX IF NOT EXISTS idx_device_requests_expires ON device_requests(expires_at)",
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"
        CREATE TABLE IF NOT EXISTS device_tokens (
            device_code TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            token TEXT NOT NULL DEFAULT '',
            expires_at INTEGER NOT NULL,
            last_request_time INTEGER NOT NULL,
            poll_interval_seconds INTEGER NOT NULL
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        "CREATE INDEX IF NOT EXISTS idx_device_tokens_expires ON device_tokens(expires_at)",
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"
        CREATE TABLE IF NOT EXISTS request_limits (
            key TEXT PRIMARY KEY,
            interval INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        "CREATE INDEX IF NOT EXISTS idx_request_limits_expires ON request_limits(expires_at)",
    ))
    .await?;

    Ok(db)
}

/// True when `err` is the storage-level unique-key conflict, e.g. a freshly
/// generated user code colliding with a live one.
pub fn is_unique_violation(err: &PerigeeError) -> bool {
    match err {
        PerigeeError::Db(db_err) => {
            matches!(db_err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
        }
        _ => false,
    }
}

fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

// Client registry

pub async fn create_client(
    db: &DatabaseConnection,
    input: NewClient,
    now: i64,
) -> Result<Client, PerigeeError> {
    let client_id = random_id();
    let client_secret = random_id();
    let redirect_uris_json = serde_json::to_string(&input.redirect_uris)?;

    db.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        r#"INSERT INTO clients (client_id, client_secret, client_name, redirect_uris, created_at)
           VALUES (?, ?, ?, ?, ?)"#,
        [
            client_id.clone().into(),
            client_secret.clone().into(),
            input.client_name.clone().into(),
            redirect_uris_json.into(),
            now.into(),
        ],
    ))
    .await?;

    Ok(Client {
        client_id,
        client_secret,
        client_name: input.client_name,
        redirect_uris: input.redirect_uris,
        created_at: now,
    })
}

pub async fn get_client(
    db: &DatabaseConnection,
    client_id: &str,
) -> Result<Option<Client>, PerigeeError> {
    if let Some(row) = db
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            r#"SELECT client_id, client_secret, client_name, redirect_uris, created_at
               FROM clients WHERE client_id = ?"#,
            [client_id.into()],
        ))
        .await?
    {
        let client_id: String = row.try_get("", "client_id")?;
        let client_secret: String = row.try_get("", "client_secret")?;
        let client_name: Option<String> = row.try_get("", "client_name").ok();
        let redirect_uris_json: String = row.try_get("", "redirect_uris")?;
        let redirect_uris: Vec<String> =
            serde_json::from_str(&redirect_uris_json).unwrap_or_default();
        let created_at: i64 = row.try_get("", "created_at")?;
        Ok(Some(Client {
            client_id,
            client_secret,
            client_name,
            redirect_uris,
            created_at,
        }))
    } else {
        Ok(None)
    }
}

// Authorization codes (produced by the upstream /auth flow)

pub async fn issue_auth_code(
    db: &DatabaseConnection,
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    subject: &str,
    now: i64,
    ttl_secs: i64,
) -> Result<AuthCode, PerigeeError> {
    let code = random_id();
    let expires_at = now + ttl_secs;
    db.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        r#"INSERT INTO auth_codes (code, client_id, redirect_uri, scope, subject, created_at, expires_at, consumed)
           VALUES (?, ?, ?, ?, ?, ?, ?, 0)"#,
        [
            code.clone().into(),
            client_id.into(),
            redirect_uri.into(),
            scope.into(),
            subject.into(),
            now.into(),
            expires_at.into(),
        ],
    ))
    .await?;
    Ok(AuthCode {
        code,
        client_id: client_id.to_string(),
        redirect_uri: redirect_uri.to_string(),
        scope: scope.to_string(),
        subject: subject.to_string(),
        created_at: now,
        expires_at,
        consumed: 0,
    })
}

fn auth_code_from_row(row: &QueryResult) -> Result<AuthCode, PerigeeError> {
    Ok(AuthCode {
        code: row.try_get("", "code")?,
        client_id: row.try_get("", "client_id")?,
        redirect_uri: row.try_get("", "redirect_uri")?,
        scope: row.try_get("", "scope")?,
        subject: row.try_get("", "subject")?,
        created_at: row.try_get("", "created_at")?,
        expires_at: row.try_get("", "expires_at")?,
        consumed: row.try_get("", "consumed")?,
    })
}

pub async fn get_auth_code(
    db: &DatabaseConnection,
    code: &str,
) -> Result<Option<AuthCode>, PerigeeError> {
    let row = db
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            r#"SELECT code, client_id, redirect_uri, scope, subject, created_at, expires_at, consumed
               FROM auth_codes WHERE code = ?"#,
            [code.into()],
        ))
        .await?;
    row.map(|r| auth_code_from_row(&r)).transpose()
}

/// Mark an auth code used. Returns `None` when it is missing, already
/// consumed, or past expiry, so a replayed code cannot mint a second token.
pub async fn consume_auth_code(
    db: &DatabaseConnection,
    code: &str,
    now: i64,
) -> Result<Option<AuthCode>, PerigeeError> {
    let txn = db.begin().await?;
    let row = txn
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            r#"SELECT code, client_id, redirect_uri, scope, subject, created_at, expires_at, consumed
               FROM auth_codes WHERE code = ?"#,
            [code.into()],
        ))
        .await?;

    let Some(row) = row else {
        txn.commit().await?;
        return Ok(None);
    };
    let mut auth_code = auth_code_from_row(&row)?;
    if auth_code.consumed != 0 || now > auth_code.expires_at {
        txn.commit().await?;
        return Ok(None);
    }

    txn.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        "UPDATE auth_codes SET consumed = 1 WHERE code = ?",
        [code.into()],
    ))
    .await?;
    txn.commit().await?;

    auth_code.consumed = 1;
    Ok(Some(auth_code))
}

// Token minting

pub async fn issue_access_token(
    db: &DatabaseConnection,
    client_id: &str,
    subject: &str,
    scope: &str,
    now: i64,
    ttl_secs: i64,
) -> Result<AccessToken, PerigeeError> {
    let token = random_id();
    let expires_at = now + ttl_secs;
    db.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        r#"INSERT INTO access_tokens (token, client_id, subject, scope, created_at, expires_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
        [
            token.clone().into(),
            client_id.into(),
            subject.into(),
            scope.into(),
            now.into(),
            expires_at.into(),
        ],
    ))
    .await?;
    Ok(AccessToken {
        token,
        client_id: client_id.to_string(),
        subject: subject.to_string(),
        scope: scope.to_string(),
        created_at: now,
        expires_at,
    })
}

pub async fn issue_refresh_token(
    db: &DatabaseConnection,
    client_id: &str,
    subject: &str,
    scope: &str,
    now: i64,
    ttl_secs: i64,
) -> Result<RefreshToken, PerigeeError> {
    let token = random_id();
    let expires_at = now + ttl_secs;
    db.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        r#"INSERT INTO refresh_tokens (token, client_id, subject, scope, created_at, expires_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
        [
            token.clone().into(),
            client_id.into(),
            subject.into(),
            scope.into(),
            now.into(),
            expires_at.into(),
        ],
    ))
    .await?;
    Ok(RefreshToken {
        token,
        client_id: client_id.to_string(),
        subject: subject.to_string(),
        scope: scope.to_string(),
        created_at: now,
        expires_at,
    })
}

// Device requests

pub async fn create_device_request(
    db: &DatabaseConnection,
    request: &DeviceRequest,
) -> Result<(), PerigeeError> {
    let scopes_json = serde_json::to_string(&request.scopes)?;
    db.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        r#"INSERT INTO device_requests (user_code, device_code, client_id, scopes, expires_at)
           VALUES (?, ?, ?, ?, ?)"#,
        [
            request.user_code.clone().into(),
            request.device_code.clone().into(),
            request.client_id.clone().into(),
            scopes_json.into(),
            request.expires_at.into(),
        ],
    ))
    .await?;
    Ok(())
}

pub async fn get_device_request(
    db: &DatabaseConnection,
    user_code: &str,
) -> Result<Option<DeviceRequest>, PerigeeError> {
    if let Some(row) = db
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            r#"SELECT user_code, device_code, client_id, scopes, expires_at
               FROM device_requests WHERE user_code = ?"#,
            [user_code.into()],
        ))
        .await?
    {
        let scopes_json: String = row.try_get("", "scopes")?;
        let scopes: Vec<String> = serde_json::from_str(&scopes_json).unwrap_or_default();
        Ok(Some(DeviceRequest {
            user_code: row.try_get("", "user_code")?,
            device_code: row.try_get("", "device_code")?,
            client_id: row.try_get("", "client_id")?,
            scopes,
            expires_at: row.try_get("", "expires_at")?,
        }))
    } else {
        Ok(None)
    }
}

// Device tokens

fn device_token_from_row(row: &QueryResult) -> Result<DeviceToken, PerigeeError> {
    Ok(DeviceToken {
        device_code: row.try_get("", "device_code")?,
        status: row.try_get("", "status")?,
        token: row.try_get("", "token")?,
        expires_at: row.try_get("", "expires_at")?,
        last_request_time: row.try_get("", "last_request_time")?,
        poll_interval_seconds: row.try_get("", "poll_interval_seconds")?,
    })
}

pub async fn create_device_token(
    db: &DatabaseConnection,
    token: &DeviceToken,
) -> Result<(), PerigeeError> {
    db.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        r#"INSERT INTO device_tokens (device_code, status, token, expires_at, last_request_time, poll_interval_seconds)
           VALUES (?, ?, ?, ?, ?, ?)"#,
        [
            token.device_code.clone().into(),
            token.status.clone().into(),
            token.token.clone().into(),
            token.expires_at.into(),
            token.last_request_time.into(),
            token.poll_interval_seconds.into(),
        ],
    ))
    .await?;
    Ok(())
}

pub async fn get_device_token(
    db: &DatabaseConnection,
    device_code: &str,
) -> Result<Option<DeviceToken>, PerigeeError> {
    let row = db
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            r#"SELECT device_code, status, token, expires_at, last_request_time, poll_interval_seconds
               FROM device_tokens WHERE device_code = ?"#,
            [device_code.into()],
        ))
        .await?;
    row.map(|r| device_token_from_row(&r)).transpose()
}

/// Read-modify-write a device token inside one transaction.
///
/// The updater sees the latest committed row and may reject the transition
/// by returning an error, which aborts the transaction. This is the only
/// path that mutates device tokens, so the pending-to-complete transition
/// happens at most once even when callbacks race.
pub async fn update_device_token<F>(
    db: &DatabaseConnection,
    device_code: &str,
    updater: F,
) -> Result<DeviceToken, PerigeeError>
where
    F: FnOnce(DeviceToken) -> Result<DeviceToken, PerigeeError> + Send,
{
    let txn = db.begin().await?;
    let row = txn
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            r#"SELECT device_code, status, token, expires_at, last_request_time, poll_interval_seconds
               FROM device_tokens WHERE device_code = ?"#,
            [device_code.into()],
        ))
        .await?
        .ok_or(PerigeeError::NotFound)?;
    let current = device_token_from_row(&row)?;
    let next = updater(current)?;

    txn.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        r#"UPDATE device_tokens
           SET status = ?, token = ?, expires_at = ?, last_request_time = ?, poll_interval_seconds = ?
           WHERE device_code = ?"#,
        [
            next.status.clone().into(),
            next.token.clone().into(),
            next.expires_at.into(),
            next.last_request_time.into(),
            next.poll_interval_seconds.into(),
            device_code.into(),
        ],
    ))
    .await?;
    txn.commit().await?;
    Ok(next)
}

// Request limits

fn request_limit_from_row(row: &QueryResult) -> Result<RequestLimit, PerigeeError> {
    Ok(RequestLimit {
        key: row.try_get("", "key")?,
        interval: row.try_get("", "interval")?,
        last_seen: row.try_get("", "last_seen")?,
        expires_at: row.try_get("", "expires_at")?,
    })
}

pub async fn create_request_limit(
    db: &DatabaseConnection,
    limit: &RequestLimit,
) -> Result<(), PerigeeError> {
    db.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        r#"INSERT INTO request_limits (key, interval, last_seen, expires_at)
           VALUES (?, ?, ?, ?)"#,
        [
            limit.key.clone().into(),
            limit.interval.into(),
            limit.last_seen.into(),
            limit.expires_at.into(),
        ],
    ))
    .await?;
    Ok(())
}

pub async fn get_request_limit(
    db: &DatabaseConnection,
    key: &str,
) -> Result<Option<RequestLimit>, PerigeeError> {
    let row = db
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT key, interval, last_seen, expires_at FROM request_limits WHERE key = ?",
            [key.into()],
        ))
        .await?;
    row.map(|r| request_limit_from_row(&r)).transpose()
}

/// Read-modify-write a request limit inside one transaction; the same
/// critical-section contract as [`update_device_token`].
pub async fn update_request_limit<F>(
    db: &DatabaseConnection,
    key: &str,
    updater: F,
) -> Result<RequestLimit, PerigeeError>
where
    F: FnOnce(RequestLimit) -> Result<RequestLimit, PerigeeError> + Send,
{
    let txn = db.begin().await?;
    let row = txn
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT key, interval, last_seen, expires_at FROM request_limits WHERE key = ?",
            [key.into()],
        ))
        .await?
        .ok_or(PerigeeError::NotFound)?;
    let current = request_limit_from_row(&row)?;
    let next = updater(current)?;

    txn.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        "UPDATE request_limits SET interval = ?, last_seen = ?, expires_at = ? WHERE key = ?",
        [
            next.interval.into(),
            next.last_seen.into(),
            next.expires_at.into(),
            key.into(),
        ],
    ))
    .await?;
    txn.commit().await?;
    Ok(next)
}

// TTL reaping

pub async fn cleanup_expired_device_requests(
    db: &DatabaseConnection,
    now: i64,
) -> Result<u64, PerigeeError> {
    let result = db
        .execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "DELETE FROM device_requests WHERE expires_at < ?",
            [now.into()],
        ))
        .await?;
    Ok(result.rows_affected())
}

pub async fn cleanup_expired_device_tokens(
    db: &DatabaseConnection,
    now: i64,
) -> Result<u64, PerigeeError> {
    let result = db
        .execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "DELETE FROM device_tokens WHERE expires_at < ?",
            [now.into()],
        ))
        .await?;
    Ok(result.rows_affected())
}

pub async fn cleanup_expired_request_limits(
    db: &DatabaseConnection,
    now: i64,
) -> Result<u64, PerigeeError> {
    let result = db
        .execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "DELETE FROM request_limits WHERE expires_at < ?",
            [now.into()],
        ))
        .await?;
    Ok(result.rows_affected())
}

pub async fn cleanup_expired_auth_codes(
    db: &DatabaseConnection,
    now: i64,
) -> Result<u64, PerigeeError> {
    let result = db
        .execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "DELETE FROM auth_codes WHERE expires_at < ?",
            [now.into()],
        ))
        .await?;
    Ok(result.rows_affected())
}
