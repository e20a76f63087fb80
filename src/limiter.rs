//! Per-key request limiter backed by the transactional store.
//!
//! Each key tracks the last time it was seen and the gap it is currently
//! required to keep. A key that keeps arriving inside its gap can be made to
//! wait longer each time (linear backoff): growth by one base interval per
//! violation is predictable for honest clients that briefly exceed the cap,
//! which is all the `slow_down` contract asks for.

use crate::clock::Clock;
use crate::errors::PerigeeError;
use crate::storage::{self, RequestLimit};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use sea_orm::DatabaseConnection;
use serde_json::json;
use std::sync::{Arc, RwLock};

/// Renders the rejection when a key is over its limit. Receives the delay
/// (the interval the key was held to) in seconds.
pub type OnLimitReached = Arc<dyn Fn(i64) -> Response + Send + Sync>;

pub struct RequestLimiter {
    base_interval: i64,
    default_expiry: i64,
    backoff: bool,
    db: DatabaseConnection,
    clock: Clock,
    // Written rarely (server wiring), read on every rejected request.
    on_limit_reached: RwLock<OnLimitReached>,
}

impl RequestLimiter {
    pub fn new(
        base_interval_secs: i64,
        default_expiry_secs: i64,
        backoff: bool,
        db: DatabaseConnection,
        clock: Clock,
    ) -> Self {
        Self {
            base_interval: base_interval_secs,
            default_expiry: default_expiry_secs,
            backoff,
            db,
            clock,
            on_limit_reached: RwLock::new(Arc::new(default_on_limit_reached)),
        }
    }

    /// Replace the rejection renderer. Safe to call while request handlers
    /// are executing the current one.
    pub fn set_on_limit_reached(&self, hook: OnLimitReached) {
        *self.on_limit_reached.write().unwrap() = hook;
    }

    /// Run the rejection renderer. The hook pointer is cloned out under the
    /// read lock and invoked after the lock is released, so the hook itself
    /// never holds the limiter's lock.
    pub fn exec_on_limit_reached(&self, delay_seconds: i64) -> Response {
        let hook = self.on_limit_reached.read().unwrap().clone();
        hook(delay_seconds)
    }

    /// Fetch the stored record for `key`, creating a fresh one on first
    /// sight. A fresh record has interval 0 and is therefore never limited.
    /// Storage faults other than absence surface to the caller.
    pub async fn get_last_request(&self, key: &str) -> Result<RequestLimit, PerigeeError> {
        if let Some(limit) = storage::get_request_limit(&self.db, key).await? {
            return Ok(limit);
        }

        let now = self.clock.now();
        let fresh = RequestLimit {
            key: key.to_string(),
            interval: 0,
            last_seen: now,
            expires_at: now + self.default_expiry,
        };
        match storage::create_request_limit(&self.db, &fresh).await {
            Ok(()) => Ok(fresh),
            Err(err) if storage::is_unique_violation(&err) => {
                // Lost the creation race to a concurrent first request.
                storage::get_request_limit(&self.db, key)
                    .await?
                    .ok_or(PerigeeError::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    /// True while the current time is inside the record's enforced gap.
    pub fn is_limited(&self, limit: &RequestLimit) -> bool {
        self.clock.now() < limit.last_seen + limit.interval
    }

    /// Advance the record for a newly observed request: a violating key with
    /// backoff enabled gets one more base interval added, everyone else is
    /// reset to the base interval, and the window restarts at now.
    pub async fn update_request(&self, limit: &RequestLimit) -> Result<(), PerigeeError> {
        let base = self.base_interval;
        let expiry = self.default_expiry;
        let backoff = self.backoff;
        let now = self.clock.now();

        let result = storage::update_request_limit(&self.db, &limit.key, move |mut stored| {
            let limited = now < stored.last_seen + stored.interval;
            if limited && backoff {
                stored.interval += base;
            } else {
                stored.interval = base;
            }
            stored.last_seen = now;
            stored.expires_at = now + expiry;
            Ok(stored)
        })
        .await;

        if let Err(err) = result {
            tracing::error!(key = %limit.key, %err, "failed to update request limit");
            return Err(err);
        }
        Ok(())
    }
}

fn default_on_limit_reached(delay_seconds: i64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, delay_seconds.to_string())],
        Json(json!({"error": "too_many_requests"})),
    )
        .into_response()
}
