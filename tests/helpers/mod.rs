pub mod db;
pub mod http;

use perigee::clock::{Clock, ManualClock};
use perigee::limiter::RequestLimiter;
use perigee::settings::Settings;
use perigee::web::AppState;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

pub const TEST_ISSUER: &str = "http://idp.example.com";

/// Build an [`AppState`] with a manual clock starting at `start`, a
/// 600-second device request lifetime, and the given middleware base
/// interval (0 disables middleware limiting so device-flow tests can focus
/// on the endpoints).
pub fn test_state(
    db: &DatabaseConnection,
    start: i64,
    limiter_base_interval: i64,
) -> (AppState, ManualClock) {
    let (clock, handle) = Clock::manual(start);

    let mut settings = Settings::default();
    settings.server.public_base_url = Some(TEST_ISSUER.to_string());
    settings.device.requests_valid_for_secs = 600;
    settings.limiter.base_interval_secs = limiter_base_interval;
    let settings = Arc::new(settings);

    let limiter = Arc::new(RequestLimiter::new(
        settings.limiter.base_interval_secs,
        settings.limiter.default_expiry_secs,
        settings.limiter.backoff,
        db.clone(),
        clock.clone(),
    ));

    let state = AppState {
        settings,
        db: db.clone(),
        clock,
        limiter,
    };
    (state, handle)
}
