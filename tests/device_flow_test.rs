mod helpers;

use axum::http::{Method, StatusCode};
use helpers::db::{seed_test_client, TestDb};
use helpers::{http, test_state, TEST_ISSUER};
use perigee::storage;
use perigee::web::{self, GRANT_TYPE_DEVICE_CODE};

const T0: i64 = 1_700_000_000;

/// POST /device/code as the device would and return the parsed response.
async fn start_device_flow(
    app: &axum::Router,
    client_id: &str,
    scopes: &[&str],
) -> serde_json::Value {
    let mut fields = vec![("client_id", client_id)];
    for scope in scopes {
        fields.push(("scope", *scope));
    }
    let response = http::post_form(app, "/device/code", &fields).await;
    assert_eq!(response.status, StatusCode::OK);
    response.json()
}

#[tokio::test]
async fn device_code_response_is_wire_stable() {
    let db = TestDb::new().await;
    let (state, _clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);
    let client = seed_test_client(db.connection()).await;

    let body = start_device_flow(&app, &client.client_id, &["openid", "profile"]).await;

    let device_code = body["device_code"].as_str().unwrap();
    let user_code = body["user_code"].as_str().unwrap();
    assert_eq!(device_code.len(), 32);
    assert_eq!(user_code.len(), 8);
    assert!(user_code.chars().all(|c| c.is_ascii_uppercase()));
    assert_eq!(body["expires_in"], 600);
    assert_eq!(body["interval"], 5);
    assert_eq!(
        body["verification_uri"].as_str().unwrap(),
        format!("{}/device", TEST_ISSUER)
    );

    // verification_uri_complete round-trips to the user code.
    let complete = url::Url::parse(body["verification_uri_complete"].as_str().unwrap()).unwrap();
    let prefilled = complete
        .query_pairs()
        .find(|(k, _)| k == "user_code")
        .map(|(_, v)| v.to_string())
        .unwrap();
    assert_eq!(prefilled, user_code);

    // Scopes are stored in submission order.
    let request = storage::get_device_request(db.connection(), user_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.scopes, vec!["openid", "profile"]);
    assert_eq!(request.device_code, device_code);

    // The paired device token starts pending with an empty token.
    let token = storage::get_device_token(db.connection(), device_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(token.status, storage::DEVICE_TOKEN_PENDING);
    assert!(token.token.is_empty());
    assert_eq!(token.poll_interval_seconds, 5);
}

#[tokio::test]
async fn device_and_user_codes_are_unique_across_requests() {
    let db = TestDb::new().await;
    let (state, _clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);
    let client = seed_test_client(db.connection()).await;

    let mut device_codes = std::collections::HashSet::new();
    let mut user_codes = std::collections::HashSet::new();
    for _ in 0..25 {
        let body = start_device_flow(&app, &client.client_id, &["openid"]).await;
        assert!(device_codes.insert(body["device_code"].as_str().unwrap().to_string()));
        assert!(user_codes.insert(body["user_code"].as_str().unwrap().to_string()));
    }
}

#[tokio::test]
async fn happy_path_issues_the_token_exactly_where_expected() {
    let db = TestDb::new().await;
    let (state, clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);
    let client = seed_test_client(db.connection()).await;

    // Device asks for codes.
    let body = start_device_flow(&app, &client.client_id, &["openid"]).await;
    let device_code = body["device_code"].as_str().unwrap().to_string();
    let user_code = body["user_code"].as_str().unwrap().to_string();

    // Browser submits the user code and is handed to /auth.
    let response = http::post_form(
        &app,
        "/device/auth/verify_code",
        &[("user_code", user_code.as_str())],
    )
    .await;
    assert_eq!(response.status, StatusCode::FOUND);
    let location = url::Url::parse(response.header("location").unwrap()).unwrap();
    assert_eq!(location.path(), "/auth");
    let pairs: Vec<(String, String)> = location
        .query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    assert!(pairs.contains(&("client_id".to_string(), client.client_id.clone())));
    assert!(pairs.contains(&("state".to_string(), user_code.clone())));
    assert!(pairs.contains(&("response_type".to_string(), "code".to_string())));
    assert!(pairs.contains(&(
        "redirect_uri".to_string(),
        format!("{}/device/callback", TEST_ISSUER)
    )));
    assert!(pairs.contains(&("scope".to_string(), "openid".to_string())));

    // Upstream /auth flow completes and redirects back with a code.
    let auth_code = web::issue_upstream_auth_code(
        db.connection(),
        &client.client_id,
        &format!("{}/device/callback", TEST_ISSUER),
        "openid",
        "subject-1",
        T0,
    )
    .await
    .unwrap();

    // The callback attaches the token and shows the success page.
    let response = http::get(
        &app,
        &format!("/device/callback?state={}&code={}", user_code, auth_code.code),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.text().contains("Test Device App"));

    // A properly paced poll six seconds later returns the stored token verbatim.
    clock.advance(6);
    let response = http::post_form(
        &app,
        "/device/token",
        &[
            ("device_code", device_code.as_str()),
            ("grant_type", GRANT_TYPE_DEVICE_CODE),
        ],
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header("content-type").unwrap(), "application/json");
    let token_body = response.json();
    assert!(token_body["access_token"].as_str().unwrap().len() > 16);
    assert_eq!(token_body["token_type"], "bearer");
    assert_eq!(token_body["scope"], "openid");

    // Once complete, every read returns the same bytes.
    let first_bytes = response.body.clone();
    let stored = storage::get_device_token(db.connection(), &device_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, storage::DEVICE_TOKEN_COMPLETE);
    assert_eq!(stored.token.as_bytes(), first_bytes.as_slice());

    clock.advance(6);
    let response = http::post_form(
        &app,
        "/device/token",
        &[
            ("device_code", device_code.as_str()),
            ("grant_type", GRANT_TYPE_DEVICE_CODE),
        ],
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, first_bytes);
}

#[tokio::test]
async fn polling_too_fast_slows_down_without_tightening_the_window() {
    let db = TestDb::new().await;
    let (state, clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);
    let client = seed_test_client(db.connection()).await;

    let body = start_device_flow(&app, &client.client_id, &["openid"]).await;
    let device_code = body["device_code"].as_str().unwrap().to_string();
    let poll = [
        ("device_code", device_code.as_str()),
        ("grant_type", GRANT_TYPE_DEVICE_CODE),
    ];

    // T0+1: too fast.
    clock.advance(1);
    let response = http::post_form(&app, "/device/token", &poll).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "slow_down");

    // The rejected poll still advanced the window...
    let stored = storage::get_device_token(db.connection(), &device_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.last_request_time, T0 + 1);
    // ...but did not tighten it.
    assert_eq!(stored.poll_interval_seconds, 5);

    // T0+7: six seconds after the rejected poll, we are outside the window.
    clock.advance(6);
    let response = http::post_form(&app, "/device/token", &poll).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.json()["error"], "authorization_pending");

    // T0+12: still pending, still paced.
    clock.advance(5);
    let response = http::post_form(&app, "/device/token", &poll).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.json()["error"], "authorization_pending");
}

#[tokio::test]
async fn slow_down_interval_can_be_persisted_when_configured() {
    use perigee::limiter::RequestLimiter;
    use perigee::settings::Settings;
    use std::sync::Arc;

    let db = TestDb::new().await;
    let (clock, handle) = perigee::clock::Clock::manual(T0);

    let mut settings = Settings::default();
    settings.server.public_base_url = Some(TEST_ISSUER.to_string());
    settings.device.requests_valid_for_secs = 600;
    settings.device.persist_slow_down_interval = true;
    settings.limiter.base_interval_secs = 0;
    let settings = Arc::new(settings);
    let limiter = Arc::new(RequestLimiter::new(
        0,
        settings.limiter.default_expiry_secs,
        settings.limiter.backoff,
        db.connection().clone(),
        clock.clone(),
    ));
    let state = web::AppState {
        settings,
        db: db.connection().clone(),
        clock,
        limiter,
    };
    let app = web::router(state);
    let client = seed_test_client(db.connection()).await;

    let body = start_device_flow(&app, &client.client_id, &["openid"]).await;
    let device_code = body["device_code"].as_str().unwrap().to_string();
    let poll = [
        ("device_code", device_code.as_str()),
        ("grant_type", GRANT_TYPE_DEVICE_CODE),
    ];

    handle.advance(1);
    let response = http::post_form(&app, "/device/token", &poll).await;
    assert_eq!(response.json()["error"], "slow_down");

    let stored = storage::get_device_token(db.connection(), &device_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.poll_interval_seconds, 10);

    // Six seconds later the tightened window still rejects the poll.
    handle.advance(6);
    let response = http::post_form(&app, "/device/token", &poll).await;
    assert_eq!(response.json()["error"], "slow_down");
}

#[tokio::test]
async fn expired_device_code_is_rejected() {
    let db = TestDb::new().await;
    let (state, clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);
    let client = seed_test_client(db.connection()).await;

    let body = start_device_flow(&app, &client.client_id, &["openid"]).await;
    let device_code = body["device_code"].as_str().unwrap().to_string();

    clock.advance(601);
    let response = http::post_form(
        &app,
        "/device/token",
        &[
            ("device_code", device_code.as_str()),
            ("grant_type", GRANT_TYPE_DEVICE_CODE),
        ],
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    let body = response.json();
    assert_eq!(body["error"], "expired_token");
    assert!(body["error_description"].as_str().is_some());
}

#[tokio::test]
async fn token_endpoint_validates_its_inputs() {
    let db = TestDb::new().await;
    let (state, _clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);

    // Missing device_code.
    let response =
        http::post_form(&app, "/device/token", &[("grant_type", GRANT_TYPE_DEVICE_CODE)]).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "invalid_request");

    // Wrong grant type.
    let response = http::post_form(
        &app,
        "/device/token",
        &[("device_code", "abc"), ("grant_type", "authorization_code")],
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "invalid_grant");

    // Unknown device code.
    let response = http::post_form(
        &app,
        "/device/token",
        &[("device_code", "abc"), ("grant_type", GRANT_TYPE_DEVICE_CODE)],
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "expired_token");
}

#[tokio::test]
async fn unknown_user_code_rerenders_the_entry_page_in_error_state() {
    let db = TestDb::new().await;
    let (state, _clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);

    let response =
        http::post_form(&app, "/device/auth/verify_code", &[("user_code", "ZZZZZZZZ")]).await;
    assert_eq!(response.status, StatusCode::OK);
    let page = response.text();
    assert!(page.contains("Invalid or expired user code"));
    assert!(page.contains(r#"value="ZZZZZZZZ""#));
}

#[tokio::test]
async fn lowercase_user_codes_are_normalized() {
    let db = TestDb::new().await;
    let (state, _clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);
    let client = seed_test_client(db.connection()).await;

    let body = start_device_flow(&app, &client.client_id, &["openid"]).await;
    let user_code = body["user_code"].as_str().unwrap().to_lowercase();

    let response = http::post_form(
        &app,
        "/device/auth/verify_code",
        &[("user_code", user_code.as_str())],
    )
    .await;
    assert_eq!(response.status, StatusCode::FOUND);
    let location = response.header("location").unwrap();
    assert!(location.contains(&user_code.to_uppercase()));
}

#[tokio::test]
async fn entry_page_prefills_and_flags_invalid_attempts() {
    let db = TestDb::new().await;
    let (state, _clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);

    let response = http::get(&app, "/device?user_code=WDJBMJHT").await;
    assert_eq!(response.status, StatusCode::OK);
    let page = response.text();
    assert!(page.contains(r#"value="WDJBMJHT""#));
    assert!(!page.contains("Invalid or expired user code"));

    let response = http::get(&app, "/device?user_code=WDJBMJHT&invalid=true").await;
    assert!(response.text().contains("Invalid or expired user code"));

    // Unparseable invalid flag is treated as false.
    let response = http::get(&app, "/device?invalid=banana").await;
    assert!(!response.text().contains("Invalid or expired user code"));
}

#[tokio::test]
async fn callback_rejects_bad_parameters() {
    let db = TestDb::new().await;
    let (state, _clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);

    // Missing state/code.
    let response = http::get(&app, "/device/callback?state=ABCD").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    // Upstream error is surfaced verbatim.
    let response = http::get(
        &app,
        "/device/callback?state=ABCD&code=x&error=access_denied&error_description=nope",
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.text(), "access_denied: nope");

    // Unknown auth code.
    let response = http::get(&app, "/device/callback?state=ABCD&code=missing").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    // Known auth code but unknown user code.
    let client = seed_test_client(db.connection()).await;
    let auth_code = web::issue_upstream_auth_code(
        db.connection(),
        &client.client_id,
        "http://idp.example.com/device/callback",
        "openid",
        "subject-1",
        T0,
    )
    .await
    .unwrap();
    let response = http::get(
        &app,
        &format!("/device/callback?state=NOPE&code={}", auth_code.code),
    )
    .await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn second_completion_loses_and_does_not_clobber_the_token() {
    let db = TestDb::new().await;
    let (state, _clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);
    let client = seed_test_client(db.connection()).await;

    let body = start_device_flow(&app, &client.client_id, &["openid"]).await;
    let device_code = body["device_code"].as_str().unwrap().to_string();
    let user_code = body["user_code"].as_str().unwrap().to_string();

    let redirect_uri = format!("{}/device/callback", TEST_ISSUER);
    let first = web::issue_upstream_auth_code(
        db.connection(),
        &client.client_id,
        &redirect_uri,
        "openid",
        "subject-1",
        T0,
    )
    .await
    .unwrap();
    let second = web::issue_upstream_auth_code(
        db.connection(),
        &client.client_id,
        &redirect_uri,
        "openid",
        "subject-1",
        T0,
    )
    .await
    .unwrap();

    let response = http::get(
        &app,
        &format!("/device/callback?state={}&code={}", user_code, first.code),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    let winner = storage::get_device_token(db.connection(), &device_code)
        .await
        .unwrap()
        .unwrap()
        .token;
    assert!(!winner.is_empty());

    // A second completer aborts; the first completer's token stays attached.
    let response = http::get(
        &app,
        &format!("/device/callback?state={}&code={}", user_code, second.code),
    )
    .await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    let stored = storage::get_device_token(db.connection(), &device_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.token, winner);
    assert_eq!(stored.status, storage::DEVICE_TOKEN_COMPLETE);
}

#[tokio::test]
async fn replayed_auth_codes_cannot_complete_a_second_device() {
    let db = TestDb::new().await;
    let (state, _clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);
    let client = seed_test_client(db.connection()).await;

    let first_flow = start_device_flow(&app, &client.client_id, &["openid"]).await;
    let second_flow = start_device_flow(&app, &client.client_id, &["openid"]).await;

    let redirect_uri = format!("{}/device/callback", TEST_ISSUER);
    let auth_code = web::issue_upstream_auth_code(
        db.connection(),
        &client.client_id,
        &redirect_uri,
        "openid",
        "subject-1",
        T0,
    )
    .await
    .unwrap();

    let response = http::get(
        &app,
        &format!(
            "/device/callback?state={}&code={}",
            first_flow["user_code"].as_str().unwrap(),
            auth_code.code
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);

    // Same code replayed against a different device request fails.
    let response = http::get(
        &app,
        &format!(
            "/device/callback?state={}&code={}",
            second_flow["user_code"].as_str().unwrap(),
            auth_code.code
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn wrong_methods_are_rejected_with_bad_request() {
    let db = TestDb::new().await;
    let (state, _clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);

    // Code and token endpoints reject with OAuth error JSON.
    let response = http::request(&app, Method::GET, "/device/code", &[], None).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "invalid_request");

    let response = http::request(&app, Method::GET, "/device/token", &[], None).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "invalid_request");

    // Browser-facing endpoints render an error page.
    let response = http::request(&app, Method::POST, "/device", &[], Some(&[])).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(response.text().contains("Requested resource does not exist."));

    let response = http::request(&app, Method::POST, "/device/callback", &[], Some(&[])).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(response.text().contains("Requested resource does not exist."));
}

#[tokio::test]
async fn discovery_advertises_the_device_endpoints() {
    let db = TestDb::new().await;
    let (state, _clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);

    let response = http::get(&app, "/.well-known/openid-configuration").await;
    assert_eq!(response.status, StatusCode::OK);
    let body = response.json();
    assert_eq!(body["issuer"], TEST_ISSUER);
    assert_eq!(
        body["device_authorization_endpoint"],
        format!("{}/device/code", TEST_ISSUER)
    );
    assert_eq!(
        body["grant_types_supported"][0],
        GRANT_TYPE_DEVICE_CODE
    );
}

#[tokio::test]
async fn offline_access_scope_adds_a_refresh_token() {
    let db = TestDb::new().await;
    let (state, clock) = test_state(db.connection(), T0, 0);
    let app = web::router(state);
    let client = seed_test_client(db.connection()).await;

    let body = start_device_flow(&app, &client.client_id, &["openid", "offline_access"]).await;
    let device_code = body["device_code"].as_str().unwrap().to_string();
    let user_code = body["user_code"].as_str().unwrap().to_string();

    let auth_code = web::issue_upstream_auth_code(
        db.connection(),
        &client.client_id,
        &format!("{}/device/callback", TEST_ISSUER),
        "openid offline_access",
        "subject-1",
        T0,
    )
    .await
    .unwrap();
    let response = http::get(
        &app,
        &format!("/device/callback?state={}&code={}", user_code, auth_code.code),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);

    clock.advance(6);
    let response = http::post_form(
        &app,
        "/device/token",
        &[
            ("device_code", device_code.as_str()),
            ("grant_type", GRANT_TYPE_DEVICE_CODE),
        ],
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    let token_body = response.json();
    assert!(token_body["refresh_token"].as_str().unwrap().len() > 16);
    assert_eq!(token_body["scope"], "openid offline_access");
}
