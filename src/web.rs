//! HTTP surface of the device authorization grant (RFC 8628).
//!
//! Five endpoints drive a small distributed state machine: the polling
//! device creates a device/user code pair (`/device/code`) and polls
//! `/device/token`, while the user's browser walks `/device` →
//! `/device/auth/verify_code` → the upstream `/auth` flow →
//! `/device/callback`, which attaches the minted token to the pending
//! record. All of it is stateless per request; the storage layer's
//! conditional updates are what make the transitions race-safe.

use crate::clock::Clock;
use crate::errors::PerigeeError;
use crate::limiter::RequestLimiter;
use crate::settings::Settings;
use crate::{codes, storage};
use axum::body::Body;
use axum::extract::rejection::FormRejection;
use axum::extract::{ConnectInfo, Form, Query, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

pub const GRANT_TYPE_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Interval advertised on creation and restored whenever a poll is properly
/// paced.
pub const DEVICE_POLL_INTERVAL_SECS: i64 = 5;

const POLL_INTERVAL_INCREMENT_SECS: i64 = 5;
const AUTH_CODE_VALID_FOR_SECS: i64 = 300;
const ACCESS_TOKEN_VALID_FOR_SECS: i64 = 3600;
const REFRESH_TOKEN_VALID_FOR_SECS: i64 = 2_592_000;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub clock: Clock,
    pub limiter: Arc<RequestLimiter>,
}

pub async fn serve(settings: Settings, db: DatabaseConnection, clock: Clock) -> miette::Result<()> {
    let settings = Arc::new(settings);

    let limiter = Arc::new(RequestLimiter::new(
        settings.limiter.base_interval_secs,
        settings.limiter.default_expiry_secs,
        settings.limiter.backoff,
        db.clone(),
        clock.clone(),
    ));
    // Rejections from the middleware render as the OAuth slow_down error the
    // polling device already understands.
    limiter.set_on_limit_reached(Arc::new(|delay_seconds| {
        json_with_headers(
            StatusCode::BAD_REQUEST,
            json!({"error": "slow_down"}),
            &[("retry-after", delay_seconds.to_string())],
        )
    }));

    let state = AppState {
        settings: settings.clone(),
        db,
        clock,
        limiter,
    };

    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    tracing::info!(%addr, issuer = %settings.issuer(), "Device authorization endpoints listening");
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .into_diagnostic()?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    // The code and token endpoints speak OAuth error JSON even for a wrong
    // method; the browser-facing routes render an error page instead.
    let device = Router::new()
        .route(
            "/device/code",
            post(device_code).fallback(unsupported_token_method),
        )
        .route("/device", get(device_page).fallback(unsupported_method))
        .route(
            "/device/auth/verify_code",
            post(verify_user_code).fallback(unsupported_method),
        )
        .route(
            "/device/callback",
            get(device_callback).fallback(unsupported_method),
        )
        .route(
            "/device/token",
            post(device_token).fallback(unsupported_token_method),
        )
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .merge(device)
        .with_state(state)
}

// Rate-limiting middleware. The stored record is advanced before the limit
// decision is rendered, and the decision is made on the snapshot observed
// prior to advancement, so a first-visit record (interval 0) always passes
// while every visit, allowed or not, restarts the window.
async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let forwarded_for = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();
    let remote_ip = forwarded_for
        .split(',')
        .next()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| {
            if remote_addr.is_empty() {
                "unknown".to_string()
            } else {
                remote_addr.clone()
            }
        });
    let key = format!("{}-{}-{}", request.method(), remote_ip, request.uri().path());

    let limit = match state.limiter.get_last_request(&key).await {
        Ok(limit) => limit,
        Err(err) => {
            tracing::error!(%key, %err, "unexpected error getting request limit");
            return render_error(StatusCode::INTERNAL_SERVER_ERROR, "");
        }
    };
    if state.limiter.update_request(&limit).await.is_err() {
        return render_error(StatusCode::INTERNAL_SERVER_ERROR, "");
    }

    let mut response = if state.limiter.is_limited(&limit) {
        state.limiter.exec_on_limit_reached(limit.interval)
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-rate-limit-duration"),
        HeaderValue::from_static("1"),
    );
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(
            HeaderName::from_static("x-rate-limit-request-forwarded-for"),
            value,
        );
    }
    if let Ok(value) = HeaderValue::from_str(&remote_addr) {
        headers.insert(
            HeaderName::from_static("x-rate-limit-request-remote-addr"),
            value,
        );
    }
    response
}

async fn discovery(State(state): State<AppState>) -> impl IntoResponse {
    let issuer = state.settings.issuer();
    let metadata = json!({
        "issuer": issuer,
        "device_authorization_endpoint": format!("{}/device/code", issuer),
        "token_endpoint": format!("{}/device/token", issuer),
        "response_types_supported": ["code"],
        "grant_types_supported": [GRANT_TYPE_DEVICE_CODE],
    });
    Json(metadata)
}

#[derive(Debug, Serialize)]
struct DeviceCodeResponse {
    /// The unique device code for device authentication
    device_code: String,
    /// The code the user will exchange via a browser and log in
    user_code: String,
    /// The url to verify the user code
    verification_uri: String,
    /// The verification uri with the user code appended for pre-filling the form
    verification_uri_complete: String,
    /// The lifetime of the device code
    expires_in: i64,
    /// How often the device is allowed to poll to verify that the user login occurred
    interval: i64,
}

/// POST /device/code - create a device/user code pair (RFC 8628 §3.2)
async fn device_code(
    State(state): State<AppState>,
    form: Result<Form<Vec<(String, String)>>, FormRejection>,
) -> Response {
    // Repeated `scope` fields must survive with their order, so the body is
    // taken as raw pairs instead of a struct.
    let Form(fields) = match form {
        Ok(form) => form,
        Err(err) => {
            tracing::warn!(%err, "could not parse device request body");
            return token_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "Could not parse device request body",
            );
        }
    };

    let client_id = fields
        .iter()
        .find(|(name, _)| name == "client_id")
        .map(|(_, value)| value.clone())
        .unwrap_or_default();
    let scopes: Vec<String> = fields
        .iter()
        .filter(|(name, _)| name == "scope")
        .map(|(_, value)| value.clone())
        .collect();

    tracing::info!(%client_id, ?scopes, "received device request");

    let now = state.clock.now();
    let expires_at = now + state.settings.device.requests_valid_for_secs;

    // A freshly generated user code can collide with a live one; regenerate
    // on the storage-level unique-key conflict.
    let mut request = None;
    for _ in 0..3 {
        let candidate = storage::DeviceRequest {
            user_code: codes::new_user_code(),
            device_code: codes::new_device_code(),
            client_id: client_id.clone(),
            scopes: scopes.clone(),
            expires_at,
        };
        match storage::create_device_request(&state.db, &candidate).await {
            Ok(()) => {
                request = Some(candidate);
                break;
            }
            Err(err) if storage::is_unique_violation(&err) => continue,
            Err(err) => {
                tracing::error!(%err, "failed to store device request");
                return token_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "server_error",
                    "Could not create device request",
                );
            }
        }
    }
    let Some(request) = request else {
        tracing::error!("gave up generating a unique user code");
        return token_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "Could not create device request",
        );
    };

    let device_token = storage::DeviceToken {
        device_code: request.device_code.clone(),
        status: storage::DEVICE_TOKEN_PENDING.to_string(),
        token: String::new(),
        expires_at,
        last_request_time: now,
        poll_interval_seconds: DEVICE_POLL_INTERVAL_SECS,
    };
    if let Err(err) = storage::create_device_token(&state.db, &device_token).await {
        tracing::error!(%err, "failed to store device token");
        return token_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "Could not create device token",
        );
    }

    let issuer = state.settings.issuer();
    let verification_uri = format!("{}/device", issuer);
    let verification_uri_complete = format!(
        "{}/device?user_code={}",
        issuer,
        urlencoding::encode(&request.user_code)
    );

    Json(DeviceCodeResponse {
        device_code: request.device_code,
        user_code: request.user_code,
        verification_uri,
        verification_uri_complete,
        expires_in: state.settings.device.requests_valid_for_secs,
        interval: DEVICE_POLL_INTERVAL_SECS,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct DevicePageQuery {
    user_code: Option<String>,
    invalid: Option<String>,
}

/// GET /device - user code entry page
async fn device_page(Query(query): Query<DevicePageQuery>) -> Response {
    let invalid = query
        .invalid
        .as_deref()
        .and_then(|value| value.parse::<bool>().ok())
        .unwrap_or(false);
    let user_code = query.user_code.as_deref().unwrap_or("");
    Html(device_page_html(user_code, invalid)).into_response()
}

#[derive(Debug, Deserialize)]
struct VerifyCodeRequest {
    user_code: Option<String>,
}

/// POST /device/auth/verify_code - bind the browser session to the device
/// request and hand off to the upstream authorization flow
async fn verify_user_code(
    State(state): State<AppState>,
    form: Result<Form<VerifyCodeRequest>, FormRejection>,
) -> Response {
    let Form(req) = match form {
        Ok(form) => form,
        Err(err) => {
            tracing::warn!(%err, "could not parse user code verification request body");
            return token_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "Could not parse user code verification request body",
            );
        }
    };

    let user_code = req.user_code.unwrap_or_default();
    if user_code.is_empty() {
        return render_error(StatusCode::BAD_REQUEST, "No user code received");
    }
    let user_code = user_code.to_uppercase();

    let device_request = match storage::get_device_request(&state.db, &user_code).await {
        Ok(Some(request)) if state.clock.now() <= request.expires_at => request,
        Ok(_) => {
            // Unknown or expired code: back to the entry page in its error
            // state, keeping what the user typed.
            return Html(device_page_html(&user_code, true)).into_response();
        }
        Err(err) => {
            tracing::error!(%err, "failed to get device request");
            return render_error(StatusCode::INTERNAL_SERVER_ERROR, "");
        }
    };

    let issuer = state.settings.issuer();
    // `state` carries the user code so the callback can correlate the
    // authorization code back to this device request.
    let auth_url = url_append_query(
        format!("{}/auth", issuer),
        &[
            ("client_id", device_request.client_id.clone()),
            ("state", device_request.user_code.clone()),
            ("response_type", "code".to_string()),
            ("redirect_uri", format!("{}/device/callback", issuer)),
            ("scope", device_request.scopes.join(" ")),
        ],
    );

    found_redirect(&auth_url)
}

#[derive(Debug, Deserialize)]
struct DeviceCallbackQuery {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /device/callback - receive the authorization code from the upstream
/// flow and attach the exchanged token to the pending device token
async fn device_callback(
    State(state): State<AppState>,
    Query(query): Query<DeviceCallbackQuery>,
) -> Response {
    let user_code = query.state.unwrap_or_default();
    let code = query.code.unwrap_or_default();
    if user_code.is_empty() || code.is_empty() {
        return render_error(StatusCode::BAD_REQUEST, "Request was missing parameters");
    }

    // Authorization error redirect from the upstream flow.
    if let Some(error) = query.error.filter(|e| !e.is_empty()) {
        let description = query.error_description.unwrap_or_default();
        return (StatusCode::BAD_REQUEST, format!("{error}: {description}")).into_response();
    }

    let now = state.clock.now();

    let auth_code = match storage::get_auth_code(&state.db, &code).await {
        Ok(Some(auth_code)) if now <= auth_code.expires_at => auth_code,
        Ok(_) => {
            return render_error(StatusCode::BAD_REQUEST, "Invalid or expired auth code.");
        }
        Err(err) => {
            tracing::error!(%err, "failed to get auth code");
            return render_error(StatusCode::BAD_REQUEST, "Invalid or expired auth code.");
        }
    };

    let device_request = match storage::get_device_request(&state.db, &user_code).await {
        Ok(Some(request)) if now <= request.expires_at => request,
        Ok(_) => {
            return render_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Invalid or expired device code.",
            );
        }
        Err(err) => {
            tracing::error!(%err, "failed to get device request");
            return render_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Invalid or expired device code.",
            );
        }
    };

    let client = match storage::get_client(&state.db, &device_request.client_id).await {
        Ok(Some(client)) => client,
        Ok(None) => {
            tracing::error!(client_id = %device_request.client_id, "device client not found");
            return render_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to retrieve device client.",
            );
        }
        Err(err) => {
            tracing::error!(client_id = %device_request.client_id, %err, "failed to get device client");
            return render_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to retrieve device client.",
            );
        }
    };

    let token_response = match exchange_auth_code(&state, &auth_code, &client).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(client_id = %client.client_id, %err, "could not exchange auth code");
            return render_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to exchange auth code.",
            );
        }
    };

    match storage::get_device_token(&state.db, &device_request.device_code).await {
        Ok(Some(token)) if now <= token.expires_at => {}
        Ok(_) => {
            return render_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Invalid or expired device code.",
            );
        }
        Err(err) => {
            tracing::error!(%err, "failed to get device token");
            return render_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Invalid or expired device code.",
            );
        }
    };

    let token_json = match serde_json::to_string_pretty(&token_response) {
        Ok(serialized) => serialized,
        Err(err) => {
            tracing::error!(%err, "failed to marshal device token response");
            return render_error(StatusCode::INTERNAL_SERVER_ERROR, "");
        }
    };

    // First completer wins: a token already marked complete rejects the
    // transition inside the store's critical section, so a double-submitting
    // browser cannot overwrite the attached token.
    let update = storage::update_device_token(&state.db, &device_request.device_code, move |mut token| {
        if token.status == storage::DEVICE_TOKEN_COMPLETE {
            return Err(PerigeeError::Conflict(
                "device token already complete".to_string(),
            ));
        }
        token.token = token_json;
        token.status = storage::DEVICE_TOKEN_COMPLETE.to_string();
        Ok(token)
    })
    .await;

    if let Err(err) = update {
        tracing::error!(%err, "failed to update device token");
        return render_error(StatusCode::INTERNAL_SERVER_ERROR, "");
    }

    let client_name = client
        .client_name
        .as_deref()
        .unwrap_or("Unknown Application");
    Html(device_success_html(client_name)).into_response()
}

#[derive(Debug, Deserialize)]
struct DeviceTokenRequest {
    device_code: Option<String>,
    grant_type: Option<String>,
}

/// POST /device/token - device polling endpoint
async fn device_token(
    State(state): State<AppState>,
    form: Result<Form<DeviceTokenRequest>, FormRejection>,
) -> Response {
    let Form(req) = match form {
        Ok(form) => form,
        Err(err) => {
            tracing::warn!(%err, "could not parse device token request body");
            return token_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "Could not parse device token request body",
            );
        }
    };

    let device_code = req.device_code.unwrap_or_default();
    if device_code.is_empty() {
        return token_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "No device code received",
        );
    }

    if req.grant_type.as_deref() != Some(GRANT_TYPE_DEVICE_CODE) {
        return token_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "Unsupported grant type.  Must be device_code",
        );
    }

    let now = state.clock.now();

    let device_token = match storage::get_device_token(&state.db, &device_code).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            return token_error(
                StatusCode::BAD_REQUEST,
                "expired_token",
                "Invalid or expired device code parameter.",
            );
        }
        Err(err) => {
            tracing::error!(%err, "failed to get device token");
            return token_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "Device code not found",
            );
        }
    };
    if now > device_token.expires_at {
        return token_error(
            StatusCode::BAD_REQUEST,
            "expired_token",
            "Invalid or expired device code parameter.",
        );
    }

    // Per-device pacing. Every poll restarts the window, rejected ones
    // included, so a flooder cannot sidestep the pacing by never passing the
    // check. The increased interval is only stored when configured to; by
    // default slow_down does not tighten the window on the record.
    let min_request_time = device_token.last_request_time + device_token.poll_interval_seconds;
    if now < min_request_time {
        let bumped_interval = device_token.poll_interval_seconds + POLL_INTERVAL_INCREMENT_SECS;
        let persist_bump = state.settings.device.persist_slow_down_interval;
        if device_token.status == storage::DEVICE_TOKEN_PENDING {
            let advanced =
                storage::update_device_token(&state.db, &device_code, move |mut token| {
                    if persist_bump {
                        token.poll_interval_seconds = bumped_interval;
                    }
                    token.last_request_time = now;
                    Ok(token)
                })
                .await;
            if let Err(err) = advanced {
                tracing::error!(%err, "failed to update device token");
            }
        }
        return token_error(StatusCode::BAD_REQUEST, "slow_down", "");
    }

    match device_token.status.as_str() {
        storage::DEVICE_TOKEN_PENDING => {
            let updated = storage::update_device_token(&state.db, &device_code, move |mut token| {
                token.poll_interval_seconds = DEVICE_POLL_INTERVAL_SECS;
                token.last_request_time = now;
                Ok(token)
            })
            .await;
            if let Err(err) = updated {
                tracing::error!(%err, "failed to update device token");
                return token_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", "");
            }
            token_error(StatusCode::UNAUTHORIZED, "authorization_pending", "")
        }
        storage::DEVICE_TOKEN_COMPLETE => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(device_token.token))
            .unwrap(),
        status => {
            tracing::error!(%status, "unknown device token status");
            token_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "Unknown device token status",
            )
        }
    }
}

/// Consume the upstream authorization code and mint the token response that
/// gets attached to the device token.
async fn exchange_auth_code(
    state: &AppState,
    auth_code: &storage::AuthCode,
    client: &storage::Client,
) -> Result<TokenResponse, PerigeeError> {
    let now = state.clock.now();
    let consumed = storage::consume_auth_code(&state.db, &auth_code.code, now)
        .await?
        .ok_or_else(|| PerigeeError::Conflict("auth code already consumed".to_string()))?;

    let access = storage::issue_access_token(
        &state.db,
        &client.client_id,
        &consumed.subject,
        &consumed.scope,
        now,
        ACCESS_TOKEN_VALID_FOR_SECS,
    )
    .await?;

    let refresh_token = if consumed
        .scope
        .split_whitespace()
        .any(|scope| scope == "offline_access")
    {
        let refresh = storage::issue_refresh_token(
            &state.db,
            &client.client_id,
            &consumed.subject,
            &consumed.scope,
            now,
            REFRESH_TOKEN_VALID_FOR_SECS,
        )
        .await?;
        Some(refresh.token)
    } else {
        None
    };

    Ok(TokenResponse {
        access_token: access.token,
        token_type: "bearer".to_string(),
        expires_in: ACCESS_TOKEN_VALID_FOR_SECS,
        refresh_token,
        scope: consumed.scope,
    })
}

/// Seed an authorization code the way the upstream `/auth` flow would after
/// a completed login. The device subsystem itself only ever reads these.
pub async fn issue_upstream_auth_code(
    db: &DatabaseConnection,
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    subject: &str,
    now: i64,
) -> Result<storage::AuthCode, PerigeeError> {
    storage::issue_auth_code(
        db,
        client_id,
        redirect_uri,
        scope,
        subject,
        now,
        AUTH_CODE_VALID_FOR_SECS,
    )
    .await
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    scope: String,
}

async fn unsupported_method() -> Response {
    render_error(StatusCode::BAD_REQUEST, "Requested resource does not exist.")
}

async fn unsupported_token_method() -> Response {
    token_error(
        StatusCode::BAD_REQUEST,
        "invalid_request",
        "Invalid device code request type",
    )
}

fn token_error(status: StatusCode, error: &str, description: &str) -> Response {
    let mut body = json!({"error": error});
    if !description.is_empty() {
        body["error_description"] = json!(description);
    }
    (status, Json(body)).into_response()
}

fn json_with_headers(status: StatusCode, value: Value, headers: &[(&str, String)]) -> Response {
    let mut resp = (status, Json(value)).into_response();
    let h = resp.headers_mut();
    for (name, val) in headers {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(val),
        ) {
            h.insert(n, v);
        }
    }
    resp
}

fn found_redirect(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

fn url_append_query(mut base: String, params: &[(&str, String)]) -> String {
    let qs = serde_urlencoded::to_string(
        params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<Vec<(String, String)>>(),
    )
    .unwrap_or_default();
    if base.contains('?') {
        base.push('&');
    } else {
        base.push('?');
    }
    base.push_str(&qs);
    base
}

fn html_attr_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn render_error(status: StatusCode, message: &str) -> Response {
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Error</title>
    <style>
        body {{ font-family: sans-serif; max-width: 600px; margin: 50px auto; padding: 20px; }}
        .container {{ background: #f8d7da; border: 1px solid #f5c6cb; padding: 30px; border-radius: 8px; }}
        h1 {{ color: #721c24; margin-top: 0; }}
        p {{ color: #721c24; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Error</h1>
        <p>{}</p>
    </div>
</body>
</html>"#,
        html_attr_escape(message)
    );
    (status, Html(html)).into_response()
}

fn device_page_html(user_code: &str, invalid: bool) -> String {
    let invalid_banner = if invalid {
        r#"<div class="error">Invalid or expired user code. Please check the code on your device and try again.</div>"#
    } else {
        ""
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Device Verification</title>
    <style>
        body {{ font-family: sans-serif; max-width: 600px; margin: 50px auto; padding: 20px; }}
        .container {{ background: #f5f5f5; padding: 30px; border-radius: 8px; }}
        h1 {{ margin-top: 0; }}
        input {{ font-size: 18px; padding: 10px; width: 100%; box-sizing: border-box; margin: 10px 0; text-transform: uppercase; }}
        button {{ background: #007bff; color: white; border: none; padding: 12px 24px; font-size: 16px; border-radius: 4px; cursor: pointer; }}
        button:hover {{ background: #0056b3; }}
        .instructions {{ background: white; padding: 15px; border-left: 4px solid #007bff; margin-bottom: 20px; }}
        .error {{ background: #f8d7da; border-left: 4px solid #dc3545; color: #721c24; padding: 15px; margin-bottom: 20px; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Device Verification</h1>
        {}
        <div class="instructions">
            <p>Enter the code shown on your device to continue signing in.</p>
        </div>
        <form method="POST" action="/device/auth/verify_code">
            <input type="text" name="user_code" placeholder="Enter code" value="{}" maxlength="8" required autofocus>
            <button type="submit">Submit</button>
        </form>
    </div>
</body>
</html>"#,
        invalid_banner,
        html_attr_escape(user_code)
    )
}

fn device_success_html(client_name: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Login Successful</title>
    <style>
        body {{ font-family: sans-serif; max-width: 600px; margin: 50px auto; padding: 20px; }}
        .container {{ background: #d4edda; border: 1px solid #c3e6cb; padding: 30px; border-radius: 8px; text-align: center; }}
        h1 {{ color: #155724; margin-top: 0; }}
        p {{ color: #155724; font-size: 18px; }}
        .checkmark {{ font-size: 48px; color: #28a745; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="checkmark">&#10003;</div>
        <h1>Login Successful</h1>
        <p>You have logged in to {}. You can now return to your device and continue.</p>
    </div>
</body>
</html>"#,
        html_attr_escape(client_name)
    )
}
