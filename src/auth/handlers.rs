use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{header::LOCATION, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        dto::{AuthResponse, CallbackQuery, LoginRequest, MeResponse, MessageResponse, SignupRequest},
        extractors::AuthUser,
    },
    error::AuthError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/google/callback", get(google_callback))
        .route("/me", get(me))
}

fn unreadable_body(rejection: JsonRejection) -> AuthError {
    warn!(error = %rejection, "unreadable request body");
    AuthError::validation("Invalid request body")
}

fn session_headers(state: &AppState, token: &str) -> Result<HeaderMap, AuthError> {
    let mut headers = HeaderMap::new();
    state.cookies.attach(&mut headers, token)?;
    Ok(headers)
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> Result<(StatusCode, HeaderMap, Json<AuthResponse>), AuthError> {
    let Json(req) = payload.map_err(unreadable_body)?;
    let session = state.auth.signup(req).await?;
    let headers = session_headers(&state, &session.token)?;

    Ok((
        StatusCode::CREATED,
        headers,
        Json(AuthResponse {
            success: true,
            message: "Account created successfully",
            user: session.user,
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<AuthResponse>), AuthError> {
    let Json(req) = payload.map_err(unreadable_body)?;
    let session = state.auth.login(req).await?;
    let headers = session_headers(&state, &session.token)?;

    Ok((
        headers,
        Json(AuthResponse {
            success: true,
            message: "Login successful",
            user: session.user,
        }),
    ))
}

/// Clears the session cookie. The token itself stays valid until it expires.
#[instrument(skip(state))]
pub async fn logout(
    State(state): State<AppState>,
) -> Result<(HeaderMap, Json<MessageResponse>), AuthError> {
    let mut headers = HeaderMap::new();
    state.cookies.clear(&mut headers)?;
    info!("session cookie cleared");

    Ok((
        headers,
        Json(MessageResponse {
            success: true,
            message: "Logged out successfully",
        }),
    ))
}

async fn complete_oauth(
    state: &AppState,
    query: Result<Query<CallbackQuery>, QueryRejection>,
    headers: &HeaderMap,
) -> Result<HeaderMap, AuthError> {
    let Query(query) = query.map_err(|rejection| {
        warn!(error = %rejection, "unreadable oauth callback query");
        AuthError::validation("Invalid callback query")
    })?;
    if let Some(reason) = query.error {
        warn!(reason = %reason, "provider reported an oauth error");
        return Err(AuthError::validation("OAuth sign-in was not completed"));
    }

    let profile = state.profiles.resolve(headers).await.map_err(|e| {
        warn!(error = %e, "oauth profile unavailable");
        AuthError::validation("OAuth profile unavailable")
    })?;

    let session = state.auth.oauth_callback(profile).await?;
    session_headers(state, &session.token)
}

fn found(mut headers: HeaderMap, location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            headers.insert(LOCATION, value);
            (StatusCode::FOUND, headers).into_response()
        }
        Err(e) => {
            error!(error = %e, location, "unusable redirect target");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Browser-navigated: every outcome is a redirect, never a JSON error.
#[instrument(skip_all)]
pub async fn google_callback(
    State(state): State<AppState>,
    query: Result<Query<CallbackQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Response {
    match complete_oauth(&state, query, &headers).await {
        Ok(cookie) => found(cookie, &state.config.dashboard_url()),
        Err(e @ AuthError::Internal(_)) => {
            error!(error = %e, "oauth callback failed");
            found(HeaderMap::new(), &state.config.oauth_failure_url())
        }
        Err(e) => {
            warn!(error = %e, "oauth callback rejected");
            found(HeaderMap::new(), &state.config.oauth_failure_url())
        }
    }
}

#[instrument(skip_all)]
pub async fn me(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<Json<MeResponse>, AuthError> {
    let user = state.auth.user_for_session(&claims).await?;
    Ok(Json(MeResponse {
        success: true,
        user,
    }))
}
