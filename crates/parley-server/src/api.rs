//! HTTP API: accounts, history and presence lookups.

use crate::auth;
use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_core::{validate_username, Message, StoreError};
use parley_protocol::PresenceStatus;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

/// Errors returned by the HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Username already taken")]
    UsernameTaken,

    /// Malformed body or rejected field.
    #[error("{0}")]
    Invalid(String),

    #[error("User not found")]
    UserNotFound,

    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Store or hashing failure. Only `message` reaches the client.
    #[error("{message}")]
    Internal {
        message: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl ApiError {
    fn internal(message: &'static str, source: impl Into<anyhow::Error>) -> Self {
        ApiError::Internal {
            message,
            source: source.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::UsernameTaken | ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiError::UserNotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Internal { message, source } => {
                error!(error = ?source, "{}", message);
                metrics::record_error("api");
                json!({ "error": message })
            }
            other => json!({ "message": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Invalid(rejection.body_text())
    }
}

/// Body of `/signup` and `/login`.
#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    fn validate(&self) -> Result<(), ApiError> {
        validate_username(&self.username).map_err(|reason| ApiError::Invalid(reason.to_string()))?;
        if self.password.is_empty() {
            return Err(ApiError::Invalid("Password must not be empty".to_string()));
        }
        Ok(())
    }
}

/// `POST /signup`
pub async fn signup(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(credentials) = body?;
    credentials.validate()?;

    let identities = state.relay.identities();
    let existing = identities
        .find(&credentials.username)
        .await
        .map_err(|e| ApiError::internal("Signup failed", e))?;
    // A bare `register` leaves an identity without a credential; signup claims it.
    if existing.is_some_and(|identity| identity.credential_hash.is_some()) {
        return Err(ApiError::UsernameTaken);
    }

    let hash = auth::hash_password(credentials.password, state.config.auth.bcrypt_cost)
        .await
        .map_err(|e| ApiError::internal("Signup failed", e))?;

    let claimed = match identities.create(&credentials.username, &hash).await {
        Ok(_) => true,
        Err(StoreError::Conflict(_)) => identities
            .set_credential_if_absent(&credentials.username, &hash)
            .await
            .map_err(|e| ApiError::internal("Signup failed", e))?,
        Err(e) => return Err(ApiError::internal("Signup failed", e)),
    };
    // Lost a race with a concurrent signup for the same name.
    if !claimed {
        return Err(ApiError::UsernameTaken);
    }

    info!(username = %credentials.username, "User created");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "User created", "username": credentials.username })),
    ))
}

/// `POST /login`
pub async fn login(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(credentials) = body?;

    let identity = state
        .relay
        .identities()
        .find(&credentials.username)
        .await
        .map_err(|e| ApiError::internal("Login failed", e))?
        .ok_or(ApiError::UserNotFound)?;

    // Identities created by a bare `register` have no credential and can't log in.
    let Some(hash) = identity.credential_hash else {
        return Err(ApiError::InvalidCredentials);
    };

    let valid = auth::verify_password(credentials.password, hash)
        .await
        .map_err(|e| ApiError::internal("Login failed", e))?;
    if !valid {
        debug!(username = %credentials.username, "Rejected login");
        return Err(ApiError::InvalidCredentials);
    }

    Ok(Json(
        json!({ "message": "Login successful", "username": credentials.username }),
    ))
}

/// `GET /messages/:user1/:user2`
pub async fn messages(
    State(state): State<Arc<AppState>>,
    Path((user1, user2)): Path<(String, String)>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let history = state
        .relay
        .log()
        .history(&user1, &user2)
        .await
        .map_err(|e| ApiError::internal("Failed to fetch messages", e))?;
    Ok(Json(history))
}

/// `GET /status/:username`
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Response, ApiError> {
    let identity = state
        .relay
        .identities()
        .find(&username)
        .await
        .map_err(|e| ApiError::internal("Failed to fetch status", e))?;

    Ok(match identity {
        Some(identity) => {
            Json(json!({ "status": PresenceStatus::from_online(identity.is_online) }))
                .into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": PresenceStatus::Offline })),
        )
            .into_response(),
    })
}

/// `GET /user/:username`
pub async fn user(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Response, ApiError> {
    let identity = state
        .relay
        .identities()
        .find(&username)
        .await
        .map_err(|e| ApiError::internal("Failed to fetch user", e))?;

    Ok(match identity {
        Some(_) => Json(json!({ "user": "exists" })).into_response(),
        None => (StatusCode::CONFLICT, Json(json!({ "user": "user not found" }))).into_response(),
    })
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.relay.stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "online": stats.online_count,
    }))
}
