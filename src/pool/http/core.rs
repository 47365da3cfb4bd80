use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{
    ActivityEvent, AddedCredential, BulkValidationReport, Credential, CredentialOrigin, HealthStatus, KeyPool,
    PoolStats, UsageAggregate, UsageLedger, UsageReport, ValidationReport, ValidationScope,
};
use crate::PoolError;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// What the caller proved about itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperatorAssertion {
    pub is_operator: bool,
    pub can_write: bool,
}

impl OperatorAssertion {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn reader() -> Self {
        Self {
            is_operator: true,
            can_write: false,
        }
    }

    pub fn writer() -> Self {
        Self {
            is_operator: true,
            can_write: true,
        }
    }
}

/// Turns request headers into an [`OperatorAssertion`]. Identity management
/// lives outside the pool; this is the only seam it crosses.
pub trait OperatorAuthority: Send + Sync {
    fn assert(&self, headers: &HeaderMap) -> OperatorAssertion;
}

/// Static bearer / `x-admin-token` tokens: one read-write, one read-only.
#[derive(Clone, Default)]
pub struct StaticTokenAuthority {
    write_token: Option<String>,
    read_token: Option<String>,
}

impl std::fmt::Debug for StaticTokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenAuthority")
            .field("write_token", &self.write_token.as_ref().map(|_| "<redacted>"))
            .field("read_token", &self.read_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StaticTokenAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_token(mut self, token: impl Into<String>) -> Self {
        self.write_token = Some(token.into());
        self
    }

    pub fn with_read_token(mut self, token: impl Into<String>) -> Self {
        self.read_token = Some(token.into());
        self
    }

    pub fn is_configured(&self) -> bool {
        self.write_token.is_some() || self.read_token.is_some()
    }
}

impl OperatorAuthority for StaticTokenAuthority {
    fn assert(&self, headers: &HeaderMap) -> OperatorAssertion {
        let Some(provided) =
            extract_bearer(headers).or_else(|| extract_header(headers, "x-admin-token"))
        else {
            return OperatorAssertion::anonymous();
        };

        if self
            .write_token
            .as_deref()
            .is_some_and(|expected| provided == expected)
        {
            return OperatorAssertion::writer();
        }
        if self
            .read_token
            .as_deref()
            .is_some_and(|expected| provided == expected)
        {
            return OperatorAssertion::reader();
        }
        OperatorAssertion::anonymous()
    }
}

#[derive(Clone)]
pub struct PoolHttpState {
    pool: KeyPool,
    tokens: StaticTokenAuthority,
    authority: Option<Arc<dyn OperatorAuthority>>,
}

impl PoolHttpState {
    pub fn new(pool: KeyPool) -> Self {
        Self {
            pool,
            tokens: StaticTokenAuthority::new(),
            authority: None,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.tokens = self.tokens.with_write_token(token);
        self
    }

    pub fn with_admin_read_token(mut self, token: impl Into<String>) -> Self {
        self.tokens = self.tokens.with_read_token(token);
        self
    }

    /// Replaces token auth with a custom authority.
    pub fn with_operator_authority(mut self, authority: impl OperatorAuthority + 'static) -> Self {
        self.authority = Some(Arc::new(authority));
        self
    }

    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }

    fn has_operator_auth(&self) -> bool {
        self.authority.is_some() || self.tokens.is_configured()
    }

    fn operator_assertion(&self, headers: &HeaderMap) -> OperatorAssertion {
        match self.authority.as_ref() {
            Some(authority) => authority.assert(headers),
            None => self.tokens.assert(headers),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

type HttpError = (StatusCode, Json<ErrorResponse>);

/// Error body on the client-facing routes: a plain message, plus the
/// validator's reason when a donation is rejected.
#[derive(Debug, Serialize)]
struct PublicErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

type PublicError = (StatusCode, Json<PublicErrorResponse>);

pub fn router(state: PoolHttpState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/v1/credential", get(allocate_credential))
        .route("/v1/donate", post(donate_credential));

    if state.has_operator_auth() {
        router = router
            .route(
                "/admin/credentials",
                get(list_credentials).post(add_credential),
            )
            .route(
                "/admin/credentials/:id",
                patch(update_credential).delete(delete_credential),
            )
            .route(
                "/admin/credentials/:id/validate",
                post(validate_credential),
            )
            .route(
                "/admin/credentials/:id/reactivate",
                post(reactivate_credential),
            )
            .route("/admin/validate-all", post(validate_all_credentials))
            .route("/admin/stats", get(pool_stats))
            .route("/admin/usage", get(usage_report))
            .route("/admin/ledger", get(instance_ledger))
            .route("/admin/ledgers/aggregate", get(aggregate_ledgers))
            .route("/admin/activity", get(recent_activity));
    }

    router.with_state(state)
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> HttpError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}

fn map_pool_error(err: PoolError) -> HttpError {
    match err {
        PoolError::NoCredentialsAvailable { .. } => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no_credentials",
            "no credentials available, retry later",
        ),
        PoolError::ValidationFailed { reason } => error_response(
            StatusCode::BAD_REQUEST,
            "validation_failed",
            format!("invalid credential: {reason}"),
        ),
        PoolError::DuplicateCredential => error_response(
            StatusCode::CONFLICT,
            "duplicate_credential",
            "this credential is already in the pool",
        ),
        PoolError::CredentialNotFound { id } => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("credential not found: {id}"),
        ),
        PoolError::InvalidRequest { reason } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", reason)
        }
        PoolError::StoreUnavailable(err) => {
            tracing::error!(error = %err, "credential store unavailable");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "credential store unavailable",
            )
        }
        PoolError::Join(err) => {
            tracing::error!(error = %err, "pool task failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "credential store unavailable",
            )
        }
    }
}

fn public_error(
    status: StatusCode,
    error: impl Into<String>,
    details: Option<String>,
) -> PublicError {
    (
        status,
        Json(PublicErrorResponse {
            error: error.into(),
            details,
        }),
    )
}

fn map_public_error(err: PoolError) -> PublicError {
    match err {
        PoolError::NoCredentialsAvailable { .. } => public_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no credentials available, retry later",
            None,
        ),
        PoolError::ValidationFailed { reason } => {
            public_error(StatusCode::BAD_REQUEST, "invalid credential", Some(reason))
        }
        PoolError::DuplicateCredential => public_error(
            StatusCode::BAD_REQUEST,
            "this credential has already been donated",
            None,
        ),
        PoolError::InvalidRequest { reason } => public_error(StatusCode::BAD_REQUEST, reason, None),
        PoolError::CredentialNotFound { id } => public_error(
            StatusCode::NOT_FOUND,
            format!("credential not found: {id}"),
            None,
        ),
        PoolError::StoreUnavailable(err) => {
            tracing::error!(error = %err, "credential store unavailable");
            public_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "credential store unavailable",
                None,
            )
        }
        PoolError::Join(err) => {
            tracing::error!(error = %err, "pool task failed");
            public_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "credential store unavailable",
                None,
            )
        }
    }
}

fn reject_public_body(rejection: JsonRejection) -> PublicError {
    public_error(
        StatusCode::BAD_REQUEST,
        "invalid request body",
        Some(rejection.body_text()),
    )
}

fn reject_admin_body(rejection: JsonRejection) -> HttpError {
    error_response(
        StatusCode::BAD_REQUEST,
        "invalid_request",
        rejection.body_text(),
    )
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("keypool-{}-{seq}", super::now_millis())
}

fn request_id_headers(request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }
    headers
}
