//! Request extractors and the error response of the HTTP surface.

use axum::{
    Json,
    extract::{
        FromRequestParts,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use model::{Actor, Role};
use serde::Serialize;
use service::ServiceError;
use tracing::error;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const CALLBACK_TOKEN_HEADER: &str = "x-callback-token";

/// Error returned by every handler, rendered as `{"code", "message"}`.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self.0 {
            ServiceError::Internal(detail) => {
                error!(error = %detail, "Request failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            code: self.0.code(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ServiceError::BadRequest(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(ServiceError::BadRequest(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(ServiceError::BadRequest(rejection.body_text()))
    }
}

/// The authenticated caller, as asserted by the upstream proxy headers.
#[derive(Debug, Clone)]
pub struct Caller(pub Actor);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers)
            .map(Caller)
            .ok_or_else(|| {
                ApiError(ServiceError::Unauthorized(
                    "missing or invalid caller identity".into(),
                ))
            })
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Identity from the proxy headers. The role defaults to a plain user.
pub fn actor_from_headers(headers: &HeaderMap) -> Option<Actor> {
    let user_id = Uuid::parse_str(header(headers, USER_ID_HEADER)?).ok()?;
    let email = header(headers, USER_EMAIL_HEADER)?.to_string();
    let role = match header(headers, USER_ROLE_HEADER) {
        Some(raw) => raw.parse::<Role>().ok()?,
        None => Role::User,
    };
    Some(Actor {
        user_id,
        email,
        role,
    })
}

/// Value of the callback token header, empty when absent.
pub fn callback_token(headers: &HeaderMap) -> &str {
    header(headers, CALLBACK_TOKEN_HEADER).unwrap_or_default()
}
