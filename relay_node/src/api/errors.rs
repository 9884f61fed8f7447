//! Error bodies for the RPC surface

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, ErrorKind};
use crate::types::DispatchResponse;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub message: String,
}

impl ApiError {
    pub fn new(code: u16, message: String) -> Self {
        Self {
            code,
            kind: None,
            message,
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(400, message.to_string())
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(404, message.to_string())
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "API Error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// `{ "error": {code, kind, message}, "dispatch"? }`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ApiError,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<DispatchResponse>,
}

impl ErrorResponse {
    pub fn new(error: ApiError) -> Self {
        Self { error, dispatch: None }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.error.status(), Json(self)).into_response()
    }
}

pub fn status_for(err: &Error) -> StatusCode {
    match (err.kind(), err) {
        (_, Error::OverService { .. }) => StatusCode::TOO_MANY_REQUESTS,
        (_, Error::UpstreamTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        (ErrorKind::Input | ErrorKind::Crypto | ErrorKind::Policy, _) => StatusCode::BAD_REQUEST,
        (ErrorKind::Upstream, _) => StatusCode::BAD_GATEWAY,
        (ErrorKind::Storage | ErrorKind::Protocol, _) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for ErrorResponse {
    fn from(err: Error) -> Self {
        let error = ApiError {
            code: status_for(&err).as_u16(),
            kind: Some(err.kind()),
            message: err.to_string(),
        };
        let dispatch = match err {
            Error::InvalidSession { dispatch, .. } => dispatch.map(|d| *d),
            _ => None,
        };
        Self { error, dispatch }
    }
}

impl From<ApiError> for ErrorResponse {
    fn from(error: ApiError) -> Self {
        Self::new(error)
    }
}

impl From<JsonRejection> for ErrorResponse {
    fn from(rejection: JsonRejection) -> Self {
        let mut error = ApiError::bad_request(&format!("JSON parsing error: {}", rejection.body_text()));
        error.kind = Some(ErrorKind::Input);
        Self::new(error)
    }
}

pub type ApiResult<T> = std::result::Result<T, ErrorResponse>;
