//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Startup errors. Any of these aborts boot before traffic is served.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing {kind} metadata on {target}")]
    MissingMetadata { kind: &'static str, target: String },
    #[error("controller {0} is registered more than once")]
    DuplicateController(String),
    #[error("controller {controller} has no handler for route '{route}'")]
    MissingHandler { controller: String, route: String },
    #[error("route {method} {path} is declared more than once")]
    DuplicateRoute { method: String, path: String },
    #[error("route {path} conflicts with {other}")]
    RouteConflict { path: String, other: String },
    #[error("invalid pattern for {field}: {reason}")]
    InvalidPattern { field: String, reason: String },
    #[error("model {model}: {reason}")]
    InvalidModel { model: String, reason: String },
    #[error("model {model}: association '{field}' targets unknown model '{target}'")]
    UnknownAssociationTarget {
        model: String,
        field: String,
        target: String,
    },
    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
    #[error("config load: {0}")]
    Load(String),
}

#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("no provider registered for {0}")]
    NotRegistered(&'static str),
    #[error("cyclic dependency while resolving {0}")]
    Cycle(&'static str),
    #[error("cannot construct {target}: {reason}")]
    Construction { target: &'static str, reason: String },
}

/// Query rewriting failures. Raised per request and surfaced as a handled route error.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("unknown field '{field}' on {model}")]
    UnknownField { model: String, field: String },
    #[error("unsupported query on {model}: {reason}")]
    UnsupportedQuery { model: String, reason: String },
    #[error("'{field}' on {model} has no identifier")]
    MissingIdentifier { model: String, field: String },
    #[error("{operation} on {model} requires a where clause")]
    EmptyWhere { model: String, operation: &'static str },
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("handler: {0}")]
    Handler(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::Resolution(_) => (StatusCode::INTERNAL_SERVER_ERROR, "resolution_error"),
            AppError::Query(QueryError::UnknownField { .. }) => (StatusCode::BAD_REQUEST, "unknown_field"),
            AppError::Query(QueryError::UnsupportedQuery { .. }) => (StatusCode::BAD_REQUEST, "unsupported_query"),
            AppError::Query(_) => (StatusCode::BAD_REQUEST, "bad_query"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            AppError::Db(e) => {
                if let sqlx::Error::RowNotFound = e {
                    (StatusCode::NOT_FOUND, "not_found")
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "database_error")
                }
            }
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::Handler(_) => (StatusCode::INTERNAL_SERVER_ERROR, "handler_error"),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
        }
    }

    /// Error envelope written into a route response.
    pub fn body(&self) -> ErrorBody {
        let (_, code) = self.status_and_code();
        ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details: None,
            },
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, _) = self.status_and_code();
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_errors_are_client_errors() {
        let err = AppError::from(QueryError::UnsupportedQuery {
            model: "Post".into(),
            reason: "has-one field 'cover' in where".into(),
        });
        assert_eq!(err.status_and_code(), (StatusCode::BAD_REQUEST, "unsupported_query"));

        let err = AppError::from(QueryError::UnknownField {
            model: "Post".into(),
            field: "nope".into(),
        });
        assert_eq!(err.status_and_code().0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn startup_errors_name_the_offender() {
        let err = ConfigError::MissingHandler {
            controller: "WidgetController".into(),
            route: "create".into(),
        };
        assert_eq!(err.to_string(), "controller WidgetController has no handler for route 'create'");
    }
}
