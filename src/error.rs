//! Typed errors for build, shape, and execution phases, plus HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Raised while building a route descriptor. Always fatal for that route;
/// nothing is cached on failure.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("undeclared parameter {{{{{name}}}}} in {branch}.sql")]
    UndeclaredParameter { branch: String, name: String },
    #[error("{branch}: use_parent_rows requires the parent branch to declare partition_by")]
    MissingPartitionBy { branch: String },
    #[error("{branch}: cache and use_parent_rows cannot both be set")]
    CacheWithParentRows { branch: String },
    #[error("no templates found under {0}")]
    NoTemplates(String),
    #[error("invalid model for {path}: {message}")]
    InvalidModel { path: String, message: String },
}

#[derive(Error, Debug)]
pub enum ShapeError {
    #[error("{0} is a reserved key")]
    ReservedKey(String),
    #[error("input expected as array, object was given")]
    ExpectedArray,
    #[error("input expected as object, array was given")]
    ExpectedObject,
    #[error("cannot coerce {prop} to {expected}")]
    Coerce { prop: String, expected: &'static str },
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("connection '{0}' is not configured")]
    UnknownConnection(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("provider: {0}")]
    Provider(String),
    #[error("partition key '{key}' missing from row")]
    PartitionKeyMissing { key: String },
    #[error("'{0}' mapped column missing from row")]
    MappedColumnMissing(String),
    #[error("invalid json in control row: {0}")]
    ControlJson(String),
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Web-layer error. Validation failures and twig `error` rows are not
/// errors at this level; they travel back as regular responses with a
/// client status code.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl From<ShapeError> for ApiError {
    fn from(e: ShapeError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Build(_) => (StatusCode::INTERNAL_SERVER_ERROR, "build_error"),
            ApiError::Execution(ExecutionError::Db(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error")
            }
            ApiError::Execution(_) => (StatusCode::INTERNAL_SERVER_ERROR, "execution_error"),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
