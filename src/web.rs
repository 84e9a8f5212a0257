//! HTTP surface. A thin axum router over [`Arbor`]: the catch-all `/api`
//! handler turns the HTTP request into a [`RequestInput`], runs the engine,
//! and copies the context's response status, headers and cookies back out.
//! The engine itself never sees an axum type.

use crate::app::{ApiResult, Arbor};
use crate::context::RequestInput;
use crate::error::ApiError;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub fn api_router(app: Arc<Arbor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/_debug", get(debug_descriptor))
        .route("/_clear/cache", post(clear_cache))
        .route(
            "/api/",
            get(serve_root)
                .post(serve_root)
                .put(serve_root)
                .patch(serve_root)
                .delete(serve_root),
        )
        .route(
            "/api/*path",
            get(serve).post(serve).put(serve).patch(serve).delete(serve),
        )
        .with_state(app)
}

async fn health() -> &'static str {
    ""
}

async fn version() -> Json<Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn debug_descriptor(
    State(app): State<Arc<Arbor>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let (Some(route), Some(method)) = (params.get("route"), params.get("method")) else {
        return Err(ApiError::NotFound("route and method required".to_string()));
    };
    let path = route.trim_start_matches("/api/").trim_start_matches('/');
    app.describe(path, method).map(Json)
}

async fn clear_cache(State(app): State<Arc<Arbor>>) -> Json<Value> {
    app.clear_cache();
    Json(serde_json::json!({ "ok": true }))
}

async fn serve_root(
    state: State<Arc<Arbor>>,
    method: Method,
    query: Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    run(state, method, String::new(), query, headers, body).await
}

async fn serve(
    state: State<Arc<Arbor>>,
    method: Method,
    Path(path): Path<String>,
    query: Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    run(state, method, path, query, headers, body).await
}

async fn run(
    State(app): State<Arc<Arbor>>,
    method: Method,
    path: String,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let input = RequestInput {
        payload: read_payload(&headers, &body)?,
        query: params
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
        path_values: Map::new(),
        header: Some(Value::Object(header_map(&headers))),
        cookie: Some(Value::Object(cookie_map(&headers))),
        request_id: Some(uuid::Uuid::new_v4().to_string()),
    };

    let result = app.execute(method.as_str(), &path, input).await?;
    Ok(into_response(result))
}

fn read_payload(headers: &HeaderMap, body: &Bytes) -> Result<Option<Value>, ApiError> {
    if body.is_empty() {
        return Ok(None);
    }
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ApiError::BadRequest(format!("invalid json body: {e}")))
}

fn header_map(headers: &HeaderMap) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            out.insert(name.as_str().to_string(), Value::String(v.to_string()));
        }
    }
    out
}

fn cookie_map(headers: &HeaderMap) -> Map<String, Value> {
    let mut out = Map::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, v)) = pair.trim().split_once('=') {
                out.insert(name.to_string(), Value::String(v.to_string()));
            }
        }
    }
    out
}

fn into_response(result: ApiResult) -> Response {
    let status = StatusCode::from_u16(result.status).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(result.body)).into_response();

    for (name, value) in result.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    for (name, row) in result.cookies {
        if let Ok(value) = HeaderValue::try_from(set_cookie(&name, &row)) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

/// Cookie rows carry `value` plus optional `path` and `expires` attributes.
fn set_cookie(name: &str, row: &Value) -> String {
    let value = match row.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => String::new(),
    };
    let mut cookie = format!("{name}={value}");
    if let Some(Value::String(path)) = row.get("path") {
        cookie.push_str("; Path=");
        cookie.push_str(path);
    }
    if let Some(Value::String(expires)) = row.get("expires") {
        cookie.push_str("; Expires=");
        cookie.push_str(expires);
    }
    cookie
}
