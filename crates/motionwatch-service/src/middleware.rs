//! Shared-secret gate for the motionwatch API.
//!
//! Mutating requests (`POST`, `PUT`, `DELETE`) must carry the configured
//! password in the `X-Password` header or a `password` query parameter. Reads
//! are never gated. An empty configured password disables the gate.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, Request, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::config::SecurityConfig;

/// Header carrying the shared secret.
pub const PASSWORD_HEADER: &str = "X-Password";

#[derive(Debug, Deserialize)]
struct PasswordQuery {
    password: Option<String>,
}

/// Password gate middleware.
///
/// Returns 401 Unauthorized before any handler runs if the secret is missing
/// or wrong.
pub async fn password_gate(
    headers: HeaderMap,
    State(config): State<Arc<SecurityConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if !config.is_enabled() || !is_mutating(request.method()) {
        return next.run(request).await;
    }

    let provided = headers
        .get(PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| password_from_query(request.uri()));

    let valid = provided.is_some_and(|p| constant_time_eq(config.password.as_bytes(), p.as_bytes()));

    if valid {
        next.run(request).await
    } else {
        warn!(
            "Rejected {} {}: missing or wrong password",
            request.method(),
            request.uri().path()
        );
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": "Invalid or missing password",
                "hint": "Provide the password in the X-Password header or as a 'password' query parameter"
            })),
        )
            .into_response()
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::DELETE)
}

/// The percent-decoded `password` query parameter.
fn password_from_query(uri: &Uri) -> Option<String> {
    Query::<PasswordQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(query)| query.password)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
