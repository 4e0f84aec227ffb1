//! Per-request context: a request id for tracing plus the username
//! authenticated by the external identity layer.
//!
//! This core trusts the identity header; verifying it is the edge's job.

use std::str::FromStr;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use shared::config::server::Config;
use uuid::Uuid;

use crate::http::error::{ApiError, AppResult};

#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub username: Option<String>,
}

impl RequestContext {
    /// The authenticated username, or an `unauthorized` error when the
    /// identity layer supplied none.
    pub fn require_username(&self) -> Result<&str, ApiError> {
        self.username
            .as_deref()
            .ok_or_else(|| ApiError::unauthorized("missing authenticated identity"))
    }
}

#[derive(Clone)]
pub struct RequestContextState {
    request_id_header: HeaderName,
    identity_header: HeaderName,
}

impl RequestContextState {
    pub fn from_config(config: &Config) -> Self {
        let request_id_header = HeaderName::from_str(&config.server.request_id_header)
            .unwrap_or_else(|_| HeaderName::from_static("x-request-id"));
        let identity_header = HeaderName::from_str(&config.server.identity_header)
            .unwrap_or_else(|_| HeaderName::from_static("x-auth-username"));
        Self {
            request_id_header,
            identity_header,
        }
    }
}

pub async fn assign_request_context(
    State(state): State<RequestContextState>,
    mut request: Request<Body>,
    next: Next,
) -> AppResult<Response> {
    let request_id = header_value(request.headers(), &state.request_id_header)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let username = header_value(request.headers(), &state.identity_header);

    request.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
        username,
    });

    let mut response = next.run(request).await;
    response.headers_mut().insert(
        state.request_id_header,
        HeaderValue::from_str(&request_id)
            .map_err(|_| ApiError::internal_server_error("failed to encode request id"))?,
    );

    Ok(response)
}

fn header_value(headers: &HeaderMap, header: &HeaderName) -> Option<String> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
