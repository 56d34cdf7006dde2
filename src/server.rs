//! HTTP listener (spec.md's out-of-scope C9, grown in SPEC_FULL.md §11):
//! exposes the Gemini-shaped `streamGenerateContent`/`generateContent`
//! endpoints, decides bypass vs. sentinel-protocol dispatch, and relays
//! bypass requests upstream verbatim.

use axum::body::Body;
use axum::extract::{OriginalUri, Path, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_TYPE,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use reqwest::Client;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::engine;
use crate::nonstreaming;
use crate::protocol::is_allowlisted;
use crate::rewrite::build_upstream_request;

#[derive(Clone)]
pub struct AppState {
    pub client: Client,
    pub config: Config,
}

/// Build the Axum router: the two sentinel-protocol-capable routes plus
/// permissive CORS (which also answers `OPTIONS` preflight for any path
/// without needing an explicit route, per `tower_http::cors::CorsLayer`).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1beta/models/{model}:streamGenerateContent",
            post(stream_generate_content),
        )
        .route(
            "/v1beta/models/{model}:generateContent",
            post(generate_content),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// A structured-output request (`generationConfig.responseSchema` present)
/// never gets the sentinel-protocol treatment: the model is contractually
/// bound to its schema, so the `[RESPONSE_BEGIN]`/`[RESPONSE_FINISHED]`
/// instructions would only corrupt the output.
fn is_structured_output(body: &Value) -> bool {
    body.pointer("/generationConfig/responseSchema").is_some()
}

fn bypasses_engine(model: &str, body: &Value) -> bool {
    !is_allowlisted(model) || is_structured_output(body)
}

async fn stream_generate_content(
    State(state): State<AppState>,
    Path(model): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let url = format!("{}{}", state.config.upstream_url_base, uri);

    if bypasses_engine(&model, &body) {
        return relay_bypass(&state.client, &url, &headers, &body).await;
    }

    let user_agent = headers
        .get(reqwest::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let stream = engine::handle_streaming(
        state.client.clone(),
        state.config.clone(),
        url,
        model,
        headers,
        user_agent,
        body,
    );

    let mut response = Response::new(Body::from_stream(stream));
    let out_headers = response.headers_mut();
    out_headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    out_headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    out_headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    out_headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

async fn generate_content(
    State(state): State<AppState>,
    Path(model): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let url = format!("{}{}", state.config.upstream_url_base, uri);

    if bypasses_engine(&model, &body) {
        return relay_bypass(&state.client, &url, &headers, &body).await;
    }

    match nonstreaming::handle_non_streaming(
        &state.client,
        &state.config,
        &url,
        &model,
        &headers,
        body,
    )
    .await
    {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "non-streaming dispatch could not even start an attempt");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": err.user_message()})),
            )
                .into_response()
        }
    }
}

/// Forward a bypass request upstream with the same header-normalisation
/// rules the engine uses (spec.md §4.2's `buildUpstreamRequest`) but no body
/// rewriting, and relay the upstream response's status/content-type/body
/// back unchanged.
async fn relay_bypass(client: &Client, url: &str, headers: &HeaderMap, body: &Value) -> Response {
    let builder = match build_upstream_request(client, url, headers, body) {
        Ok(b) => b,
        Err(err) => {
            tracing::error!(error = %err, "failed to build bypass upstream request");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let upstream = match builder.send().await {
        Ok(r) => r,
        Err(err) => {
            tracing::warn!(error = %err, "bypass upstream request failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream.headers().get(reqwest::header::CONTENT_TYPE).cloned();

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    if let Some(ct) = content_type {
        response.headers_mut().insert(CONTENT_TYPE, ct);
    }
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_output_request_bypasses() {
        let body = json!({"generationConfig": {"responseSchema": {"type": "object"}}});
        assert!(bypasses_engine("gemini-2.5-pro", &body));
    }

    #[test]
    fn non_allowlisted_model_bypasses() {
        let body = json!({});
        assert!(bypasses_engine("gemini-1.5-pro", &body));
    }

    #[test]
    fn allowlisted_plain_request_does_not_bypass() {
        let body = json!({"contents": []});
        assert!(!bypasses_engine("gemini-2.5-flash", &body));
    }
}
