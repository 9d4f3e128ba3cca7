use crate::budget::{apply_budget, token_budget, RESPONSE_RESERVE_FRACTION};
use crate::error::{ProxyError, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, HeaderName, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use broker_model_cache::ModelContextCache;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PROXY_BIND: &str = "127.0.0.1:1235";

/// Completion endpoints whose `max_tokens` is rewritten. Everything else is
/// forwarded untouched.
pub const REWRITE_PATHS: [&str; 2] = ["/v1/chat/completions", "/v1/completions"];

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Transparent forwarding proxy in front of an OpenAI-compatible server.
///
/// Holds no per-request state; the model cache is the only thing shared
/// between requests.
pub struct ContextProxy {
    cache: Arc<ModelContextCache>,
    upstream: String,
    http: reqwest::Client,
    reserve_fraction: f64,
}

impl ContextProxy {
    pub fn new(cache: Arc<ModelContextCache>, upstream: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                log::warn!("Falling back to default HTTP client: {err}");
                reqwest::Client::new()
            });
        Self {
            cache,
            upstream: upstream.into().trim_end_matches('/').to_string(),
            http,
            reserve_fraction: RESPONSE_RESERVE_FRACTION,
        }
    }

    pub fn with_reserve_fraction(mut self, reserve_fraction: f64) -> Self {
        self.reserve_fraction = reserve_fraction;
        self
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn reserve_fraction(&self) -> f64 {
        self.reserve_fraction
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/proxy/health", get(health))
            .fallback(forward)
            .with_state(self)
    }

    /// Forward one request, rewriting the token budget of completion calls.
    pub async fn handle(&self, request: Request) -> Result<Response> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| ProxyError::Body(e.to_string()))?;

        let body = if parts.method == Method::POST && REWRITE_PATHS.contains(&parts.uri.path()) {
            self.optimize(body).await?
        } else {
            body
        };

        let target = format!(
            "{}{}",
            self.upstream,
            parts.uri.path_and_query().map_or("/", |pq| pq.as_str())
        );
        let upstream = self
            .http
            .request(parts.method, target)
            .headers(forwarded_headers(&parts.headers))
            .body(body)
            .send()
            .await
            .map_err(|err| {
                log::warn!("Error forwarding request to {}: {err}", self.upstream);
                ProxyError::Upstream(err)
            })?;
        Ok(stream_back(upstream))
    }

    /// Rewrite `max_tokens` in a completion body. Cache failures and bodies
    /// without a model fall through unmodified.
    pub async fn optimize(&self, body: Bytes) -> Result<Bytes> {
        let mut json: Value = serde_json::from_slice(&body)?;
        let Some(object) = json.as_object_mut() else {
            return Ok(body);
        };
        let Some(model_id) = object.get("model").and_then(Value::as_str).map(str::to_string) else {
            return Ok(body);
        };

        let cached = match self.cache.get(&model_id).await {
            Ok(cached) => cached,
            Err(err) => {
                log::debug!("No context window for {model_id} ({err}); forwarding unmodified");
                return Ok(body);
            }
        };

        let context_window = cached.descriptor.context_window;
        let budget = token_budget(context_window, self.reserve_fraction);
        let decision = apply_budget(object, budget);
        if !decision.rewrote() {
            return Ok(body);
        }
        log::info!(
            "Optimized request for {model_id}: {decision} (context window: {context_window}{})",
            if cached.stale { ", stale" } else { "" }
        );
        Ok(Bytes::from(serde_json::to_vec(&json)?))
    }
}

async fn forward(State(proxy): State<Arc<ContextProxy>>, request: Request) -> Response {
    match proxy.handle(request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn health(State(proxy): State<Arc<ContextProxy>>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "upstream": proxy.upstream,
        "cached_models": proxy.cache.len(),
        "reserve_fraction": proxy.reserve_fraction,
    }))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Relay status, headers and body as the upstream produces them.
fn stream_back(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::with_capacity(upstream.headers().len());
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name) || name == CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn hop_by_hop_and_length_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("localhost:1235"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("authorization", HeaderValue::from_static("Bearer lm-studio"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let out = forwarded_headers(&headers);
        assert_eq!(out.len(), 2);
        assert!(out.contains_key("authorization"));
        assert!(out.contains_key("content-type"));
    }
}
