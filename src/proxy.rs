//! Inference request router.
//!
//! Resolves the `model` field of each request to a running instance,
//! enforces the instance's concurrency limit, and proxies the HTTP
//! exchange. OpenAI-shaped routes are forwarded byte-for-byte; the
//! Anthropic route converts in both directions through [`crate::translate`].
//!
//! Concurrency permits are tied to the response body, not the handler:
//! a streamed response holds its permit until the last byte is consumed.

use crate::error::{Error, Result};
use crate::registry::{Instance, InstanceRegistry, InstanceState};
use crate::translate::{self, request::convert_request, response::convert_response};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, Response, StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use http_body::Frame;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

/// Headers never forwarded by proxies (RFC 2616 §13.5.1).
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Shared router state: instance lookup, per-instance gates, and the
/// upstream HTTP client.
#[derive(Clone)]
pub struct ProxyState {
    registry: Arc<InstanceRegistry>,
    client: Client<HttpConnector, Body>,
    gates: Arc<DashMap<String, Arc<Semaphore>>>,
}

impl ProxyState {
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self {
            registry,
            client: Client::builder(TokioExecutor::new()).build_http(),
            gates: Arc::new(DashMap::new()),
        }
    }

    /// Resolve a running instance for a client-supplied model name.
    async fn resolve(&self, model: &str) -> Result<Instance> {
        let instance = self
            .registry
            .resolve_model(model)
            .await
            .ok_or_else(|| Error::NotFound(format!("no running instance found for model: {}", model)))?;
        if instance.state != InstanceState::Running {
            return Err(Error::Unhealthy(format!(
                "model instance is not running (state: {})",
                instance.state
            )));
        }
        Ok(instance)
    }

    /// Acquire a concurrency permit when the instance is limited. Waits for
    /// a free slot; dropping the future (client disconnect) leaves no
    /// token behind.
    async fn acquire(&self, instance: &Instance) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(limit) = instance.max_concurrent.filter(|m| *m > 0) else {
            return Ok(None);
        };
        let sem = self
            .gates
            .entry(instance.id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone();
        // The guard decrements even when the wait is cancelled mid-await.
        let _depth = QueueDepthGuard(instance.id.clone());
        metrics::gauge!("xw_request_queue_depth", "instance" => instance.id.clone()).increment(1.0);
        let permit = sem.acquire_owned().await;
        permit
            .map(Some)
            .map_err(|_| Error::Internal("concurrency gate closed".into()))
    }

    /// Forward a request to the instance's port, returning the raw upstream
    /// response. No outer timeout: the caller's cancellation is the only
    /// bound.
    async fn forward(
        &self,
        method: axum::http::Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
        port: u16,
    ) -> Result<Response<hyper::body::Incoming>> {
        let uri: Uri = format!("http://127.0.0.1:{}{}", port, path_and_query)
            .parse()
            .map_err(|e| Error::Internal(format!("invalid upstream URI: {}", e)))?;

        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body))
            .map_err(|e| Error::Internal(e.to_string()))?;

        copy_filtered_headers(headers, req.headers_mut());
        req.headers_mut().remove(header::HOST);
        if !req.headers().contains_key(header::CONTENT_TYPE) {
            req.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/json"),
            );
        }

        self.client
            .request(req)
            .await
            .map_err(|e| Error::Upstream(format!("backend unreachable: {}", e)))
    }
}

/// Copy headers from `src` to `dst`, dropping the hop-by-hop set.
fn copy_filtered_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

/// Routes served by the inference proxy.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(proxy_openai))
        .route("/v1/completions", post(proxy_openai))
        .route("/v1/embeddings", post(proxy_openai))
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

/// Only the fields needed for routing and stream detection.
#[derive(Debug, Deserialize)]
struct MinimalRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    stream: bool,
}

// ---------------------------------------------------------------------------
// OpenAI pass-through
// ---------------------------------------------------------------------------

async fn proxy_openai(State(state): State<ProxyState>, req: Request<Body>) -> Response<Body> {
    let started = Instant::now();
    metrics::counter!("xw_requests_total").increment(1);

    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "Failed to read request body");
            return openai_error(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let min_req: MinimalRequest = match serde_json::from_slice(&body_bytes) {
        Ok(r) => r,
        Err(e) => {
            return openai_error(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {}", e),
            )
        }
    };
    if min_req.model.is_empty() {
        return openai_error(StatusCode::BAD_REQUEST, "missing required field: model");
    }

    let instance = match state.resolve(&min_req.model).await {
        Ok(i) => i,
        Err(e) => return openai_error(e.status(), &e.to_string()),
    };
    debug!(model = %min_req.model, instance = %instance.id, port = instance.port, "Routing request");

    let permit = match state.acquire(&instance).await {
        Ok(p) => p,
        Err(e) => return openai_error(e.status(), &e.to_string()),
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let upstream = match state
        .forward(parts.method, &path_and_query, &parts.headers, body_bytes, instance.port)
        .await
    {
        Ok(resp) => resp,
        Err(e) => return openai_error(e.status(), &e.to_string()),
    };

    metrics::histogram!("xw_request_duration_seconds").record(started.elapsed().as_secs_f64());

    // Stream or buffer: either way the body flows through as-is, with the
    // permit held until the client has consumed it.
    let (up_parts, up_body) = upstream.into_parts();
    let mut response = Response::builder()
        .status(up_parts.status)
        .body(Body::new(GuardedBody {
            inner: Body::new(up_body),
            _permit: permit,
        }))
        .expect("static response parts");
    copy_filtered_headers(&up_parts.headers, response.headers_mut());
    response
}

// ---------------------------------------------------------------------------
// Anthropic Messages
// ---------------------------------------------------------------------------

async fn handle_messages(State(state): State<ProxyState>, req: Request<Body>) -> Response<Body> {
    metrics::counter!("xw_requests_total").increment(1);

    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return anthropic_error(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "failed to read request body",
            )
        }
    };

    let msg_req: translate::MessagesRequest = match serde_json::from_slice(&body_bytes) {
        Ok(r) => r,
        Err(e) => {
            return anthropic_error(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("invalid JSON: {}", e),
            )
        }
    };

    if msg_req.model.is_empty() {
        return anthropic_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "missing required field: model",
        );
    }
    if msg_req.max_tokens == 0 {
        return anthropic_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "max_tokens must be a positive integer",
        );
    }
    if msg_req.messages.is_empty() {
        return anthropic_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "messages must not be empty",
        );
    }

    let instance = match state.resolve(&msg_req.model).await {
        Ok(i) => i,
        Err(e) => return anthropic_error(e.status(), e.anthropic_kind(), &e.to_string()),
    };

    let permit = match state.acquire(&instance).await {
        Ok(p) => p,
        Err(e) => return anthropic_error(e.status(), e.anthropic_kind(), &e.to_string()),
    };

    // The backend sees the name it loaded, not the client's model string.
    let backend_model = instance.display_alias().to_string();
    let openai_req = match convert_request(&msg_req, &backend_model) {
        Ok(r) => r,
        Err(e) => return anthropic_error(e.status(), e.anthropic_kind(), &e.to_string()),
    };
    let openai_body = match serde_json::to_vec(&openai_req) {
        Ok(b) => Bytes::from(b),
        Err(e) => {
            return anthropic_error(StatusCode::INTERNAL_SERVER_ERROR, "api_error", &e.to_string())
        }
    };

    debug!(
        model = %msg_req.model,
        instance = %instance.id,
        stream = msg_req.stream,
        "Forwarding translated request"
    );

    let upstream = match state
        .forward(
            axum::http::Method::POST,
            "/v1/chat/completions",
            &parts.headers,
            openai_body,
            instance.port,
        )
        .await
    {
        Ok(resp) => resp,
        Err(e) => return anthropic_error(e.status(), e.anthropic_kind(), &e.to_string()),
    };

    if upstream.status().as_u16() >= 400 {
        return forward_backend_error(upstream).await;
    }

    if msg_req.stream {
        stream_anthropic(upstream, msg_req.model.clone(), permit)
    } else {
        let body = match upstream.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return anthropic_error(
                    StatusCode::BAD_GATEWAY,
                    "api_error",
                    &format!("failed to read backend response: {}", e),
                )
            }
        };
        drop(permit);
        match convert_response(&body, &msg_req.model) {
            Ok(resp) => json_response(StatusCode::OK, &resp),
            Err(e) => anthropic_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                &format!("failed to convert response: {}", e),
            ),
        }
    }
}

/// Run the stream adapter in a task feeding an SSE response body. The
/// concurrency permit rides inside the task so it is released when the
/// upstream stream ends.
fn stream_anthropic(
    upstream: Response<hyper::body::Incoming>,
    request_model: String,
    permit: Option<OwnedSemaphorePermit>,
) -> Response<Body> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let _permit = permit;
        let adapter = translate::stream::StreamAdapter::new(&request_model);
        adapter.transform(upstream.into_body(), tx).await;
        debug!(model = %request_model, "Anthropic stream completed");
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .expect("static response parts")
}

/// Surface a backend HTTP error in the Anthropic envelope, keeping the
/// upstream status and extracting its error message when the body is the
/// usual `{"error": ...}` shape.
async fn forward_backend_error(upstream: Response<hyper::body::Incoming>) -> Response<Body> {
    let status = upstream.status();
    let body = upstream
        .into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    let mut message = format!("backend returned HTTP {}", status.as_u16());
    if let Ok(v) = serde_json::from_slice::<serde_json::Value>(&body) {
        match &v["error"] {
            serde_json::Value::String(s) => message = s.clone(),
            serde_json::Value::Object(o) => {
                if let Some(m) = o.get("message").and_then(|m| m.as_str()) {
                    message = m.to_string();
                }
            }
            _ => {}
        }
    }

    warn!(status = %status, message = %message, "Backend error");
    anthropic_error(status, "api_error", &message)
}

// ---------------------------------------------------------------------------
// Token counting and model listing
// ---------------------------------------------------------------------------

async fn handle_count_tokens(body: Bytes) -> Response<Body> {
    // ~4 characters per token is a workable estimate across tokenizers and
    // avoids shipping one. Partial groups count as a whole token.
    let estimate = (body.len() as u64).div_ceil(4).max(1);
    json_response(
        StatusCode::OK,
        &translate::TokenCountResponse {
            input_tokens: estimate,
        },
    )
}

async fn list_models(State(state): State<ProxyState>) -> Json<serde_json::Value> {
    let instances = state.registry.snapshot(false).await;
    let mut data: Vec<serde_json::Value> = instances
        .iter()
        .map(|i| {
            serde_json::json!({
                "id": i.display_alias(),
                "object": "model",
                "created": i.created_at,
                "owned_by": "xw",
            })
        })
        .collect();
    data.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    Json(serde_json::json!({"object": "list", "data": data}))
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response parts")
}

fn openai_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(
        status,
        &serde_json::json!({
            "error": message,
            "code": status.as_u16().to_string(),
        }),
    )
}

fn anthropic_error(status: StatusCode, kind: &str, message: &str) -> Response<Body> {
    json_response(status, &translate::AnthropicError::new(kind, message))
}

struct QueueDepthGuard(String);

impl Drop for QueueDepthGuard {
    fn drop(&mut self) {
        metrics::gauge!("xw_request_queue_depth", "instance" => self.0.clone()).decrement(1.0);
    }
}

/// Response body that keeps a concurrency permit alive until the stream is
/// fully consumed, so long-running SSE responses count against the
/// instance's limit for their entire duration.
struct GuardedBody {
    inner: Body,
    _permit: Option<OwnedSemaphorePermit>,
}

impl http_body::Body for GuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_filtered_headers_drops_hop_by_hop() {
        let mut src = HeaderMap::new();
        src.insert("connection", "keep-alive".parse().unwrap());
        src.insert("transfer-encoding", "chunked".parse().unwrap());
        src.insert("x-custom", "yes".parse().unwrap());
        src.insert("authorization", "Bearer t".parse().unwrap());

        let mut dst = HeaderMap::new();
        copy_filtered_headers(&src, &mut dst);

        assert!(dst.get("connection").is_none());
        assert!(dst.get("transfer-encoding").is_none());
        assert_eq!(dst.get("x-custom").unwrap(), "yes");
        assert_eq!(dst.get("authorization").unwrap(), "Bearer t");
    }

    #[test]
    fn test_minimal_request_parsing() {
        let r: MinimalRequest =
            serde_json::from_str(r#"{"model": "m", "stream": true, "messages": []}"#).unwrap();
        assert_eq!(r.model, "m");
        assert!(r.stream);

        let r: MinimalRequest = serde_json::from_str(r#"{"messages": []}"#).unwrap();
        assert!(r.model.is_empty());
        assert!(!r.stream);
    }
}
