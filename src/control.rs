//! Management API.
//!
//! Instance lifecycle and daemon introspection endpoints, served on the
//! same listener as the inference proxy.
//!
//! | Method | Path                  | Description                          |
//! |--------|-----------------------|--------------------------------------|
//! | GET    | `/api/health`         | Daemon liveness                      |
//! | GET    | `/api/version`        | Version, build time, git commit      |
//! | POST   | `/api/instances/run`  | Launch an instance (SSE progress)    |
//! | POST   | `/api/instances/stop` | Stop an instance                     |
//! | GET    | `/api/instances`      | List instances (`?all=true` for all) |

use crate::error::{Error, Result};
use crate::scheduler::{Progress, RunOptions, Scheduler};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

pub fn router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/version", get(version))
        .route("/api/instances/run", post(run_instance))
        .route("/api/instances/stop", post(stop_instance))
        .route("/api/instances", get(list_instances))
        .route("/api/models/pull", post(pull_model))
        .with_state(scheduler)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    message: String,
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
    build_time: &'static str,
    git_commit: &'static str,
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    model_id: String,
    #[serde(default)]
    engine: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    max_concurrent: Option<usize>,
    #[serde(default)]
    additional_config: AdditionalConfig,
}

#[derive(Debug, Default, Deserialize)]
struct AdditionalConfig {
    /// Explicit device indices as a comma-joined list (e.g. `"0,1"`).
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    device_count: Option<usize>,
    #[serde(default)]
    tensor_parallel: Option<usize>,
    #[serde(default)]
    max_model_len: Option<u32>,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    alias: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    all: bool,
}

#[derive(Serialize)]
struct RunResult {
    id: String,
    alias: String,
    state: String,
    port: u16,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

fn error_json(e: &Error) -> (StatusCode, Json<ErrorResponse>) {
    let status = e.status();
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: status.as_u16().to_string(),
        }),
    )
}

/// Parse a comma-joined device list like `"0"` or `"0,1,2,3"`.
fn parse_device_list(list: &str) -> Result<Vec<usize>> {
    let indices: Vec<usize> = list
        .split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<usize>()
                .map_err(|_| Error::Invalid(format!("invalid device index '{}'", p)))
        })
        .collect::<Result<_>>()?;
    if indices.is_empty() {
        return Err(Error::Invalid("empty device list".into()));
    }
    Ok(indices)
}

impl RunRequest {
    fn into_options(self) -> Result<RunOptions> {
        let devices = match &self.additional_config.device {
            Some(list) if !list.trim().is_empty() => Some(parse_device_list(list)?),
            _ => None,
        };
        Ok(RunOptions {
            model_id: self.model_id,
            engine: self.engine,
            mode: self.mode,
            alias: self.alias,
            devices,
            device_count: self.additional_config.device_count,
            port: self.port,
            tensor_parallel: self.additional_config.tensor_parallel,
            max_concurrent: self.max_concurrent,
            max_model_len: self.additional_config.max_model_len,
            env: self.additional_config.env,
        })
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        message: "xw daemon is running".to_string(),
    })
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        build_time: option_env!("XW_BUILD_TIME").unwrap_or("unknown"),
        git_commit: option_env!("XW_GIT_COMMIT").unwrap_or("unknown"),
    })
}

/// Launch an instance, streaming progress as SSE and finishing with either
/// a `result` event carrying `{id, alias, state, port}` or an `error`
/// event.
async fn run_instance(
    State(scheduler): State<Arc<Scheduler>>,
    Json(req): Json<RunRequest>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (event_tx, event_rx) = mpsc::channel::<Event>(32);

    tokio::spawn(async move {
        let opts = match req.into_options() {
            Ok(opts) => opts,
            Err(e) => {
                let _ = event_tx
                    .send(Event::default().event("error").data(e.to_string()))
                    .await;
                return;
            }
        };

        let (progress_tx, mut progress_rx) = mpsc::channel::<String>(32);
        let run = scheduler.run(opts, Progress::channel(progress_tx));
        tokio::pin!(run);

        loop {
            tokio::select! {
                biased;
                Some(msg) = progress_rx.recv() => {
                    let _ = event_tx.send(Event::default().data(msg)).await;
                }
                result = &mut run => {
                    // Flush progress produced before completion.
                    while let Ok(msg) = progress_rx.try_recv() {
                        let _ = event_tx.send(Event::default().data(msg)).await;
                    }
                    match result {
                        Ok(instance) => {
                            let payload = RunResult {
                                id: instance.id.clone(),
                                alias: instance.display_alias().to_string(),
                                state: instance.state.to_string(),
                                port: instance.port,
                            };
                            let event = Event::default()
                                .event("result")
                                .data(serde_json::to_string(&payload).unwrap_or_default());
                            let _ = event_tx.send(event).await;
                        }
                        Err(e) => {
                            error!(error = %e, "Run request failed");
                            let _ = event_tx
                                .send(Event::default().event("error").data(e.to_string()))
                                .await;
                        }
                    }
                    break;
                }
            }
        }
    });

    let stream = ReceiverStream::new(event_rx).map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn stop_instance(
    State(scheduler): State<Arc<Scheduler>>,
    Json(req): Json<StopRequest>,
) -> impl IntoResponse {
    match scheduler.stop(&req.alias, req.force).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ok"})),
        )
            .into_response(),
        Err(e) => error_json(&e).into_response(),
    }
}

async fn list_instances(
    State(scheduler): State<Arc<Scheduler>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let instances = scheduler.list(query.all).await;
    Json(instances)
}

/// Model downloading is handled outside the daemon; the endpoint exists so
/// clients get a clear answer instead of a 404.
async fn pull_model() -> impl IntoResponse {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(ErrorResponse {
            error: "model pulling is not available on this server".to_string(),
            code: StatusCode::NOT_IMPLEMENTED.as_u16().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_list() {
        assert_eq!(parse_device_list("0").unwrap(), vec![0]);
        assert_eq!(parse_device_list("0, 1,3").unwrap(), vec![0, 1, 3]);
        assert!(parse_device_list("a,b").is_err());
        assert!(parse_device_list(" ").is_err());
    }

    #[test]
    fn test_run_request_into_options() {
        let req: RunRequest = serde_json::from_str(
            r#"{
                "model_id": "qwen2-7b",
                "engine": "vllm",
                "max_concurrent": 4,
                "additional_config": {"device": "0,1", "max_model_len": 4096}
            }"#,
        )
        .unwrap();
        let opts = req.into_options().unwrap();
        assert_eq!(opts.model_id, "qwen2-7b");
        assert_eq!(opts.devices, Some(vec![0, 1]));
        assert_eq!(opts.max_concurrent, Some(4));
        assert_eq!(opts.max_model_len, Some(4096));
    }
}
