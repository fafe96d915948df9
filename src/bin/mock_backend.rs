//! Mock OpenAI-compatible inference backend.
//!
//! Stands in for a real engine container during development and manual
//! end-to-end testing: serves `/health` plus the chat, completion, and
//! embedding endpoints with canned responses, including SSE streaming.
//!
//! Run with: `cargo run --bin mock-backend -- --port 10881 --model qwen2-7b`

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "Mock OpenAI-compatible inference backend")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Model name reported in responses
    #[arg(short, long, default_value = "mock-model")]
    model: String,

    /// Milliseconds of artificial latency per request
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

#[derive(Clone)]
struct MockState {
    model: String,
    delay: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let state = MockState {
        model: args.model,
        delay: Duration::from_millis(args.delay_ms),
    };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .with_state(state);

    let addr = format!("127.0.0.1:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Mock backend listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn chat_completions(
    State(state): State<MockState>,
    Json(body): Json<Value>,
) -> Response {
    tokio::time::sleep(state.delay).await;

    let stream = body["stream"].as_bool().unwrap_or(false);
    let model = body["model"].as_str().unwrap_or(&state.model).to_string();

    if stream {
        return stream_chat(model);
    }

    Json(json!({
        "id": "chatcmpl-mock-1",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello from the mock backend."},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 7, "completion_tokens": 6, "total_tokens": 13},
    }))
    .into_response()
}

fn stream_chat(model: String) -> Response {
    let chunks = vec![
        json!({"id": "chatcmpl-mock-1", "model": model,
               "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hello"}, "finish_reason": null}]}),
        json!({"id": "chatcmpl-mock-1", "model": model,
               "choices": [{"index": 0, "delta": {"content": " from the mock backend."}, "finish_reason": null}]}),
        json!({"id": "chatcmpl-mock-1", "model": model,
               "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
               "usage": {"prompt_tokens": 7, "completion_tokens": 6, "total_tokens": 13}}),
    ];

    let mut sse = String::new();
    for chunk in chunks {
        sse.push_str(&format!("data: {}\n\n", chunk));
    }
    sse.push_str("data: [DONE]\n\n");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from(sse))
        .expect("static response parts")
}

async fn completions(State(state): State<MockState>, Json(body): Json<Value>) -> Json<Value> {
    tokio::time::sleep(state.delay).await;
    let model = body["model"].as_str().unwrap_or(&state.model).to_string();
    Json(json!({
        "id": "cmpl-mock-1",
        "object": "text_completion",
        "model": model,
        "choices": [{"index": 0, "text": "mock completion", "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5},
    }))
}

async fn embeddings(State(state): State<MockState>, Json(body): Json<Value>) -> Json<Value> {
    tokio::time::sleep(state.delay).await;
    let model = body["model"].as_str().unwrap_or(&state.model).to_string();
    Json(json!({
        "object": "list",
        "model": model,
        "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2, 0.3]}],
        "usage": {"prompt_tokens": 3, "total_tokens": 3},
    }))
}
