//! Loopback LM router
//!
//! A per-completion HTTP service bound on 127.0.0.1 at an OS-assigned port.
//! Sandbox children reach it through the `/llm_query` and
//! `/llm_query_batched` hook endpoints; the driver uses the direct
//! (non-HTTP) completion path on the same instance. Sub-LM calls carry the
//! caller's depth so the router can pick the designated sub-model.

mod usage;

pub use usage::UsageTracker;

use crate::error::{EngineError, Result};
use crate::providers::ModelProvider;
use crate::types::{single_call_summary, Message, RlmCall};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

// ============================================================================
// Address
// ============================================================================

/// Bound loopback address handed to sandbox sessions.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RouterAddress {
    pub host: String,
    pub port: u16,
}

impl RouterAddress {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Router state
// ============================================================================

struct RouterState {
    default_model: Arc<dyn ModelProvider>,
    sub_model: Option<Arc<dyn ModelProvider>>,
    models: HashMap<String, Arc<dyn ModelProvider>>,
    usage: Arc<UsageTracker>,
}

/// Select the adapter for one hook call: a registered name wins, then the
/// sub-model at depth 1, then the default.
fn select_model(
    state: &RouterState,
    model: Option<&str>,
    depth: u32,
) -> Arc<dyn ModelProvider> {
    if let Some(name) = model {
        if let Some(provider) = state.models.get(name) {
            return Arc::clone(provider);
        }
    }
    if depth == 1 {
        if let Some(sub) = &state.sub_model {
            return Arc::clone(sub);
        }
    }
    Arc::clone(&state.default_model)
}

/// Translate a hook prompt into chat-message form: a string becomes one
/// user message, a message list passes through, anything else is
/// JSON-stringified into one user message.
fn prompt_to_messages(prompt: &Value) -> Vec<Message> {
    if let Value::String(text) = prompt {
        return vec![Message::user(text.clone())];
    }
    if prompt.is_array() {
        if let Ok(messages) = serde_json::from_value::<Vec<Message>>(prompt.clone()) {
            return messages;
        }
    }
    vec![Message::user(prompt.to_string())]
}

// ============================================================================
// HTTP handlers
// ============================================================================

#[derive(Debug, Deserialize)]
struct QueryRequest {
    prompt: Value,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    depth: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct BatchedQueryRequest {
    prompts: Vec<Value>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    depth: Option<u32>,
}

fn error_response(message: impl Into<String>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

/// Dispatch one generation and build its sub-LM call record.
async fn dispatch_one(
    state: &RouterState,
    model: &Arc<dyn ModelProvider>,
    prompt: &Value,
) -> std::result::Result<(String, RlmCall), String> {
    let messages = prompt_to_messages(prompt);
    let started = Instant::now();
    let generation = model
        .generate(&messages)
        .await
        .map_err(|err| err.to_string())?;
    let elapsed = started.elapsed().as_secs_f64();

    let usage = generation.usage.unwrap_or_default();
    state
        .usage
        .track(model.model_name(), usage.input_tokens, usage.output_tokens);

    let call = RlmCall {
        model: model.model_name().to_string(),
        prompt: prompt.clone(),
        response: generation.text.clone(),
        usage: single_call_summary(model.model_name(), usage.input_tokens, usage.output_tokens),
        execution_time: elapsed,
    };
    Ok((generation.text, call))
}

/// POST /llm_query
async fn handle_llm_query(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let request: QueryRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(format!("Invalid request body: {err}")),
    };

    let model = select_model(&state, request.model.as_deref(), request.depth.unwrap_or(0));
    tracing::debug!(model = %model.model_name(), depth = request.depth.unwrap_or(0), "Serving llm_query");

    match dispatch_one(&state, &model, &request.prompt).await {
        Ok((response, call)) => {
            Json(json!({ "response": response, "rlm_call": call })).into_response()
        }
        Err(message) => error_response(message),
    }
}

/// POST /llm_query_batched
///
/// Dispatches all prompts concurrently and joins them; responses preserve
/// input order. The per-element elapsed value is the overall elapsed
/// divided by the element count, an approximation never used for billing.
async fn handle_llm_query_batched(
    State(state): State<Arc<RouterState>>,
    body: Bytes,
) -> Response {
    let request: BatchedQueryRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(format!("Invalid request body: {err}")),
    };

    let model = select_model(&state, request.model.as_deref(), request.depth.unwrap_or(0));
    let count = request.prompts.len();
    tracing::debug!(
        model = %model.model_name(),
        prompts = count,
        "Serving llm_query_batched"
    );

    let started = Instant::now();
    let generations = futures::future::join_all(request.prompts.iter().map(|prompt| {
        let model = Arc::clone(&model);
        async move {
            let messages = prompt_to_messages(prompt);
            model.generate(&messages).await
        }
    }))
    .await;
    let per_element = started.elapsed().as_secs_f64() / count.max(1) as f64;

    // Usage is tracked in input order once every element has completed.
    let mut responses: Vec<String> = Vec::with_capacity(count);
    let mut calls: Vec<RlmCall> = Vec::with_capacity(count);
    for (prompt, generation) in request.prompts.iter().zip(generations) {
        let generation = match generation {
            Ok(generation) => generation,
            Err(err) => return error_response(err.to_string()),
        };
        let usage = generation.usage.unwrap_or_default();
        state
            .usage
            .track(model.model_name(), usage.input_tokens, usage.output_tokens);
        calls.push(RlmCall {
            model: model.model_name().to_string(),
            prompt: prompt.clone(),
            response: generation.text.clone(),
            usage: single_call_summary(
                model.model_name(),
                usage.input_tokens,
                usage.output_tokens,
            ),
            execution_time: per_element,
        });
        responses.push(generation.text);
    }

    Json(json!({ "responses": responses, "rlm_calls": calls })).into_response()
}

async fn unknown_endpoint(uri: Uri) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("Unknown endpoint: {}", uri.path()) })),
    )
        .into_response()
}

// ============================================================================
// Router lifecycle
// ============================================================================

/// The per-completion loopback LM router.
///
/// Owned by its driver: created at completion entry, stopped at completion
/// exit. Accepts requests only on 127.0.0.1.
pub struct LlmRouter {
    default_model: Arc<dyn ModelProvider>,
    sub_model: Option<Arc<dyn ModelProvider>>,
    models: HashMap<String, Arc<dyn ModelProvider>>,
    usage: Arc<UsageTracker>,
    address: Option<RouterAddress>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LlmRouter {
    /// Create a router around a default model and an optional sub-model.
    /// The sub-model is also registered under its own name.
    pub fn new(
        default_model: Arc<dyn ModelProvider>,
        sub_model: Option<Arc<dyn ModelProvider>>,
    ) -> Self {
        let mut models: HashMap<String, Arc<dyn ModelProvider>> = HashMap::new();
        if let Some(sub) = &sub_model {
            models.insert(sub.model_name().to_string(), Arc::clone(sub));
        }
        Self {
            default_model,
            sub_model,
            models,
            usage: Arc::new(UsageTracker::new()),
            address: None,
            shutdown: None,
            task: None,
        }
    }

    /// Register an additional model selectable by name. Must be called
    /// before [`start`](Self::start).
    pub fn register_model(&mut self, provider: Arc<dyn ModelProvider>) {
        self.models
            .insert(provider.model_name().to_string(), provider);
    }

    pub fn usage(&self) -> Arc<UsageTracker> {
        Arc::clone(&self.usage)
    }

    pub fn address(&self) -> Option<&RouterAddress> {
        self.address.as_ref()
    }

    /// Bind on 127.0.0.1 at an OS-assigned port and begin serving. Returns
    /// the bound address.
    pub async fn start(&mut self) -> Result<RouterAddress> {
        let state = Arc::new(RouterState {
            default_model: Arc::clone(&self.default_model),
            sub_model: self.sub_model.clone(),
            models: self.models.clone(),
            usage: Arc::clone(&self.usage),
        });

        let app = axum::Router::new()
            .route("/llm_query", post(handle_llm_query))
            .route("/llm_query_batched", post(handle_llm_query_batched))
            .fallback(unknown_endpoint)
            .with_state(state);

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|err| EngineError::Router(format!("failed to bind loopback port: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| EngineError::Router(err.to_string()))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                tracing::warn!(error = %err, "LM router server exited with error");
            }
        });

        let address = RouterAddress {
            host: "127.0.0.1".to_string(),
            port: local_addr.port(),
        };
        tracing::debug!(port = address.port, "LM router started");

        self.address = Some(address.clone());
        self.shutdown = Some(shutdown_tx);
        self.task = Some(task);
        Ok(address)
    }

    /// Close the listener. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
            tracing::debug!("LM router stopped");
        }
        self.address = None;
    }

    /// Direct (non-HTTP) completion path on the default model, used by the
    /// driver for its own turns. Usage is tracked like any other call.
    pub async fn complete(&self, messages: &[Message]) -> Result<String> {
        let generation = self
            .default_model
            .generate(messages)
            .await
            .map_err(|err| EngineError::Provider(err.to_string()))?;
        let usage = generation.usage.unwrap_or_default();
        self.usage.track(
            self.default_model.model_name(),
            usage.input_tokens,
            usage.output_tokens,
        );
        Ok(generation.text)
    }
}

impl Drop for LlmRouter {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
