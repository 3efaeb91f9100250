//! Container sandbox backend
//!
//! Same session contract as the local backend, but the child interpreter
//! runs inside an isolated OS container that shares only a mounted scratch
//! directory with the host. Because the container cannot reach the
//! router's loopback endpoint, a host-side forwarding proxy relays the two
//! hook paths; inside the container the router URL points at
//! `host.docker.internal` on the proxy's port.

use super::runner::{self, StateCodec};
use super::{SandboxError, SandboxResult, SandboxSession};
use crate::router::RouterAddress;
use crate::types::{ContextPayload, ReplResult};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Default container image for sandbox execution.
pub const DEFAULT_SANDBOX_IMAGE: &str = "python:3.11-slim";

/// Default memory limit for containers (256MB).
const DEFAULT_MEMORY_LIMIT: i64 = 256 * 1024 * 1024;

/// Hard wall-clock limit for one code execution.
const EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// Stdout capture limit per execution.
const MAX_STDOUT_BYTES: usize = 50 * 1024 * 1024;

/// Scratch mount point inside the container.
const WORKSPACE: &str = "/workspace";

const DEFAULT_PYTHON_COMMAND: &str = "python3";

// ============================================================================
// Hook forwarding proxy
// ============================================================================

struct ProxyState {
    client: reqwest::Client,
    upstream: String,
}

async fn forward(state: Arc<ProxyState>, path: &str, body: Bytes) -> Response {
    let url = format!("{}{path}", state.upstream);
    match state
        .client
        .post(&url)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
    {
        Ok(upstream_response) => {
            let status = StatusCode::from_u16(upstream_response.status().as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let bytes = upstream_response.bytes().await.unwrap_or_default();
            (status, [(header::CONTENT_TYPE, "application/json")], bytes).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("proxy forward failed: {err}") })),
        )
            .into_response(),
    }
}

async fn forward_query(State(state): State<Arc<ProxyState>>, body: Bytes) -> Response {
    forward(state, "/llm_query", body).await
}

async fn forward_batched(State(state): State<Arc<ProxyState>>, body: Bytes) -> Response {
    forward(state, "/llm_query_batched", body).await
}

/// Loopback HTTP server relaying hook calls from the container to the
/// real router address.
struct HookProxy {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HookProxy {
    async fn start(upstream: String) -> SandboxResult<Self> {
        let state = Arc::new(ProxyState {
            client: reqwest::Client::new(),
            upstream,
        });
        let app = axum::Router::new()
            .route("/llm_query", post(forward_query))
            .route("/llm_query_batched", post(forward_batched))
            .with_state(state);

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|err| SandboxError::ProxyError(format!("failed to bind: {err}")))?;
        let port = listener
            .local_addr()
            .map_err(|err| SandboxError::ProxyError(err.to_string()))?
            .port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                tracing::warn!(error = %err, "Hook proxy exited with error");
            }
        });

        tracing::debug!(port, "Hook proxy started");
        Ok(Self {
            port,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

// ============================================================================
// Container configuration
// ============================================================================

/// Resolved configuration for the container backend.
#[derive(Debug, Clone)]
struct ContainerConfig {
    image: String,
    memory_limit: i64,
    python_command: String,
}

impl ContainerConfig {
    /// Config bag keys: `image`, `memory_limit` (bytes), `python_command`.
    fn from_bag(bag: &Map<String, Value>) -> Self {
        Self {
            image: bag
                .get("image")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_SANDBOX_IMAGE)
                .to_string(),
            memory_limit: bag
                .get("memory_limit")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_MEMORY_LIMIT),
            python_command: bag
                .get("python_command")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_PYTHON_COMMAND)
                .to_string(),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Sandbox session hosted in an isolated OS container.
pub struct ContainerSandbox {
    config: ContainerConfig,
    router_url: String,
    depth: u32,
    docker: Option<Docker>,
    scratch: Option<TempDir>,
    container_id: Option<String>,
    proxy: Option<HookProxy>,
    exec_counter: usize,
    context_count: usize,
}

impl ContainerSandbox {
    pub fn new(config: &Map<String, Value>, router: &RouterAddress, depth: u32) -> Self {
        Self {
            config: ContainerConfig::from_bag(config),
            router_url: router.base_url(),
            depth,
            docker: None,
            scratch: None,
            container_id: None,
            proxy: None,
            exec_counter: 0,
            context_count: 0,
        }
    }

    fn docker(&self) -> SandboxResult<&Docker> {
        self.docker.as_ref().ok_or(SandboxError::SessionClosed)
    }

    /// Collect stdout/stderr from one exec instance.
    async fn collect_exec_output(
        docker: &Docker,
        exec_id: &str,
    ) -> SandboxResult<(String, String)> {
        let start_result = docker
            .start_exec(exec_id, None)
            .await
            .map_err(|err| SandboxError::ExecFailed(format!("failed to start exec: {err}")))?;

        let mut stdout = Vec::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = start_result {
            while let Some(result) = output.next().await {
                match result {
                    Ok(LogOutput::StdOut { message }) => {
                        if stdout.len() < MAX_STDOUT_BYTES {
                            stdout.extend_from_slice(&message);
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "Error reading exec output");
                    }
                }
            }
        }

        stdout.truncate(MAX_STDOUT_BYTES);
        Ok((String::from_utf8_lossy(&stdout).into_owned(), stderr))
    }
}

#[async_trait]
impl SandboxSession for ContainerSandbox {
    async fn setup(&mut self) -> SandboxResult<()> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| SandboxError::DockerNotAvailable(err.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|err| SandboxError::DockerNotAvailable(format!("failed to ping: {err}")))?;

        let scratch = tempfile::Builder::new().prefix("rlm_container_").tempdir()?;
        let proxy = HookProxy::start(self.router_url.clone()).await?;

        let container_name = format!("rlm_sandbox_{}", uuid::Uuid::new_v4());
        let host_config = bollard::service::HostConfig {
            memory: Some(self.config.memory_limit),
            binds: Some(vec![format!(
                "{}:{WORKSPACE}",
                scratch.path().display()
            )]),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };
        let config = Config {
            image: Some(self.config.image.clone()),
            working_dir: Some(WORKSPACE.to_string()),
            host_config: Some(host_config),
            tty: Some(true),
            // Keep the container running between executions.
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let response = docker
            .create_container(Some(options), config)
            .await
            .map_err(|err| SandboxError::ContainerCreationFailed(err.to_string()))?;
        docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| SandboxError::ContainerStartFailed(err.to_string()))?;

        tracing::debug!(
            container = %response.id,
            image = %self.config.image,
            proxy_port = proxy.port,
            "Container sandbox ready"
        );

        tokio::fs::write(scratch.path().join("state.pkl"), b"").await?;
        self.docker = Some(docker);
        self.scratch = Some(scratch);
        self.container_id = Some(response.id);
        self.proxy = Some(proxy);
        Ok(())
    }

    async fn load_context(&mut self, payload: &ContextPayload) -> SandboxResult<()> {
        let index = self.context_count;
        let scratch = self.scratch.as_ref().ok_or(SandboxError::SessionClosed)?;

        let (file_name, stub_reader) = match payload {
            ContextPayload::Text(_) => (format!("context_{index}.txt"), "_handle.read()"),
            _ => (format!("context_{index}.json"), "json.load(_handle)"),
        };
        match payload {
            ContextPayload::Text(text) => {
                tokio::fs::write(scratch.path().join(&file_name), text).await?
            }
            other => {
                tokio::fs::write(scratch.path().join(&file_name), serde_json::to_vec(other)?)
                    .await?
            }
        }

        let mut stub = format!(
            "import json\nwith open(\"{WORKSPACE}/{file_name}\", \"r\", encoding=\"utf-8\") as _handle:\n    context_{index} = {stub_reader}\n"
        );
        if index == 0 {
            stub.push_str(&format!("context = context_{index}\n"));
        }

        let result = self.execute_code(&stub).await?;
        if !result.stderr.trim().is_empty() {
            return Err(SandboxError::PayloadLoadFailed(result.stderr));
        }
        self.context_count += 1;
        Ok(())
    }

    async fn execute_code(&mut self, code: &str) -> SandboxResult<ReplResult> {
        let proxy_port = self
            .proxy
            .as_ref()
            .map(|proxy| proxy.port)
            .ok_or(SandboxError::SessionClosed)?;
        let container_id = self
            .container_id
            .clone()
            .ok_or(SandboxError::SessionClosed)?;

        // The container reaches the host-side proxy through the gateway
        // alias; the proxy relays to the real router.
        let program = runner::render_program(
            &format!("{WORKSPACE}/state.pkl"),
            &format!("http://host.docker.internal:{proxy_port}"),
            self.depth,
            code,
            StateCodec::Pickle,
        );

        self.exec_counter += 1;
        let script_name = format!("exec_{}.py", self.exec_counter);
        {
            let scratch = self.scratch.as_ref().ok_or(SandboxError::SessionClosed)?;
            tokio::fs::write(scratch.path().join(&script_name), &program).await?;
        }

        let docker = self.docker()?;
        let exec_config = CreateExecOptions {
            cmd: Some(vec![
                self.config.python_command.clone(),
                format!("{WORKSPACE}/{script_name}"),
            ]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(WORKSPACE.to_string()),
            ..Default::default()
        };
        let exec = docker
            .create_exec(&container_id, exec_config)
            .await
            .map_err(|err| SandboxError::ExecFailed(format!("failed to create exec: {err}")))?;

        let started = Instant::now();
        let collected = timeout(EXEC_TIMEOUT, Self::collect_exec_output(docker, &exec.id)).await;
        let elapsed = started.elapsed().as_secs_f64();

        match collected {
            Err(_) => Ok(ReplResult::failure(
                "",
                format!(
                    "Error: execution timed out after {} seconds",
                    EXEC_TIMEOUT.as_secs()
                ),
            )),
            Ok(Err(err)) => Ok(ReplResult::failure("", format!("Error: {err}"))),
            Ok(Ok((stdout, stderr))) => Ok(runner::parse_child_output(&stdout, &stderr, elapsed)),
        }
    }

    async fn cleanup(&mut self) -> SandboxResult<()> {
        if let (Some(docker), Some(container_id)) = (self.docker.take(), self.container_id.take())
        {
            if let Err(err) = docker
                .stop_container(&container_id, Some(StopContainerOptions { t: 5 }))
                .await
            {
                tracing::warn!(error = %err, "Failed to stop sandbox container");
            }
            if let Err(err) = docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                tracing::warn!(error = %err, "Failed to remove sandbox container");
            }
        }
        if let Some(mut proxy) = self.proxy.take() {
            proxy.stop().await;
        }
        if let Some(scratch) = self.scratch.take() {
            scratch.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> RouterAddress {
        RouterAddress {
            host: "127.0.0.1".to_string(),
            port: 1,
        }
    }

    #[test]
    fn config_defaults_from_empty_bag() {
        let config = ContainerConfig::from_bag(&Map::new());
        assert_eq!(config.image, DEFAULT_SANDBOX_IMAGE);
        assert_eq!(config.memory_limit, DEFAULT_MEMORY_LIMIT);
        assert_eq!(config.python_command, "python3");
    }

    #[test]
    fn config_bag_overrides() {
        let mut bag = Map::new();
        bag.insert("image".to_string(), json!("python:3.12"));
        bag.insert("memory_limit".to_string(), json!(1024));
        let config = ContainerConfig::from_bag(&bag);
        assert_eq!(config.image, "python:3.12");
        assert_eq!(config.memory_limit, 1024);
    }

    #[test]
    fn container_backend_has_no_persistence_extension() {
        let mut sandbox = ContainerSandbox::new(&Map::new(), &router(), 1);
        assert!(sandbox.as_persistent().is_none());
    }

    #[tokio::test]
    async fn cleanup_before_setup_is_safe() {
        let mut sandbox = ContainerSandbox::new(&Map::new(), &router(), 1);
        sandbox.cleanup().await.unwrap();
        sandbox.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn execute_without_setup_is_rejected() {
        let mut sandbox = ContainerSandbox::new(&Map::new(), &router(), 1);
        let result = sandbox.execute_code("print(1)").await;
        assert!(matches!(result, Err(SandboxError::SessionClosed)));
    }

    #[tokio::test]
    async fn proxy_forwards_error_when_upstream_is_gone() {
        // No listener at the upstream address: the proxy reifies the
        // transport failure as a 500 {error} body.
        let mut proxy = HookProxy::start("http://127.0.0.1:9".to_string())
            .await
            .unwrap();
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://127.0.0.1:{}/llm_query", proxy.port))
            .json(&json!({ "prompt": "hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 500);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("proxy forward failed"));
        proxy.stop().await;
    }
}
