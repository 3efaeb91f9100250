//! Local sandbox backend
//!
//! Hosts the REPL in a child interpreter on the same machine. Each
//! execution runs a fresh child; inter-turn state lives in a JSON side
//! file inside a private scratch directory. This backend implements the
//! persistence extension and can span multiple completions.

use super::runner::{self, StateCodec};
use super::{PersistentSession, SandboxError, SandboxResult, SandboxSession};
use crate::router::RouterAddress;
use crate::types::{ContextPayload, Message, ReplResult};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;

/// Hard wall-clock limit for one code execution.
const EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// Stdout capture limit per execution.
const MAX_STDOUT_BYTES: usize = 50 * 1024 * 1024;

const DEFAULT_PYTHON_COMMAND: &str = "python3";

/// Child-interpreter sandbox with a JSON state file.
pub struct LocalSandbox {
    scratch: Option<TempDir>,
    state_file: PathBuf,
    router_url: String,
    depth: u32,
    python_command: String,
    exec_timeout: Duration,
    context_count: usize,
    history_count: usize,
}

impl LocalSandbox {
    /// Create the session and its private scratch directory.
    ///
    /// Config bag keys: `python_command` (interpreter invocation, default
    /// `python3`).
    pub fn new(
        config: &Map<String, Value>,
        router: &RouterAddress,
        depth: u32,
    ) -> SandboxResult<Self> {
        let scratch = tempfile::Builder::new().prefix("rlm_sandbox_").tempdir()?;
        let state_file = scratch.path().join("state.json");
        let python_command = config
            .get("python_command")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_PYTHON_COMMAND)
            .to_string();

        tracing::debug!(
            scratch = %scratch.path().display(),
            python_command = %python_command,
            depth,
            "Created local sandbox"
        );

        Ok(Self {
            scratch: Some(scratch),
            state_file,
            router_url: router.base_url(),
            depth,
            python_command,
            exec_timeout: EXEC_TIMEOUT,
            context_count: 0,
            history_count: 0,
        })
    }

    fn scratch(&self) -> SandboxResult<&TempDir> {
        self.scratch.as_ref().ok_or(SandboxError::SessionClosed)
    }

    /// Write a payload side file and execute the stub that binds it to the
    /// next `context_N` identifier.
    async fn load_payload(
        &mut self,
        payload: &ContextPayload,
        index: Option<usize>,
    ) -> SandboxResult<usize> {
        let index = index.unwrap_or(self.context_count);
        let scratch = self.scratch()?;

        let (file_name, stub_reader) = match payload {
            ContextPayload::Text(_) => (format!("context_{index}.txt"), "_handle.read()"),
            _ => (format!("context_{index}.json"), "json.load(_handle)"),
        };
        let path = scratch.path().join(&file_name);
        match payload {
            ContextPayload::Text(text) => tokio::fs::write(&path, text).await?,
            other => tokio::fs::write(&path, serde_json::to_vec(other)?).await?,
        }

        let mut stub = String::from("import json\n");
        stub.push_str(&format!(
            "with open({}, \"r\", encoding=\"utf-8\") as _handle:\n    context_{index} = {stub_reader}\n",
            py_path_literal(&path)
        ));
        if index == 0 {
            stub.push_str(&format!("context = context_{index}\n"));
        }

        let result = self.execute_code(&stub).await?;
        if !result.stderr.trim().is_empty() {
            return Err(SandboxError::PayloadLoadFailed(result.stderr));
        }

        self.context_count = self.context_count.max(index + 1);
        Ok(index)
    }

    async fn load_history(
        &mut self,
        messages: &[Message],
        index: Option<usize>,
    ) -> SandboxResult<usize> {
        let index = index.unwrap_or(self.history_count);
        let scratch = self.scratch()?;

        let path = scratch.path().join(format!("history_{index}.json"));
        tokio::fs::write(&path, serde_json::to_vec(messages)?).await?;

        let stub = format!(
            "import json\nwith open({}, \"r\", encoding=\"utf-8\") as _handle:\n    history_{index} = json.load(_handle)\n",
            py_path_literal(&path)
        );
        let result = self.execute_code(&stub).await?;
        if !result.stderr.trim().is_empty() {
            return Err(SandboxError::PayloadLoadFailed(result.stderr));
        }

        self.history_count = self.history_count.max(index + 1);
        Ok(index)
    }
}

fn py_path_literal(path: &std::path::Path) -> String {
    serde_json::to_string(&path.to_string_lossy())
        .expect("string literals always serialize")
}

#[async_trait]
impl SandboxSession for LocalSandbox {
    async fn setup(&mut self) -> SandboxResult<()> {
        self.scratch()?;
        tokio::fs::write(&self.state_file, "{}").await?;
        Ok(())
    }

    async fn load_context(&mut self, payload: &ContextPayload) -> SandboxResult<()> {
        self.load_payload(payload, None).await?;
        Ok(())
    }

    async fn execute_code(&mut self, code: &str) -> SandboxResult<ReplResult> {
        self.scratch()?;

        let program = runner::render_program(
            &self.state_file.to_string_lossy(),
            &self.router_url,
            self.depth,
            code,
            StateCodec::Json,
        );

        let parts = shlex::split(&self.python_command)
            .filter(|parts| !parts.is_empty())
            .unwrap_or_else(|| vec![self.python_command.clone()]);
        let mut command = Command::new(&parts[0]);
        command
            .args(parts.iter().skip(1))
            .arg("-c")
            .arg(&program)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let output = match tokio::time::timeout(self.exec_timeout, command.output()).await {
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.exec_timeout.as_secs(),
                    "Sandbox execution timed out"
                );
                return Ok(ReplResult::failure(
                    "",
                    format!(
                        "Error: execution timed out after {} seconds",
                        self.exec_timeout.as_secs()
                    ),
                ));
            }
            Ok(Err(err)) => {
                return Ok(ReplResult::failure(
                    "",
                    format!(
                        "Error: failed to spawn interpreter `{}`: {err}",
                        self.python_command
                    ),
                ));
            }
            Ok(Ok(output)) => output,
        };
        let elapsed = started.elapsed().as_secs_f64();

        let mut stdout_bytes = output.stdout;
        if stdout_bytes.len() > MAX_STDOUT_BYTES {
            stdout_bytes.truncate(MAX_STDOUT_BYTES);
        }
        let stdout = String::from_utf8_lossy(&stdout_bytes);
        let stderr = String::from_utf8_lossy(&output.stderr);

        Ok(runner::parse_child_output(&stdout, &stderr, elapsed))
    }

    async fn cleanup(&mut self) -> SandboxResult<()> {
        if let Some(scratch) = self.scratch.take() {
            tracing::debug!(scratch = %scratch.path().display(), "Cleaning up local sandbox");
            scratch.close()?;
        }
        Ok(())
    }

    fn as_persistent(&mut self) -> Option<&mut dyn PersistentSession> {
        Some(self)
    }
}

#[async_trait]
impl PersistentSession for LocalSandbox {
    fn update_handler_address(&mut self, address: &RouterAddress) {
        self.router_url = address.base_url();
    }

    async fn add_context(
        &mut self,
        payload: &ContextPayload,
        index: Option<usize>,
    ) -> SandboxResult<usize> {
        self.load_payload(payload, index).await
    }

    async fn add_history(
        &mut self,
        messages: &[Message],
        index: Option<usize>,
    ) -> SandboxResult<usize> {
        self.load_history(messages, index).await
    }

    fn context_count(&self) -> usize {
        self.context_count
    }

    fn history_count(&self) -> usize {
        self.history_count
    }
}
