//! Shared test support: scripted providers and collecting observers.

#![allow(dead_code)]

use async_trait::async_trait;
use rlm_engine::observers::IterationObserver;
use rlm_engine::types::RunMetadata;
use rlm_engine::{Generation, Iteration, Message, ModelProvider, TokenUsage};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Tokens reported by the scripted provider for every call.
pub const SCRIPT_INPUT_TOKENS: u64 = 7;
pub const SCRIPT_OUTPUT_TOKENS: u64 = 3;

/// Replays a fixed sequence of responses, one per call.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str, responses: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, _messages: &[Message]) -> anyhow::Result<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "FINAL(script exhausted)".to_string());
        Ok(Generation {
            text,
            usage: Some(TokenUsage {
                input_tokens: SCRIPT_INPUT_TOKENS,
                output_tokens: SCRIPT_OUTPUT_TOKENS,
            }),
        })
    }
}

/// Maps the last message to its upper-cased form, optionally sleeping a
/// per-prompt delay so batched completions finish out of dispatch order.
pub struct UppercaseProvider {
    name: String,
    delays_ms: HashMap<String, u64>,
    calls: AtomicUsize,
}

impl UppercaseProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delays_ms: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, prompt: &str, delay_ms: u64) -> Self {
        self.delays_ms.insert(prompt.to_string(), delay_ms);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for UppercaseProvider {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, messages: &[Message]) -> anyhow::Result<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        if let Some(delay) = self.delays_ms.get(&prompt) {
            tokio::time::sleep(Duration::from_millis(*delay)).await;
        }
        Ok(Generation {
            text: prompt.to_uppercase(),
            usage: Some(TokenUsage {
                input_tokens: 1,
                output_tokens: 1,
            }),
        })
    }
}

/// Always fails, for exercising the HTTP 500 error path.
pub struct FailingProvider;

#[async_trait]
impl ModelProvider for FailingProvider {
    fn model_name(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _messages: &[Message]) -> anyhow::Result<Generation> {
        anyhow::bail!("synthetic adapter failure")
    }
}

/// Records every observed event for later assertions.
#[derive(Default)]
pub struct CollectingObserver {
    pub metadata: Mutex<Vec<RunMetadata>>,
    pub iterations: Mutex<Vec<(usize, Iteration)>>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iteration_count(&self) -> usize {
        self.iterations.lock().unwrap().len()
    }
}

impl IterationObserver for CollectingObserver {
    fn on_metadata(&self, metadata: &RunMetadata) {
        self.metadata.lock().unwrap().push(metadata.clone());
    }

    fn on_iteration(&self, sequence: usize, iteration: &Iteration) {
        self.iterations
            .lock()
            .unwrap()
            .push((sequence, iteration.clone()));
    }
}

/// The local backend needs a Python interpreter; skip cleanly when the
/// test host has none.
pub fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}
