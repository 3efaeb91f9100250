//! Iteration driver
//!
//! Orchestrates one completion: starts a loopback router, acquires a
//! sandbox session, then alternates LM turns and code executions until a
//! terminating marker appears or the iteration budget is exhausted.
//! Iteration records are dispatched to observers as they are produced; no
//! history is retained internally.

use crate::config::{sanitize_config_bag, DriverConfig};
use crate::error::{EngineError, Result};
use crate::observers::IterationObserver;
use crate::parsing;
use crate::prompts;
use crate::providers::ModelProvider;
use crate::router::{LlmRouter, RouterAddress};
use crate::sandbox::{self, SandboxSession};
use crate::types::{
    single_call_summary, CodeBlock, Completion, ContextPayload, Iteration, Message, ReplResult,
    RunMetadata,
};
use std::sync::Arc;
use std::time::Instant;

/// Driver for recursive language model completions.
///
/// The router is per-completion; the sandbox session is per-completion
/// unless the driver is `persistent`, in which case the session survives
/// across successive completion calls and accumulates `context_N` /
/// `history_N` identifiers.
pub struct RlmDriver {
    root_model: Arc<dyn ModelProvider>,
    sub_model: Option<Arc<dyn ModelProvider>>,
    config: DriverConfig,
    system_prompt: String,
    log_observer: Option<Arc<dyn IterationObserver>>,
    verbose_observer: Option<Arc<dyn IterationObserver>>,
    held_session: Option<Box<dyn SandboxSession>>,
}

impl RlmDriver {
    /// Create a driver. Fails when the backend name is unknown, or when
    /// persistence is requested with a backend lacking the extension.
    pub fn new(
        root_model: Arc<dyn ModelProvider>,
        sub_model: Option<Arc<dyn ModelProvider>>,
        config: DriverConfig,
    ) -> Result<Self> {
        if config.backend != sandbox::LOCAL_BACKEND && config.backend != sandbox::CONTAINER_BACKEND
        {
            return Err(EngineError::UnknownBackend(config.backend.clone()));
        }
        if config.persistent && !sandbox::supports_persistence(&config.backend) {
            return Err(EngineError::PersistenceUnsupported(config.backend.clone()));
        }

        let system_prompt = config
            .system_prompt
            .clone()
            .unwrap_or_else(|| prompts::DEFAULT_SYSTEM_PROMPT.to_string());

        Ok(Self {
            root_model,
            sub_model,
            config,
            system_prompt,
            log_observer: None,
            verbose_observer: None,
            held_session: None,
        })
    }

    /// Attach the machine-readable record observer.
    pub fn with_log_observer(mut self, observer: Arc<dyn IterationObserver>) -> Self {
        self.log_observer = Some(observer);
        self
    }

    /// Attach the human-readable terminal observer.
    pub fn with_verbose_observer(mut self, observer: Arc<dyn IterationObserver>) -> Self {
        self.verbose_observer = Some(observer);
        self
    }

    fn emit_metadata(&self, metadata: &RunMetadata) {
        if let Some(observer) = &self.log_observer {
            observer.on_metadata(metadata);
        }
        if let Some(observer) = &self.verbose_observer {
            observer.on_metadata(metadata);
        }
    }

    fn emit_iteration(&self, sequence: usize, iteration: &Iteration) {
        if let Some(observer) = &self.log_observer {
            observer.on_iteration(sequence, iteration);
        }
        if let Some(observer) = &self.verbose_observer {
            observer.on_iteration(sequence, iteration);
        }
    }

    fn metadata_record(&self) -> RunMetadata {
        RunMetadata {
            root_model: self.root_model.model_name().to_string(),
            max_depth: self.config.max_depth,
            max_iterations: self.config.max_iterations,
            backend: self.config.backend.clone(),
            environment: sanitize_config_bag(&self.config.sandbox),
            sub_models: self
                .sub_model
                .as_ref()
                .map(|model| vec![model.model_name().to_string()]),
        }
    }

    /// Run one end-to-end completion over the payload.
    pub async fn completion(
        &mut self,
        payload: impl Into<ContextPayload>,
        root_prompt: Option<&str>,
    ) -> Result<Completion> {
        let payload = payload.into();
        let started = Instant::now();

        // The metadata record precedes whatever follows, including a
        // fallback completion with zero iteration records.
        self.emit_metadata(&self.metadata_record());

        if self.config.depth >= self.config.max_depth {
            return self.fallback_completion(&payload, root_prompt, started).await;
        }

        let mut router = LlmRouter::new(Arc::clone(&self.root_model), self.sub_model.clone());
        let address = match router.start().await {
            Ok(address) => address,
            Err(err) => {
                router.stop().await;
                return Err(err);
            }
        };

        let mut session = match self.acquire_session(&address, &payload).await {
            Ok(session) => session,
            Err(err) => {
                router.stop().await;
                return Err(err);
            }
        };

        let result = self
            .run_iterations(&router, session.as_mut(), &payload, root_prompt, started)
            .await;

        // Every exit path stops the router and destroys the sandbox unless
        // the driver is persistent.
        router.stop().await;
        if self.config.persistent {
            self.held_session = Some(session);
        } else if let Err(err) = session.cleanup().await {
            tracing::warn!(error = %err, "Sandbox cleanup failed");
        }
        result
    }

    /// Depth budget reached: one direct LM call on the root model with the
    /// payload as a single user message.
    async fn fallback_completion(
        &self,
        payload: &ContextPayload,
        root_prompt: Option<&str>,
        started: Instant,
    ) -> Result<Completion> {
        tracing::debug!(
            depth = self.config.depth,
            max_depth = self.config.max_depth,
            "Depth budget reached, answering with a direct completion"
        );

        let messages = vec![Message::user(payload.to_prompt_text())];
        let generation = self
            .root_model
            .generate(&messages)
            .await
            .map_err(|err| EngineError::Provider(err.to_string()))?;
        let usage = generation.usage.unwrap_or_default();

        Ok(Completion {
            root_model: self.root_model.model_name().to_string(),
            prompt: root_prompt.map(str::to_string),
            response: generation.text,
            usage_summary: single_call_summary(
                self.root_model.model_name(),
                usage.input_tokens,
                usage.output_tokens,
            ),
            execution_time: started.elapsed().as_secs_f64(),
        })
    }

    /// Acquire a sandbox: the held persistent session (rebound to the new
    /// router, payload stacked as the next `context_N`) or a fresh one.
    async fn acquire_session(
        &mut self,
        address: &RouterAddress,
        payload: &ContextPayload,
    ) -> Result<Box<dyn SandboxSession>> {
        if let Some(mut held) = self.held_session.take() {
            if let Some(persistent) = held.as_persistent() {
                persistent.update_handler_address(address);
                persistent.add_context(payload, None).await?;
            }
            return Ok(held);
        }

        let mut created = sandbox::create_session(
            &self.config.backend,
            &self.config.sandbox,
            address,
            self.config.depth + 1,
        )?;
        if let Err(err) = created.setup().await {
            let _ = created.cleanup().await;
            return Err(err.into());
        }
        if let Err(err) = created.load_context(payload).await {
            let _ = created.cleanup().await;
            return Err(err.into());
        }
        Ok(created)
    }

    async fn run_iterations(
        &self,
        router: &LlmRouter,
        session: &mut dyn SandboxSession,
        payload: &ContextPayload,
        root_prompt: Option<&str>,
        started: Instant,
    ) -> Result<Completion> {
        let metadata = payload.metadata();
        let mut history = vec![
            Message::system(self.system_prompt.clone()),
            Message::assistant(prompts::context_report(&metadata)),
        ];

        for iteration_index in 0..self.config.max_iterations {
            let turn_started = Instant::now();

            let (context_count, history_count) = match session.as_persistent() {
                Some(persistent) => (persistent.context_count(), persistent.history_count()),
                None => (1, 0),
            };
            history.push(Message::user(prompts::next_step_prompt(
                iteration_index,
                root_prompt,
                context_count,
                history_count,
            )));

            let response = router.complete(&history).await?;
            tracing::debug!(
                iteration = iteration_index,
                response_chars = response.chars().count(),
                "Received LM turn"
            );

            let mut code_blocks = Vec::new();
            for code in parsing::extract_code_blocks(&response) {
                let result = match session.execute_code(&code).await {
                    Ok(result) => result,
                    Err(err) => ReplResult::failure("", format!("Error: {err}")),
                };
                code_blocks.push(CodeBlock { code, result });
            }

            // FINAL_VAR may execute one additional sandbox call here.
            let final_answer = parsing::resolve_final_answer(&response, Some(&mut *session)).await;

            let iteration = Iteration {
                history: history.clone(),
                response: response.clone(),
                code_blocks,
                final_answer: final_answer.clone(),
                iteration_time: turn_started.elapsed().as_secs_f64(),
            };
            self.emit_iteration(iteration_index as usize, &iteration);

            if let Some(answer) = final_answer {
                if self.config.persistent {
                    let mut completed = history.clone();
                    completed.push(Message::assistant(response));
                    if let Some(persistent) = session.as_persistent() {
                        if let Err(err) = persistent.add_history(&completed, None).await {
                            tracing::warn!(error = %err, "Failed to record completed history");
                        }
                    }
                }
                return Ok(Completion {
                    root_model: self.root_model.model_name().to_string(),
                    prompt: root_prompt.map(str::to_string),
                    response: answer,
                    usage_summary: router.usage().get_usage_summary(),
                    execution_time: started.elapsed().as_secs_f64(),
                });
            }

            let mut appended = parsing::format_iteration_messages(&iteration);
            history.append(&mut appended);
        }

        // Budget exhausted: one more turn asking for the final answer from
        // the accumulated history.
        tracing::debug!(
            max_iterations = self.config.max_iterations,
            "Iteration budget exhausted, requesting a final answer"
        );
        history.push(Message::assistant(prompts::FINAL_ANSWER_REQUEST.to_string()));
        let response = router.complete(&history).await?;

        Ok(Completion {
            root_model: self.root_model.model_name().to_string(),
            prompt: root_prompt.map(str::to_string),
            response: response.trim().to_string(),
            usage_summary: router.usage().get_usage_summary(),
            execution_time: started.elapsed().as_secs_f64(),
        })
    }
}
