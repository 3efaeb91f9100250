//! Prompt templates for the iteration driver
//!
//! The published system prompt is an opaque parameter to the driver; this
//! module carries the default text plus the synthesized per-turn messages.

use crate::types::QueryMetadata;
use std::fmt::Write;

/// Chunk-length entries shown in the context report before truncation.
const MAX_CHUNKS_SHOWN: usize = 100;

/// Default system prompt describing the REPL protocol and the marker
/// surface the LM uses to control the loop.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are answering a query over a context that may be far too large to read at once. The context is loaded into a persistent Python REPL as the variable `context`.

You interact with the REPL by emitting fenced code blocks tagged `repl`:

```repl
print(len(context))
```

Each block is executed in order and its output is shown to you on the next turn. Variables persist across turns. Inspect before you conclude: chunk the context, look at slices, and aggregate findings in variables.

Built-ins available inside the REPL:
- llm_query(prompt, model=None) -> str: ask a sub-model about a piece of text you pass in the prompt.
- llm_query_batched(prompts, model=None) -> list[str]: ask many independent questions concurrently; results come back in input order.
- SHOW_VARS() -> dict: names and types of your current REPL variables.
- FINAL_VAR(name) -> str: the textual value of a REPL variable.

To finish, emit exactly one terminating marker on its own line:
- FINAL(your answer here) when the answer is short enough to write inline.
- FINAL_VAR(variable_name) when the answer is held in a REPL variable.

Do not emit a terminating marker until the executed output supports your answer."#;

/// Epilogue request appended when the iteration budget is exhausted.
pub const FINAL_ANSWER_REQUEST: &str = "The iteration budget is exhausted. Using only the information already gathered in this conversation, state your best final answer now. Reply with the answer text only.";

/// Metadata message describing the loaded context, inserted right after the
/// system prompt with the assistant role.
pub fn context_report(metadata: &QueryMetadata) -> String {
    let mut report = String::new();
    let _ = write!(
        report,
        "Context loaded into `context`: shape={}, total {} chars across {} chunk(s).",
        metadata.shape,
        metadata.total_chars,
        metadata.chunk_chars.len()
    );

    let shown = metadata.chunk_chars.len().min(MAX_CHUNKS_SHOWN);
    let listed = metadata.chunk_chars[..shown]
        .iter()
        .map(|len| len.to_string())
        .collect::<Vec<String>>()
        .join(", ");
    let _ = write!(report, " Chunk lengths: [{listed}");
    if metadata.chunk_chars.len() > MAX_CHUNKS_SHOWN {
        let _ = write!(report, ", ... {} others", metadata.chunk_chars.len() - MAX_CHUNKS_SHOWN);
    }
    report.push(']');
    report
}

/// The user-role prompt asking for the next step of iteration `iteration`.
///
/// The first turn carries a safeguard reminding the model it has not yet
/// inspected the REPL; later turns list the extra `context_N` / `history_N`
/// identifiers when more than one of each exists.
pub fn next_step_prompt(
    iteration: u32,
    root_prompt: Option<&str>,
    context_count: usize,
    history_count: usize,
) -> String {
    let mut prompt = String::new();
    if iteration == 0 {
        prompt.push_str(
            "You have not executed any code yet, so you have not seen the context. Inspect it through the REPL before answering.\n\n",
        );
    }

    match root_prompt {
        Some(question) => {
            let _ = write!(prompt, "Question: {question}\n\nWhat is your next step?");
        }
        None => prompt.push_str("What is your next step?"),
    }

    if context_count > 1 {
        let names = (0..context_count)
            .map(|index| format!("context_{index}"))
            .collect::<Vec<String>>()
            .join(", ");
        let _ = write!(prompt, "\nNote: multiple contexts are loaded: {names}.");
    }
    if history_count > 1 {
        let names = (0..history_count)
            .map(|index| format!("history_{index}"))
            .collect::<Vec<String>>()
            .join(", ");
        let _ = write!(prompt, "\nNote: prior conversation histories are available: {names}.");
    }
    prompt
}
