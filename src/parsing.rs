//! LM output parsing and result rendering
//!
//! Extracts fenced `repl` code blocks and terminating markers from raw LM
//! responses, and renders execution results back into chat-turn form with
//! size clamping.

use crate::sandbox::SandboxSession;
use crate::types::{Iteration, Message, ReplResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Maximum rendered size of one execution result before truncation.
pub const MAX_RESULT_CHARS: usize = 20_000;

/// Rendering of a result with no stdout, no stderr, and no variables.
pub const NO_OUTPUT: &str = "No output";

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```repl[ \t]*\r?\n(.*?)```").unwrap());

// FINAL_VAR takes a short argument, matched non-greedily up to the first
// closing paren. FINAL is greedy so parentheses inside the answer survive.
static FINAL_VAR_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*FINAL_VAR\((.*?)\)").unwrap());
static FINAL_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*FINAL\((.*)\)\s*$").unwrap());

// ============================================================================
// Code-block extraction
// ============================================================================

/// Extract the ordered list of source strings found inside ```repl fences.
///
/// Fences are matched non-greedily; content is trimmed of outer whitespace.
/// Nested fences are not supported.
pub fn extract_code_blocks(text: &str) -> Vec<String> {
    CODE_FENCE
        .captures_iter(text)
        .map(|captures| captures[1].trim().to_string())
        .collect()
}

// ============================================================================
// Terminating markers
// ============================================================================

/// A terminating marker found in an LM response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalMarker {
    /// `FINAL_VAR(name)`: the answer lives in a REPL identifier.
    Var(String),
    /// `FINAL(answer)`: the answer is inline.
    Answer(String),
}

/// Trim whitespace and one optional pair of matching quotes.
fn strip_quotes(raw: &str) -> &str {
    let trimmed = raw.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        if (first == b'"' || first == b'\'') && bytes[bytes.len() - 1] == first {
            return &trimmed[1..trimmed.len() - 1];
        }
    }
    trimmed
}

/// Scan for a terminating marker. `FINAL_VAR` takes priority over `FINAL`;
/// only the first marker of the winning pattern is considered.
pub fn find_final_marker(text: &str) -> Option<FinalMarker> {
    if let Some(captures) = FINAL_VAR_MARKER.captures(text) {
        return Some(FinalMarker::Var(strip_quotes(&captures[1]).to_string()));
    }
    FINAL_MARKER
        .captures(text)
        .map(|captures| FinalMarker::Answer(captures[1].trim().to_string()))
}

/// Resolve a detected marker into the final answer.
///
/// `FINAL(answer)` needs no sandbox. `FINAL_VAR(name)` runs one extra
/// sandbox execution that prints the named identifier through the
/// `FINAL_VAR` hook: captured stdout is the answer, falling back to stderr
/// when stdout is blank. Without a sandbox the marker is detected but no
/// answer is produced.
pub async fn resolve_final_answer(
    text: &str,
    sandbox: Option<&mut dyn SandboxSession>,
) -> Option<String> {
    match find_final_marker(text)? {
        FinalMarker::Answer(answer) => Some(answer),
        FinalMarker::Var(name) => {
            let session = sandbox?;
            let quoted = serde_json::to_string(&name).unwrap_or_else(|_| format!("\"{name}\""));
            let program = format!("print(FINAL_VAR({quoted}))");
            match session.execute_code(&program).await {
                Ok(result) => {
                    let stdout = result.stdout.trim();
                    if stdout.is_empty() {
                        Some(result.stderr.trim().to_string())
                    } else {
                        Some(stdout.to_string())
                    }
                }
                Err(err) => Some(format!("Error: {err}")),
            }
        }
    }
}

// ============================================================================
// Result rendering
// ============================================================================

/// True for values worth listing on the variables line: strings, numbers,
/// booleans, and structured collections.
fn is_presentable(value: &Value) -> bool {
    matches!(
        value,
        Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Array(_) | Value::Object(_)
    )
}

/// Render one execution result for the LM: stdout, stderr, and a one-line
/// listing of presentable variables.
///
/// The clamp covers the captured output, so the elided count in the
/// truncation suffix reflects exactly what the execution printed; the
/// variables line is appended afterwards.
pub fn render_result(result: &ReplResult) -> String {
    let mut sections: Vec<String> = Vec::new();

    let stdout = result.stdout.trim_end();
    if !stdout.trim().is_empty() {
        sections.push(stdout.to_string());
    }
    let stderr = result.stderr.trim_end();
    if !stderr.trim().is_empty() {
        sections.push(stderr.to_string());
    }
    let mut rendered = clamp(&sections.join("\n"));

    let names: Vec<&str> = result
        .locals
        .iter()
        .filter(|(name, value)| !name.starts_with('_') && is_presentable(value))
        .map(|(name, _)| name.as_str())
        .collect();
    if !names.is_empty() {
        if !rendered.is_empty() {
            rendered.push('\n');
        }
        rendered.push_str("Variables: ");
        rendered.push_str(&names.join(", "));
    }

    if rendered.is_empty() {
        return NO_OUTPUT.to_string();
    }
    rendered
}

/// Truncate to [`MAX_RESULT_CHARS`] characters, reporting the elided count.
fn clamp(rendered: &str) -> String {
    let total = rendered.chars().count();
    if total <= MAX_RESULT_CHARS {
        return rendered.to_string();
    }
    let kept: String = rendered.chars().take(MAX_RESULT_CHARS).collect();
    format!("{kept}... + [{} chars...]", total - MAX_RESULT_CHARS)
}

/// Produce the messages appended to the history for one finished turn: the
/// verbatim assistant response, then one user message per executed block
/// pairing the fenced code with its rendered result.
pub fn format_iteration_messages(iteration: &Iteration) -> Vec<Message> {
    let mut messages = vec![Message::assistant(iteration.response.clone())];
    for block in &iteration.code_blocks {
        messages.push(Message::user(format!(
            "```repl\n{}\n```\n{}",
            block.code,
            render_result(&block.result)
        )));
    }
    messages
}

// ============================================================================
// Tests
// ============================================================================
