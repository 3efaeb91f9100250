//! Iteration stream observers
//!
//! The driver dispatches one metadata record and one iteration record per
//! turn to whichever observers are attached. The JSONL observer writes
//! machine-readable lines to disk; the verbose observer renders the same
//! events for a terminal and is purely cosmetic.

use crate::types::{Iteration, RunMetadata};
use serde_json::{json, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Receiver of the iteration stream of one completion.
pub trait IterationObserver: Send + Sync {
    /// Called once per completion, before any iteration record.
    fn on_metadata(&self, metadata: &RunMetadata);

    /// Called once per turn, in strict turn order.
    fn on_iteration(&self, sequence: usize, iteration: &Iteration);
}

// ============================================================================
// JSONL log observer
// ============================================================================

/// Appends one UTF-8 JSON line per record to a log file.
///
/// Each line carries leading `seq`, ISO-8601 `timestamp`, and `type`
/// (`metadata` or `iteration`) fields alongside the record's own fields,
/// so every line parses as a single JSON value.
pub struct JsonlLogObserver {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlLogObserver {
    /// Open (or create) the log file in append mode.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&self, record_type: &str, sequence: usize, record: Value) {
        let mut line = json!({
            "seq": sequence,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "type": record_type,
        });
        if let (Some(line_map), Value::Object(fields)) = (line.as_object_mut(), record) {
            for (key, value) in fields {
                line_map.insert(key, value);
            }
        }

        let mut file = self.file.lock().unwrap();
        if let Err(err) = writeln!(file, "{line}") {
            tracing::warn!(path = %self.path.display(), error = %err, "Failed to write log record");
        }
    }
}

impl IterationObserver for JsonlLogObserver {
    fn on_metadata(&self, metadata: &RunMetadata) {
        match serde_json::to_value(metadata) {
            Ok(record) => self.write_record("metadata", 0, record),
            Err(err) => tracing::warn!(error = %err, "Failed to serialize metadata record"),
        }
    }

    fn on_iteration(&self, sequence: usize, iteration: &Iteration) {
        match serde_json::to_value(iteration) {
            Ok(record) => self.write_record("iteration", sequence, record),
            Err(err) => tracing::warn!(error = %err, "Failed to serialize iteration record"),
        }
    }
}

// ============================================================================
// Verbose observer
// ============================================================================

/// Human-readable terminal rendering of the iteration stream.
#[derive(Debug, Default)]
pub struct VerboseObserver;

impl VerboseObserver {
    pub fn new() -> Self {
        Self
    }

    fn preview(text: &str, max_chars: usize) -> String {
        let flattened = text.replace('\n', " ");
        let mut preview: String = flattened.chars().take(max_chars).collect();
        if flattened.chars().count() > max_chars {
            preview.push_str("...");
        }
        preview
    }
}

impl IterationObserver for VerboseObserver {
    fn on_metadata(&self, metadata: &RunMetadata) {
        println!(
            "=== RLM completion: model={} backend={} max_iterations={} max_depth={} ===",
            metadata.root_model, metadata.backend, metadata.max_iterations, metadata.max_depth
        );
        if let Some(sub_models) = &metadata.sub_models {
            println!("    sub-models: {}", sub_models.join(", "));
        }
    }

    fn on_iteration(&self, sequence: usize, iteration: &Iteration) {
        println!(
            "--- iteration {sequence} ({:.2}s, {} code block(s)) ---",
            iteration.iteration_time,
            iteration.code_blocks.len()
        );
        println!("LM: {}", Self::preview(&iteration.response, 200));
        for block in &iteration.code_blocks {
            println!("  code: {}", Self::preview(&block.code, 120));
            if !block.result.stdout.trim().is_empty() {
                println!("  stdout: {}", Self::preview(&block.result.stdout, 120));
            }
            if !block.result.stderr.trim().is_empty() {
                println!("  stderr: {}", Self::preview(&block.result.stderr, 120));
            }
            for call in &block.result.rlm_calls {
                println!("  sub-LM [{}]: {}", call.model, Self::preview(&call.response, 80));
            }
        }
        if let Some(answer) = &iteration.final_answer {
            println!("FINAL: {}", Self::preview(answer, 200));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
