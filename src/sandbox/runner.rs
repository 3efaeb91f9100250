//! Python driver program for sandbox executions
//!
//! Each `execute_code` call materializes one self-contained program from
//! the sections below: the hook preamble (sub-LM calls and REPL
//! introspection), a state codec (JSON for the local backend, pickle
//! inside containers), and the exec harness that runs the user source and
//! emits the structured result record as its final stdout line.

use crate::types::{ReplResult, RlmCall};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Hook functions plus transport to the loopback router. Placeholders:
/// `@@STATE_FILE@@`, `@@ROUTER_URL@@` (JSON string literals), `@@DEPTH@@`.
const HOOK_PREAMBLE: &str = r#"
import base64
import io
import json
import os
import sys
import traceback
import urllib.error
import urllib.request
from contextlib import redirect_stderr, redirect_stdout

_STATE_FILE = @@STATE_FILE@@
_ROUTER_URL = @@ROUTER_URL@@
_DEPTH = @@DEPTH@@
_RLM_CALLS = []
_SCOPE = {}
_RESERVED = {"llm_query", "llm_query_batched", "FINAL_VAR", "SHOW_VARS", "__builtins__"}


def _post_json(path, payload):
    data = json.dumps(payload).encode("utf-8")
    request = urllib.request.Request(
        _ROUTER_URL + path,
        data=data,
        headers={"Content-Type": "application/json"},
        method="POST",
    )
    with urllib.request.urlopen(request, timeout=600) as response:
        return json.loads(response.read().decode("utf-8"))


def _error_detail(error):
    if isinstance(error, urllib.error.HTTPError):
        try:
            body = json.loads(error.read().decode("utf-8"))
            return str(body.get("error", error))
        except Exception:
            return str(error)
    return str(error)


def llm_query(prompt, model=None):
    try:
        reply = _post_json("/llm_query", {"prompt": prompt, "model": model, "depth": _DEPTH})
    except Exception as error:
        return "Error: " + _error_detail(error)
    if reply.get("rlm_call") is not None:
        _RLM_CALLS.append(reply["rlm_call"])
    return reply.get("response", "")


def llm_query_batched(prompts, model=None):
    prompts = list(prompts)
    try:
        reply = _post_json(
            "/llm_query_batched",
            {"prompts": prompts, "model": model, "depth": _DEPTH},
        )
    except Exception as error:
        return ["Error: " + _error_detail(error)] * len(prompts)
    _RLM_CALLS.extend(reply.get("rlm_calls", []))
    return reply.get("responses", [])


def _value_text(value):
    if isinstance(value, str):
        return value
    try:
        return json.dumps(value, ensure_ascii=False)
    except (TypeError, ValueError):
        return str(value)


def _visible_names():
    return sorted(
        name
        for name, value in _SCOPE.items()
        if not name.startswith("_")
        and name not in _RESERVED
        and not callable(value)
        and not isinstance(value, type(sys))
    )


def FINAL_VAR(name):
    key = str(name).strip()
    if len(key) >= 2 and key[0] == key[-1] and key[0] in ("'", '"'):
        key = key[1:-1]
    if key in _SCOPE and not key.startswith("_") and key not in _RESERVED:
        return _value_text(_SCOPE[key])
    return (
        "Variable '%s' is not defined in the REPL. Available variables: %s. "
        "Assign your answer to a variable first, then call FINAL_VAR on it."
        % (key, _visible_names())
    )


def SHOW_VARS():
    return {name: type(_SCOPE[name]).__name__ for name in _visible_names()}
"#;

/// JSON state codec used by the local backend: serializable values are
/// kept as-is, everything else degrades to its printable string.
const JSON_STATE_SECTION: &str = r#"
def _load_state():
    try:
        with open(_STATE_FILE, "r", encoding="utf-8") as handle:
            saved = json.load(handle)
    except Exception:
        saved = {}
    return saved if isinstance(saved, dict) else {}


def _save_state(scope):
    snapshot = {}
    for name, value in scope.items():
        if name.startswith("_") or name in _RESERVED:
            continue
        if callable(value) or isinstance(value, type(sys)):
            continue
        try:
            json.dumps(value)
            snapshot[name] = value
        except (TypeError, ValueError):
            snapshot[name] = str(value)
    tmp_path = _STATE_FILE + ".tmp"
    with open(tmp_path, "w", encoding="utf-8") as handle:
        json.dump(snapshot, handle, ensure_ascii=False)
    os.replace(tmp_path, _STATE_FILE)
    return snapshot
"#;

/// Pickle state codec used inside containers: tolerates a broader value
/// set; values that fail to round-trip are dropped. The result record
/// still carries a JSON-safe snapshot.
const PICKLE_STATE_SECTION: &str = r#"
import pickle


def _load_state():
    try:
        with open(_STATE_FILE, "rb") as handle:
            saved = pickle.load(handle)
    except Exception:
        saved = {}
    return saved if isinstance(saved, dict) else {}


def _save_state(scope):
    keep = {}
    snapshot = {}
    for name, value in scope.items():
        if name.startswith("_") or name in _RESERVED:
            continue
        if callable(value) or isinstance(value, type(sys)):
            continue
        try:
            pickle.loads(pickle.dumps(value))
        except Exception:
            continue
        keep[name] = value
        try:
            json.dumps(value)
            snapshot[name] = value
        except (TypeError, ValueError):
            snapshot[name] = str(value)
    tmp_path = _STATE_FILE + ".tmp"
    with open(tmp_path, "wb") as handle:
        pickle.dump(keep, handle)
    os.replace(tmp_path, _STATE_FILE)
    return snapshot
"#;

/// Exec harness. Placeholder: `@@CODE_B64@@` (base-64 user source).
const EXEC_SECTION: &str = r#"
_SCOPE.update(_load_state())
_SCOPE["llm_query"] = llm_query
_SCOPE["llm_query_batched"] = llm_query_batched
_SCOPE["FINAL_VAR"] = FINAL_VAR
_SCOPE["SHOW_VARS"] = SHOW_VARS

_USER_CODE = base64.b64decode("@@CODE_B64@@").decode("utf-8")
_STDOUT = io.StringIO()
_STDERR = io.StringIO()
try:
    with redirect_stdout(_STDOUT), redirect_stderr(_STDERR):
        exec(_USER_CODE, _SCOPE, _SCOPE)
except BaseException:
    _STDERR.write(traceback.format_exc())

try:
    _LOCALS = _save_state(_SCOPE)
except Exception:
    _LOCALS = {}
    _STDERR.write("\n[state persistence failed: %s]" % traceback.format_exc())

print(json.dumps({
    "stdout": _STDOUT.getvalue(),
    "stderr": _STDERR.getvalue(),
    "locals": _LOCALS,
    "rlm_calls": _RLM_CALLS,
}, ensure_ascii=False, default=str))
"#;

/// Inter-turn state serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateCodec {
    Json,
    Pickle,
}

fn py_string_literal(value: &str) -> String {
    serde_json::to_string(value).expect("string literals always serialize")
}

/// Assemble the self-contained program for one execution.
pub(crate) fn render_program(
    state_file: &str,
    router_url: &str,
    depth: u32,
    code: &str,
    codec: StateCodec,
) -> String {
    let state_section = match codec {
        StateCodec::Json => JSON_STATE_SECTION,
        StateCodec::Pickle => PICKLE_STATE_SECTION,
    };
    let preamble = HOOK_PREAMBLE
        .replace("@@STATE_FILE@@", &py_string_literal(state_file))
        .replace("@@ROUTER_URL@@", &py_string_literal(router_url))
        .replace("@@DEPTH@@", &depth.to_string());
    let exec_section = EXEC_SECTION.replace("@@CODE_B64@@", &BASE64.encode(code));
    format!("{preamble}\n{state_section}\n{exec_section}")
}

// ============================================================================
// Child output parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChildRecord {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    locals: Map<String, Value>,
    #[serde(default)]
    rlm_calls: Vec<RlmCall>,
}

/// Split the child's stdout on newlines and parse the last non-blank line
/// as the structured record. When that fails, the whole raw stdout becomes
/// the result's stdout and a parse-error note joins the stderr.
pub(crate) fn parse_child_output(raw_stdout: &str, raw_stderr: &str, elapsed: f64) -> ReplResult {
    if let Some(line) = raw_stdout.lines().rev().find(|line| !line.trim().is_empty()) {
        if let Ok(record) = serde_json::from_str::<ChildRecord>(line) {
            return ReplResult {
                stdout: record.stdout,
                stderr: record.stderr,
                locals: record.locals,
                execution_time: elapsed,
                rlm_calls: record.rlm_calls,
            };
        }
    }

    let mut stderr =
        String::from("Parse error: interpreter output did not end with a structured record");
    if !raw_stderr.trim().is_empty() {
        stderr.push('\n');
        stderr.push_str(raw_stderr.trim_end());
    }
    ReplResult {
        stdout: raw_stdout.to_string(),
        stderr,
        locals: Map::new(),
        execution_time: elapsed,
        rlm_calls: Vec::new(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_embeds_endpoint_depth_and_code() {
        let program = render_program(
            "/tmp/state.json",
            "http://127.0.0.1:9000",
            1,
            "print('hi')",
            StateCodec::Json,
        );
        assert!(program.contains("_STATE_FILE = \"/tmp/state.json\""));
        assert!(program.contains("_ROUTER_URL = \"http://127.0.0.1:9000\""));
        assert!(program.contains("_DEPTH = 1"));
        assert!(program.contains(&BASE64.encode("print('hi')")));
        assert!(program.contains("json.dump(snapshot, handle"));
        assert!(!program.contains("pickle"));
    }

    #[test]
    fn pickle_codec_swaps_state_section() {
        let program = render_program("/w/state.pkl", "http://h:1", 1, "x = 1", StateCodec::Pickle);
        assert!(program.contains("pickle.dump(keep, handle)"));
    }

    #[test]
    fn parses_last_line_record() {
        let raw = "noise line\n{\"stdout\":\"2\\n\",\"stderr\":\"\",\"locals\":{\"x\":42},\"rlm_calls\":[]}\n";
        let result = parse_child_output(raw, "", 0.5);
        assert_eq!(result.stdout, "2\n");
        assert_eq!(result.locals["x"], serde_json::json!(42));
        assert!(result.rlm_calls.is_empty());
        assert_eq!(result.execution_time, 0.5);
    }

    #[test]
    fn parse_failure_keeps_raw_stdout() {
        let result = parse_child_output("garbage output", "boom", 0.1);
        assert_eq!(result.stdout, "garbage output");
        assert!(result.stderr.starts_with("Parse error"));
        assert!(result.stderr.contains("boom"));
    }

    #[test]
    fn empty_output_is_a_parse_failure() {
        let result = parse_child_output("", "", 0.0);
        assert!(result.stderr.starts_with("Parse error"));
    }
}
