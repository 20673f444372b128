//! Strip interpreter internals from error messages before they reach a
//! caller or the execution history.

use std::sync::LazyLock;

use regex::Regex;

/// `[string "..."]:12:` chunk references.
static CHUNK_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\[string "[^"]*"\]:\d+:\s*"#).expect("valid regex"));

/// `script:12:` references produced by the `=script` chunk name.
static SCRIPT_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bscript:\d+:\s*").expect("valid regex"));

/// `[C]:` and `[C]: in ?` frames.
static C_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[C\]:(\s*in\s+\S+)?\s*").expect("valid regex"));

/// Host source paths such as `src/scripting/library.rs:42:7`.
static HOST_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\S*\.rs:\d+(:\d+)?").expect("valid regex"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Returned when nothing meaningful survives sanitization.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Remove stack tracebacks, chunk/line references and host file paths.
pub fn sanitize_error(raw: &str) -> String {
    let head = raw.split("stack traceback:").next().unwrap_or_default();
    let cleaned = CHUNK_REF.replace_all(head, "");
    let cleaned = SCRIPT_REF.replace_all(&cleaned, "");
    let cleaned = C_FRAME.replace_all(&cleaned, "");
    let cleaned = HOST_PATH.replace_all(&cleaned, "");
    let cleaned = WHITESPACE.replace_all(&cleaned, " ");
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        UNKNOWN_ERROR.to_string()
    } else {
        cleaned.to_string()
    }
}
