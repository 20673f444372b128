//! One untrusted script call in a freshly constructed interpreter.
//!
//! [`run_script`] builds a new Lua state for every call, strips it down to
//! the capability allow-list, installs the host library and the input
//! context, and runs the chunk under a statement ceiling. The state is
//! dropped when the call returns, whatever the outcome. Nothing is pooled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mlua::{DebugEvent, HookTriggers, Lua, LuaOptions, StdLib, Value as LuaValue, VmState};
use tokio_util::sync::CancellationToken;

use crate::value::{Map, Value};

use super::config::SandboxLimits;
use super::convert::{from_sandbox, install_array_marker, to_sandbox, track_array_removals};
use super::guard::install_guards;
use super::library::{install_console, install_erp, stash_tostring, ConsoleBuffer};
use super::sanitize::sanitize_error;

/// Base-library globals a script may use. Everything else is removed.
pub const ALLOWED_GLOBALS: &[&str] = &[
    "assert",
    "error",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "xpcall",
    "select",
    "tonumber",
    "tostring",
    "type",
    "rawequal",
    "rawlen",
    "rawget",
    "rawset",
    "setmetatable",
    "getmetatable",
    "_VERSION",
    "_G",
    "math",
    "string",
    "table",
    "utf8",
];

/// VM instructions between interrupt polls when no line event fires.
const INTERRUPT_POLL_INSTRUCTIONS: u32 = 1_000;

/// Chunk name; errors are reported as `script:<line>:` and then sanitized.
const CHUNK_NAME: &str = "=script";

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

/// Internal failures raised while preparing, running or converting a call.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("statement limit of {limit} exceeded")]
    StatementLimit { limit: u64 },

    #[error("script execution interrupted")]
    Interrupted,

    #[error("cyclic structure cannot be converted to a value")]
    CyclicStructure,

    #[error("value nested deeper than {max} levels")]
    TooDeep { max: usize },

    #[error("cannot convert a {0} value")]
    Unsupported(&'static str),

    #[error("unsupported table key of type {0}")]
    UnsupportedKey(&'static str),

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

/// Classified result of one sandbox call.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxOutcome {
    /// The chunk returned; its first return value, converted.
    Success(Value),
    /// The script raised an error or failed to parse. Sanitized message.
    RuntimeFailure(String),
    /// The statement ceiling was breached.
    ResourceExhausted,
    /// The call was cancelled from outside before it finished.
    Interrupted,
}

impl SandboxOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::RuntimeFailure(_) => "runtime_failure",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Everything a sandbox call produces.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxRun {
    pub outcome: SandboxOutcome,
    /// Captured `console.*` lines.
    pub logs: Vec<String>,
    /// Statements counted by the ceiling hook.
    pub statements: u64,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Hook state shared between the interpreter hook and the caller.
#[derive(Debug, Default)]
struct StepGuard {
    statements: AtomicU64,
    exhausted: AtomicBool,
    interrupted: AtomicBool,
}

/// Run `source` against `context` in a fresh interpreter.
///
/// Blocking: call it from a worker thread. `cancel` is polled by the
/// interpreter hook; cancelling it ends the call as
/// [`SandboxOutcome::Interrupted`] at the next hook event.
pub fn run_script(
    source: &str,
    context: &Map,
    limits: &SandboxLimits,
    cancel: &CancellationToken,
) -> SandboxRun {
    let started = Instant::now();
    let guard = Arc::new(StepGuard::default());
    let console = ConsoleBuffer::new();

    let result = execute(source, context, limits, cancel, &guard, &console);

    let outcome = if guard.exhausted.load(Ordering::Relaxed) {
        SandboxOutcome::ResourceExhausted
    } else if guard.interrupted.load(Ordering::Relaxed) {
        SandboxOutcome::Interrupted
    } else {
        match result {
            Ok(value) => SandboxOutcome::Success(value),
            Err(SandboxError::Interrupted) => SandboxOutcome::Interrupted,
            Err(err) => SandboxOutcome::RuntimeFailure(sanitize_error(&describe(&err))),
        }
    };

    let statements = guard.statements.load(Ordering::Relaxed);
    tracing::debug!(
        outcome = outcome.label(),
        statements,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Sandbox call finished",
    );

    SandboxRun {
        outcome,
        logs: console.take(),
        statements,
    }
}

fn execute(
    source: &str,
    context: &Map,
    limits: &SandboxLimits,
    cancel: &CancellationToken,
    guard: &Arc<StepGuard>,
    console: &ConsoleBuffer,
) -> Result<Value, SandboxError> {
    let lua = Lua::new_with(
        StdLib::MATH | StdLib::STRING | StdLib::TABLE | StdLib::UTF8,
        LuaOptions::new(),
    )?;

    install_array_marker(&lua)?;
    stash_tostring(&lua)?;
    restrict_globals(&lua)?;
    install_guards(&lua)?;
    track_array_removals(&lua)?;
    install_erp(&lua)?;
    install_console(&lua, console)?;
    bind_context(&lua, context)?;

    lua.set_memory_limit(limits.max_memory_bytes())?;
    install_step_hook(&lua, limits.max_statements, cancel.clone(), Arc::clone(guard));

    let chunk = lua.load(source).set_name(CHUNK_NAME).into_function()?;
    let returned: LuaValue = chunk.call(())?;
    from_sandbox(&lua, returned)
}

/// Drop every global outside [`ALLOWED_GLOBALS`] and remove `string.dump`.
fn restrict_globals(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();

    let mut denied = Vec::new();
    for pair in globals.clone().pairs::<LuaValue, LuaValue>() {
        let (key, _) = pair?;
        let allowed = match &key {
            LuaValue::String(name) => name
                .to_str()
                .map(|name| ALLOWED_GLOBALS.contains(&&*name))
                .unwrap_or(false),
            _ => false,
        };
        if !allowed {
            denied.push(key);
        }
    }
    for key in denied {
        globals.raw_set(key, LuaValue::Nil)?;
    }

    let string: mlua::Table = globals.raw_get("string")?;
    string.raw_set("dump", LuaValue::Nil)
}

/// Expose each context key as a global. Host globals win on collision.
fn bind_context(lua: &Lua, context: &Map) -> mlua::Result<()> {
    let globals = lua.globals();
    for (key, value) in context {
        let existing: LuaValue = globals.raw_get(key.as_str())?;
        if !existing.is_nil() {
            tracing::warn!(key = %key, "Context key shadows a host global; ignored");
            continue;
        }
        globals.raw_set(key.as_str(), to_sandbox(lua, value)?)?;
    }
    Ok(())
}

/// Count statements and poll for cancellation.
///
/// Once the ceiling trips, every later hook event fails too, so `pcall`
/// cannot swallow the abort.
fn install_step_hook(lua: &Lua, max_statements: u64, cancel: CancellationToken, guard: Arc<StepGuard>) {
    let triggers = HookTriggers {
        every_line: true,
        every_nth_instruction: Some(INTERRUPT_POLL_INSTRUCTIONS),
        ..Default::default()
    };
    lua.set_hook(triggers, move |_lua, debug| {
        if guard.exhausted.load(Ordering::Relaxed) {
            return Err(mlua::Error::external(SandboxError::StatementLimit {
                limit: max_statements,
            }));
        }
        if cancel.is_cancelled() {
            guard.interrupted.store(true, Ordering::Relaxed);
            return Err(mlua::Error::external(SandboxError::Interrupted));
        }
        if let DebugEvent::Line = debug.event() {
            let executed = guard.statements.fetch_add(1, Ordering::Relaxed) + 1;
            if executed > max_statements {
                guard.exhausted.store(true, Ordering::Relaxed);
                return Err(mlua::Error::external(SandboxError::StatementLimit {
                    limit: max_statements,
                }));
            }
        }
        Ok(VmState::Continue)
    });
}

/// Raw message for an error, before sanitization.
fn describe(err: &SandboxError) -> String {
    match err {
        SandboxError::Lua(lua_err) => describe_lua(lua_err),
        other => other.to_string(),
    }
}

fn describe_lua(err: &mlua::Error) -> String {
    match err {
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::MemoryError(_) => "memory limit exceeded".to_string(),
        mlua::Error::CallbackError { cause, .. } => describe_lua(cause),
        mlua::Error::ExternalError(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
