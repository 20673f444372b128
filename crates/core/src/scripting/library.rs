//! Host-provided globals: the `ERP` utility library and `console`.
//!
//! These are the only host functions a script can reach. Every function
//! works on plain values; none of them touches the network, the filesystem,
//! the process environment or any other host object.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use mlua::{Function, Lua, Value as LuaValue, Variadic};
use regex::Regex;

use crate::value::{Map, Value};

use super::convert::{from_sandbox, number_to_value, to_sandbox};

static SLUG_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid regex"));

static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("valid regex")
});

/// Maximum console lines kept per call.
pub const MAX_LOG_LINES: usize = 200;

/// Maximum characters kept per console line.
pub const MAX_LOG_LINE_CHARS: usize = 1_000;

const TOSTRING_KEY: &str = "scriptbox.tostring";

// ---------------------------------------------------------------------------
// Console capture
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ConsoleLines {
    lines: Vec<String>,
    dropped: usize,
}

/// Bounded capture of `console.*` output for one call.
#[derive(Debug, Clone, Default)]
pub struct ConsoleBuffer {
    inner: Arc<Mutex<ConsoleLines>>,
}

impl ConsoleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, line: String) {
        let line: String = if line.chars().count() > MAX_LOG_LINE_CHARS {
            line.chars().take(MAX_LOG_LINE_CHARS).collect()
        } else {
            line
        };
        tracing::debug!(line = %line, "Script console output");

        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.lines.len() < MAX_LOG_LINES {
            guard.lines.push(line);
        } else {
            guard.dropped += 1;
        }
    }

    /// Captured lines, with a trailing marker when lines were dropped.
    pub fn take(&self) -> Vec<String> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut lines = std::mem::take(&mut guard.lines);
        if guard.dropped > 0 {
            lines.push(format!("[{} more lines truncated]", guard.dropped));
            guard.dropped = 0;
        }
        lines
    }
}

// ---------------------------------------------------------------------------
// Installation
// ---------------------------------------------------------------------------

/// Keep a private reference to the builtin `tostring` so console output is
/// unaffected by scripts that reassign the global.
pub fn stash_tostring(lua: &Lua) -> mlua::Result<()> {
    let tostring: Function = lua.globals().raw_get("tostring")?;
    lua.set_named_registry_value(TOSTRING_KEY, tostring)
}

/// Install `console` with `log`, `warn` and `error`.
pub fn install_console(lua: &Lua, buffer: &ConsoleBuffer) -> mlua::Result<()> {
    let console = lua.create_table()?;
    for (name, prefix) in [("log", ""), ("warn", "[WARN] "), ("error", "[ERROR] ")] {
        let buffer = buffer.clone();
        let function = lua.create_function(move |lua, args: Variadic<LuaValue>| {
            let tostring: Function = lua.named_registry_value(TOSTRING_KEY)?;
            let mut parts = Vec::with_capacity(args.len());
            for arg in args.iter() {
                let part: String = tostring.call(arg.clone())?;
                parts.push(part);
            }
            buffer.push(format!("{prefix}{}", parts.join(" ")));
            Ok(())
        })?;
        console.raw_set(name, function)?;
    }
    lua.globals().raw_set("console", console)
}

/// Install the `ERP` utility table.
pub fn install_erp(lua: &Lua) -> mlua::Result<()> {
    let erp = lua.create_table()?;

    erp.raw_set(
        "round",
        lua.create_function(|_, (n, decimals): (f64, Option<i32>)| {
            Ok(number_to_lua(round_half_up(n, decimals.unwrap_or(0))))
        })?,
    )?;
    erp.raw_set(
        "clamp",
        lua.create_function(|_, (n, min, max): (f64, f64, f64)| {
            Ok(number_to_lua(n.max(min).min(max)))
        })?,
    )?;
    erp.raw_set(
        "slugify",
        lua.create_function(|_, s: String| Ok(slugify(&s)))?,
    )?;
    erp.raw_set(
        "sum",
        lua.create_function(|lua, arr: LuaValue| {
            let items = array_arg(lua, arr, "sum")?;
            sum(&items).map(value_to_lua_number).map_err(mlua::Error::RuntimeError)
        })?,
    )?;
    erp.raw_set(
        "avg",
        lua.create_function(|lua, arr: LuaValue| {
            let items = array_arg(lua, arr, "avg")?;
            if items.is_empty() {
                return Ok(LuaValue::Integer(0));
            }
            let total = sum(&items).map_err(mlua::Error::RuntimeError)?;
            let total = total.as_f64().unwrap_or_default();
            Ok(number_to_lua(total / items.len() as f64))
        })?,
    )?;
    erp.raw_set(
        "unique",
        lua.create_function(|lua, arr: LuaValue| {
            let items = array_arg(lua, arr, "unique")?;
            let items = unique(items).map_err(mlua::Error::external)?;
            to_sandbox(lua, &Value::Array(items))
        })?,
    )?;
    erp.raw_set(
        "groupBy",
        lua.create_function(|lua, (arr, key): (LuaValue, String)| {
            let items = array_arg(lua, arr, "groupBy")?;
            to_sandbox(lua, &Value::Object(group_by(items, &key)))
        })?,
    )?;
    erp.raw_set(
        "isEmail",
        lua.create_function(|_, s: LuaValue| Ok(string_matches(&s, &EMAIL)))?,
    )?;
    erp.raw_set(
        "isUUID",
        lua.create_function(|_, s: LuaValue| Ok(string_matches(&s, &UUID)))?,
    )?;
    erp.raw_set(
        "now",
        lua.create_function(|_, ()| Ok(Utc::now().timestamp_millis()))?,
    )?;
    erp.raw_set(
        "formatDate",
        lua.create_function(|_, millis: f64| {
            format_date(millis).ok_or_else(|| {
                mlua::Error::RuntimeError("ERP.formatDate: invalid timestamp".to_string())
            })
        })?,
    )?;

    lua.globals().raw_set("ERP", erp)
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// `Math.round` semantics: halves round towards positive infinity.
fn round_half_up(n: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (n * factor + 0.5).floor() / factor
}

fn slugify(s: &str) -> String {
    let lowered = s.to_lowercase();
    SLUG_SEPARATOR
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

fn sum(items: &[Value]) -> Result<Value, String> {
    let mut int_total: Option<i64> = Some(0);
    let mut float_total = 0.0;
    for item in items {
        match item {
            Value::Int(i) => {
                int_total = int_total.and_then(|total| total.checked_add(*i));
                float_total += *i as f64;
            }
            Value::Float(f) => {
                int_total = None;
                float_total += f;
            }
            other => {
                return Err(format!(
                    "ERP.sum expects an array of numbers, found {}",
                    other.type_name()
                ))
            }
        }
    }
    Ok(match int_total {
        Some(total) => Value::Int(total),
        None => number_to_value(float_total),
    })
}

/// First occurrence wins; equality is structural.
///
/// Sandbox values are canonical (integral floats are already `Int`, object
/// keys sorted), so the JSON text of a value identifies it.
fn unique(items: Vec<Value>) -> serde_json::Result<Vec<Value>> {
    let mut seen = HashSet::with_capacity(items.len());
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        if seen.insert(serde_json::to_string(&item)?) {
            kept.push(item);
        }
    }
    Ok(kept)
}

fn group_by(items: Vec<Value>, key: &str) -> Map {
    let mut groups: IndexMap<String, Vec<Value>> = IndexMap::new();
    for item in items {
        let group = match item.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Int(i)) => i.to_string(),
            Some(Value::Float(f)) => f.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(Value::Null) => "null".to_string(),
            Some(_) | None => "undefined".to_string(),
        };
        groups.entry(group).or_default().push(item);
    }
    groups
        .into_iter()
        .map(|(group, members)| (group, Value::Array(members)))
        .collect()
}

fn string_matches(value: &LuaValue, pattern: &Regex) -> bool {
    match value {
        LuaValue::String(s) => s.to_str().map(|s| pattern.is_match(&s)).unwrap_or(false),
        _ => false,
    }
}

fn format_date(millis: f64) -> Option<String> {
    if !millis.is_finite() {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(millis.trunc() as i64)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Accept an array, or an empty table (which the sandbox cannot tell apart
/// from an empty object).
fn array_arg(lua: &Lua, arr: LuaValue, function: &str) -> mlua::Result<Vec<Value>> {
    match from_sandbox(lua, arr).map_err(mlua::Error::external)? {
        Value::Array(items) => Ok(items),
        Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        other => Err(mlua::Error::RuntimeError(format!(
            "ERP.{function} expects an array, found {}",
            other.type_name()
        ))),
    }
}

fn number_to_lua(n: f64) -> LuaValue {
    value_to_lua_number(number_to_value(n))
}

fn value_to_lua_number(value: Value) -> LuaValue {
    match value {
        Value::Int(i) => LuaValue::Integer(i),
        Value::Float(f) => LuaValue::Number(f),
        _ => LuaValue::Number(f64::NAN),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
