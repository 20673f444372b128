//! Conversion between [`Value`] and interpreter values.
//!
//! Both directions are total: every [`Value`] has a sandbox form, and every
//! sandbox value either converts or yields a [`SandboxError`]. Arrays created
//! by the host are remembered in a weak-keyed registry table so that empty
//! arrays (and arrays with `null` holes) come back as arrays.

use std::collections::HashSet;

use mlua::{Function, Lua, MultiValue, Table, Value as LuaValue, Variadic};

use crate::value::{Map, Value};

use super::sandbox::SandboxError;

/// Maximum nesting depth accepted in either direction.
pub const MAX_DEPTH: usize = 64;

/// Largest magnitude at which every integer is exactly representable as f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

const ARRAY_MARKER_KEY: &str = "scriptbox.arrays";

/// Create the per-runtime array marker. Must run before any conversion.
pub fn install_array_marker(lua: &Lua) -> mlua::Result<()> {
    let marker: Table = lua
        .load("return setmetatable({}, { __mode = 'k' })")
        .set_name("=marker")
        .eval()?;
    lua.set_named_registry_value(ARRAY_MARKER_KEY, marker)
}

fn array_marker(lua: &Lua) -> mlua::Result<Table> {
    lua.named_registry_value(ARRAY_MARKER_KEY)
}

/// Shrink the recorded length of a host array when `table.remove` takes an
/// element out of it, so a popped array does not come back padded with
/// `null`.
pub fn track_array_removals(lua: &Lua) -> mlua::Result<()> {
    let table: Table = lua.globals().raw_get("table")?;
    let original: Function = table.raw_get("remove")?;
    let tracked = lua.create_function(move |lua, args: Variadic<LuaValue>| {
        let target = match args.first() {
            Some(LuaValue::Table(target)) => Some((target.clone(), target.raw_len())),
            _ => None,
        };
        let removed = original.call::<MultiValue>(args)?;
        if let Some((target, len_before)) = target {
            let marker = array_marker(lua)?;
            let recorded: Option<usize> = marker.raw_get(target.clone())?;
            if let Some(recorded) = recorded.filter(|_| len_before > 0) {
                marker.raw_set(target, recorded.saturating_sub(1))?;
            }
        }
        Ok(removed)
    })?;
    table.raw_set("remove", tracked)
}

// ---------------------------------------------------------------------------
// Host -> sandbox
// ---------------------------------------------------------------------------

/// Convert a host value into an interpreter value.
pub fn to_sandbox(lua: &Lua, value: &Value) -> mlua::Result<LuaValue> {
    let marker = array_marker(lua)?;
    to_lua(lua, &marker, value, 0)
}

fn to_lua(lua: &Lua, marker: &Table, value: &Value, depth: usize) -> mlua::Result<LuaValue> {
    let converted = match value {
        Value::Null => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(*b),
        Value::Int(i) => LuaValue::Integer(*i),
        Value::Float(f) => LuaValue::Number(*f),
        Value::String(s) => LuaValue::String(lua.create_string(s)?),
        Value::Array(items) => {
            check_depth(depth).map_err(mlua::Error::external)?;
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (index, item) in items.iter().enumerate() {
                table.raw_set(index + 1, to_lua(lua, marker, item, depth + 1)?)?;
            }
            // The stored length bounds how sparse a returned array may be.
            marker.raw_set(table.clone(), items.len())?;
            LuaValue::Table(table)
        }
        Value::Object(map) => {
            check_depth(depth).map_err(mlua::Error::external)?;
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, item) in map {
                table.raw_set(key.as_str(), to_lua(lua, marker, item, depth + 1)?)?;
            }
            LuaValue::Table(table)
        }
    };
    Ok(converted)
}

// ---------------------------------------------------------------------------
// Sandbox -> host
// ---------------------------------------------------------------------------

/// Convert an interpreter value into a host value.
pub fn from_sandbox(lua: &Lua, value: LuaValue) -> Result<Value, SandboxError> {
    let marker = array_marker(lua)?;
    let mut ancestors = HashSet::new();
    from_lua(&marker, value, &mut ancestors, 0)
}

fn from_lua(
    marker: &Table,
    value: LuaValue,
    ancestors: &mut HashSet<usize>,
    depth: usize,
) -> Result<Value, SandboxError> {
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Boolean(b) => Ok(Value::Bool(b)),
        LuaValue::Integer(i) => Ok(Value::Int(i)),
        LuaValue::Number(n) => Ok(number_to_value(n)),
        LuaValue::String(s) => Ok(Value::String(String::from(s.to_string_lossy()))),
        LuaValue::Table(table) => from_table(marker, table, ancestors, depth),
        other => Err(SandboxError::Unsupported(other.type_name())),
    }
}

/// Integral floats inside the safe-integer range become `Int`; NaN and
/// infinities have no JSON form and become `Null`.
pub fn number_to_value(n: f64) -> Value {
    if !n.is_finite() {
        Value::Null
    } else if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Value::Int(n as i64)
    } else {
        Value::Float(n)
    }
}

fn from_table(
    marker: &Table,
    table: Table,
    ancestors: &mut HashSet<usize>,
    depth: usize,
) -> Result<Value, SandboxError> {
    check_depth(depth)?;
    let identity = table.to_pointer() as usize;
    if !ancestors.insert(identity) {
        return Err(SandboxError::CyclicStructure);
    }

    let mut entries = Vec::new();
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        entries.push(pair?);
    }
    let host_len: Option<usize> = marker.raw_get(table)?;

    let converted = match array_len(&entries, host_len) {
        Some(len) => {
            let mut items = vec![Value::Null; len];
            for (key, item) in entries {
                if let LuaValue::Integer(index) = key {
                    items[(index - 1) as usize] = from_lua(marker, item, ancestors, depth + 1)?;
                }
            }
            Value::Array(items)
        }
        None => {
            let mut fields = Vec::with_capacity(entries.len());
            for (key, item) in entries {
                let key = object_key(&key)?;
                fields.push((key, from_lua(marker, item, ancestors, depth + 1)?));
            }
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(fields.into_iter().collect::<Map>())
        }
    };

    ancestors.remove(&identity);
    Ok(converted)
}

/// Decide whether a table is an array and, if so, how long it is.
///
/// Host-created arrays may contain holes (from `null` elements or script
/// edits) as long as every key is a positive integer within a linear bound.
/// They keep at least their recorded length, so trailing `null`s survive.
/// Script-created tables are arrays only when their keys are exactly `1..n`.
fn array_len(entries: &[(LuaValue, LuaValue)], host_len: Option<usize>) -> Option<usize> {
    let mut max_index = 0usize;
    for (key, _) in entries {
        match key {
            LuaValue::Integer(index) if *index >= 1 => {
                max_index = max_index.max(usize::try_from(*index).ok()?);
            }
            _ => return None,
        }
    }

    match host_len {
        Some(len) if max_index <= len + entries.len() => Some(max_index.max(len)),
        Some(_) => None,
        None if !entries.is_empty() && max_index == entries.len() => Some(max_index),
        None => None,
    }
}

/// Containers may sit at most [`MAX_DEPTH`] levels below the root, in
/// either direction.
fn check_depth(depth: usize) -> Result<(), SandboxError> {
    if depth > MAX_DEPTH {
        Err(SandboxError::TooDeep { max: MAX_DEPTH })
    } else {
        Ok(())
    }
}

fn object_key(key: &LuaValue) -> Result<String, SandboxError> {
    match key {
        LuaValue::String(s) => Ok(String::from(s.to_string_lossy())),
        LuaValue::Integer(i) => Ok(i.to_string()),
        LuaValue::Number(n) => match number_to_value(*n) {
            Value::Int(i) => Ok(i.to_string()),
            _ => Ok(n.to_string()),
        },
        other => Err(SandboxError::UnsupportedKey(other.type_name())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
