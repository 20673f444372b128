//! Wrappers around builtins whose work the step hook cannot see.
//!
//! The statement ceiling is enforced by an interpreter hook, and the hook
//! only fires between VM instructions. Two kinds of builtin escape it:
//!
//! - Finalizers. The interpreter disables hooks while a `__gc` metamethod
//!   runs, so `setmetatable` refuses metatables that carry one.
//! - Long loops inside a single C call. Pattern matching can backtrack
//!   polynomially in the subject length, and `table.move` walks whatever
//!   index range it is given. Each call is checked against a worst-case
//!   work estimate before it reaches the builtin.

use mlua::{Function, Lua, MultiValue, Table, Value as LuaValue, Variadic};

/// Largest worst-case step estimate accepted for one pattern call.
pub const MAX_PATTERN_WORK: u64 = 250_000_000;

/// Largest index range one `table.move` call may cover.
pub const MAX_MOVE_ELEMENTS: i64 = 1_000_000;

/// Pattern functions and whether a leading `^` anchors them.
const PATTERN_FUNCTIONS: &[(&str, bool)] = &[
    ("find", true),
    ("match", true),
    ("gmatch", false),
    ("gsub", true),
];

/// Install every guard. Runs after the global allow-list is applied.
pub fn install_guards(lua: &Lua) -> mlua::Result<()> {
    guard_setmetatable(lua)?;
    guard_patterns(lua)?;
    guard_table_move(lua)
}

fn guard_setmetatable(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let original: Function = globals.raw_get("setmetatable")?;
    let guarded = lua.create_function(move |_, args: Variadic<LuaValue>| {
        if let Some(LuaValue::Table(metatable)) = args.get(1) {
            let gc: LuaValue = metatable.raw_get("__gc")?;
            if !gc.is_nil() {
                return Err(mlua::Error::RuntimeError(
                    "setmetatable: __gc metamethods are not allowed".to_string(),
                ));
            }
        }
        original.call::<MultiValue>(args)
    })?;
    globals.raw_set("setmetatable", guarded)
}

fn guard_patterns(lua: &Lua) -> mlua::Result<()> {
    let string: Table = lua.globals().raw_get("string")?;
    for &(name, anchorable) in PATTERN_FUNCTIONS {
        let original: Function = string.raw_get(name)?;
        let guarded = lua.create_function(move |lua, args: Variadic<LuaValue>| {
            let subject = coerced_len(lua, args.first())?;
            let pattern = args
                .get(1)
                .cloned()
                .map(|value| lua.coerce_string(value))
                .transpose()?
                .flatten();
            if let (Some(subject_len), Some(pattern)) = (subject, pattern) {
                let plain = name == "find" && args.get(3).is_some_and(is_truthy);
                let work = pattern_work(subject_len, &pattern.as_bytes(), anchorable, plain);
                if work > MAX_PATTERN_WORK {
                    return Err(mlua::Error::RuntimeError(format!(
                        "string.{name}: pattern too complex for a {subject_len}-byte subject"
                    )));
                }
            }
            original.call::<MultiValue>(args)
        })?;
        string.raw_set(name, guarded)?;
    }
    Ok(())
}

fn guard_table_move(lua: &Lua) -> mlua::Result<()> {
    let table: Table = lua.globals().raw_get("table")?;
    let original: Function = table.raw_get("move")?;
    let guarded = lua.create_function(move |lua, args: Variadic<LuaValue>| {
        let first = coerced_integer(lua, args.get(1))?;
        let last = coerced_integer(lua, args.get(2))?;
        if let (Some(first), Some(last)) = (first, last) {
            if last >= first && last.saturating_sub(first) >= MAX_MOVE_ELEMENTS {
                return Err(mlua::Error::RuntimeError(format!(
                    "table.move: range exceeds {MAX_MOVE_ELEMENTS} elements"
                )));
            }
        }
        original.call::<MultiValue>(args)
    })?;
    table.raw_set("move", guarded)
}

fn coerced_len(lua: &Lua, value: Option<&LuaValue>) -> mlua::Result<Option<usize>> {
    match value {
        Some(value) => Ok(lua
            .coerce_string(value.clone())?
            .map(|s| s.as_bytes().len())),
        None => Ok(None),
    }
}

fn coerced_integer(lua: &Lua, value: Option<&LuaValue>) -> mlua::Result<Option<i64>> {
    match value {
        Some(value) => lua.coerce_integer(value.clone()),
        None => Ok(None),
    }
}

fn is_truthy(value: &LuaValue) -> bool {
    !matches!(value, LuaValue::Nil | LuaValue::Boolean(false))
}

/// Worst-case matcher steps for one call of a pattern function.
///
/// Every start position is tried unless the pattern is anchored. At each
/// start the matcher walks the pattern items; a repetition (`*`, `+`, `-`)
/// with further items after it may retry the rest once per subject byte,
/// `?` doubles the work, and `%b` or a back-reference may scan the whole
/// subject. A repetition with nothing but capture closers after it
/// expands once and never backtracks.
pub fn pattern_work(subject_len: usize, pattern: &[u8], anchorable: bool, plain: bool) -> u64 {
    let len = subject_len as u64 + 1;
    let pattern_len = pattern.len().max(1) as u64;
    if plain {
        return len.saturating_mul(pattern_len);
    }

    let (starts, mut i) = if anchorable && pattern.first() == Some(&b'^') {
        (1, 1)
    } else {
        (len, 0)
    };

    let mut product: u64 = 1;
    while i < pattern.len() {
        let item_end = match pattern[i] {
            b'(' | b')' => {
                i += 1;
                continue;
            }
            b'$' if i + 1 == pattern.len() => break,
            b'%' => match pattern.get(i + 1) {
                Some(b'b') => {
                    product = product.saturating_mul(len);
                    i += 4;
                    continue;
                }
                Some(b'f') => {
                    i = set_end(pattern, i + 2);
                    continue;
                }
                Some(c) if c.is_ascii_digit() => {
                    product = product.saturating_mul(len);
                    i += 2;
                    continue;
                }
                _ => i + 2,
            },
            b'[' => set_end(pattern, i),
            _ => i + 1,
        };

        match pattern.get(item_end) {
            Some(b'*' | b'+' | b'-') => {
                let rest = pattern.get(item_end + 1..).unwrap_or_default();
                if rest.iter().any(|&b| b != b')') {
                    product = product.saturating_mul(len);
                }
                i = item_end + 1;
            }
            Some(b'?') => {
                product = product.saturating_mul(2);
                i = item_end + 1;
            }
            _ => i = item_end,
        }
    }

    starts
        .saturating_mul(product)
        .saturating_add(starts.saturating_mul(pattern_len))
}

/// Index just past a `[...]` set starting at `start`. Malformed sets end
/// at the pattern end; the builtin reports them.
fn set_end(pattern: &[u8], start: usize) -> usize {
    if pattern.get(start) != Some(&b'[') {
        return start + 1;
    }
    let mut i = start + 1;
    if pattern.get(i) == Some(&b'^') {
        i += 1;
    }
    // The first byte of a set is literal, even `]`.
    loop {
        match pattern.get(i) {
            None => return pattern.len(),
            Some(b'%') => i += 2,
            Some(_) => i += 1,
        }
        if pattern.get(i) == Some(&b']') {
            return i + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_are_linear() {
        assert_eq!(pattern_work(9, b"abc", true, false), 10 + 10 * 3);
        assert_eq!(pattern_work(9, b"^abc", true, false), 1 + 4);
    }

    #[test]
    fn trailing_repetition_does_not_multiply() {
        let work = pattern_work(1_000_000, b"%s+", true, false);
        assert!(work < MAX_PATTERN_WORK, "{work}");
        let work = pattern_work(1_000_000, b"(%w+)", true, false);
        assert!(work < MAX_PATTERN_WORK, "{work}");
    }

    #[test]
    fn repetition_followed_by_items_is_quadratic() {
        assert!(pattern_work(10_000, b"(%w+)=(%w+)", true, false) < MAX_PATTERN_WORK);
        assert!(pattern_work(100_000, b"a*b", true, false) > MAX_PATTERN_WORK);
    }

    #[test]
    fn stacked_repetitions_are_refused() {
        let pattern = format!("{}b", "a*".repeat(12));
        assert_eq!(
            pattern_work(3_000, pattern.as_bytes(), true, false),
            u64::MAX
        );
    }

    #[test]
    fn gmatch_ignores_the_anchor() {
        let anchored = pattern_work(100_000, b"^a*b", true, false);
        let unanchored = pattern_work(100_000, b"^a*b", false, false);
        assert!(anchored < unanchored);
    }

    #[test]
    fn balanced_match_scans_the_subject() {
        assert!(pattern_work(100_000, b"%b()", true, false) > MAX_PATTERN_WORK);
    }

    #[test]
    fn sets_are_single_items() {
        assert_eq!(set_end(b"[]a]x", 0), 4);
        assert_eq!(set_end(b"[^%]]x", 0), 5);
        assert_eq!(set_end(b"[abc", 0), 4);
        // `[%a]*` at the end of the pattern does not backtrack.
        assert_eq!(pattern_work(9, b"[%a]*", false, false), 10 + 10 * 5);
    }

    #[test]
    fn plain_find_is_subject_times_needle() {
        assert_eq!(pattern_work(9, b"a*b", true, true), 30);
    }
}
