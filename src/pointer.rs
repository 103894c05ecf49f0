//! JSON Pointer (RFC 6901) utilities.
//!
//! Pointers name nodes inside the watched list relative to the list root.
//! The empty pointer `""` is the list itself. Components are kept unescaped
//! in `Vec<String>` form; `~0`/`~1` escaping applies only at the string
//! boundary.

use serde_json::Value;

/// Unescape a single pointer component (`~1` → `/`, `~0` → `~`).
pub fn unescape_component(component: &str) -> String {
    component.replace("~1", "/").replace("~0", "~")
}

/// Escape a single pointer component (`~` → `~0`, `/` → `~1`).
pub fn escape_component(component: &str) -> String {
    component.replace('~', "~0").replace('/', "~1")
}

/// Parse a JSON pointer string into unescaped components.
///
/// `""` parses to the empty path (the document root).
pub fn parse(pointer: &str) -> Vec<String> {
    if pointer.is_empty() {
        return Vec::new();
    }
    pointer
        .split('/')
        .skip(1)
        .map(unescape_component)
        .collect()
}

/// Format unescaped components back into a JSON pointer string.
pub fn format(path: &[String]) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for component in path {
        out.push('/');
        out.push_str(&escape_component(component));
    }
    out
}

/// Append one component to a pointer string.
pub fn join(pointer: &str, component: &str) -> String {
    format!("{pointer}/{}", escape_component(component))
}

/// Resolve a component path against a JSON value.
///
/// Returns `None` on any missing step. An explicit `null` value is
/// `Some(&Value::Null)`, distinct from a missing key.
pub fn get<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = doc;
    for step in path {
        match current {
            Value::Object(map) => current = map.get(step)?,
            Value::Array(arr) => {
                let idx: usize = step.parse().ok()?;
                current = arr.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Whether `prefix` names `pointer` itself or one of its ancestors.
///
/// Comparison is at component boundaries: `/a` is a prefix of `/a/b` but not
/// of `/ab`.
pub fn is_prefix_of(prefix: &str, pointer: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    pointer == prefix
        || (pointer.starts_with(prefix) && pointer.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Strip `prefix` from `pointer`, yielding a pointer relative to the prefix.
///
/// Returns `None` unless [`is_prefix_of`] holds.
pub fn strip_prefix<'a>(prefix: &str, pointer: &'a str) -> Option<&'a str> {
    if !is_prefix_of(prefix, pointer) {
        return None;
    }
    Some(&pointer[prefix.len()..])
}

/// Whether any component of the path begins with an underscore.
///
/// Underscore-prefixed keys are OADA bookkeeping (`_id`, `_rev`, `_meta`)
/// and can never name list items.
pub fn has_underscore_component(path: &[String]) -> bool {
    path.iter().any(|c| c.starts_with('_'))
}
