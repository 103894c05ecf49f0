//! Items-selector engine: the JSONPath subset used to pick list items out
//! of a change tree or snapshot.
//!
//! Supported syntax: root `$`, dot and bracket child names, wildcards
//! (`.*`, `[*]`), numeric indices, recursive descent (`..`), bracket unions,
//! and filter selectors `[?(...)]` with existence tests (`@.k`), comparisons
//! against literals, boolean operators, and the key test
//! `@property.match(/re/)` that the default selector relies on.
//!
//! Whatever the selector says, matched pointers never contain a component
//! beginning with `_` — those name store bookkeeping, not items.

mod eval;
mod parser;

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

pub use parser::PathError;

use crate::pointer;

/// The selector applied when none is configured: every direct child whose
/// key does not start with an underscore.
pub const DEFAULT_ITEMS_PATH: &str = "$[?(!@property.match(/^_/))]";

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct JsonPath {
    pub segments: Vec<PathSegment>,
}

#[derive(Debug, Clone)]
pub(crate) struct PathSegment {
    pub selectors: Vec<Selector>,
    pub recursive: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum Selector {
    Name(String),
    Index(isize),
    Wildcard,
    Filter(FilterExpr),
}

#[derive(Debug, Clone)]
pub(crate) enum FilterExpr {
    /// `@.a.b` — the path resolves to at least one value.
    Exists(JsonPath),
    /// `<operand>.match(/re/)` — regex test on the operand's string form.
    Match {
        operand: Operand,
        regex: regex::Regex,
    },
    Compare {
        op: CompareOp,
        left: Operand,
        right: Operand,
    },
    Not(Box<FilterExpr>),
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
}

#[derive(Debug, Clone)]
pub(crate) enum Operand {
    /// `@property` — the candidate's own key or index.
    Property,
    /// `@` or `@.path` — a path from the candidate node.
    Current(JsonPath),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

// ============================================================================
// ItemsPath — public selector type
// ============================================================================

/// One node selected by an [`ItemsPath`].
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// JSON pointer of the node, relative to the evaluated document.
    pub pointer: String,
    pub value: Value,
}

/// A parsed items selector.
#[derive(Debug, Clone)]
pub struct ItemsPath {
    source: String,
    path: JsonPath,
}

impl ItemsPath {
    /// Parse a selector expression.
    pub fn parse(source: &str) -> Result<Self, PathError> {
        let path = parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            path,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `doc`, yielding matches in document order.
    ///
    /// Matches whose pointer contains an underscore-prefixed component are
    /// dropped here so no caller can observe them.
    pub fn matches(&self, doc: &Value) -> Vec<Match> {
        eval::eval(&self.path, doc)
            .into_iter()
            .filter(|(path, _)| !pointer::has_underscore_component(path))
            .map(|(path, value)| Match {
                pointer: pointer::format(&path),
                value: value.clone(),
            })
            .collect()
    }
}

impl FromStr for ItemsPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Default for ItemsPath {
    /// The built-in selector, constructed directly rather than parsed.
    ///
    /// A single wildcard child segment is exactly equivalent to
    /// [`DEFAULT_ITEMS_PATH`] here, because [`ItemsPath::matches`] already
    /// drops every pointer with an underscore-prefixed component.
    fn default() -> Self {
        Self {
            source: DEFAULT_ITEMS_PATH.to_string(),
            path: JsonPath {
                segments: vec![PathSegment {
                    selectors: vec![Selector::Wildcard],
                    recursive: false,
                }],
            },
        }
    }
}

impl fmt::Display for ItemsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
