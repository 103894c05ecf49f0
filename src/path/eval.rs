//! Selector evaluation.
//!
//! Walks the document segment by segment, carrying the pointer path for each
//! intermediate result in a parallel vector so matches come back as
//! `(path, value)` pairs in document order.

use serde_json::Value;

use super::{CompareOp, FilterExpr, JsonPath, Operand, PathSegment, Selector};

pub(crate) fn eval<'a>(path: &JsonPath, doc: &'a Value) -> Vec<(Vec<String>, &'a Value)> {
    let mut results: Vec<(Vec<String>, &Value)> = vec![(Vec::new(), doc)];

    for segment in &path.segments {
        let mut next = Vec::new();
        for (current_path, value) in &results {
            if segment.recursive {
                eval_recursive(value, segment, current_path, &mut next);
            } else {
                eval_segment(value, segment, current_path, &mut next);
            }
        }
        results = next;
    }

    results
}

fn eval_segment<'a>(
    value: &'a Value,
    segment: &PathSegment,
    current_path: &[String],
    out: &mut Vec<(Vec<String>, &'a Value)>,
) {
    for selector in &segment.selectors {
        eval_selector(value, selector, current_path, out);
    }
}

fn eval_recursive<'a>(
    value: &'a Value,
    segment: &PathSegment,
    current_path: &[String],
    out: &mut Vec<(Vec<String>, &'a Value)>,
) {
    eval_segment(value, segment, current_path, out);

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let mut child_path = current_path.to_vec();
                child_path.push(key.clone());
                eval_recursive(child, segment, &child_path, out);
            }
        }
        Value::Array(arr) => {
            for (idx, child) in arr.iter().enumerate() {
                let mut child_path = current_path.to_vec();
                child_path.push(idx.to_string());
                eval_recursive(child, segment, &child_path, out);
            }
        }
        _ => {}
    }
}

fn eval_selector<'a>(
    value: &'a Value,
    selector: &Selector,
    current_path: &[String],
    out: &mut Vec<(Vec<String>, &'a Value)>,
) {
    match selector {
        Selector::Name(name) => {
            if let Value::Object(map) = value {
                if let Some(child) = map.get(name) {
                    let mut path = current_path.to_vec();
                    path.push(name.clone());
                    out.push((path, child));
                }
            }
        }
        Selector::Index(index) => {
            if let Value::Array(arr) = value {
                let idx = if *index < 0 {
                    let Some(i) = arr.len().checked_sub(index.unsigned_abs()) else {
                        return;
                    };
                    i
                } else {
                    *index as usize
                };
                if let Some(child) = arr.get(idx) {
                    let mut path = current_path.to_vec();
                    path.push(idx.to_string());
                    out.push((path, child));
                }
            }
        }
        Selector::Wildcard => for_each_child(value, current_path, out, |_, _| true),
        Selector::Filter(expr) => {
            for_each_child(value, current_path, out, |key, child| {
                eval_filter(expr, key, child)
            })
        }
    }
}

fn for_each_child<'a>(
    value: &'a Value,
    current_path: &[String],
    out: &mut Vec<(Vec<String>, &'a Value)>,
    mut keep: impl FnMut(&str, &Value) -> bool,
) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if keep(key, child) {
                    let mut path = current_path.to_vec();
                    path.push(key.clone());
                    out.push((path, child));
                }
            }
        }
        Value::Array(arr) => {
            for (idx, child) in arr.iter().enumerate() {
                let key = idx.to_string();
                if keep(&key, child) {
                    let mut path = current_path.to_vec();
                    path.push(key);
                    out.push((path, child));
                }
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Filter evaluation
// ---------------------------------------------------------------------------

fn eval_filter(expr: &FilterExpr, key: &str, candidate: &Value) -> bool {
    match expr {
        FilterExpr::Exists(path) => !eval(path, candidate).is_empty(),
        FilterExpr::Match { operand, regex } => match operand_string(operand, key, candidate) {
            Some(s) => regex.is_match(&s),
            None => false,
        },
        FilterExpr::Compare { op, left, right } => {
            let left = operand_value(left, key, candidate);
            let right = operand_value(right, key, candidate);
            compare(*op, left.as_ref(), right.as_ref())
        }
        FilterExpr::Not(inner) => !eval_filter(inner, key, candidate),
        FilterExpr::And(a, b) => eval_filter(a, key, candidate) && eval_filter(b, key, candidate),
        FilterExpr::Or(a, b) => eval_filter(a, key, candidate) || eval_filter(b, key, candidate),
    }
}

fn operand_value(operand: &Operand, key: &str, candidate: &Value) -> Option<Value> {
    match operand {
        Operand::Property => Some(Value::String(key.to_string())),
        Operand::Current(path) => eval(path, candidate).first().map(|(_, v)| (*v).clone()),
        Operand::Literal(value) => Some(value.clone()),
    }
}

fn operand_string(operand: &Operand, key: &str, candidate: &Value) -> Option<String> {
    match operand_value(operand, key, candidate)? {
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn compare(op: CompareOp, left: Option<&Value>, right: Option<&Value>) -> bool {
    use std::cmp::Ordering;

    match (left, right) {
        (None, None) => matches!(op, CompareOp::Eq),
        (Some(l), Some(r)) => {
            // Numbers compare by value so an integer JSON field matches a
            // float literal; other types fall back to structural equality.
            let ord = match (l, r) {
                (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
                _ => None,
            };
            match op {
                CompareOp::Eq => ord.map_or(l == r, |o| o == Ordering::Equal),
                CompareOp::Ne => ord.map_or(l != r, |o| o != Ordering::Equal),
                CompareOp::Lt => ord == Some(Ordering::Less),
                CompareOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
                CompareOp::Gt => ord == Some(Ordering::Greater),
                CompareOp::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
            }
        }
        _ => matches!(op, CompareOp::Ne),
    }
}
