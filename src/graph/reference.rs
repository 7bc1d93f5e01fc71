//! Reference expressions inside attribute values.
//!
//! Any string attribute may embed `${type.name.attr}` or
//! `${type.name[i].attr.path}`. A string consisting of exactly one reference
//! resolves to the referenced JSON value; otherwise references are
//! interpolated as text. `$${` produces a literal `${`.
//!
//! Inside a counted resource the index may itself be `${count.index}`, as in
//! `${type.name[${count.index}].id}`; it is replaced while the resource is
//! expanded.

use serde_json::Value;
use std::fmt;

use crate::error::ConfigError;

use super::address::{is_valid_name, is_valid_type, split_index, ResourceAddress};

/// A reference to another resource's attribute or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Target address; has no index when the expression had none.
    pub target: ResourceAddress,
    /// Attribute path inside the target (`id`, `outputs.ip`, `tags.env`).
    pub path: Vec<String>,
}

/// A parsed `${...}` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    /// `${count.index}`.
    CountIndex,
    /// A resource reference.
    Resource(Reference),
}

/// The count placeholder as written in a template.
const COUNT_INDEX: &str = "${count.index}";

/// A piece of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Expr(String),
}

/// Outcome of resolving a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// Fully known value.
    Known(Value),
    /// At least one referenced value is only known after apply.
    Unknown,
}

impl Reference {
    /// Renders the reference in `${...}` form.
    #[must_use]
    pub fn expression(&self) -> String {
        format!("${{{}.{}}}", self.target, self.path.join("."))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.path.join("."))
    }
}

/// Splits a string into literal and expression segments.
fn parse_template(text: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = text;

    while let Some(pos) = rest.find("${") {
        if rest[..pos].ends_with('$') {
            // `$${` escapes a literal `${`
            literal.push_str(&rest[..pos - 1]);
            literal.push_str("${");
            rest = &rest[pos + 2..];
            continue;
        }

        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let Some(end) = closing_brace(after) else {
            return Err(String::from("unterminated '${'"));
        };

        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Expr(after[..end].trim().to_string()));
        rest = &after[end + 1..];
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

/// Finds the `}` that closes an expression body, skipping nested `${...}`.
fn closing_brace(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                depth += 1;
                i += 1;
            }
            b'}' if depth == 0 => return Some(i),
            b'}' => depth -= 1,
            _ => {}
        }
        i += 1;
    }

    None
}

/// Parses the inside of a `${...}` expression.
///
/// # Errors
///
/// Returns a description of the problem if the expression is malformed.
pub fn parse_expression(inner: &str) -> Result<Expression, String> {
    if inner == "count.index" {
        return Ok(Expression::CountIndex);
    }

    if inner.contains("${") {
        return Err(if inner.contains(COUNT_INDEX) {
            String::from("count.index used in an index outside a counted resource")
        } else {
            String::from("only ${count.index} may be nested inside a reference")
        });
    }

    let parts: Vec<&str> = inner.split('.').collect();
    if parts.len() < 3 {
        return Err(String::from("expected <type>.<name>.<attribute>"));
    }

    let resource_type = parts[0];
    if !is_valid_type(resource_type) {
        return Err(format!("'{resource_type}' is not a valid resource type"));
    }

    let (name, index) = split_index(parts[1])?;
    if !is_valid_name(name) {
        return Err(format!("'{name}' is not a valid resource name"));
    }

    if parts[2..].iter().any(|p| p.is_empty()) {
        return Err(String::from("empty attribute path segment"));
    }

    let target = match index {
        Some(i) => ResourceAddress::indexed(resource_type, name, i),
        None => ResourceAddress::new(resource_type, name),
    };

    Ok(Expression::Resource(Reference {
        target,
        path: parts[2..].iter().map(|p| (*p).to_string()).collect(),
    }))
}

/// Collects every expression appearing in a value, in document order.
///
/// # Errors
///
/// Returns a description of the first malformed template or expression.
pub fn expressions_in(value: &Value) -> Result<Vec<Expression>, String> {
    let mut found = Vec::new();
    collect_expressions(value, &mut found)?;
    Ok(found)
}

fn collect_expressions(value: &Value, found: &mut Vec<Expression>) -> Result<(), String> {
    match value {
        Value::String(text) => {
            for segment in parse_template(text)? {
                if let Segment::Expr(inner) = segment {
                    found.push(parse_expression(&inner)?);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_expressions(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_expressions(item, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replaces `${count.index}` with the instance index, including inside the
/// index of a reference (`${type.name[${count.index}].id}`).
///
/// A string that is exactly `${count.index}` becomes a number.
#[must_use]
pub fn substitute_count(value: &Value, index: u32) -> Value {
    match value {
        Value::String(text) => {
            let Ok(segments) = parse_template(text) else {
                return value.clone();
            };

            if matches!(segments.as_slice(), [Segment::Expr(inner)] if inner == "count.index") {
                return Value::from(index);
            }

            if !segments
                .iter()
                .any(|s| matches!(s, Segment::Expr(inner) if inner == "count.index" || inner.contains(COUNT_INDEX)))
            {
                return value.clone();
            }

            let mut out = String::new();
            for segment in segments {
                match segment {
                    Segment::Literal(lit) => out.push_str(&escape_literal(&lit)),
                    Segment::Expr(inner) if inner == "count.index" => out.push_str(&index.to_string()),
                    Segment::Expr(inner) => {
                        out.push_str("${");
                        out.push_str(&inner.replace(COUNT_INDEX, &index.to_string()));
                        out.push('}');
                    }
                }
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_count(v, index)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_count(v, index)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Re-escapes a literal so it survives another template pass.
fn escape_literal(literal: &str) -> String {
    literal.replace("${", "$${")
}

/// Resolves every reference in `value` through `lookup`.
///
/// # Errors
///
/// Returns an error if a template is malformed or if `lookup` fails.
pub fn resolve<F>(value: &Value, from: &ResourceAddress, lookup: &mut F) -> Result<Resolved, ConfigError>
where
    F: FnMut(&Reference) -> Result<Resolved, ConfigError>,
{
    match value {
        Value::String(text) => resolve_string(text, from, lookup),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            let mut unknown = false;
            for item in items {
                match resolve(item, from, lookup)? {
                    Resolved::Known(v) => out.push(v),
                    Resolved::Unknown => unknown = true,
                }
            }
            Ok(if unknown { Resolved::Unknown } else { Resolved::Known(Value::Array(out)) })
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            let mut unknown = false;
            for (key, item) in map {
                match resolve(item, from, lookup)? {
                    Resolved::Known(v) => {
                        out.insert(key.clone(), v);
                    }
                    Resolved::Unknown => unknown = true,
                }
            }
            Ok(if unknown { Resolved::Unknown } else { Resolved::Known(Value::Object(out)) })
        }
        other => Ok(Resolved::Known(other.clone())),
    }
}

fn resolve_string<F>(text: &str, from: &ResourceAddress, lookup: &mut F) -> Result<Resolved, ConfigError>
where
    F: FnMut(&Reference) -> Result<Resolved, ConfigError>,
{
    let segments = parse_template(text)
        .map_err(|message| ConfigError::invalid_reference(from.to_string(), text, message))?;

    let mut resolve_expr = |inner: &str| -> Result<Resolved, ConfigError> {
        match parse_expression(inner) {
            Ok(Expression::Resource(reference)) => lookup(&reference),
            Ok(Expression::CountIndex) => Err(ConfigError::invalid_reference(
                from.to_string(),
                inner,
                "count.index used outside a counted resource",
            )),
            Err(message) => Err(ConfigError::invalid_reference(from.to_string(), inner, message)),
        }
    };

    if let [Segment::Expr(inner)] = segments.as_slice() {
        return resolve_expr(inner);
    }

    let mut out = String::new();
    let mut unknown = false;
    for segment in &segments {
        match segment {
            Segment::Literal(lit) => out.push_str(lit),
            Segment::Expr(inner) => match resolve_expr(inner)? {
                Resolved::Known(Value::String(s)) => out.push_str(&s),
                Resolved::Known(other) => out.push_str(&other.to_string()),
                Resolved::Unknown => unknown = true,
            },
        }
    }

    Ok(if unknown { Resolved::Unknown } else { Resolved::Known(Value::String(out)) })
}

/// Follows an attribute path into a JSON value.
#[must_use]
pub fn lookup_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
