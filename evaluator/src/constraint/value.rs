use std::fmt;

/// Tolerance used for every numeric comparison.
pub const EPSILON: f64 = 1e-6;

/// A typed value, either parsed from a constraint literal or resolved
/// from the entity context.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Number(f64),
    Bool(bool),
    StringArray(Vec<String>),
    NumberArray(Vec<f64>),
}

pub(crate) fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < EPSILON
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Bool(_) => "bool",
            Value::StringArray(_) => "string array",
            Value::NumberArray(_) => "number array",
        }
    }

    /// Converts an entity context value. Nulls, objects and arrays that
    /// mix element types have no counterpart and yield `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<Value> {
        match value {
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Array(items) => {
                if items.iter().all(|i| i.is_string()) {
                    Some(Value::StringArray(
                        items
                            .iter()
                            .filter_map(|i| i.as_str().map(str::to_owned))
                            .collect(),
                    ))
                } else if items.iter().all(|i| i.is_number()) {
                    Some(Value::NumberArray(
                        items.iter().filter_map(serde_json::Value::as_f64).collect(),
                    ))
                } else {
                    None
                }
            }
            serde_json::Value::Null | serde_json::Value::Object(_) => None,
        }
    }

    /// Equality used by `EQ` and `NEQ`. Values of different types are never
    /// equal; numbers compare within [`EPSILON`].
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => approx_eq(*a, *b),
            (Value::NumberArray(a), Value::NumberArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| approx_eq(*x, *y))
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::StringArray(a), Value::StringArray(b)) => a == b,
            _ => false,
        }
    }

    /// True if `self` is an element of the array `collection`.
    pub fn is_member_of(&self, collection: &Value) -> bool {
        match (self, collection) {
            (Value::String(s), Value::StringArray(items)) => items.contains(s),
            (Value::Number(n), Value::NumberArray(items)) => {
                items.iter().any(|item| approx_eq(*item, *n))
            }
            _ => false,
        }
    }

    /// `CONTAINS`: array membership of `needle`, or substring search when
    /// both sides are strings.
    pub fn contains(&self, needle: &Value) -> bool {
        match (self, needle) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            _ => needle.is_member_of(self),
        }
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    write!(f, "\"")?;
    for c in s.chars() {
        match c {
            '"' => write!(f, "\\\"")?,
            '\\' => write!(f, "\\\\")?,
            '\n' => write!(f, "\\n")?,
            '\t' => write!(f, "\\t")?,
            '\r' => write!(f, "\\r")?,
            c => write!(f, "{c}")?,
        }
    }
    write!(f, "\"")
}

fn write_list<T>(
    f: &mut fmt::Formatter<'_>,
    items: &[T],
    mut each: impl FnMut(&mut fmt::Formatter<'_>, &T) -> fmt::Result,
) -> fmt::Result {
    write!(f, "[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        each(f, item)?;
    }
    write!(f, "]")
}

/// Renders the value in the literal syntax it would be parsed from.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write_quoted(f, s),
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::StringArray(items) => write_list(f, items, |f, s| write_quoted(f, s)),
            Value::NumberArray(items) => write_list(f, items, |f, n| write!(f, "{n}")),
        }
    }
}
