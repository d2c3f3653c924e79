//! Segment constraints: compiling `(property, operator, value)` triples
//! into an expression once per cache load, and evaluating that expression
//! against an [`EvalContext`].

mod parser;
mod value;

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde_json::Map;

use crate::types::{Constraint, EvalContext};

pub use parser::is_identifier;
pub use value::{EPSILON, Value};

use parser::Operand;
use value::approx_eq;

/// Context keys that resolve to fields of the context itself when the
/// entity context does not define them.
pub const ENTITY_ID_PROPERTY: &str = "@entity_id";
pub const ENTITY_TYPE_PROPERTY: &str = "@entity_type";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    Ereg,
    Nereg,
    Contains,
    NotContains,
}

impl Operator {
    pub const ALL: [Operator; 12] = [
        Operator::Eq,
        Operator::Neq,
        Operator::Lt,
        Operator::Lte,
        Operator::Gt,
        Operator::Gte,
        Operator::In,
        Operator::NotIn,
        Operator::Ereg,
        Operator::Nereg,
        Operator::Contains,
        Operator::NotContains,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "EQ",
            Operator::Neq => "NEQ",
            Operator::Lt => "LT",
            Operator::Lte => "LTE",
            Operator::Gt => "GT",
            Operator::Gte => "GTE",
            Operator::In => "IN",
            Operator::NotIn => "NOTIN",
            Operator::Ereg => "EREG",
            Operator::Nereg => "NEREG",
            Operator::Contains => "CONTAINS",
            Operator::NotContains => "NOTCONTAINS",
        }
    }

    const fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Neq => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Ereg => "=~",
            Operator::Nereg => "!~",
            Operator::Contains => "CONTAINS",
            Operator::NotContains => "NOT CONTAINS",
        }
    }
}

impl FromStr for Operator {
    type Err = ConstraintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operator::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| ConstraintError::UnsupportedOperator(s.to_string()))
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised while compiling a constraint.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConstraintError {
    #[error("unsupported operator {0:?}")]
    UnsupportedOperator(String),
    #[error("invalid constraint ({property} {operator} {value}): {reason}")]
    Parse {
        property: String,
        operator: String,
        value: String,
        reason: String,
    },
}

/// Raised while evaluating a compiled constraint against a context.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("entity id is empty")]
    EmptyEntityId,
    #[error("property {0:?} is not present in the entity context")]
    MissingProperty(String),
    #[error("property {0:?} has a value of unsupported type")]
    UnsupportedType(String),
    #[error("{operator} cannot compare {left} with {right}")]
    TypeMismatch {
        operator: Operator,
        left: &'static str,
        right: &'static str,
    },
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Clone, Debug)]
enum Rhs {
    Value(Value),
    Pattern(Regex),
    Variable(String),
}

#[derive(Clone, Debug)]
pub struct Comparison {
    property: String,
    operator: Operator,
    rhs: Rhs,
}

/// A compiled constraint expression. An empty conjunction is always true.
#[derive(Clone, Debug)]
pub enum Expr {
    And(Vec<Expr>),
    Comparison(Comparison),
}

impl Default for Expr {
    fn default() -> Self {
        Expr::And(Vec::new())
    }
}

/// Compiles one constraint.
pub fn compile(property: &str, operator: &str, value: &str) -> Result<Expr, ConstraintError> {
    let op = Operator::from_str(operator)?;
    let parse_error = |reason: String| ConstraintError::Parse {
        property: property.to_string(),
        operator: operator.to_string(),
        value: value.to_string(),
        reason,
    };

    if !is_identifier(property) {
        return Err(parse_error(format!("invalid property name {property:?}")));
    }

    let rhs = match (op, parser::parse_operand(value).map_err(&parse_error)?) {
        (_, Operand::Variable(name)) => Rhs::Variable(name),
        (Operator::Eq | Operator::Neq, Operand::Literal(v)) => Rhs::Value(v),
        (
            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte,
            Operand::Literal(v @ Value::Number(_)),
        ) => Rhs::Value(v),
        (
            Operator::In | Operator::NotIn,
            Operand::Literal(v @ (Value::StringArray(_) | Value::NumberArray(_))),
        ) => Rhs::Value(v),
        (
            Operator::Contains | Operator::NotContains,
            Operand::Literal(v @ (Value::String(_) | Value::Number(_))),
        ) => Rhs::Value(v),
        (Operator::Ereg | Operator::Nereg, Operand::Literal(Value::String(pattern))) => {
            Rhs::Pattern(
                Regex::new(&pattern).map_err(|e| parse_error(format!("invalid pattern: {e}")))?,
            )
        }
        (op, Operand::Literal(v)) => {
            return Err(parse_error(format!(
                "{op} does not accept a {} operand",
                v.type_name()
            )));
        }
    };

    Ok(Expr::Comparison(Comparison {
        property: property.to_string(),
        operator: op,
        rhs,
    }))
}

/// Compiles the constraints of a segment into their conjunction.
pub fn compile_all(constraints: &[Constraint]) -> Result<Expr, ConstraintError> {
    constraints
        .iter()
        .map(|c| compile(&c.property, &c.operator, &c.value))
        .collect::<Result<Vec<_>, _>>()
        .map(Expr::And)
}

impl Expr {
    pub fn is_empty(&self) -> bool {
        matches!(self, Expr::And(exprs) if exprs.is_empty())
    }

    pub fn evaluate(&self, context: &EvalContext) -> Result<bool, EvaluationError> {
        match self {
            Expr::And(exprs) => {
                for expr in exprs {
                    if !expr.evaluate(context)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Comparison(comparison) => comparison.evaluate(context),
        }
    }
}

impl Comparison {
    fn evaluate(&self, context: &EvalContext) -> Result<bool, EvaluationError> {
        let left = resolve(context, &self.property)?;

        let right = match &self.rhs {
            Rhs::Pattern(re) => {
                let matched = self.match_pattern(&left, Cow::Borrowed(re))?;
                return Ok(matched == (self.operator == Operator::Ereg));
            }
            Rhs::Value(v) => Cow::Borrowed(v),
            Rhs::Variable(name) => Cow::Owned(resolve(context, name)?),
        };

        match self.operator {
            Operator::Eq => Ok(left.loosely_equals(&right)),
            Operator::Neq => Ok(!left.loosely_equals(&right)),
            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => {
                let (Value::Number(l), Value::Number(r)) = (&left, &*right) else {
                    return Err(self.mismatch(&left, &right));
                };
                let (l, r) = (*l, *r);
                let eq = approx_eq(l, r);
                Ok(match self.operator {
                    Operator::Lt => l < r && !eq,
                    Operator::Lte => l < r || eq,
                    Operator::Gt => l > r && !eq,
                    _ => l > r || eq,
                })
            }
            Operator::In => Ok(left.is_member_of(&right)),
            Operator::NotIn => Ok(!left.is_member_of(&right)),
            Operator::Contains => Ok(left.contains(&right)),
            Operator::NotContains => Ok(!left.contains(&right)),
            Operator::Ereg | Operator::Nereg => {
                let Value::String(pattern) = &*right else {
                    return Err(self.mismatch(&left, &right));
                };
                let re = Regex::new(pattern).map_err(|e| EvaluationError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
                let matched = self.match_pattern(&left, Cow::Owned(re))?;
                Ok(matched == (self.operator == Operator::Ereg))
            }
        }
    }

    fn match_pattern(&self, left: &Value, re: Cow<'_, Regex>) -> Result<bool, EvaluationError> {
        match left {
            Value::String(s) => Ok(re.is_match(s)),
            other => Err(EvaluationError::TypeMismatch {
                operator: self.operator,
                left: other.type_name(),
                right: "pattern",
            }),
        }
    }

    fn mismatch(&self, left: &Value, right: &Value) -> EvaluationError {
        EvaluationError::TypeMismatch {
            operator: self.operator,
            left: left.type_name(),
            right: right.type_name(),
        }
    }
}

/// Looks up `property` in the entity context: the exact key first, then a
/// dotted path through nested objects, then the implicit `@` fields.
fn resolve(context: &EvalContext, property: &str) -> Result<Value, EvaluationError> {
    match lookup(&context.entity_context, property) {
        Some(json) => Value::from_json(json)
            .ok_or_else(|| EvaluationError::UnsupportedType(property.to_string())),
        None => match property {
            ENTITY_ID_PROPERTY => Ok(Value::String(context.entity_id.clone())),
            ENTITY_TYPE_PROPERTY => Ok(Value::String(context.entity_type.clone())),
            _ => Err(EvaluationError::MissingProperty(property.to_string())),
        },
    }
}

fn lookup<'a>(
    map: &'a Map<String, serde_json::Value>,
    path: &str,
) -> Option<&'a serde_json::Value> {
    if let Some(value) = map.get(path) {
        return Some(value);
    }
    if !path.contains('.') {
        return None;
    }
    let mut parts = path.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::And(exprs) if exprs.is_empty() => write!(f, "true"),
            Expr::And(exprs) => {
                for (i, expr) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " && ")?;
                    }
                    write!(f, "{expr}")?;
                }
                Ok(())
            }
            Expr::Comparison(c) => {
                write!(f, "({} {} ", c.property, c.operator.symbol())?;
                match &c.rhs {
                    Rhs::Value(v) => write!(f, "{v}")?,
                    Rhs::Pattern(re) => write!(f, "{}", Value::String(re.as_str().to_string()))?,
                    Rhs::Variable(name) => write!(f, "{{{name}}}")?,
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> EvalContext {
        EvalContext::new("entity1")
            .with_entity_type("user")
            .with_attribute("dl_state", "CA")
            .with_attribute("age", 30)
            .with_attribute("score", 0.3)
            .with_attribute("email", "alice@example.com")
            .with_attribute("roles", json!(["admin", "dev"]))
            .with_attribute("lucky", json!([3, 7]))
            .with_attribute("beta", true)
            .with_attribute("address", json!({"state": "NY", "zip": 10001}))
            .with_attribute("nothing", json!(null))
            .with_attribute("home_state", "CA")
    }

    fn eval(property: &str, operator: &str, value: &str) -> Result<bool, EvaluationError> {
        compile(property, operator, value).unwrap().evaluate(&ctx())
    }

    #[test]
    fn test_operator_from_str() {
        for op in Operator::ALL {
            assert_eq!(op.as_str().parse::<Operator>().unwrap(), op);
        }
        assert_eq!(
            "LIKE".parse::<Operator>(),
            Err(ConstraintError::UnsupportedOperator("LIKE".into()))
        );
        assert!("eq".parse::<Operator>().is_err());
    }

    #[test]
    fn test_equality() {
        assert_eq!(eval("dl_state", "EQ", r#""CA""#), Ok(true));
        assert_eq!(eval("dl_state", "EQ", r#""NY""#), Ok(false));
        assert_eq!(eval("dl_state", "NEQ", r#""NY""#), Ok(true));
        assert_eq!(eval("age", "EQ", "30"), Ok(true));
        assert_eq!(eval("score", "EQ", "0.3000000001"), Ok(true));
        assert_eq!(eval("beta", "EQ", "true"), Ok(true));
        // A string never equals a number.
        assert_eq!(eval("age", "EQ", r#""30""#), Ok(false));
    }

    #[test]
    fn test_ordering() {
        assert_eq!(eval("age", "GT", "18"), Ok(true));
        assert_eq!(eval("age", "GTE", "30"), Ok(true));
        assert_eq!(eval("age", "GT", "30"), Ok(false));
        assert_eq!(eval("age", "LT", "30"), Ok(false));
        assert_eq!(eval("age", "LTE", "30.0000001"), Ok(true));
        assert_eq!(eval("age", "LT", "31"), Ok(true));
        assert!(matches!(
            eval("dl_state", "GT", "1"),
            Err(EvaluationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_membership() {
        assert_eq!(eval("dl_state", "IN", r#"["CA", "NY"]"#), Ok(true));
        assert_eq!(eval("dl_state", "IN", r#"["WA"]"#), Ok(false));
        assert_eq!(eval("dl_state", "NOTIN", r#"["WA"]"#), Ok(true));
        assert_eq!(eval("age", "IN", "[29, 30]"), Ok(true));
        // Mismatched element types are simply not members.
        assert_eq!(eval("age", "IN", r#"["30"]"#), Ok(false));
        assert_eq!(eval("age", "NOTIN", r#"["30"]"#), Ok(true));
    }

    #[test]
    fn test_contains() {
        assert_eq!(eval("roles", "CONTAINS", r#""admin""#), Ok(true));
        assert_eq!(eval("roles", "NOTCONTAINS", r#""ops""#), Ok(true));
        assert_eq!(eval("lucky", "CONTAINS", "7"), Ok(true));
        assert_eq!(eval("email", "CONTAINS", r#""@example""#), Ok(true));
        assert_eq!(eval("email", "CONTAINS", r#""@corp""#), Ok(false));
    }

    #[test]
    fn test_regex() {
        assert_eq!(eval("email", "EREG", r#"".*@example\\.com$""#), Ok(true));
        assert_eq!(eval("email", "NEREG", r#""^bob""#), Ok(true));
        assert!(matches!(
            eval("age", "EREG", r#""3.*""#),
            Err(EvaluationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_nested_and_implicit_properties() {
        assert_eq!(eval("address.state", "EQ", r#""NY""#), Ok(true));
        assert_eq!(eval("address.zip", "GT", "10000"), Ok(true));
        assert_eq!(eval("@entity_id", "EQ", r#""entity1""#), Ok(true));
        assert_eq!(eval("@entity_type", "EQ", r#""user""#), Ok(true));
    }

    #[test]
    fn test_variable_reference() {
        assert_eq!(eval("dl_state", "EQ", "{home_state}"), Ok(true));
        assert_eq!(eval("dl_state", "EQ", "{address.state}"), Ok(false));
        assert_eq!(
            eval("dl_state", "EQ", "{missing}"),
            Err(EvaluationError::MissingProperty("missing".into()))
        );
    }

    #[test]
    fn test_missing_and_unsupported_properties() {
        assert_eq!(
            eval("country", "EQ", r#""US""#),
            Err(EvaluationError::MissingProperty("country".into()))
        );
        assert_eq!(
            eval("nothing", "EQ", r#""US""#),
            Err(EvaluationError::UnsupportedType("nothing".into()))
        );
        assert_eq!(
            eval("address", "EQ", r#""US""#),
            Err(EvaluationError::UnsupportedType("address".into()))
        );
    }

    #[test]
    fn test_compile_errors() {
        assert!(matches!(
            compile("age", "BETWEEN", "1"),
            Err(ConstraintError::UnsupportedOperator(_))
        ));
        assert!(matches!(
            compile("dl_state", "EQ", "CA"),
            Err(ConstraintError::Parse { .. })
        ));
        assert!(matches!(
            compile("age", "GT", r#""18""#),
            Err(ConstraintError::Parse { .. })
        ));
        assert!(matches!(
            compile("dl_state", "IN", r#""CA""#),
            Err(ConstraintError::Parse { .. })
        ));
        assert!(matches!(
            compile("email", "EREG", r#""(unclosed""#),
            Err(ConstraintError::Parse { .. })
        ));
        assert!(matches!(
            compile("bad property", "EQ", r#""x""#),
            Err(ConstraintError::Parse { .. })
        ));
    }

    #[test]
    fn test_conjunction_short_circuits() {
        let constraints = vec![
            Constraint {
                property: "dl_state".into(),
                operator: "EQ".into(),
                value: r#""NY""#.into(),
                ..Default::default()
            },
            Constraint {
                property: "country".into(),
                operator: "EQ".into(),
                value: r#""US""#.into(),
                ..Default::default()
            },
        ];
        let expr = compile_all(&constraints).unwrap();
        assert_eq!(expr.evaluate(&ctx()), Ok(false));

        assert!(Expr::default().is_empty());
        assert_eq!(Expr::default().evaluate(&EvalContext::default()), Ok(true));
    }

    #[test]
    fn test_display() {
        let constraints = vec![
            Constraint {
                property: "dl_state".into(),
                operator: "EQ".into(),
                value: r#""CA""#.into(),
                ..Default::default()
            },
            Constraint {
                property: "age".into(),
                operator: "GTE".into(),
                value: "{min_age}".into(),
                ..Default::default()
            },
        ];
        let expr = compile_all(&constraints).unwrap();
        assert_eq!(expr.to_string(), r#"(dl_state == "CA") && (age >= {min_age})"#);
        assert_eq!(Expr::default().to_string(), "true");
    }
}
