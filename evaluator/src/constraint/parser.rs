//! Parser for the right-hand side of a constraint.
//!
//! Accepted forms are quoted strings (`"..."` or `'...'` with backslash
//! escapes), numbers, `true`/`false`, bracketed arrays of strings or of
//! numbers, and `{name}` references to another context property.

use std::iter::Peekable;
use std::str::CharIndices;

use super::value::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Literal(Value),
    Variable(String),
}

/// True if `name` can be used as a property name: dot-separated, non-empty
/// parts made of alphanumerics and `_`, `@` or `-`.
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_alphanumeric() || matches!(c, '_' | '@' | '-'))
        })
}

pub fn parse_operand(input: &str) -> Result<Operand, String> {
    let mut parser = Parser {
        chars: input.char_indices().peekable(),
    };
    parser.skip_whitespace();
    let operand = parser.operand()?;
    parser.skip_whitespace();
    match parser.chars.next() {
        Some((pos, c)) => Err(format!("unexpected {c:?} at position {pos}")),
        None => Ok(operand),
    }
}

struct Parser<'a> {
    chars: Peekable<CharIndices<'a>>,
}

impl Parser<'_> {
    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.chars.next();
        }
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.peek() {
            None => Err("empty value".to_string()),
            Some('{') => self.variable().map(Operand::Variable),
            Some('[') => self.array().map(Operand::Literal),
            Some(_) => self.scalar().map(Operand::Literal),
        }
    }

    fn scalar(&mut self) -> Result<Value, String> {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => self.string(quote).map(Value::String),
            Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.') => {
                self.number().map(Value::Number)
            }
            Some(c) if c.is_alphabetic() => {
                let word = self.take_while(char::is_alphanumeric);
                match word.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(format!("unquoted string {word:?}")),
                }
            }
            Some(c) => Err(format!("unexpected {c:?}")),
            None => Err("unexpected end of value".to_string()),
        }
    }

    fn take_while(&mut self, mut accept: impl FnMut(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if !accept(c) {
                break;
            }
            out.push(c);
            self.chars.next();
        }
        out
    }

    fn string(&mut self, quote: char) -> Result<String, String> {
        self.chars.next();
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err("unterminated string".to_string()),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, c @ ('\\' | '"' | '\''))) => out.push(c),
                    Some((pos, c)) => return Err(format!("invalid escape \\{c} at position {pos}")),
                    None => return Err("unterminated string".to_string()),
                },
                Some((_, c)) if c == quote => return Ok(out),
                Some((_, c)) => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<f64, String> {
        let text =
            self.take_while(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(n),
            _ => Err(format!("invalid number {text:?}")),
        }
    }

    fn array(&mut self) -> Result<Value, String> {
        self.chars.next();
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(']') {
            self.chars.next();
            return Ok(Value::StringArray(Vec::new()));
        }
        loop {
            self.skip_whitespace();
            let item = self.scalar()?;
            if !matches!(item, Value::String(_) | Value::Number(_)) {
                return Err(format!(
                    "array elements must be strings or numbers, got {}",
                    item.type_name()
                ));
            }
            items.push(item);
            self.skip_whitespace();
            match self.chars.next() {
                Some((_, ',')) => continue,
                Some((_, ']')) => break,
                Some((pos, c)) => return Err(format!("unexpected {c:?} at position {pos}")),
                None => return Err("unbalanced '['".to_string()),
            }
        }

        if items.iter().all(|i| matches!(i, Value::String(_))) {
            Ok(Value::StringArray(
                items
                    .into_iter()
                    .filter_map(|i| match i {
                        Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            ))
        } else if items.iter().all(|i| matches!(i, Value::Number(_))) {
            Ok(Value::NumberArray(
                items
                    .into_iter()
                    .filter_map(|i| match i {
                        Value::Number(n) => Some(n),
                        _ => None,
                    })
                    .collect(),
            ))
        } else {
            Err("array mixes strings and numbers".to_string())
        }
    }

    fn variable(&mut self) -> Result<String, String> {
        self.chars.next();
        let name = self.take_while(|c| c != '}');
        if self.chars.next().is_none() {
            return Err("unbalanced '{'".to_string());
        }
        let name = name.trim();
        if !is_identifier(name) {
            return Err(format!("invalid variable reference {{{name}}}"));
        }
        Ok(name.to_string())
    }
}
