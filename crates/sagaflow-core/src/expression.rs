//! Predicate evaluator for condition steps.
//!
//! A deliberately tiny, side-effect-free language: one comparison between two
//! operands, where an operand is either a dotted path into the step's JSON
//! input or a literal.
//!
//! ```text
//! input.order.total >= 100
//! input.region == 'eu'
//! input.flags.express == true
//! ```
//!
//! Supported operators: `==`, `!=`, `>`, `<`, `>=`, `<=`. Anything else is
//! rejected when the definition is parsed, not at execution time. Payloads are
//! never interpolated into expression strings; the input document is passed as
//! a context value.

use serde_json::Value;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while parsing a condition expression.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("empty expression")]
    Empty,

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("expected an operand at position {0}")]
    ExpectedOperand(usize),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("trailing input after expression: '{0}'")]
    TrailingInput(String),
}

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// A parsed `lhs op rhs` comparison, ready to evaluate against an input
/// document.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    lhs: Operand,
    op: Comparator,
    rhs: Operand,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    /// Dotted path into the input document. A leading `input` segment refers
    /// to the document root. Numeric segments index into arrays.
    Path(Vec<String>),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl Predicate {
    /// Evaluate against the input document. Missing paths resolve to `null`;
    /// ordering comparisons between incompatible types are `false`.
    pub fn evaluate(&self, input: &Value) -> bool {
        let lhs = self.lhs.resolve(input);
        let rhs = self.rhs.resolve(input);
        match self.op {
            Comparator::Eq => lhs == rhs,
            Comparator::Ne => lhs != rhs,
            Comparator::Gt => compare(&lhs, &rhs).is_some_and(|o| o.is_gt()),
            Comparator::Lt => compare(&lhs, &rhs).is_some_and(|o| o.is_lt()),
            Comparator::Ge => compare(&lhs, &rhs).is_some_and(|o| o.is_ge()),
            Comparator::Le => compare(&lhs, &rhs).is_some_and(|o| o.is_le()),
        }
    }
}

impl Operand {
    fn resolve(&self, input: &Value) -> Value {
        match self {
            Operand::Literal(v) => v.clone(),
            Operand::Path(segments) => {
                let mut current = input;
                let mut segments = segments.as_slice();
                // "input.total" and "total" both address the document root.
                if segments.first().map(String::as_str) == Some("input") {
                    segments = &segments[1..];
                }
                for segment in segments {
                    current = match current {
                        Value::Object(map) => match map.get(segment) {
                            Some(v) => v,
                            None => return Value::Null,
                        },
                        Value::Array(items) => match segment
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| items.get(i))
                        {
                            Some(v) => v,
                            None => return Value::Null,
                        },
                        _ => return Value::Null,
                    };
                }
                current.clone()
            }
        }
    }
}

/// Partial ordering across JSON values: numbers by value, strings lexically.
fn compare(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().and_then(|a| b.as_f64().and_then(|b| a.partial_cmp(&b)))
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse an expression, rejecting unknown operators and malformed operands.
pub fn parse(expr: &str) -> Result<Predicate, ExpressionError> {
    let mut scanner = Scanner::new(expr);
    scanner.skip_whitespace();
    if scanner.at_end() {
        return Err(ExpressionError::Empty);
    }

    let lhs = scanner.operand()?;
    let op = scanner.comparator()?;
    let rhs = scanner.operand()?;

    scanner.skip_whitespace();
    if !scanner.at_end() {
        return Err(ExpressionError::TrailingInput(scanner.rest().to_string()));
    }

    Ok(Predicate { lhs, op, rhs })
}

/// Parse and evaluate in one call.
pub fn evaluate(expr: &str, input: &Value) -> Result<bool, ExpressionError> {
    Ok(parse(expr)?.evaluate(input))
}

struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn operand(&mut self) -> Result<Operand, ExpressionError> {
        self.skip_whitespace();
        let Some(c) = self.peek() else {
            return Err(ExpressionError::ExpectedOperand(self.pos));
        };
        match c {
            '\'' | '"' => self.string_literal(c),
            c if c.is_ascii_digit() || c == '-' => self.number_literal(),
            c if c.is_alphabetic() || c == '_' => self.path_or_keyword(),
            _ => Err(ExpressionError::ExpectedOperand(self.pos)),
        }
    }

    fn string_literal(&mut self, quote: char) -> Result<Operand, ExpressionError> {
        self.pos += quote.len_utf8();
        let start = self.pos;
        for (offset, c) in self.rest().char_indices() {
            if c == quote {
                let text = &self.input[start..start + offset];
                self.pos = start + offset + quote.len_utf8();
                return Ok(Operand::Literal(Value::String(text.to_string())));
            }
        }
        Err(ExpressionError::UnterminatedString)
    }

    fn number_literal(&mut self) -> Result<Operand, ExpressionError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '.') {
            self.pos += 1;
        }
        let text = &self.input[start..self.pos];
        serde_json::from_str::<serde_json::Number>(text)
            .map(|n| Operand::Literal(Value::Number(n)))
            .map_err(|_| ExpressionError::ExpectedOperand(start))
    }

    fn path_or_keyword(&mut self) -> Result<Operand, ExpressionError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !(c.is_alphanumeric() || c == '_' || c == '.' || c == '-') {
                break;
            }
            self.pos += c.len_utf8();
        }
        let text = &self.input[start..self.pos];
        match text {
            "true" => Ok(Operand::Literal(Value::Bool(true))),
            "false" => Ok(Operand::Literal(Value::Bool(false))),
            "null" => Ok(Operand::Literal(Value::Null)),
            _ => Ok(Operand::Path(
                text.split('.').map(str::to_string).collect(),
            )),
        }
    }

    fn comparator(&mut self) -> Result<Comparator, ExpressionError> {
        self.skip_whitespace();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| matches!(c, '=' | '!' | '<' | '>' | '~' | '&' | '|'))
        {
            self.pos += 1;
        }
        let text = &self.input[start..self.pos];
        match text {
            "==" => Ok(Comparator::Eq),
            "!=" => Ok(Comparator::Ne),
            ">" => Ok(Comparator::Gt),
            "<" => Ok(Comparator::Lt),
            ">=" => Ok(Comparator::Ge),
            "<=" => Ok(Comparator::Le),
            other => Err(ExpressionError::UnknownOperator(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
