//! Skip-condition evaluation for phase configuration.
//!
//! Conditions are small declarative expressions attached to a phase, e.g.
//! `risk_level == 'low' && !is_new_project`. They are evaluated against a
//! fixed, read-only variable set built by the engine — there is no access to
//! anything beyond that set, no function calls, and no side effects.
//!
//! Grammar (hand-written tokenizer + recursive descent):
//!
//! ```text
//! expr    := or
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | cmp
//! cmp     := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
//! primary := string | number | "true" | "false" | variable | "(" expr ")"
//! ```
//!
//! Variables are dotted identifiers (`state.current_phase`) resolved against
//! the context map. Strings compare with `==`/`!=` only; numbers support all
//! six comparison operators.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// A value a condition variable or literal can take.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Num(_) => "number",
            Value::Bool(_) => "bool",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "'{s}'"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("Unexpected character '{0}' in condition")]
    UnexpectedChar(char),

    #[error("Unterminated string literal")]
    UnterminatedString,

    #[error("Unexpected end of condition")]
    UnexpectedEnd,

    #[error("Unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("Cannot compare {left} with {right}")]
    TypeMismatch {
        left: &'static str,
        right: &'static str,
    },

    #[error("Expected a boolean, got {0}")]
    NotABool(&'static str),
}

/// The fixed read-only variable set a condition is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    vars: BTreeMap<String, Value>,
}

impl ConditionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

/// Evaluate a condition expression against the given context.
///
/// Returns the boolean result, or an error for malformed expressions,
/// unknown variables, and type mismatches. Callers decide the fail-safe
/// policy; the engine treats any error as "do not skip".
pub fn evaluate(expr: &str, ctx: &ConditionContext) -> Result<bool, ConditionError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        ctx,
    };
    let value = parser.or_expr()?;
    parser.expect_end()?;
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(ConditionError::NotABool(other.type_name())),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndOp,
    OrOp,
    Not,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Str(s) => format!("'{s}'"),
            Token::Num(n) => n.to_string(),
            Token::Eq => "==".into(),
            Token::Ne => "!=".into(),
            Token::Lt => "<".into(),
            Token::Le => "<=".into(),
            Token::Gt => ">".into(),
            Token::Ge => ">=".into(),
            Token::AndOp => "&&".into(),
            Token::OrOp => "||".into(),
            Token::Not => "!".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
        }
    }
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                match chars.next() {
                    Some('=') => tokens.push(Token::Eq),
                    _ => return Err(ConditionError::UnexpectedChar('=')),
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                match chars.next() {
                    Some('&') => tokens.push(Token::AndOp),
                    _ => return Err(ConditionError::UnexpectedChar('&')),
                }
            }
            '|' => {
                chars.next();
                match chars.next() {
                    Some('|') => tokens.push(Token::OrOp),
                    _ => return Err(ConditionError::UnexpectedChar('|')),
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                for ch in chars.by_ref() {
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    s.push(ch);
                }
                if !closed {
                    return Err(ConditionError::UnterminatedString);
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = s
                    .parse::<f64>()
                    .map_err(|_| ConditionError::UnexpectedToken(s.clone()))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // Word forms of the boolean operators
                match s.as_str() {
                    "and" => tokens.push(Token::AndOp),
                    "or" => tokens.push(Token::OrOp),
                    "not" => tokens.push(Token::Not),
                    _ => tokens.push(Token::Ident(s)),
                }
            }
            other => return Err(ConditionError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    ctx: &'a ConditionContext,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect_end(&self) -> Result<(), ConditionError> {
        match self.peek() {
            None => Ok(()),
            Some(tok) => Err(ConditionError::UnexpectedToken(tok.describe())),
        }
    }

    fn or_expr(&mut self) -> Result<Value, ConditionError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::OrOp) {
            self.next();
            let right = self.and_expr()?;
            left = Value::Bool(as_bool(&left)? || as_bool(&right)?);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Value, ConditionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::AndOp) {
            self.next();
            let right = self.unary()?;
            left = Value::Bool(as_bool(&left)? && as_bool(&right)?);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.unary()?;
            return Ok(Value::Bool(!as_bool(&inner)?));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value, ConditionError> {
        let left = self.primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            Some(Token::Lt) => Token::Lt,
            Some(Token::Le) => Token::Le,
            Some(Token::Gt) => Token::Gt,
            Some(Token::Ge) => Token::Ge,
            _ => return Ok(left),
        };
        self.next();
        let right = self.primary()?;
        compare(&left, &op, &right)
    }

    fn primary(&mut self) -> Result<Value, ConditionError> {
        match self.next().cloned() {
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Num(n)) => Ok(Value::Num(n)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => self
                    .ctx
                    .get(&name)
                    .cloned()
                    .ok_or(ConditionError::UnknownVariable(name)),
            },
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(tok) => Err(ConditionError::UnexpectedToken(tok.describe())),
                    None => Err(ConditionError::UnexpectedEnd),
                }
            }
            Some(tok) => Err(ConditionError::UnexpectedToken(tok.describe())),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }
}

fn as_bool(value: &Value) -> Result<bool, ConditionError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(ConditionError::NotABool(other.type_name())),
    }
}

fn compare(left: &Value, op: &Token, right: &Value) -> Result<Value, ConditionError> {
    let result = match (left, right) {
        (Value::Num(a), Value::Num(b)) => match op {
            Token::Eq => a == b,
            Token::Ne => a != b,
            Token::Lt => a < b,
            Token::Le => a <= b,
            Token::Gt => a > b,
            Token::Ge => a >= b,
            _ => unreachable!("comparison called with non-comparison token"),
        },
        (Value::Str(a), Value::Str(b)) => match op {
            Token::Eq => a == b,
            Token::Ne => a != b,
            _ => {
                return Err(ConditionError::TypeMismatch {
                    left: "string",
                    right: "string",
                });
            }
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            Token::Eq => a == b,
            Token::Ne => a != b,
            _ => {
                return Err(ConditionError::TypeMismatch {
                    left: "bool",
                    right: "bool",
                });
            }
        },
        (l, r) => {
            return Err(ConditionError::TypeMismatch {
                left: l.type_name(),
                right: r.type_name(),
            });
        }
    };
    Ok(Value::Bool(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ConditionContext {
        let mut ctx = ConditionContext::new();
        ctx.set("risk_level", Value::Str("high".into()));
        ctx.set("is_new_project", Value::Bool(true));
        ctx.set("components", Value::Num(3.0));
        ctx.set("transitive_deps", Value::Num(5.0));
        ctx.set("state.current_phase", Value::Str("build".into()));
        ctx
    }

    #[test]
    fn string_equality() {
        assert!(evaluate("risk_level == 'high'", &ctx()).unwrap());
        assert!(!evaluate("risk_level == 'low'", &ctx()).unwrap());
        assert!(evaluate("risk_level != 'low'", &ctx()).unwrap());
    }

    #[test]
    fn double_quoted_strings_work() {
        assert!(evaluate("risk_level == \"high\"", &ctx()).unwrap());
    }

    #[test]
    fn numeric_comparisons() {
        assert!(evaluate("components > 2", &ctx()).unwrap());
        assert!(evaluate("components >= 3", &ctx()).unwrap());
        assert!(evaluate("components < 10", &ctx()).unwrap());
        assert!(evaluate("transitive_deps <= 5", &ctx()).unwrap());
        assert!(!evaluate("components == 4", &ctx()).unwrap());
    }

    #[test]
    fn bare_bool_variable() {
        assert!(evaluate("is_new_project", &ctx()).unwrap());
        assert!(!evaluate("!is_new_project", &ctx()).unwrap());
        assert!(!evaluate("not is_new_project", &ctx()).unwrap());
    }

    #[test]
    fn boolean_connectives() {
        assert!(evaluate("risk_level == 'high' && components > 1", &ctx()).unwrap());
        assert!(evaluate("risk_level == 'low' || is_new_project", &ctx()).unwrap());
        assert!(evaluate("risk_level == 'high' and components > 1", &ctx()).unwrap());
        assert!(evaluate("risk_level == 'low' or is_new_project", &ctx()).unwrap());
        assert!(!evaluate("risk_level == 'low' && is_new_project", &ctx()).unwrap());
    }

    #[test]
    fn parentheses_group() {
        assert!(
            evaluate(
                "(risk_level == 'low' || risk_level == 'high') && components > 0",
                &ctx()
            )
            .unwrap()
        );
    }

    #[test]
    fn dotted_variable_lookup() {
        assert!(evaluate("state.current_phase == 'build'", &ctx()).unwrap());
    }

    #[test]
    fn unknown_variable_errors() {
        let err = evaluate("nonexistent == 1", &ctx()).unwrap_err();
        assert_eq!(err, ConditionError::UnknownVariable("nonexistent".into()));
    }

    #[test]
    fn type_mismatch_errors() {
        let err = evaluate("risk_level > 2", &ctx()).unwrap_err();
        assert!(matches!(err, ConditionError::TypeMismatch { .. }));
    }

    #[test]
    fn string_ordering_is_rejected() {
        let err = evaluate("risk_level < 'z'", &ctx()).unwrap_err();
        assert!(matches!(err, ConditionError::TypeMismatch { .. }));
    }

    #[test]
    fn non_boolean_result_is_rejected() {
        let err = evaluate("components", &ctx()).unwrap_err();
        assert_eq!(err, ConditionError::NotABool("number"));
    }

    #[test]
    fn malformed_expressions_error() {
        assert!(evaluate("risk_level ==", &ctx()).is_err());
        assert!(evaluate("== 'high'", &ctx()).is_err());
        assert!(evaluate("(components > 1", &ctx()).is_err());
        assert!(evaluate("components > 1)", &ctx()).is_err());
        assert!(evaluate("risk_level = 'high'", &ctx()).is_err());
        assert!(evaluate("'unterminated", &ctx()).is_err());
    }

    #[test]
    fn literal_only_expressions() {
        assert!(evaluate("true", &ctx()).unwrap());
        assert!(!evaluate("false", &ctx()).unwrap());
        assert!(evaluate("1 < 2", &ctx()).unwrap());
        assert!(evaluate("'a' == 'a'", &ctx()).unwrap());
    }

    #[test]
    fn empty_expression_errors() {
        assert!(evaluate("", &ctx()).is_err());
    }
}
