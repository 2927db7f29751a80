//! Condition evaluator
//!
//! Evaluates boolean expressions against the execution context. Grammar,
//! precedence high to low: `!`, ordered comparisons (`<` `<=` `>` `>=`),
//! equality (`==` `!=`), `&&`, `||`. Parentheses group.
//!
//! Operands are `{{ ... }}` templates (resolved with type preservation) or
//! literals. Before comparison both sides are normalized: numeric strings
//! become numbers, `"true"`/`"false"` become booleans, null stays null.
//! Ordered comparisons require both sides to normalize to numbers.
//!
//! Outcomes: [`ConditionOutcome::Execute`] when the expression holds,
//! `Skip` when it evaluates to false, `Failure` on parse errors
//! (`ConditionInvalid`) or missing references (`ConditionUnresolved`).

use serde_json::Value;

use crate::context::ResolutionScope;
use crate::error::StepError;
use crate::template::{self, TemplateExpr};

/// Skip reason recorded when a condition evaluates to false.
pub const SKIP_REASON_FALSE: &str = "condition evaluated to false";

// ============================================================================
// OUTCOME
// ============================================================================

/// Result of evaluating a step condition.
#[derive(Debug, Clone)]
pub enum ConditionOutcome {
    Execute,
    Skip(String),
    Failure(StepError),
}

/// Parse and evaluate a condition expression in one step.
pub fn evaluate(src: &str, scope: &ResolutionScope<'_>) -> ConditionOutcome {
    let ast = match parse(src) {
        Ok(ast) => ast,
        Err(err) => return ConditionOutcome::Failure(err),
    };
    match ast.eval(scope) {
        Ok(true) => ConditionOutcome::Execute,
        Ok(false) => ConditionOutcome::Skip(SKIP_REASON_FALSE.to_string()),
        Err(err) => ConditionOutcome::Failure(err),
    }
}

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Template(TemplateExpr),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Parsed condition, reusable for static analysis and evaluation.
#[derive(Debug, Clone)]
pub struct ConditionAst {
    root: Expr,
}

impl ConditionAst {
    /// Template expressions referenced anywhere in the condition
    /// (used by the validator and the usage analyzer).
    pub fn template_exprs(&self) -> Vec<&TemplateExpr> {
        let mut out = Vec::new();
        collect_templates(&self.root, &mut out);
        out
    }

    /// Evaluate to a boolean.
    pub fn eval(&self, scope: &ResolutionScope<'_>) -> Result<bool, StepError> {
        let value = eval_expr(&self.root, scope)?;
        as_bool(&value)
    }
}

fn collect_templates<'a>(expr: &'a Expr, out: &mut Vec<&'a TemplateExpr>) {
    match expr {
        Expr::Template(t) => out.push(t),
        Expr::Not(inner) => collect_templates(inner, out),
        Expr::Binary { lhs, rhs, .. } => {
            collect_templates(lhs, out);
            collect_templates(rhs, out);
        }
        Expr::Literal(_) => {}
    }
}

// ============================================================================
// LEXER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Template(TemplateExpr),
    Not,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    And,
    Or,
    LParen,
    RParen,
}

fn invalid(reason: impl Into<String>) -> StepError {
    StepError::ConditionInvalid {
        reason: reason.into(),
    }
}

fn lex(src: &str) -> Result<Vec<Token>, StepError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '{' if bytes.get(i + 1) == Some(&b'{') => {
                let Some(rel) = src[i + 2..].find("}}") else {
                    return Err(invalid(format!("unterminated template at byte {i}")));
                };
                let inner = &src[i + 2..i + 2 + rel];
                let expr = template::parse_expr(inner)
                    .map_err(|e| invalid(format!("bad template operand: {e}")))?;
                tokens.push(Token::Template(expr));
                i += 2 + rel + 2;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(invalid("single '=' is not an operator (use '==')"));
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(invalid("single '&' is not an operator (use '&&')"));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(invalid("single '|' is not an operator (use '||')"));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut j = i + 1;
                let mut out = String::new();
                let mut closed = false;
                while j < bytes.len() {
                    let ch = bytes[j] as char;
                    if ch == '\\' && j + 1 < bytes.len() {
                        out.push(bytes[j + 1] as char);
                        j += 2;
                        continue;
                    }
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    out.push(ch);
                    j += 1;
                }
                if !closed {
                    return Err(invalid("unterminated string literal"));
                }
                tokens.push(Token::Literal(Value::String(out)));
                i = j + 1;
            }
            '0'..='9' | '-' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && matches!(bytes[i] as char, '0'..='9' | '.' | 'e' | 'E' | '+' | '-')
                {
                    i += 1;
                }
                let text = &src[start..i];
                let value = if let Ok(n) = text.parse::<i64>() {
                    Value::from(n)
                } else if let Ok(f) = text.parse::<f64>() {
                    serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .ok_or_else(|| invalid(format!("bad number '{text}'")))?
                } else {
                    return Err(invalid(format!("bad number '{text}'")));
                };
                tokens.push(Token::Literal(value));
            }
            c if c.is_alphabetic() => {
                let start = i;
                while i < bytes.len() && (bytes[i] as char).is_alphanumeric() {
                    i += 1;
                }
                match &src[start..i] {
                    "true" => tokens.push(Token::Literal(Value::Bool(true))),
                    "false" => tokens.push(Token::Literal(Value::Bool(false))),
                    "null" => tokens.push(Token::Literal(Value::Null)),
                    word => {
                        return Err(invalid(format!(
                            "bare identifier '{word}' (quote strings, wrap references in '{{{{ }}}}')"
                        )))
                    }
                }
            }
            other => return Err(invalid(format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

// ============================================================================
// PARSER (recursive descent, precedence high -> low)
// ============================================================================

/// Parse a condition expression. Fails with `ConditionInvalid`.
pub fn parse(src: &str) -> Result<ConditionAst, StepError> {
    if src.trim().is_empty() {
        return Err(invalid("empty condition"));
    }
    let tokens = lex(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let root = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(invalid("trailing tokens after expression"));
    }
    Ok(ConditionAst { root })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<Expr, StepError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, StepError> {
        let mut lhs = self.parse_eq()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let rhs = self.parse_eq()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_eq(&mut self) -> Result<Expr, StepError> {
        let mut lhs = self.parse_rel()?;
        while let Some(op) = match self.peek() {
            Some(Token::EqEq) => Some(BinOp::Eq),
            Some(Token::Ne) => Some(BinOp::Ne),
            _ => None,
        } {
            self.bump();
            let rhs = self.parse_rel()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_rel(&mut self) -> Result<Expr, StepError> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = match self.peek() {
            Some(Token::Lt) => Some(BinOp::Lt),
            Some(Token::Le) => Some(BinOp::Le),
            Some(Token::Gt) => Some(BinOp::Gt),
            Some(Token::Ge) => Some(BinOp::Ge),
            _ => None,
        } {
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, StepError> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, StepError> {
        match self.bump() {
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::Template(t)) => Ok(Expr::Template(t)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(invalid("missing closing ')'")),
                }
            }
            Some(other) => Err(invalid(format!("unexpected token {other:?}"))),
            None => Err(invalid("unexpected end of expression")),
        }
    }
}

// ============================================================================
// EVALUATION
// ============================================================================

fn eval_expr(expr: &Expr, scope: &ResolutionScope<'_>) -> Result<Value, StepError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Template(t) => template::resolve_expr(t, scope).map_err(|e| match e {
            StepError::TemplateUnresolved { path } => StepError::ConditionUnresolved {
                reason: format!("missing reference '{path}'"),
            },
            other => other,
        }),
        Expr::Not(inner) => {
            let value = eval_expr(inner, scope)?;
            Ok(Value::Bool(!as_bool(&value)?))
        }
        Expr::Binary { op, lhs, rhs } => {
            // && and || short-circuit on booleans
            if matches!(op, BinOp::And | BinOp::Or) {
                let left = as_bool(&eval_expr(lhs, scope)?)?;
                let result = match op {
                    BinOp::And => left && as_bool(&eval_expr(rhs, scope)?)?,
                    BinOp::Or => left || as_bool(&eval_expr(rhs, scope)?)?,
                    _ => unreachable!(),
                };
                return Ok(Value::Bool(result));
            }

            let left = eval_expr(lhs, scope)?;
            let right = eval_expr(rhs, scope)?;
            match op {
                BinOp::Eq => Ok(Value::Bool(normalized_eq(&left, &right))),
                BinOp::Ne => Ok(Value::Bool(!normalized_eq(&left, &right))),
                BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                    let (a, b) = (require_number(&left)?, require_number(&right)?);
                    let result = match op {
                        BinOp::Lt => a < b,
                        BinOp::Le => a <= b,
                        BinOp::Gt => a > b,
                        BinOp::Ge => a >= b,
                        _ => unreachable!(),
                    };
                    Ok(Value::Bool(result))
                }
                _ => unreachable!(),
            }
        }
    }
}

/// Normalize a value before comparison: numeric strings to numbers,
/// `"true"`/`"false"` to booleans.
pub fn normalize(value: &Value) -> Value {
    if let Value::String(s) = value {
        let trimmed = s.trim();
        if trimmed == "true" {
            return Value::Bool(true);
        }
        if trimmed == "false" {
            return Value::Bool(false);
        }
        if let Ok(n) = trimmed.parse::<i64>() {
            return Value::from(n);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if let Some(num) = serde_json::Number::from_f64(f) {
                return Value::Number(num);
            }
        }
    }
    value.clone()
}

/// Equality after normalization; numbers compare by value.
pub fn normalized_eq(a: &Value, b: &Value) -> bool {
    match (normalize(a), normalize(b)) {
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_f64(), y.as_f64()) {
                (Some(fx), Some(fy)) => fx == fy,
                _ => x == y,
            }
        }
        (x, y) => x == y,
    }
}

/// Switch-case matching: the same normalization as `==`, with strings
/// compared case-insensitively.
pub fn values_match(a: &Value, b: &Value) -> bool {
    match (normalize(a), normalize(b)) {
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(&y),
        (x, y) => normalized_eq(&x, &y),
    }
}

fn require_number(value: &Value) -> Result<f64, StepError> {
    match normalize(value) {
        Value::Number(n) => n.as_f64().ok_or_else(|| {
            invalid(format!("number '{n}' is not representable"))
        }),
        other => Err(invalid(format!(
            "ordered comparison requires numeric operands, got {other}"
        ))),
    }
}

fn as_bool(value: &Value) -> Result<bool, StepError> {
    match normalize(value) {
        Value::Bool(b) => Ok(b),
        other => Err(invalid(format!("expected a boolean, got {other}"))),
    }
}

// ============================================================================
// TESTS
// ============================================================================
