//! Restricted state-expression language.
//!
//! This is the capability surface handed to user-supplied edge conditions
//! and to the built-in expression compiler: a small, pure language over the
//! attempt state. There is no I/O, no ambient clock, and no way to define
//! functions, so evaluating untrusted expressions cannot escape the runner.
//!
//! Two contexts narrow the builtin set:
//! - [`ExprContext::Condition`] exposes only inspection primitives
//!   (`get`, `len`, `keys`, `defined`);
//! - [`ExprContext::Operation`] additionally exposes construction
//!   (`merge`), enough to produce a successor state.
//!
//! The evaluator binds a single variable, `state`.

use std::fmt;

use serde_json::{Map as JsonMap, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("syntax error at byte {at}: {message}")]
    Syntax { at: usize, message: String },

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error("unknown variable: {0}")]
    VariableNotFound(String),

    #[error("unknown function: {0}")]
    FunctionNotFound(String),
}

pub type ExprResult<T> = Result<T, ExprError>;

/// Which builtin set an expression may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprContext {
    /// Pure inspection over state; used for edge conditions.
    Condition,
    /// Inspection plus construction; used for operation bodies.
    Operation,
}

impl ExprContext {
    fn allows(&self, function: &str) -> bool {
        match function {
            "get" | "len" | "keys" | "defined" => true,
            "merge" => matches!(self, ExprContext::Operation),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Dot,
    Comma,
    Colon,
    Semi,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Bang,
    Plus,
    Minus,
    Star,
    Slash,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "{name}"),
            Token::Number(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{other:?}"),
        }
    }
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Syntax {
            at: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn tokenize(mut self) -> ExprResult<Vec<(usize, Token)>> {
        let mut tokens = Vec::new();
        while let Some(byte) = self.peek() {
            let start = self.pos;
            match byte {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                    continue;
                }
                b'0'..=b'9' => {
                    tokens.push((start, self.number()?));
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    tokens.push((start, self.ident()));
                }
                b'\'' | b'"' => {
                    tokens.push((start, self.string(byte)?));
                }
                _ => {
                    self.pos += 1;
                    let token = match byte {
                        b'.' => Token::Dot,
                        b',' => Token::Comma,
                        b':' => Token::Colon,
                        b';' => Token::Semi,
                        b'(' => Token::LParen,
                        b')' => Token::RParen,
                        b'[' => Token::LBracket,
                        b']' => Token::RBracket,
                        b'{' => Token::LBrace,
                        b'}' => Token::RBrace,
                        b'+' => Token::Plus,
                        b'-' => Token::Minus,
                        b'*' => Token::Star,
                        b'/' => Token::Slash,
                        b'!' => {
                            if self.eat(b'=') {
                                Token::NotEq
                            } else {
                                Token::Bang
                            }
                        }
                        b'=' => {
                            if self.eat(b'=') {
                                Token::EqEq
                            } else {
                                return Err(self.error("expected ==, found ="));
                            }
                        }
                        b'<' => {
                            if self.eat(b'=') {
                                Token::Le
                            } else {
                                Token::Lt
                            }
                        }
                        b'>' => {
                            if self.eat(b'=') {
                                Token::Ge
                            } else {
                                Token::Gt
                            }
                        }
                        b'&' => {
                            if self.eat(b'&') {
                                Token::AndAnd
                            } else {
                                return Err(self.error("expected &&"));
                            }
                        }
                        b'|' => {
                            if self.eat(b'|') {
                                Token::OrOr
                            } else {
                                return Err(self.error("expected ||"));
                            }
                        }
                        other => {
                            return Err(self.error(format!(
                                "unexpected character {:?}",
                                other as char
                            )));
                        }
                    };
                    tokens.push((start, token));
                }
            }
        }
        Ok(tokens)
    }

    fn number(&mut self) -> ExprResult<Token> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') && matches!(self.src.get(self.pos + 1), Some(b'0'..=b'9')) {
            self.pos += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("invalid number"))?;
        text.parse()
            .map(Token::Number)
            .map_err(|_| self.error(format!("invalid number {text}")))
    }

    fn ident(&mut self) -> Token {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')
        ) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default();
        match text {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            _ => Token::Ident(text.to_string()),
        }
    }

    fn string(&mut self, quote: u8) -> ExprResult<Token> {
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.bump() {
                Some(b) if b == quote => return Ok(Token::Str(value)),
                Some(b'\\') => match self.bump() {
                    Some(b'n') => value.push('\n'),
                    Some(b't') => value.push('\t'),
                    Some(b) => value.push(b as char),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(b) => value.push(b as char),
                None => return Err(self.error("unterminated string")),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AST and parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Field {
        base: Box<Expr>,
        name: String,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        function: String,
        args: Vec<Expr>,
    },
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn error_at(&self, message: impl Into<String>) -> ExprError {
        let at = self
            .tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(at, _)| *at)
            .unwrap_or(0);
        ExprError::Syntax {
            at,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> ExprResult<()> {
        match self.bump() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(self.error_at(format!("expected {expected}, found {token}"))),
            None => Err(self.error_at(format!("expected {expected}, found end of input"))),
        }
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn program(&mut self) -> ExprResult<Vec<Expr>> {
        let mut exprs = vec![self.expression()?];
        while self.eat(&Token::Semi) {
            if self.peek().is_none() {
                break;
            }
            exprs.push(self.expression()?);
        }
        if let Some(token) = self.peek() {
            return Err(self.error_at(format!("unexpected trailing {token}")));
        }
        Ok(exprs)
    }

    fn expression(&mut self) -> ExprResult<Expr> {
        self.binary(0)
    }

    fn binary(&mut self, min_precedence: u8) -> ExprResult<Expr> {
        let mut left = self.unary()?;
        while let Some(op) = self.peek().and_then(binop_of) {
            let precedence = precedence_of(op);
            if precedence < min_precedence {
                break;
            }
            self.pos += 1;
            let right = self.binary(precedence + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> ExprResult<Expr> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ExprResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.bump() {
                    Some(Token::Ident(name)) => {
                        expr = Expr::Field {
                            base: Box::new(expr),
                            name,
                        };
                    }
                    _ => return Err(self.error_at("expected field name after '.'")),
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.peek() == Some(&Token::LParen) {
                // Calls are only valid on bare function names.
                let Expr::Variable(function) = expr else {
                    return Err(self.error_at("only builtin functions can be called"));
                };
                self.pos += 1;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                expr = Expr::Call { function, args };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> ExprResult<Expr> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Variable(name)),
            Some(Token::LParen) => {
                let expr = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                let mut elements = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        elements.push(self.expression()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expr::Array(elements))
            }
            Some(Token::LBrace) => {
                let mut entries = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = match self.bump() {
                            Some(Token::Ident(name)) => name,
                            Some(Token::Str(s)) => s,
                            _ => return Err(self.error_at("expected object key")),
                        };
                        self.expect(Token::Colon)?;
                        entries.push((key, self.expression()?));
                        if self.eat(&Token::RBrace) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expr::Object(entries))
            }
            Some(token) => Err(self.error_at(format!("unexpected {token}"))),
            None => Err(self.error_at("unexpected end of input")),
        }
    }
}

fn binop_of(token: &Token) -> Option<BinOp> {
    Some(match token {
        Token::OrOr => BinOp::Or,
        Token::AndAnd => BinOp::And,
        Token::EqEq => BinOp::Eq,
        Token::NotEq => BinOp::Ne,
        Token::Lt => BinOp::Lt,
        Token::Le => BinOp::Le,
        Token::Gt => BinOp::Gt,
        Token::Ge => BinOp::Ge,
        Token::Plus => BinOp::Add,
        Token::Minus => BinOp::Sub,
        Token::Star => BinOp::Mul,
        Token::Slash => BinOp::Div,
        _ => return None,
    })
}

fn precedence_of(op: BinOp) -> u8 {
    match op {
        BinOp::Or => 1,
        BinOp::And => 2,
        BinOp::Eq | BinOp::Ne => 3,
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 4,
        BinOp::Add | BinOp::Sub => 5,
        BinOp::Mul | BinOp::Div => 6,
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Parse a `;`-separated sequence of expressions.
pub fn parse_program(source: &str) -> ExprResult<Vec<Expr>> {
    let tokens = Lexer::new(source).tokenize()?;
    if tokens.is_empty() {
        return Err(ExprError::Syntax {
            at: 0,
            message: "empty expression".to_string(),
        });
    }
    Parser { tokens, pos: 0 }.program()
}

/// Parse a single expression (edge conditions).
pub fn parse_expression(source: &str) -> ExprResult<Expr> {
    let mut exprs = parse_program(source)?;
    if exprs.len() != 1 {
        return Err(ExprError::Syntax {
            at: 0,
            message: "expected a single expression".to_string(),
        });
    }
    Ok(exprs.remove(0))
}

/// Static validation: every called function must exist in the context's
/// builtin set. Run at compile time so bad conditions fail before any
/// attempt starts.
pub fn validate(expr: &Expr, context: ExprContext) -> ExprResult<()> {
    match expr {
        Expr::Literal(_) | Expr::Variable(_) => Ok(()),
        Expr::Not(inner) | Expr::Neg(inner) => validate(inner, context),
        Expr::Binary { left, right, .. } => {
            validate(left, context)?;
            validate(right, context)
        }
        Expr::Field { base, .. } => validate(base, context),
        Expr::Index { base, index } => {
            validate(base, context)?;
            validate(index, context)
        }
        Expr::Call { function, args } => {
            if !context.allows(function) {
                return Err(ExprError::FunctionNotFound(function.clone()));
            }
            for arg in args {
                validate(arg, context)?;
            }
            Ok(())
        }
        Expr::Object(entries) => {
            for (_, value) in entries {
                validate(value, context)?;
            }
            Ok(())
        }
        Expr::Array(elements) => {
            for element in elements {
                validate(element, context)?;
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate an expression with `state` bound.
pub fn evaluate(expr: &Expr, state: &Value, context: ExprContext) -> ExprResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Variable(name) => {
            if name == "state" {
                Ok(state.clone())
            } else {
                Err(ExprError::VariableNotFound(name.clone()))
            }
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&evaluate(inner, state, context)?))),
        Expr::Neg(inner) => match evaluate(inner, state, context)? {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Number((-i).into()))
                } else if let Some(f) = n.as_f64() {
                    Ok(number_value(-f))
                } else {
                    Err(ExprError::Eval("cannot negate number".to_string()))
                }
            }
            other => Err(ExprError::Eval(format!("cannot negate {other}"))),
        },
        Expr::Binary { op, left, right } => {
            let left = evaluate(left, state, context)?;
            // Short-circuit before evaluating the right side.
            match op {
                BinOp::And if !truthy(&left) => return Ok(Value::Bool(false)),
                BinOp::Or if truthy(&left) => return Ok(Value::Bool(true)),
                _ => {}
            }
            let right = evaluate(right, state, context)?;
            apply_binop(*op, &left, &right)
        }
        Expr::Field { base, name } => {
            let base = evaluate(base, state, context)?;
            Ok(base.get(name).cloned().unwrap_or(Value::Null))
        }
        Expr::Index { base, index } => {
            let base = evaluate(base, state, context)?;
            let index = evaluate(index, state, context)?;
            Ok(match (&base, &index) {
                (Value::Object(map), Value::String(key)) => {
                    map.get(key).cloned().unwrap_or(Value::Null)
                }
                (Value::Array(items), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned()
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            })
        }
        Expr::Call { function, args } => {
            if !context.allows(function) {
                return Err(ExprError::FunctionNotFound(function.clone()));
            }
            let args: Vec<Value> = args
                .iter()
                .map(|arg| evaluate(arg, state, context))
                .collect::<ExprResult<_>>()?;
            call_builtin(function, &args)
        }
        Expr::Object(entries) => {
            let mut map = JsonMap::new();
            for (key, value) in entries {
                map.insert(key.clone(), evaluate(value, state, context)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Array(elements) => {
            let values: Vec<Value> = elements
                .iter()
                .map(|element| evaluate(element, state, context))
                .collect::<ExprResult<_>>()?;
            Ok(Value::Array(values))
        }
    }
}

fn apply_binop(op: BinOp, left: &Value, right: &Value) -> ExprResult<Value> {
    use BinOp::*;
    match op {
        Eq => Ok(Value::Bool(left == right)),
        Ne => Ok(Value::Bool(left != right)),
        And => Ok(Value::Bool(truthy(left) && truthy(right))),
        Or => Ok(Value::Bool(truthy(left) || truthy(right))),
        Add => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => arithmetic(op, left, right),
        },
        Sub | Mul | Div => arithmetic(op, left, right),
        Lt | Le | Gt | Ge => {
            let (a, b) = numeric_pair(left, right)?;
            Ok(Value::Bool(match op {
                Lt => a < b,
                Le => a <= b,
                Gt => a > b,
                _ => a >= b,
            }))
        }
    }
}

fn arithmetic(op: BinOp, left: &Value, right: &Value) -> ExprResult<Value> {
    let (a, b) = numeric_pair(left, right)?;
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(ExprError::Eval("division by zero".to_string()));
            }
            a / b
        }
        _ => unreachable!("non-arithmetic op"),
    };
    Ok(number_value(result))
}

fn numeric_pair(left: &Value, right: &Value) -> ExprResult<(f64, f64)> {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(ExprError::Eval(format!(
            "expected numbers, found {left} and {right}"
        ))),
    }
}

fn call_builtin(function: &str, args: &[Value]) -> ExprResult<Value> {
    match function {
        "get" => match args {
            [Value::Object(map), Value::String(key)] => {
                Ok(map.get(key).cloned().unwrap_or(Value::Null))
            }
            [_, _] => Ok(Value::Null),
            _ => Err(ExprError::Eval("get expects (object, key)".to_string())),
        },
        "len" => match args {
            [Value::Array(items)] => Ok(Value::Number(items.len().into())),
            [Value::Object(map)] => Ok(Value::Number(map.len().into())),
            [Value::String(s)] => Ok(Value::Number(s.len().into())),
            _ => Err(ExprError::Eval("len expects one collection".to_string())),
        },
        "keys" => match args {
            [Value::Object(map)] => Ok(Value::Array(
                map.keys().map(|k| Value::String(k.clone())).collect(),
            )),
            _ => Err(ExprError::Eval("keys expects an object".to_string())),
        },
        "defined" => match args {
            [value] => Ok(Value::Bool(!value.is_null())),
            _ => Err(ExprError::Eval("defined expects one argument".to_string())),
        },
        "merge" => match args {
            [Value::Object(a), Value::Object(b)] => {
                let mut merged = a.clone();
                for (key, value) in b {
                    merged.insert(key.clone(), value.clone());
                }
                Ok(Value::Object(merged))
            }
            _ => Err(ExprError::Eval("merge expects two objects".to_string())),
        },
        _ => Err(ExprError::FunctionNotFound(function.to_string())),
    }
}

/// JSON truthiness: null and false are false, zero and the empty string are
/// false, arrays and objects are always true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
