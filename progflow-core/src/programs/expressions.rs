//! Condition and expression language used by triggers and parameter templates.
//!
//! Expressions are parsed into an [`Expression`] tree and evaluated against an
//! [`Environment`] holding the run variables and the run's fixed instant. The
//! function table is owned by [`ExpressionEvaluator`], so new functions are
//! registered there and the parser never changes.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Number, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("expression parse error: {0}")]
    Parse(String),
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("function '{function}' expects {expected} argument(s), got {actual}")]
    Arity {
        function: String,
        expected: usize,
        actual: usize,
    },
}

impl ExpressionError {
    pub fn is_parse(&self) -> bool {
        matches!(self, ExpressionError::Parse(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvaluationOptions {
    pub max_length: usize,
    pub max_depth: usize,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            max_length: 8_192,
            max_depth: 64,
        }
    }
}

/// Variables and clock visible to one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Environment<'a> {
    variables: &'a BTreeMap<String, Value>,
    now: DateTime<Utc>,
}

impl<'a> Environment<'a> {
    pub fn new(variables: &'a BTreeMap<String, Value>, now: DateTime<Utc>) -> Self {
        Self { variables, now }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.variables.get(name)
    }
}

pub type BuiltinFn =
    dyn Fn(&[Value], &Environment<'_>) -> Result<Value, ExpressionError> + Send + Sync;

#[derive(Clone)]
struct FunctionEntry {
    arity: usize,
    call: Arc<BuiltinFn>,
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone)]
enum Expr {
    Variable(String),
    Literal(Value),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Access {
        target: Box<Expr>,
        segment: String,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Identifier(String),
    Number(f64),
    String(String),
    True,
    False,
    Null,
}

/// A parsed expression, ready to be evaluated any number of times.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Upper-cased names of every function the expression calls.
    pub fn functions(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        collect_functions(&self.root, &mut names);
        names
    }

    /// Root variable names the expression reads.
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        collect_identifiers(&self.root, &mut names);
        names
    }
}

fn collect_functions(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Variable(_) | Expr::Literal(_) => {}
        Expr::Unary { expr, .. } => collect_functions(expr, out),
        Expr::Binary { left, right, .. } => {
            collect_functions(left, out);
            collect_functions(right, out);
        }
        Expr::Access { target, .. } => collect_functions(target, out),
        Expr::Index { target, index } => {
            collect_functions(target, out);
            collect_functions(index, out);
        }
        Expr::Call { name, args } => {
            out.insert(name.clone());
            for arg in args {
                collect_functions(arg, out);
            }
        }
    }
}

fn collect_identifiers(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Variable(name) => {
            out.insert(name.clone());
        }
        Expr::Literal(_) => {}
        Expr::Unary { expr, .. } => collect_identifiers(expr, out),
        Expr::Binary { left, right, .. } => {
            collect_identifiers(left, out);
            collect_identifiers(right, out);
        }
        Expr::Access { target, .. } => collect_identifiers(target, out),
        Expr::Index { target, index } => {
            collect_identifiers(target, out);
            collect_identifiers(index, out);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                collect_identifiers(arg, out);
            }
        }
    }
}

#[derive(Clone)]
pub struct ExpressionEvaluator {
    functions: HashMap<String, FunctionEntry>,
    options: EvaluationOptions,
}

impl std::fmt::Debug for ExpressionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.function_names();
        names.sort();
        f.debug_struct("ExpressionEvaluator")
            .field("functions", &names)
            .field("options", &self.options)
            .finish()
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self::with_options(EvaluationOptions::default())
    }

    pub fn with_options(options: EvaluationOptions) -> Self {
        let mut evaluator = Self {
            functions: HashMap::new(),
            options,
        };
        evaluator.register_builtins();
        evaluator
    }

    pub fn options(&self) -> EvaluationOptions {
        self.options
    }

    /// Adds (or replaces) a function. Names are case-insensitive.
    pub fn with_function<F>(mut self, name: &str, arity: usize, function: F) -> Self
    where
        F: Fn(&[Value], &Environment<'_>) -> Result<Value, ExpressionError> + Send + Sync + 'static,
    {
        self.register_function(name, arity, function);
        self
    }

    pub fn register_function<F>(&mut self, name: &str, arity: usize, function: F)
    where
        F: Fn(&[Value], &Environment<'_>) -> Result<Value, ExpressionError> + Send + Sync + 'static,
    {
        self.functions.insert(
            name.to_ascii_uppercase(),
            FunctionEntry {
                arity,
                call: Arc::new(function),
            },
        );
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(&name.to_ascii_uppercase())
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn parse(&self, expression: &str) -> Result<Expression, ExpressionError> {
        if expression.len() > self.options.max_length {
            return Err(ExpressionError::Parse(format!(
                "expression exceeds max length {}",
                self.options.max_length
            )));
        }
        if expression.trim().is_empty() {
            return Err(ExpressionError::Parse("expression is empty".to_owned()));
        }

        let tokens = tokenize(expression)?;
        let mut parser = Parser::new(tokens, self.options.max_depth);
        let root = parser.parse_expression()?;
        parser.expect_end()?;
        Ok(Expression {
            source: expression.to_owned(),
            root,
        })
    }

    pub fn evaluate(&self, expression: &str, env: &Environment<'_>) -> Result<Value, ExpressionError> {
        let parsed = self.parse(expression)?;
        self.evaluate_parsed(&parsed, env)
    }

    pub fn evaluate_parsed(
        &self,
        expression: &Expression,
        env: &Environment<'_>,
    ) -> Result<Value, ExpressionError> {
        Evaluator {
            functions: &self.functions,
            env,
        }
        .eval(&expression.root)
    }

    /// Evaluates an expression that must produce a boolean.
    pub fn evaluate_condition(
        &self,
        expression: &str,
        env: &Environment<'_>,
    ) -> Result<bool, ExpressionError> {
        match self.evaluate(expression, env)? {
            Value::Bool(value) => Ok(value),
            other => Err(ExpressionError::TypeMismatch(format!(
                "condition must evaluate to a boolean, got {}",
                type_name(&other)
            ))),
        }
    }

    fn register_builtins(&mut self) {
        self.register_function("COUNT", 1, |args, _| {
            Ok(number_to_value(match &args[0] {
                Value::Array(items) => items.len() as f64,
                Value::Object(map) => map.len() as f64,
                other => {
                    return Err(ExpressionError::TypeMismatch(format!(
                        "COUNT expects a collection, got {}",
                        type_name(other)
                    )))
                }
            }))
        });
        self.register_function("SUM", 1, |args, _| {
            let numbers = numeric_items("SUM", &args[0])?;
            Ok(number_to_value(numbers.iter().sum()))
        });
        self.register_function("AVG", 1, |args, _| {
            let numbers = numeric_items("AVG", &args[0])?;
            if numbers.is_empty() {
                return Ok(number_to_value(0.0));
            }
            let total = numbers.iter().sum::<f64>();
            Ok(number_to_value(total / numbers.len() as f64))
        });
        self.register_function("MIN", 1, |args, _| {
            let numbers = numeric_items("MIN", &args[0])?;
            Ok(numbers
                .into_iter()
                .reduce(f64::min)
                .map(number_to_value)
                .unwrap_or(Value::Null))
        });
        self.register_function("MAX", 1, |args, _| {
            let numbers = numeric_items("MAX", &args[0])?;
            Ok(numbers
                .into_iter()
                .reduce(f64::max)
                .map(number_to_value)
                .unwrap_or(Value::Null))
        });
        self.register_function("NOW", 0, |_, env| Ok(instant_to_value(env.now())));
        self.register_function("DAYS_AGO", 1, |args, env| {
            let days = as_number(&args[0]).ok_or_else(|| {
                ExpressionError::TypeMismatch(format!(
                    "DAYS_AGO expects a number, got {}",
                    type_name(&args[0])
                ))
            })?;
            let out_of_range =
                || ExpressionError::TypeMismatch(format!("DAYS_AGO argument {days} is out of range"));
            let seconds = (days * 86_400.0).round();
            if !seconds.is_finite() {
                return Err(out_of_range());
            }
            let offset = ChronoDuration::try_seconds(seconds as i64).ok_or_else(out_of_range)?;
            let instant = env.now().checked_sub_signed(offset).ok_or_else(out_of_range)?;
            Ok(instant_to_value(instant))
        });
        self.register_function("LOWER", 1, |args, _| {
            let text = string_arg("LOWER", &args[0])?;
            Ok(Value::String(text.to_lowercase()))
        });
        self.register_function("UPPER", 1, |args, _| {
            let text = string_arg("UPPER", &args[0])?;
            Ok(Value::String(text.to_uppercase()))
        });
        self.register_function("CONTAINS", 2, |args, _| {
            let found = match (&args[0], &args[1]) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => {
                    items.iter().any(|item| loosely_equal(item, needle))
                }
                (Value::Object(map), Value::String(key)) => map.contains_key(key),
                (left, right) => {
                    return Err(ExpressionError::TypeMismatch(format!(
                        "CONTAINS cannot search {} for {}",
                        type_name(left),
                        type_name(right)
                    )))
                }
            };
            Ok(Value::Bool(found))
        });
        self.register_function("MATCHES", 2, |args, _| {
            let text = string_arg("MATCHES", &args[0])?;
            let pattern = string_arg("MATCHES", &args[1])?;
            let regex = Regex::new(pattern).map_err(|err| {
                ExpressionError::TypeMismatch(format!("invalid regex '{pattern}': {err}"))
            })?;
            Ok(Value::Bool(regex.is_match(text)))
        });
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut chars = input.char_indices().peekable();
    let mut tokens = Vec::new();

    while let Some((idx, ch)) = chars.peek().copied() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        if ch.is_ascii_digit() {
            let start = idx;
            chars.next();
            while let Some((_, c)) = chars.peek().copied() {
                if c.is_ascii_digit() || c == '.' {
                    chars.next();
                } else {
                    break;
                }
            }
            let end = chars.peek().map(|(i, _)| *i).unwrap_or(input.len());
            let text = &input[start..end];
            let number = text
                .parse::<f64>()
                .map_err(|err| ExpressionError::Parse(format!("invalid number '{text}': {err}")))?;
            tokens.push(Token::Number(number));
            continue;
        }

        if ch == '\'' || ch == '"' {
            let quote = ch;
            chars.next();
            let mut value = String::new();
            let mut escaped = false;
            let mut terminated = false;

            for (_, c) in chars.by_ref() {
                if escaped {
                    let translated = match c {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    };
                    value.push(translated);
                    escaped = false;
                    continue;
                }
                if c == '\\' {
                    escaped = true;
                    continue;
                }
                if c == quote {
                    terminated = true;
                    break;
                }
                value.push(c);
            }

            if !terminated {
                return Err(ExpressionError::Parse(
                    "unterminated string literal".to_owned(),
                ));
            }
            tokens.push(Token::String(value));
            continue;
        }

        if ch.is_ascii_alphabetic() || ch == '_' {
            let start = idx;
            chars.next();
            while let Some((_, c)) = chars.peek().copied() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    chars.next();
                } else {
                    break;
                }
            }
            let end = chars.peek().map(|(i, _)| *i).unwrap_or(input.len());
            let ident = &input[start..end];
            let token = match ident.to_ascii_lowercase().as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                _ => Token::Identifier(ident.to_owned()),
            };
            tokens.push(token);
            continue;
        }

        chars.next();
        let next_is = |chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>, want: char| {
            if matches!(chars.peek(), Some((_, c)) if *c == want) {
                chars.next();
                true
            } else {
                false
            }
        };

        let token = match ch {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '.' => Token::Dot,
            ',' => Token::Comma,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '=' => {
                next_is(&mut chars, '=');
                Token::Eq
            }
            '!' => {
                if next_is(&mut chars, '=') {
                    Token::NotEq
                } else {
                    Token::Not
                }
            }
            '>' => {
                if next_is(&mut chars, '=') {
                    Token::Gte
                } else {
                    Token::Gt
                }
            }
            '<' => {
                if next_is(&mut chars, '=') {
                    Token::Lte
                } else if next_is(&mut chars, '>') {
                    Token::NotEq
                } else {
                    Token::Lt
                }
            }
            '&' => {
                if !next_is(&mut chars, '&') {
                    return Err(ExpressionError::Parse(
                        "unexpected '&'; use 'AND' or '&&'".to_owned(),
                    ));
                }
                Token::And
            }
            '|' => {
                if !next_is(&mut chars, '|') {
                    return Err(ExpressionError::Parse(
                        "unexpected '|'; use 'OR' or '||'".to_owned(),
                    ));
                }
                Token::Or
            }
            other => {
                return Err(ExpressionError::Parse(format!(
                    "unexpected character '{other}' at offset {idx}"
                )));
            }
        };
        tokens.push(token);
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
    depth: usize,
    max_depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, max_depth: usize) -> Self {
        Self {
            tokens,
            index: 0,
            depth: 0,
            max_depth,
        }
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(ExpressionError::Parse(format!(
                "expression nesting exceeds max depth {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn parse_expression(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let expr = self.parse_or();
        self.leave();
        expr
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.match_token(&Token::Or) {
            let right = self.parse_and()?;
            left = binary(left, BinaryOp::Or, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        while self.match_token(&Token::And) {
            let right = self.parse_comparison()?;
            left = binary(left, BinaryOp::And, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_additive()?;
        while let Some(op) = self.match_comparison_op() {
            let right = self.parse_additive()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.match_token(&Token::Plus) {
                BinaryOp::Add
            } else if self.match_token(&Token::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.parse_multiplicative()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.match_token(&Token::Star) {
                BinaryOp::Mul
            } else if self.match_token(&Token::Slash) {
                BinaryOp::Div
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = if self.match_token(&Token::Not) {
            UnaryOp::Not
        } else if self.match_token(&Token::Minus) {
            UnaryOp::Neg
        } else {
            return self.parse_postfix();
        };

        self.enter()?;
        let operand = self.parse_unary();
        self.leave();
        Ok(Expr::Unary {
            op,
            expr: Box::new(operand?),
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.match_token(&Token::Dot) {
                let segment = match self.peek().cloned() {
                    Some(Token::Identifier(name)) => name,
                    Some(Token::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                        format!("{}", n as u64)
                    }
                    _ => {
                        return Err(ExpressionError::Parse(
                            "expected member name after '.'".to_owned(),
                        ))
                    }
                };
                self.index += 1;
                expr = Expr::Access {
                    target: Box::new(expr),
                    segment,
                };
                continue;
            }

            if self.match_token(&Token::LBracket) {
                let index = self.parse_expression()?;
                self.consume(&Token::RBracket, "expected ']' after index")?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
                continue;
            }

            break;
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let Some(token) = self.peek().cloned() else {
            return Err(ExpressionError::Parse(
                "unexpected end of expression".to_owned(),
            ));
        };
        self.index += 1;

        match token {
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Number(v) => {
                let number = Number::from_f64(v).ok_or_else(|| {
                    ExpressionError::Parse(format!("invalid finite number literal '{v}'"))
                })?;
                Ok(Expr::Literal(Value::Number(number)))
            }
            Token::String(v) => Ok(Expr::Literal(Value::String(v))),
            Token::Identifier(name) => {
                if !self.match_token(&Token::LParen) {
                    return Ok(Expr::Variable(name));
                }
                let mut args = Vec::new();
                if !self.match_token(&Token::RParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if self.match_token(&Token::RParen) {
                            break;
                        }
                        self.consume(&Token::Comma, "expected ',' between function arguments")?;
                    }
                }
                Ok(Expr::Call {
                    name: name.to_ascii_uppercase(),
                    args,
                })
            }
            Token::LParen => {
                let expr = self.parse_expression()?;
                self.consume(&Token::RParen, "expected ')' after expression")?;
                Ok(expr)
            }
            other => Err(ExpressionError::Parse(format!(
                "unexpected token {other:?}"
            ))),
        }
    }

    fn match_comparison_op(&mut self) -> Option<BinaryOp> {
        let op = match self.peek()? {
            Token::Eq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Neq,
            Token::Gt => BinaryOp::Gt,
            Token::Gte => BinaryOp::Gte,
            Token::Lt => BinaryOp::Lt,
            Token::Lte => BinaryOp::Lte,
            _ => return None,
        };
        self.index += 1;
        Some(op)
    }

    fn consume(&mut self, expected: &Token, msg: &str) -> Result<(), ExpressionError> {
        if self.match_token(expected) {
            Ok(())
        } else {
            Err(ExpressionError::Parse(msg.to_owned()))
        }
    }

    fn match_token(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.index += 1;
            return true;
        }
        false
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }

    fn expect_end(&self) -> Result<(), ExpressionError> {
        match self.peek() {
            Some(token) => Err(ExpressionError::Parse(format!(
                "unexpected trailing token {token:?}"
            ))),
            None => Ok(()),
        }
    }
}

fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    Expr::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

struct Evaluator<'a, 'e> {
    functions: &'a HashMap<String, FunctionEntry>,
    env: &'a Environment<'e>,
}

impl Evaluator<'_, '_> {
    fn eval(&self, expr: &Expr) -> Result<Value, ExpressionError> {
        match expr {
            Expr::Variable(name) => self
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| ExpressionError::UnknownIdentifier(name.clone())),
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!expect_bool("NOT", &value)?)),
                    UnaryOp::Neg => {
                        let number = as_number(&value).ok_or_else(|| {
                            ExpressionError::TypeMismatch(format!(
                                "cannot negate {}",
                                type_name(&value)
                            ))
                        })?;
                        Ok(number_to_value(-number))
                    }
                }
            }
            Expr::Binary {
                left,
                op: BinaryOp::And,
                right,
            } => {
                if !expect_bool("AND", &self.eval(left)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(expect_bool("AND", &self.eval(right)?)?))
            }
            Expr::Binary {
                left,
                op: BinaryOp::Or,
                right,
            } => {
                if expect_bool("OR", &self.eval(left)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(expect_bool("OR", &self.eval(right)?)?))
            }
            Expr::Binary { left, op, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                eval_binary(&left, *op, &right)
            }
            Expr::Access { target, segment } => {
                let value = self.eval(target)?;
                match &value {
                    Value::Object(map) => map.get(segment).cloned().ok_or_else(|| {
                        ExpressionError::UnknownIdentifier(format!("{}.{segment}", describe(target)))
                    }),
                    Value::Array(items) => segment
                        .parse::<usize>()
                        .ok()
                        .and_then(|idx| items.get(idx).cloned())
                        .ok_or_else(|| {
                            ExpressionError::UnknownIdentifier(format!(
                                "{}.{segment}",
                                describe(target)
                            ))
                        }),
                    other => Err(ExpressionError::TypeMismatch(format!(
                        "cannot read member '{segment}' of {}",
                        type_name(other)
                    ))),
                }
            }
            Expr::Index { target, index } => {
                let value = self.eval(target)?;
                let index = self.eval(index)?;
                let missing =
                    || ExpressionError::UnknownIdentifier(format!("{}[{index}]", describe(target)));
                match (&value, &index) {
                    (Value::Array(items), Value::Number(n)) => n
                        .as_f64()
                        .filter(|idx| *idx >= 0.0 && idx.fract() == 0.0)
                        .and_then(|idx| items.get(idx as usize).cloned())
                        .ok_or_else(missing),
                    (Value::Object(map), Value::String(key)) => {
                        map.get(key).cloned().ok_or_else(missing)
                    }
                    (target, index) => Err(ExpressionError::TypeMismatch(format!(
                        "cannot index {} with {}",
                        type_name(target),
                        type_name(index)
                    ))),
                }
            }
            Expr::Call { name, args } => {
                let entry = self
                    .functions
                    .get(name)
                    .ok_or_else(|| ExpressionError::UnknownFunction(name.clone()))?;
                if args.len() != entry.arity {
                    return Err(ExpressionError::Arity {
                        function: name.clone(),
                        expected: entry.arity,
                        actual: args.len(),
                    });
                }
                let evaluated = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                (entry.call)(&evaluated, self.env)
            }
        }
    }
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Variable(name) => name.clone(),
        Expr::Access { target, segment } => format!("{}.{segment}", describe(target)),
        Expr::Index { target, .. } => format!("{}[..]", describe(target)),
        Expr::Call { name, .. } => format!("{name}(..)"),
        _ => "<expression>".to_owned(),
    }
}

fn eval_binary(left: &Value, op: BinaryOp, right: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right)?)),
        BinaryOp::Neq => Ok(Value::Bool(!values_equal(left, right)?)),
        BinaryOp::Gt | BinaryOp::Gte | BinaryOp::Lt | BinaryOp::Lte => {
            let ordering = compare_values(left, right)?;
            Ok(Value::Bool(match op {
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Gte => ordering.is_ge(),
                BinaryOp::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            }))
        }
        BinaryOp::Add => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => {
                let (a, b) = numbers_pair(left, right, "+")?;
                Ok(number_to_value(a + b))
            }
        },
        BinaryOp::Sub => {
            let (a, b) = numbers_pair(left, right, "-")?;
            Ok(number_to_value(a - b))
        }
        BinaryOp::Mul => {
            let (a, b) = numbers_pair(left, right, "*")?;
            Ok(number_to_value(a * b))
        }
        BinaryOp::Div => {
            let (a, b) = numbers_pair(left, right, "/")?;
            if b == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            Ok(number_to_value(a / b))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("logical operators short-circuit in eval"),
    }
}

fn values_equal(left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    match (left, right) {
        (Value::Null, Value::Null) => Ok(true),
        (Value::Null, _) | (_, Value::Null) => Ok(false),
        (Value::Number(a), Value::Number(b)) => Ok(a.as_f64() == b.as_f64()),
        (Value::String(a), Value::String(b)) => Ok(a == b),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            Ok(left == right)
        }
        _ => Err(ExpressionError::TypeMismatch(format!(
            "cannot compare {} with {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    values_equal(left, right).unwrap_or(false)
}

fn compare_values(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExpressionError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b).ok_or_else(|| {
                ExpressionError::TypeMismatch(format!("cannot order {a} and {b}"))
            })
        }
        (Value::String(a), Value::String(b)) => {
            match (parse_instant(a), parse_instant(b)) {
                (Some(a), Some(b)) => Ok(a.cmp(&b)),
                _ => Ok(a.cmp(b)),
            }
        }
        _ => Err(ExpressionError::TypeMismatch(format!(
            "cannot order {} and {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn numbers_pair(left: &Value, right: &Value, op: &str) -> Result<(f64, f64), ExpressionError> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(ExpressionError::TypeMismatch(format!(
            "operator '{op}' expects numbers, got {} and {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn expect_bool(op: &str, value: &Value) -> Result<bool, ExpressionError> {
    value.as_bool().ok_or_else(|| {
        ExpressionError::TypeMismatch(format!(
            "operator '{op}' expects booleans, got {}",
            type_name(value)
        ))
    })
}

fn numeric_items(function: &str, value: &Value) -> Result<Vec<f64>, ExpressionError> {
    let Value::Array(items) = value else {
        return Err(ExpressionError::TypeMismatch(format!(
            "{function} expects an array, got {}",
            type_name(value)
        )));
    };
    items
        .iter()
        .map(|item| {
            as_number(item).ok_or_else(|| {
                ExpressionError::TypeMismatch(format!(
                    "{function} expects numeric items, found {}",
                    type_name(item)
                ))
            })
        })
        .collect()
}

fn string_arg<'v>(function: &str, value: &'v Value) -> Result<&'v str, ExpressionError> {
    value.as_str().ok_or_else(|| {
        ExpressionError::TypeMismatch(format!(
            "{function} expects a string, got {}",
            type_name(value)
        ))
    })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(v) => v.as_f64(),
        _ => None,
    }
}

fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}

fn instant_to_value(instant: DateTime<Utc>) -> Value {
    Value::String(instant.to_rfc3339_opts(SecondsFormat::Secs, true))
}

pub(crate) fn number_to_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < 9.0e15 {
        return Value::from(number as i64);
    }
    Number::from_f64(number)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn vars(value: Value) -> BTreeMap<String, Value> {
        value
            .as_object()
            .map(|map| map.clone().into_iter().collect())
            .unwrap_or_default()
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    fn eval(expression: &str, variables: Value) -> Result<Value, ExpressionError> {
        let variables = vars(variables);
        ExpressionEvaluator::new().evaluate(expression, &Environment::new(&variables, fixed_now()))
    }

    #[test]
    fn evaluates_conjunction_of_comparisons() {
        let result = eval(
            "age >= 18 AND verified = true",
            json!({"age": 20, "verified": true}),
        );
        assert_eq!(result, Ok(Value::Bool(true)));
    }

    #[test]
    fn count_of_empty_collection_is_zero() {
        let result = eval("COUNT(orders) > 0", json!({"orders": []}));
        assert_eq!(result, Ok(Value::Bool(false)));
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let result = eval("unknown_var > 1", json!({}));
        assert_eq!(
            result,
            Err(ExpressionError::UnknownIdentifier("unknown_var".to_owned()))
        );
    }

    #[test]
    fn not_binds_tighter_than_and_which_binds_tighter_than_or() {
        let variables = json!({"a": true, "b": false, "c": false});
        assert_eq!(eval("a OR b AND c", variables.clone()), Ok(Value::Bool(true)));
        assert_eq!(eval("(a OR b) AND c", variables.clone()), Ok(Value::Bool(false)));
        assert_eq!(eval("NOT b AND a", variables.clone()), Ok(Value::Bool(true)));
        assert_eq!(eval("not a or not b", variables), Ok(Value::Bool(true)));
    }

    #[test]
    fn logical_operators_short_circuit() {
        assert_eq!(eval("false AND missing > 1", json!({})), Ok(Value::Bool(false)));
        assert_eq!(eval("true OR missing > 1", json!({})), Ok(Value::Bool(true)));
    }

    #[test]
    fn logical_operators_reject_non_booleans() {
        let err = eval("1 AND true", json!({})).unwrap_err();
        assert!(matches!(err, ExpressionError::TypeMismatch(_)));
    }

    #[test]
    fn equality_across_types_is_a_mismatch() {
        let err = eval("age = '20'", json!({"age": 20})).unwrap_err();
        assert!(matches!(err, ExpressionError::TypeMismatch(_)));
        assert_eq!(eval("age = null", json!({"age": 20})), Ok(Value::Bool(false)));
    }

    #[test]
    fn integers_and_floats_compare_numerically() {
        assert_eq!(eval("score = 20.0", json!({"score": 20})), Ok(Value::Bool(true)));
        assert_eq!(eval("score == 20", json!({"score": 20.0})), Ok(Value::Bool(true)));
    }

    #[test]
    fn arithmetic_and_division_by_zero() {
        assert_eq!(eval("(a + 2) * 3 - 1", json!({"a": 1})), Ok(json!(8)));
        assert_eq!(eval("7 / 2", json!({})), Ok(json!(3.5)));
        assert_eq!(eval("1 / zero", json!({"zero": 0})), Err(ExpressionError::DivisionByZero));
        assert_eq!(eval("-a + 1", json!({"a": 3})), Ok(json!(-2)));
    }

    #[test]
    fn member_and_index_access() {
        let variables = json!({
            "user": {"profile": {"tier": "gold"}, "tags": ["new", "vip"]},
            "steps": {"welcome": {"delivered": true}}
        });
        assert_eq!(
            eval("user.profile.tier = 'gold'", variables.clone()),
            Ok(Value::Bool(true))
        );
        assert_eq!(eval("user.tags[1]", variables.clone()), Ok(json!("vip")));
        assert_eq!(eval("steps.welcome.delivered", variables.clone()), Ok(json!(true)));
        assert_eq!(
            eval("steps.reminder.delivered", variables),
            Err(ExpressionError::UnknownIdentifier("steps.reminder".to_owned()))
        );
    }

    #[test]
    fn aggregate_functions() {
        let variables = json!({"scores": [2, 4, 9]});
        assert_eq!(eval("SUM(scores)", variables.clone()), Ok(json!(15)));
        assert_eq!(eval("AVG(scores)", variables.clone()), Ok(json!(5)));
        assert_eq!(eval("min(scores) < max(scores)", variables), Ok(json!(true)));
        assert_eq!(eval("AVG(empty)", json!({"empty": []})), Ok(json!(0)));
        let err = eval("SUM(mixed)", json!({"mixed": [1, "x"]})).unwrap_err();
        assert!(matches!(err, ExpressionError::TypeMismatch(_)));
    }

    #[test]
    fn time_functions_use_the_environment_clock() {
        assert_eq!(eval("NOW()", json!({})), Ok(json!("2024-03-15T12:00:00Z")));
        assert_eq!(eval("DAYS_AGO(2)", json!({})), Ok(json!("2024-03-13T12:00:00Z")));
        assert_eq!(
            eval(
                "last_login < DAYS_AGO(7)",
                json!({"last_login": "2024-03-01T08:30:00+00:00"})
            ),
            Ok(json!(true))
        );
    }

    #[test]
    fn days_ago_rejects_offsets_beyond_the_duration_range() {
        let edge = 9_223_372_036_854_776.0 / 86_400.0;
        for days in [json!(edge), json!(-edge), json!(1e300)] {
            assert!(matches!(
                eval("DAYS_AGO(x)", json!({ "x": days })),
                Err(ExpressionError::TypeMismatch(_))
            ));
        }
        assert!(matches!(
            eval("DAYS_AGO(x)", json!({ "x": 1e9 })),
            Err(ExpressionError::TypeMismatch(_))
        ));
    }

    #[test]
    fn arity_mismatch_is_reported() {
        assert_eq!(
            eval("COUNT(a, b)", json!({"a": [], "b": []})),
            Err(ExpressionError::Arity {
                function: "COUNT".to_owned(),
                expected: 1,
                actual: 2,
            })
        );
        assert_eq!(
            eval("NOPE(1)", json!({})),
            Err(ExpressionError::UnknownFunction("NOPE".to_owned()))
        );
    }

    #[test]
    fn string_functions() {
        let variables = json!({"name": "Ada", "tags": ["a", "b"]});
        assert_eq!(eval("LOWER(name) = 'ada'", variables.clone()), Ok(json!(true)));
        assert_eq!(eval("CONTAINS(tags, 'b')", variables.clone()), Ok(json!(true)));
        assert_eq!(eval("MATCHES(name, '^A')", variables.clone()), Ok(json!(true)));
        assert_eq!(eval("name + '!'", variables), Ok(json!("Ada!")));
    }

    #[test]
    fn parse_errors_are_reported_without_evaluation() {
        let evaluator = ExpressionEvaluator::new();
        for bad in ["age >=", "(a AND b", "a & b", "'open", "a b", ""] {
            let err = evaluator.parse(bad).unwrap_err();
            assert!(err.is_parse(), "{bad:?} should fail to parse, got {err:?}");
        }
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let evaluator = ExpressionEvaluator::with_options(EvaluationOptions {
            max_length: 8_192,
            max_depth: 8,
        });
        let deep = format!("{}1{}", "(".repeat(20), ")".repeat(20));
        assert!(evaluator.parse(&deep).unwrap_err().is_parse());
        assert!(evaluator.parse("((1))").is_ok());
    }

    #[test]
    fn custom_functions_extend_the_table() {
        let evaluator = ExpressionEvaluator::new().with_function("double", 1, |args, _| {
            let n = args[0].as_f64().unwrap_or_default();
            Ok(number_to_value(n * 2.0))
        });
        let variables = vars(json!({"x": 21}));
        let env = Environment::new(&variables, fixed_now());
        assert_eq!(evaluator.evaluate("DOUBLE(x)", &env), Ok(json!(42)));
    }

    #[test]
    fn parsed_expression_reports_functions_and_identifiers() {
        let parsed = ExpressionEvaluator::new()
            .parse("COUNT(orders) > 0 AND user.age >= min_age")
            .unwrap();
        assert_eq!(
            parsed.functions().into_iter().collect::<Vec<_>>(),
            vec!["COUNT".to_owned()]
        );
        assert_eq!(
            parsed.identifiers().into_iter().collect::<Vec<_>>(),
            vec!["min_age".to_owned(), "orders".to_owned(), "user".to_owned()]
        );
    }

    #[test]
    fn condition_must_be_boolean() {
        let evaluator = ExpressionEvaluator::new();
        let variables = vars(json!({"n": 3}));
        let env = Environment::new(&variables, fixed_now());
        assert!(matches!(
            evaluator.evaluate_condition("n + 1", &env),
            Err(ExpressionError::TypeMismatch(_))
        ));
        assert_eq!(evaluator.evaluate_condition("n > 1", &env), Ok(true));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let evaluator = ExpressionEvaluator::new();
        let variables = vars(json!({"signup": "2024-03-10T00:00:00Z"}));
        let env = Environment::new(&variables, fixed_now());
        let first = evaluator.evaluate("signup > DAYS_AGO(7)", &env);
        let second = evaluator.evaluate("signup > DAYS_AGO(7)", &env);
        assert_eq!(first, second);
        assert_eq!(first, Ok(json!(true)));
    }
}
