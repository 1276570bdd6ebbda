//! Metering expressions: derive billable compute units from request
//! statistics.
//!
//! A route may carry an expression such as `1 + bytes_out / 1048576`;
//! it is compiled once at snapshot build (so a bad expression rejects the
//! reload) and evaluated per request. Without an expression every request
//! meters one unit.

use serde::Serialize;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MeterError {
    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),
    #[error("unknown variable {0:?}")]
    UnknownVariable(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("trailing input after expression")]
    TrailingInput,
}

/// Inputs available to a metering expression.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MeterStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Var {
    Requests,
    BytesIn,
    BytesOut,
    LatencyMs,
}

#[derive(Debug, Clone)]
enum Expr {
    Num(f64),
    Var(Var),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

/// A compiled metering expression.
#[derive(Debug, Clone)]
pub struct MeterExpr {
    root: Expr,
}

impl MeterExpr {
    /// One unit per request; used when a route has no expression.
    pub fn per_request() -> Self {
        Self {
            root: Expr::Num(1.0),
        }
    }

    pub fn compile(source: &str) -> Result<Self, MeterError> {
        let mut parser = Parser {
            chars: source.chars().collect(),
            pos: 0,
        };
        let root = parser.expr()?;
        parser.skip_ws();
        if parser.pos != parser.chars.len() {
            return Err(MeterError::TrailingInput);
        }
        Ok(Self { root })
    }

    /// Evaluate against a finished request. Division by zero yields zero
    /// and the result is clamped non-negative; billing never goes
    /// backwards.
    pub fn eval(&self, stats: &MeterStats) -> f64 {
        eval(&self.root, stats).max(0.0)
    }
}

fn eval(expr: &Expr, stats: &MeterStats) -> f64 {
    match expr {
        Expr::Num(n) => *n,
        Expr::Var(Var::Requests) => 1.0,
        Expr::Var(Var::BytesIn) => stats.bytes_in as f64,
        Expr::Var(Var::BytesOut) => stats.bytes_out as f64,
        Expr::Var(Var::LatencyMs) => stats.latency_ms as f64,
        Expr::Add(a, b) => eval(a, stats) + eval(b, stats),
        Expr::Sub(a, b) => eval(a, stats) - eval(b, stats),
        Expr::Mul(a, b) => eval(a, stats) * eval(b, stats),
        Expr::Div(a, b) => {
            let d = eval(b, stats);
            if d == 0.0 { 0.0 } else { eval(a, stats) / d }
        }
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn expr(&mut self) -> Result<Expr, MeterError> {
        let mut left = self.term()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some('+') => {
                    self.pos += 1;
                    left = Expr::Add(Box::new(left), Box::new(self.term()?));
                }
                Some('-') => {
                    self.pos += 1;
                    left = Expr::Sub(Box::new(left), Box::new(self.term()?));
                }
                _ => return Ok(left),
            }
        }
    }

    fn term(&mut self) -> Result<Expr, MeterError> {
        let mut left = self.factor()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some('*') => {
                    self.pos += 1;
                    left = Expr::Mul(Box::new(left), Box::new(self.factor()?));
                }
                Some('/') => {
                    self.pos += 1;
                    left = Expr::Div(Box::new(left), Box::new(self.factor()?));
                }
                _ => return Ok(left),
            }
        }
    }

    fn factor(&mut self) -> Result<Expr, MeterError> {
        self.skip_ws();
        match self.peek() {
            None => Err(MeterError::UnexpectedEnd),
            Some('(') => {
                self.pos += 1;
                let inner = self.expr()?;
                self.skip_ws();
                match self.peek() {
                    Some(')') => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    Some(c) => Err(MeterError::UnexpectedChar(c)),
                    None => Err(MeterError::UnexpectedEnd),
                }
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() || c == '_' => self.variable(),
            Some(c) => Err(MeterError::UnexpectedChar(c)),
        }
    }

    fn number(&mut self) -> Result<Expr, MeterError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse()
            .map(Expr::Num)
            .map_err(|_| MeterError::UnexpectedChar('.'))
    }

    fn variable(&mut self) -> Result<Expr, MeterError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        match name.as_str() {
            "requests" => Ok(Expr::Var(Var::Requests)),
            "bytes_in" => Ok(Expr::Var(Var::BytesIn)),
            "bytes_out" => Ok(Expr::Var(Var::BytesOut)),
            "latency_ms" => Ok(Expr::Var(Var::LatencyMs)),
            _ => Err(MeterError::UnknownVariable(name)),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }
}
