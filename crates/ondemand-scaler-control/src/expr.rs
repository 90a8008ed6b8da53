//! The allowed-free expression.
//!
//! A small arithmetic language evaluated once per pool and GC cycle with the
//! pool's `totalnodes` and `busynodes`. It yields how many idle nodes the
//! pool should keep.
//!
//! ```text
//! expr    := or
//! or      := and (("or" | "||") and)*
//! and     := not (("and" | "&&") not)*
//! not     := ("not" | "!") not | cmp
//! cmp     := sum (("<" | "<=" | ">" | ">=" | "==" | "=" | "!=") sum)?
//! sum     := term (("+" | "-") term)*
//! term    := unary (("*" | "/" | "%") unary)*
//! unary   := ("-" | "+") unary | primary
//! primary := number | variable | call | "(" expr ")" | if
//! if      := "if" "(" expr ")" "{" expr "}" "else" ("{" expr "}" | if)
//!          | "if" "(" expr "," expr "," expr ")"
//! ```
//!
//! Booleans are numbers: comparisons yield `1` or `0`, and any non-zero
//! value is true.

use std::fmt;

use thiserror::Error;

/// Variables an expression may reference.
pub const VARIABLES: [&str; 2] = ["totalnodes", "busynodes"];

/// Expression compile errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    /// A character that starts no token.
    #[error("unexpected character {ch:?} at offset {offset}")]
    UnexpectedChar {
        /// The character.
        ch: char,
        /// Byte offset in the source.
        offset: usize,
    },

    /// A token where another was required.
    #[error("expected {expected}, found {found}")]
    UnexpectedToken {
        /// What the parser wanted.
        expected: String,
        /// What it got.
        found: String,
    },

    /// A variable other than the known ones.
    #[error("unknown variable {0:?} (known: totalnodes, busynodes)")]
    UnknownVariable(String),

    /// A function that does not exist.
    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    /// A function called with the wrong number of arguments.
    #[error("{name} takes {expected} argument(s), got {found}")]
    Arity {
        /// Function name.
        name: String,
        /// Required argument count.
        expected: usize,
        /// Given argument count.
        found: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Symbol(&'static str),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "number {n}"),
            Self::Ident(name) => write!(f, "{name:?}"),
            Self::Symbol(sym) => write!(f, "{sym:?}"),
        }
    }
}

const SYMBOLS: [&str; 20] = [
    "<=", ">=", "==", "!=", "&&", "||", "<", ">", "=", "!", "+", "-", "*", "/", "%", "(", ")",
    "{", "}", ",",
];

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut rest = source;

    while let Some(ch) = rest.chars().next() {
        let offset = source.len() - rest.len();
        if ch.is_whitespace() {
            rest = &rest[ch.len_utf8()..];
        } else if ch.is_ascii_digit() || ch == '.' {
            let end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(rest.len());
            let number = rest[..end]
                .parse()
                .map_err(|_| ExprError::UnexpectedChar { ch, offset })?;
            tokens.push(Token::Number(number));
            rest = &rest[end..];
        } else if ch.is_ascii_alphabetic() || ch == '_' {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            tokens.push(Token::Ident(rest[..end].to_ascii_lowercase()));
            rest = &rest[end..];
        } else if let Some(sym) = SYMBOLS.iter().find(|s| rest.starts_with(**s)) {
            tokens.push(Token::Symbol(sym));
            rest = &rest[sym.len()..];
        } else {
            return Err(ExprError::UnexpectedChar { ch, offset });
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Var {
    Total,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Min,
    Max,
    Round,
    Ceil,
    Floor,
    Abs,
}

impl Func {
    fn lookup(name: &str) -> Option<(Self, usize)> {
        Some(match name {
            "min" => (Self::Min, 2),
            "max" => (Self::Max, 2),
            "round" => (Self::Round, 1),
            "ceil" => (Self::Ceil, 1),
            "floor" => (Self::Floor, 1),
            "abs" => (Self::Abs, 1),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Number(f64),
    Var(Var),
    Neg(Box<Ast>),
    Not(Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
    Call(Func, Vec<Ast>),
    If(Box<Ast>, Box<Ast>, Box<Ast>),
}

fn truth(value: f64) -> bool {
    value != 0.0
}

fn from_bool(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

impl Ast {
    fn eval(&self, total: f64, busy: f64) -> f64 {
        match self {
            Self::Number(n) => *n,
            Self::Var(Var::Total) => total,
            Self::Var(Var::Busy) => busy,
            Self::Neg(inner) => -inner.eval(total, busy),
            Self::Not(inner) => from_bool(!truth(inner.eval(total, busy))),
            Self::If(cond, then, otherwise) => {
                if truth(cond.eval(total, busy)) {
                    then.eval(total, busy)
                } else {
                    otherwise.eval(total, busy)
                }
            }
            Self::Call(func, args) => {
                let arg = |i: usize| args[i].eval(total, busy);
                match func {
                    Func::Min => arg(0).min(arg(1)),
                    Func::Max => arg(0).max(arg(1)),
                    Func::Round => arg(0).round(),
                    Func::Ceil => arg(0).ceil(),
                    Func::Floor => arg(0).floor(),
                    Func::Abs => arg(0).abs(),
                }
            }
            Self::Binary(op, lhs, rhs) => {
                let l = lhs.eval(total, busy);
                match op {
                    BinOp::And => return from_bool(truth(l) && truth(rhs.eval(total, busy))),
                    BinOp::Or => return from_bool(truth(l) || truth(rhs.eval(total, busy))),
                    _ => {}
                }
                let r = rhs.eval(total, busy);
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                    BinOp::Rem => l % r,
                    BinOp::Lt => from_bool(l < r),
                    BinOp::Le => from_bool(l <= r),
                    BinOp::Gt => from_bool(l > r),
                    BinOp::Ge => from_bool(l >= r),
                    BinOp::Eq => from_bool((l - r).abs() < f64::EPSILON),
                    BinOp::Ne => from_bool((l - r).abs() >= f64::EPSILON),
                    BinOp::And | BinOp::Or => unreachable!("handled above"),
                }
            }
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn unexpected(&self, expected: &str) -> ExprError {
        ExprError::UnexpectedToken {
            expected: expected.to_string(),
            found: self
                .peek()
                .map_or_else(|| "end of input".to_string(), ToString::to_string),
        }
    }

    fn eat_symbol(&mut self, symbols: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Symbol(sym)) if symbols.contains(sym) => {
                let sym = *sym;
                self.pos += 1;
                Some(sym)
            }
            _ => None,
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(name)) if name == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: &'static str) -> Result<(), ExprError> {
        self.eat_symbol(&[symbol])
            .map(|_| ())
            .ok_or_else(|| self.unexpected(&format!("{symbol:?}")))
    }

    fn expr(&mut self) -> Result<Ast, ExprError> {
        self.or()
    }

    fn or(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.and()?;
        while self.eat_keyword("or") || self.eat_symbol(&["||"]).is_some() {
            lhs = Ast::Binary(BinOp::Or, Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.not()?;
        while self.eat_keyword("and") || self.eat_symbol(&["&&"]).is_some() {
            lhs = Ast::Binary(BinOp::And, Box::new(lhs), Box::new(self.not()?));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Ast, ExprError> {
        if self.eat_keyword("not") || self.eat_symbol(&["!"]).is_some() {
            return Ok(Ast::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Ast, ExprError> {
        let lhs = self.sum()?;
        let op = match self.eat_symbol(&["<", "<=", ">", ">=", "==", "=", "!="]) {
            Some("<") => BinOp::Lt,
            Some("<=") => BinOp::Le,
            Some(">") => BinOp::Gt,
            Some(">=") => BinOp::Ge,
            Some("==" | "=") => BinOp::Eq,
            Some(_) => BinOp::Ne,
            None => return Ok(lhs),
        };
        Ok(Ast::Binary(op, Box::new(lhs), Box::new(self.sum()?)))
    }

    fn sum(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.term()?;
        while let Some(sym) = self.eat_symbol(&["+", "-"]) {
            let op = if sym == "+" { BinOp::Add } else { BinOp::Sub };
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(self.term()?));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(sym) = self.eat_symbol(&["*", "/", "%"]) {
            let op = match sym {
                "*" => BinOp::Mul,
                "/" => BinOp::Div,
                _ => BinOp::Rem,
            };
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Ast, ExprError> {
        match self.eat_symbol(&["-", "+"]) {
            Some("-") => Ok(Ast::Neg(Box::new(self.unary()?))),
            Some(_) => self.unary(),
            None => self.primary(),
        }
    }

    fn block(&mut self) -> Result<Ast, ExprError> {
        self.expect_symbol("{")?;
        let inner = self.expr()?;
        self.expect_symbol("}")?;
        Ok(inner)
    }

    fn conditional(&mut self) -> Result<Ast, ExprError> {
        self.expect_symbol("(")?;
        let cond = self.expr()?;
        if self.eat_symbol(&[","]).is_some() {
            let then = self.expr()?;
            self.expect_symbol(",")?;
            let otherwise = self.expr()?;
            self.expect_symbol(")")?;
            return Ok(Ast::If(Box::new(cond), Box::new(then), Box::new(otherwise)));
        }
        self.expect_symbol(")")?;
        let then = self.block()?;
        if !self.eat_keyword("else") {
            return Err(self.unexpected("\"else\""));
        }
        let otherwise = if self.eat_keyword("if") {
            self.conditional()?
        } else {
            self.block()?
        };
        Ok(Ast::If(Box::new(cond), Box::new(then), Box::new(otherwise)))
    }

    fn primary(&mut self) -> Result<Ast, ExprError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Ast::Number(n)),
            Some(Token::Symbol("(")) => {
                let inner = self.expr()?;
                self.expect_symbol(")")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) if name == "if" => self.conditional(),
            Some(Token::Ident(name)) => {
                if self.eat_symbol(&["("]).is_some() {
                    return self.call(name);
                }
                match name.as_str() {
                    "totalnodes" => Ok(Ast::Var(Var::Total)),
                    "busynodes" => Ok(Ast::Var(Var::Busy)),
                    "true" => Ok(Ast::Number(1.0)),
                    "false" => Ok(Ast::Number(0.0)),
                    _ => Err(ExprError::UnknownVariable(name)),
                }
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("a value"))
            }
        }
    }

    fn call(&mut self, name: String) -> Result<Ast, ExprError> {
        let (func, arity) =
            Func::lookup(&name).ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
        let mut args = Vec::new();
        if self.eat_symbol(&[")"]).is_none() {
            loop {
                args.push(self.expr()?);
                if self.eat_symbol(&[","]).is_none() {
                    break;
                }
            }
            self.expect_symbol(")")?;
        }
        if args.len() != arity {
            return Err(ExprError::Arity {
                name,
                expected: arity,
                found: args.len(),
            });
        }
        Ok(Ast::Call(func, args))
    }
}

/// A compiled allowed-free expression.
#[derive(Debug, Clone, PartialEq)]
pub struct AllowedFreeExpr {
    source: String,
    ast: Ast,
}

impl AllowedFreeExpr {
    /// Compile `source`.
    ///
    /// # Errors
    ///
    /// Returns an [`ExprError`] on a syntax error, an unknown function or a
    /// variable other than [`VARIABLES`].
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let mut parser = Parser {
            tokens: tokenize(source)?,
            pos: 0,
        };
        let ast = parser.expr()?;
        if parser.peek().is_some() {
            return Err(parser.unexpected("end of input"));
        }
        Ok(Self {
            source: source.trim().to_string(),
            ast,
        })
    }

    /// The expression text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Raw value for the given pool counts.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(&self, total_nodes: usize, busy_nodes: usize) -> f64 {
        self.ast.eval(total_nodes as f64, busy_nodes as f64)
    }

    /// Number of idle nodes to keep: the value truncated toward zero,
    /// negative or non-finite values yielding zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn allowed_free(&self, total_nodes: usize, busy_nodes: usize) -> usize {
        let value = self.evaluate(total_nodes, busy_nodes);
        if value.is_finite() && value > 0.0 {
            value.trunc() as usize
        } else {
            0
        }
    }
}

impl Default for AllowedFreeExpr {
    fn default() -> Self {
        Self {
            source: "0".to_string(),
            ast: Ast::Number(0.0),
        }
    }
}

impl fmt::Display for AllowedFreeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for AllowedFreeExpr {
    type Error = ExprError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        Self::compile(&source)
    }
}

impl<'de> serde::Deserialize<'de> for AllowedFreeExpr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Self::compile(&source).map_err(serde::de::Error::custom)
    }
}
