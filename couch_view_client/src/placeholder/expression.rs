//! Evaluation of the expression placeholders used for partition routing, e.g.
//!
//! ```text
//! http://{{shard} < 4 ? "east" : "west"}.db.example.com/{database}
//! http://db{{shard} % 2}.example.com/{database}
//! ```
//!
//! References (`{name}`) inside the expression are looked up through a caller supplied
//! function and always produce strings. Strings that look like integers take part in
//! arithmetic and comparisons as integers. Only the chosen branch of a `cond ? a : b` is
//! evaluated; the other is parsed but never looked up or computed.

use std::{cmp::Ordering, fmt::Display, iter::Peekable, str::Chars};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum ExpressionError {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unterminated reference")]
    UnterminatedReference,

    #[error("unresolved reference '{0}'")]
    Unresolved(String),

    #[error("expected {expected}, found {found}")]
    Unexpected { expected: &'static str, found: String },

    #[error("operator '{op}' requires integer operands")]
    NotAnInteger { op: char },

    #[error("integer overflow")]
    Overflow,

    #[error("division by zero")]
    DivideByZero,
}

type Result<T, E = ExpressionError> = std::result::Result<T, E>;

/// Evaluate `source`, resolving `{name}` references with `lookup`, and render the result
pub(crate) fn evaluate<F>(source: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens: tokens.into_iter().peekable(),
        lookup: &lookup,
        skipping: 0,
    };
    let value = parser.ternary()?;
    match parser.tokens.next() {
        None => Ok(value.to_string()),
        Some(t) => Err(ExpressionError::Unexpected {
            expected: "end of expression",
            found: t.to_string(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Int(i64),
    Str(String),
}

impl Value {
    fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Str(s) => s.parse().ok(),
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            Self::Int(i) => *i != 0,
            Self::Str(s) => !matches!(s.as_str(), "" | "0" | "false" | "null"),
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.to_string().cmp(&other.to_string()),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Value(Value),
    Ref(String),
    Op(&'static str),
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => write!(f, "'{v}'"),
            Self::Ref(name) => write!(f, "'{{{name}}}'"),
            Self::Op(op) => write!(f, "'{op}'"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '{' => {
                chars.next();
                let name = take_while(&mut chars, |c| c != '}');
                if chars.next() != Some('}') {
                    return Err(ExpressionError::UnterminatedReference);
                }
                tokens.push(Token::Ref(name));
            }
            '"' => {
                chars.next();
                let s = take_while(&mut chars, |c| c != '"');
                if chars.next() != Some('"') {
                    return Err(ExpressionError::UnterminatedString);
                }
                tokens.push(Token::Value(Value::Str(s)));
            }
            c if c.is_ascii_digit() => {
                let digits = take_while(&mut chars, |c| c.is_ascii_digit());
                let i = digits.parse().map_err(|_| ExpressionError::Overflow)?;
                tokens.push(Token::Value(Value::Int(i)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let word = take_while(&mut chars, |c| c.is_alphanumeric() || c == '_' || c == '.');
                tokens.push(Token::Value(Value::Str(word)));
            }
            _ => {
                chars.next();
                let op = match (c, chars.peek()) {
                    ('=', Some('=')) => "==",
                    ('!', Some('=')) => "!=",
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('<', _) => "<",
                    ('>', _) => ">",
                    ('+', _) => "+",
                    ('-', _) => "-",
                    ('*', _) => "*",
                    ('/', _) => "/",
                    ('%', _) => "%",
                    ('?', _) => "?",
                    (':', _) => ":",
                    ('(', _) => "(",
                    (')', _) => ")",
                    _ => return Err(ExpressionError::UnexpectedChar(c)),
                };
                if op.len() == 2 {
                    chars.next();
                }
                tokens.push(Token::Op(op));
            }
        }
    }
    Ok(tokens)
}

fn take_while(chars: &mut Peekable<Chars<'_>>, pred: impl Fn(char) -> bool) -> String {
    let mut out = String::new();
    while let Some(&c) = chars.peek() {
        if !pred(c) {
            break;
        }
        out.push(c);
        chars.next();
    }
    out
}

/// Recursive descent over the token list, lowest precedence first:
/// ternary, comparison, additive, multiplicative, unary, primary.
struct Parser<'a, F> {
    tokens: Peekable<std::vec::IntoIter<Token>>,
    lookup: &'a F,
    /// Depth of untaken ternary branches being parsed; nothing is evaluated while non-zero
    skipping: usize,
}

impl<F> Parser<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Run `op` unless inside an untaken branch, where the result is a placeholder `0`
    fn eval(&self, op: impl FnOnce() -> Result<Value>) -> Result<Value> {
        if self.skipping > 0 {
            Ok(Value::Int(0))
        } else {
            op()
        }
    }

    fn eat(&mut self, op: &'static str) -> bool {
        if self.tokens.peek() == Some(&Token::Op(op)) {
            self.tokens.next();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, op: &'static str) -> Result<()> {
        if self.eat(op) {
            Ok(())
        } else {
            Err(ExpressionError::Unexpected {
                expected: op,
                found: self.found(),
            })
        }
    }

    fn found(&mut self) -> String {
        self.tokens
            .peek()
            .map(ToString::to_string)
            .unwrap_or_else(|| "end of expression".to_string())
    }

    fn ternary(&mut self) -> Result<Value> {
        let cond = self.comparison()?;
        if !self.eat("?") {
            return Ok(cond);
        }
        let taken = cond.is_truthy();
        let then = self.branch(taken)?;
        self.expect(":")?;
        let otherwise = self.branch(!taken)?;
        Ok(if taken { then } else { otherwise })
    }

    fn branch(&mut self, taken: bool) -> Result<Value> {
        if taken {
            return self.ternary();
        }
        self.skipping += 1;
        let v = self.ternary();
        self.skipping -= 1;
        v
    }

    fn comparison(&mut self) -> Result<Value> {
        let lhs = self.additive()?;
        for op in ["==", "!=", "<=", ">=", "<", ">"] {
            if self.eat(op) {
                let rhs = self.additive()?;
                let ord = lhs.compare(&rhs);
                let holds = match op {
                    "==" => ord.is_eq(),
                    "!=" => ord.is_ne(),
                    "<=" => ord.is_le(),
                    ">=" => ord.is_ge(),
                    "<" => ord.is_lt(),
                    _ => ord.is_gt(),
                };
                return Ok(Value::Int(holds.into()));
            }
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Value> {
        let mut lhs = self.multiplicative()?;
        loop {
            if self.eat("+") {
                let rhs = self.multiplicative()?;
                lhs = self.eval(|| match (lhs.as_int(), rhs.as_int()) {
                    (Some(a), Some(b)) => {
                        Ok(Value::Int(a.checked_add(b).ok_or(ExpressionError::Overflow)?))
                    }
                    _ => Ok(Value::Str(format!("{lhs}{rhs}"))),
                })?;
            } else if self.eat("-") {
                let rhs = self.multiplicative()?;
                lhs = self.eval(|| arith('-', &lhs, &rhs, i64::checked_sub))?;
            } else {
                return Ok(lhs);
            }
        }
    }

    fn multiplicative(&mut self) -> Result<Value> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat("*") {
                '*'
            } else if self.eat("/") {
                '/'
            } else if self.eat("%") {
                '%'
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = self.eval(|| match op {
                '*' => arith(op, &lhs, &rhs, i64::checked_mul),
                _ if rhs.as_int() == Some(0) => Err(ExpressionError::DivideByZero),
                '/' => arith(op, &lhs, &rhs, i64::checked_div),
                // truncated, the sign follows the dividend
                _ => arith(op, &lhs, &rhs, i64::checked_rem),
            })?;
        }
    }

    fn unary(&mut self) -> Result<Value> {
        if self.eat("-") {
            let v = self.unary()?;
            return self.eval(|| arith('-', &Value::Int(0), &v, i64::checked_sub));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value> {
        match self.tokens.next() {
            Some(Token::Value(v)) => Ok(v),
            Some(Token::Ref(name)) => self.eval(|| {
                (self.lookup)(&name)
                    .map(Value::Str)
                    .ok_or_else(|| ExpressionError::Unresolved(name.clone()))
            }),
            Some(Token::Op("(")) => {
                let v = self.ternary()?;
                self.expect(")")?;
                Ok(v)
            }
            Some(t) => Err(ExpressionError::Unexpected {
                expected: "a value",
                found: t.to_string(),
            }),
            None => Err(ExpressionError::Unexpected {
                expected: "a value",
                found: "end of expression".to_string(),
            }),
        }
    }
}

fn arith(op: char, lhs: &Value, rhs: &Value, f: fn(i64, i64) -> Option<i64>) -> Result<Value> {
    match (lhs.as_int(), rhs.as_int()) {
        (Some(a), Some(b)) => f(a, b).map(Value::Int).ok_or(ExpressionError::Overflow),
        _ => Err(ExpressionError::NotAnInteger { op }),
    }
}
