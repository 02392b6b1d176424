//! Rank formula language.
//!
//! Formulas are small Python-style expressions stored in scorecard files:
//!
//! ```text
//! expr    := ternary
//! ternary := or ("if" or "else" ternary)?
//! or      := and ("or" and)*
//! and     := not ("and" not)*
//! not     := "not" not | cmp
//! cmp     := sum (("<" | "<=" | ">" | ">=" | "==" | "!=" | "in" | "not" "in") sum)*
//! sum     := prod (("+" | "-") prod)*
//! prod    := unary (("*" | "/") unary)*
//! unary   := ("-" | "+") unary | primary
//! primary := number | string | "True" | "False" | "None" | ident
//!          | "entity" "." attribute | ident "(" args ")" | "[" args "]" | "(" expr ")"
//! ```
//!
//! Values are numbers, text, lists or `None`. Booleans are the numbers `1.0`
//! and `0.0`; zero, empty text, empty lists and `None` are falsy. `and`/`or`
//! return one of their operands and a chained comparison `a < b < c` means
//! `a < b and b < c`. `entity.<attribute>` reads the rated entity (see
//! [`ENTITY_ATTRIBUTES`]) and is `None` when no entity is bound or the entity
//! lacks the attribute.
//!
//! A formula is compiled once into an [`Expr`] tree against the set of
//! variables it may use and then interpreted. Compilation rejects unknown
//! identifiers and entity attributes, so a compiled formula can only fail at
//! evaluation time for data reasons: a missing score, a division by zero, a
//! non-finite result or operands of the wrong type.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::constants::{MAX_FORMULA_DEPTH, MAX_FORMULA_LENGTH};
use crate::core::BkstgError;

/// Entity attributes readable as `entity.<attribute>`.
pub const ENTITY_ATTRIBUTES: &[&str] = &[
    "kind",
    "type",
    "lifecycle",
    "owner",
    "system",
    "domain",
    "namespace",
    "name",
    "title",
    "description",
    "tags",
];

pub(super) const ENTITY: &str = "entity";

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `in`
    In,
    /// `not in`
    NotIn,
    /// `and`
    And,
    /// `or`
    Or,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `+x`
    Plus,
    /// `not x`
    Not,
}

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// Smallest argument
    Min,
    /// Largest argument
    Max,
    /// Absolute value
    Abs,
    /// Arithmetic mean, `0` for no values
    Avg,
    /// Total
    Sum,
    /// `round(x)` or `round(x, digits)`, ties to even
    Round,
    /// Length of text or a list
    Len,
    /// Square root
    Sqrt,
    /// Round down
    Floor,
    /// Round up
    Ceil,
    /// `pow(x, y)`
    Pow,
    /// Text form of a value
    Str,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "abs" => Some(Self::Abs),
            "avg" => Some(Self::Avg),
            "sum" => Some(Self::Sum),
            "round" => Some(Self::Round),
            "len" => Some(Self::Len),
            "sqrt" => Some(Self::Sqrt),
            "floor" => Some(Self::Floor),
            "ceil" => Some(Self::Ceil),
            "pow" => Some(Self::Pow),
            "str" => Some(Self::Str),
            _ => None,
        }
    }

    const fn arity(self) -> (usize, usize) {
        match self {
            Self::Min | Self::Max | Self::Avg | Self::Sum => (1, usize::MAX),
            Self::Abs | Self::Len | Self::Sqrt | Self::Floor | Self::Ceil | Self::Str => (1, 1),
            Self::Round => (1, 2),
            Self::Pow => (2, 2),
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Abs => "abs",
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Round => "round",
            Self::Len => "len",
            Self::Sqrt => "sqrt",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Pow => "pow",
            Self::Str => "str",
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn apply(self, args: &[Value]) -> Result<Value, EvalError> {
        let name = self.name();
        let empty = || EvalError::TypeMismatch(format!("{name}() of no values"));
        let value = match self {
            Self::Min => spread(name, args)?.into_iter().reduce(f64::min).ok_or_else(empty)?,
            Self::Max => spread(name, args)?.into_iter().reduce(f64::max).ok_or_else(empty)?,
            Self::Avg => {
                let values = spread(name, args)?;
                if values.is_empty() { 0.0 } else { values.iter().sum::<f64>() / values.len() as f64 }
            }
            Self::Sum => spread(name, args)?.iter().sum(),
            Self::Abs => args[0].number(name)?.abs(),
            Self::Round => {
                let digits = match args.get(1) {
                    Some(digits) => digits.number(name)?,
                    None => 0.0,
                };
                round_to(args[0].number(name)?, digits)
            }
            Self::Len => match &args[0] {
                Value::Text(text) => text.chars().count() as f64,
                Value::List(items) => items.len() as f64,
                other => {
                    return Err(EvalError::TypeMismatch(format!(
                        "len() expects text or a list, got {}",
                        other.type_name()
                    )));
                }
            },
            Self::Sqrt => args[0].number(name)?.sqrt(),
            Self::Floor => args[0].number(name)?.floor(),
            Self::Ceil => args[0].number(name)?.ceil(),
            Self::Pow => args[0].number(name)?.powf(args[1].number(name)?),
            Self::Str => return Ok(Value::Text(args[0].to_string())),
        };
        Ok(Value::Number(value))
    }
}

/// Numbers of `args`, or of the single list argument.
fn spread(name: &str, args: &[Value]) -> Result<Vec<f64>, EvalError> {
    match args {
        [Value::List(items)] => items.iter().map(|v| v.number(name)).collect(),
        _ => args.iter().map(|v| v.number(name)).collect(),
    }
}

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `None`
    Null,
    /// Number or boolean
    Number(f64),
    /// Text
    Text(String),
    /// List
    List(Vec<Value>),
}

impl Value {
    /// Whether the value counts as true: non-zero, non-empty and not `None`.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Number(n) => *n != 0.0,
            Self::Text(text) => !text.is_empty(),
            Self::List(items) => !items.is_empty(),
        }
    }

    /// The numeric value, for a final formula result.
    pub fn as_number(&self) -> Result<f64, EvalError> {
        match self {
            Self::Number(n) => Ok(*n),
            other => Err(EvalError::TypeMismatch(format!("expected a number, got {}", other.type_name()))),
        }
    }

    const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "None",
            Self::Number(_) => "a number",
            Self::Text(_) => "text",
            Self::List(_) => "a list",
        }
    }

    fn number(&self, operation: &str) -> Result<f64, EvalError> {
        match self {
            Self::Number(n) => Ok(*n),
            other => {
                Err(EvalError::TypeMismatch(format!("'{operation}' expects numbers, got {}", other.type_name())))
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Number(if value { 1.0 } else { 0.0 })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("None"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(text) => f.write_str(text),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match item {
                        Self::Text(text) => write!(f, "'{text}'")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("]")
            }
        }
    }
}

/// The entity attributes a formula can read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityContext {
    /// `kind`
    pub kind: String,
    /// `spec.type`
    pub entity_type: Option<String>,
    /// `spec.lifecycle`
    pub lifecycle: Option<String>,
    /// `spec.owner`
    pub owner: Option<String>,
    /// `spec.system`
    pub system: Option<String>,
    /// `spec.domain`
    pub domain: Option<String>,
    /// `metadata.namespace`
    pub namespace: String,
    /// `metadata.name`
    pub name: String,
    /// `metadata.title`
    pub title: Option<String>,
    /// `metadata.description`
    pub description: Option<String>,
    /// `metadata.tags`
    pub tags: Vec<String>,
}

impl EntityContext {
    /// Value of `entity.<name>`.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Value {
        let text = |value: Option<&str>| value.map_or(Value::Null, |v| Value::Text(v.to_string()));
        match name {
            "kind" => Value::Text(self.kind.clone()),
            "type" => text(self.entity_type.as_deref()),
            "lifecycle" => text(self.lifecycle.as_deref()),
            "owner" => text(self.owner.as_deref()),
            "system" => text(self.system.as_deref()),
            "domain" => text(self.domain.as_deref()),
            "namespace" => Value::Text(self.namespace.clone()),
            "name" => Value::Text(self.name.clone()),
            "title" => text(self.title.as_deref()),
            "description" => text(self.description.as_deref()),
            "tags" => Value::List(self.tags.iter().cloned().map(Value::Text).collect()),
            _ => Value::Null,
        }
    }
}

/// Variable bindings and the entity being rated.
#[derive(Debug, Clone, Default)]
pub struct Env<'a> {
    variables: HashMap<String, Value>,
    entity: Option<&'a EntityContext>,
}

impl<'a> Env<'a> {
    /// Empty bindings, reading `entity.*` from `entity`.
    #[must_use]
    pub fn new(entity: Option<&'a EntityContext>) -> Self {
        Self {
            variables: HashMap::new(),
            entity,
        }
    }

    /// Binds `name`, replacing an earlier value.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Value bound to `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

/// Parsed formula.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant
    Literal(Value),
    /// Score or local variable
    Variable(String),
    /// `entity.<attribute>`
    Attribute(String),
    /// `[items...]`
    List(Vec<Expr>),
    /// `lhs op rhs`
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// `op operand`
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
    },
    /// `function(args...)`
    Call {
        /// Function
        function: Function,
        /// Arguments
        args: Vec<Expr>,
    },
    /// `then if condition else otherwise`
    Conditional {
        /// Condition
        condition: Box<Expr>,
        /// Value when the condition is truthy
        then: Box<Expr>,
        /// Value otherwise
        otherwise: Box<Expr>,
    },
}

/// Why a compiled formula produced no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// A variable had no value
    MissingVariable(String),
    /// Division by zero
    DivisionByZero,
    /// The result was NaN or infinite
    NonFinite,
    /// An operator or function got a value of the wrong type
    TypeMismatch(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingVariable(name) => write!(f, "missing score '{name}'"),
            Self::DivisionByZero => f.write_str("division by zero"),
            Self::NonFinite => f.write_str("result is not a finite number"),
            Self::TypeMismatch(message) => f.write_str(message),
        }
    }
}

fn round_to(value: f64, digits: f64) -> f64 {
    let digits = digits.trunc();
    if digits == 0.0 {
        return value.round_ties_even();
    }
    let scale = 10f64.powf(digits);
    (value * scale).round_ties_even() / scale
}

fn ordered(op: BinaryOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (a, b) => {
            return Err(EvalError::TypeMismatch(format!(
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            )));
        }
    };
    Ok(ordering.is_some_and(|o| match op {
        BinaryOp::Lt => o.is_lt(),
        BinaryOp::Le => o.is_le(),
        BinaryOp::Gt => o.is_gt(),
        _ => o.is_ge(),
    }))
}

fn contains(container: &Value, item: &Value) -> Result<bool, EvalError> {
    match (container, item) {
        (Value::List(items), _) => Ok(items.contains(item)),
        (Value::Text(text), Value::Text(needle)) => Ok(text.contains(needle.as_str())),
        (Value::Null, _) => Ok(false),
        (container, item) => Err(EvalError::TypeMismatch(format!(
            "cannot look for {} in {}",
            item.type_name(),
            container.type_name()
        ))),
    }
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, EvalError> {
    Ok(match op {
        BinaryOp::Add => match (left, right) {
            (Value::Text(a), Value::Text(b)) => Value::Text(a + &b),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Value::List(a)
            }
            (a, b) => Value::Number(a.number("+")? + b.number("+")?),
        },
        BinaryOp::Sub => Value::Number(left.number("-")? - right.number("-")?),
        BinaryOp::Mul => Value::Number(left.number("*")? * right.number("*")?),
        BinaryOp::Div => {
            let divisor = right.number("/")?;
            if divisor == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Value::Number(left.number("/")? / divisor)
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => ordered(op, &left, &right)?.into(),
        BinaryOp::Eq => (left == right).into(),
        BinaryOp::Ne => (left != right).into(),
        BinaryOp::In => contains(&right, &left)?.into(),
        BinaryOp::NotIn => (!contains(&right, &left)?).into(),
        BinaryOp::And => {
            if left.truthy() { right } else { left }
        }
        BinaryOp::Or => {
            if left.truthy() { left } else { right }
        }
    })
}

impl Expr {
    /// Nesting depth of the tree; a leaf has depth 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        match self {
            Self::Literal(_) | Self::Variable(_) | Self::Attribute(_) => 1,
            Self::List(items) => 1 + items.iter().map(Self::depth).max().unwrap_or(0),
            Self::Binary { lhs, rhs, .. } => 1 + lhs.depth().max(rhs.depth()),
            Self::Unary { operand, .. } => 1 + operand.depth(),
            Self::Call { args, .. } => 1 + args.iter().map(Self::depth).max().unwrap_or(0),
            Self::Conditional { condition, then, otherwise } => {
                1 + condition.depth().max(then.depth()).max(otherwise.depth())
            }
        }
    }

    /// Names of every variable the tree reads.
    #[must_use]
    pub fn variables(&self) -> BTreeSet<&str> {
        let mut found = BTreeSet::new();
        self.collect_variables(&mut found);
        found
    }

    fn collect_variables<'a>(&'a self, found: &mut BTreeSet<&'a str>) {
        match self {
            Self::Literal(_) | Self::Attribute(_) => {}
            Self::Variable(name) => {
                found.insert(name);
            }
            Self::List(items) | Self::Call { args: items, .. } => {
                items.iter().for_each(|a| a.collect_variables(found));
            }
            Self::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(found);
                rhs.collect_variables(found);
            }
            Self::Unary { operand, .. } => operand.collect_variables(found),
            Self::Conditional { condition, then, otherwise } => {
                condition.collect_variables(found);
                then.collect_variables(found);
                otherwise.collect_variables(found);
            }
        }
    }

    /// Evaluates a numeric formula with `variables` bound and no entity.
    pub fn eval(&self, variables: &HashMap<String, f64>) -> Result<f64, EvalError> {
        let mut env = Env::new(None);
        for (name, value) in variables {
            env.bind(name.clone(), Value::Number(*value));
        }
        self.evaluate(&env)?.as_number()
    }

    /// Evaluates the tree in `env`.
    ///
    /// Only the branch taken by a conditional or a short-circuiting operator
    /// is evaluated.
    pub fn evaluate(&self, env: &Env<'_>) -> Result<Value, EvalError> {
        let value = match self {
            Self::Literal(value) => value.clone(),
            Self::Variable(name) => {
                env.get(name).cloned().ok_or_else(|| EvalError::MissingVariable(name.clone()))?
            }
            Self::Attribute(name) => env.entity.map_or(Value::Null, |entity| entity.attribute(name)),
            Self::List(items) => {
                Value::List(items.iter().map(|item| item.evaluate(env)).collect::<Result<_, _>>()?)
            }
            Self::Unary { op, operand } => {
                let value = operand.evaluate(env)?;
                match op {
                    UnaryOp::Neg => Value::Number(-value.number("-")?),
                    UnaryOp::Plus => Value::Number(value.number("+")?),
                    UnaryOp::Not => (!value.truthy()).into(),
                }
            }
            Self::Binary { op, lhs, rhs } => {
                let left = lhs.evaluate(env)?;
                match op {
                    BinaryOp::And if !left.truthy() => left,
                    BinaryOp::Or if left.truthy() => left,
                    _ => apply_binary(*op, left, rhs.evaluate(env)?)?,
                }
            }
            Self::Call { function, args } => {
                let values = args.iter().map(|a| a.evaluate(env)).collect::<Result<Vec<_>, _>>()?;
                function.apply(&values)?
            }
            Self::Conditional { condition, then, otherwise } => {
                if condition.evaluate(env)?.truthy() {
                    then.evaluate(env)?
                } else {
                    otherwise.evaluate(env)?
                }
            }
        };

        if matches!(value, Value::Number(n) if !n.is_finite()) {
            Err(EvalError::NonFinite)
        } else {
            Ok(value)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Token {
    Number(f64),
    Text(String),
    Ident(String),
    Symbol(&'static str),
    End,
}

const SYMBOLS: &[&str] = &[
    "<=", ">=", "==", "!=", "<", ">", "+", "-", "*", "/", "(", ")", "[", "]", ",", ".", ":", "=",
];

pub(super) fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, (usize, String)> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)) {
            let start = pos;
            while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                pos += 1;
            }
            if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
                let mut end = pos + 1;
                if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
                    end += 1;
                }
                if end < bytes.len() && bytes[end].is_ascii_digit() {
                    pos = end;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
            }
            let text = &source[start..pos];
            let value = text
                .parse::<f64>()
                .map_err(|_| (start, format!("invalid number '{text}'")))?;
            tokens.push((Token::Number(value), start));
            continue;
        }

        if c == b'\'' || c == b'"' {
            let start = pos;
            let (text, len) = string_literal(&source[pos..]).ok_or_else(|| (start, "unterminated string".to_string()))?;
            tokens.push((Token::Text(text), start));
            pos += len;
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            let start = pos;
            while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                pos += 1;
            }
            tokens.push((Token::Ident(source[start..pos].to_string()), start));
            continue;
        }

        let Some(symbol) = SYMBOLS.iter().find(|s| source[pos..].starts_with(**s)) else {
            let ch = source[pos..].chars().next().unwrap_or('?');
            return Err((pos, format!("unexpected character '{ch}'")));
        };
        tokens.push((Token::Symbol(symbol), pos));
        pos += symbol.len();
    }

    tokens.push((Token::End, source.len()));
    Ok(tokens)
}

/// Reads a quoted string at the start of `source`; returns its text and
/// length in bytes including the quotes.
fn string_literal(source: &str) -> Option<(String, usize)> {
    let quote = source.chars().next()?;
    let mut text = String::new();
    let mut chars = source.char_indices().skip(1);
    while let Some((offset, ch)) = chars.next() {
        match ch {
            '\\' => match chars.next()?.1 {
                'n' => text.push('\n'),
                't' => text.push('\t'),
                other => text.push(other),
            },
            ch if ch == quote => return Some((text, offset + ch.len_utf8())),
            ch => text.push(ch),
        }
    }
    None
}

pub(super) const KEYWORDS: &[&str] = &[
    "and", "or", "not", "in", "if", "elif", "else", "True", "False", "None", "return", "pass",
];

pub(super) struct Parser<'a> {
    tokens: Vec<(Token, usize)>,
    index: usize,
    variables: &'a BTreeSet<String>,
    nesting: usize,
}

pub(super) type ParseResult<T> = Result<T, (usize, String)>;

impl<'a> Parser<'a> {
    pub(super) fn new(tokens: Vec<(Token, usize)>, variables: &'a BTreeSet<String>) -> Self {
        Self {
            tokens,
            index: 0,
            variables,
            nesting: 0,
        }
    }

    pub(super) fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    pub(super) fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.index + ahead).min(self.tokens.len() - 1)].0
    }

    pub(super) fn position(&self) -> usize {
        self.tokens[self.index.min(self.tokens.len() - 1)].1
    }

    pub(super) fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
        token
    }

    pub(super) fn is_symbol(&self, symbol: &str) -> bool {
        matches!(self.peek(), Token::Symbol(s) if *s == symbol)
    }

    pub(super) fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Ident(name) if name == keyword)
    }

    pub(super) fn at_end(&self) -> bool {
        *self.peek() == Token::End
    }

    pub(super) fn expect_symbol(&mut self, symbol: &str) -> ParseResult<()> {
        if self.is_symbol(symbol) {
            self.advance();
            Ok(())
        } else {
            Err((self.position(), format!("expected '{symbol}'")))
        }
    }

    /// Parses one expression and checks its depth.
    pub(super) fn expression(&mut self) -> ParseResult<Expr> {
        let start = self.position();
        let expr = self.ternary()?;
        if expr.depth() > MAX_FORMULA_DEPTH {
            return Err((start, format!("expression nested deeper than {MAX_FORMULA_DEPTH}")));
        }
        Ok(expr)
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        self.nesting += 1;
        if self.nesting > MAX_FORMULA_DEPTH {
            return Err((self.position(), format!("nesting deeper than {MAX_FORMULA_DEPTH}")));
        }
        let result = parse(self);
        self.nesting -= 1;
        result
    }

    fn ternary(&mut self) -> ParseResult<Expr> {
        self.nested(|p| {
            let then = p.or()?;
            if !p.is_keyword("if") {
                return Ok(then);
            }
            p.advance();
            let condition = p.or()?;
            if !p.is_keyword("else") {
                return Err((p.position(), "expected 'else'".to_string()));
            }
            p.advance();
            let otherwise = p.ternary()?;
            Ok(Expr::Conditional {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            })
        })
    }

    fn or(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.and()?;
        while self.is_keyword("or") {
            self.advance();
            let rhs = self.and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.not()?;
        while self.is_keyword("and") {
            self.advance();
            let rhs = self.not()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn not(&mut self) -> ParseResult<Expr> {
        if self.is_keyword("not") {
            self.advance();
            let operand = self.nested(Self::not)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    /// Comparison operator at the cursor and how many tokens it spans.
    fn comparison_op(&self) -> Option<(BinaryOp, usize)> {
        match self.peek() {
            Token::Symbol(symbol) => {
                let op = match *symbol {
                    "<" => BinaryOp::Lt,
                    "<=" => BinaryOp::Le,
                    ">" => BinaryOp::Gt,
                    ">=" => BinaryOp::Ge,
                    "==" => BinaryOp::Eq,
                    "!=" => BinaryOp::Ne,
                    _ => return None,
                };
                Some((op, 1))
            }
            Token::Ident(word) if word == "in" => Some((BinaryOp::In, 1)),
            Token::Ident(word) if word == "not" && matches!(self.peek_at(1), Token::Ident(n) if n == "in") => {
                Some((BinaryOp::NotIn, 2))
            }
            _ => None,
        }
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let first = self.sum()?;
        let mut links = Vec::new();
        while let Some((op, width)) = self.comparison_op() {
            for _ in 0..width {
                self.advance();
            }
            links.push((op, self.sum()?));
        }

        // a < b < c  =>  (a < b) and (b < c)
        let mut left = first;
        let mut chained: Option<Expr> = None;
        for (op, right) in links {
            let link = binary(op, left, right.clone());
            chained = Some(match chained {
                Some(prev) => binary(BinaryOp::And, prev, link),
                None => link,
            });
            left = right;
        }
        Ok(chained.unwrap_or(left))
    }

    fn sum(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.product()?;
        loop {
            let op = if self.is_symbol("+") {
                BinaryOp::Add
            } else if self.is_symbol("-") {
                BinaryOp::Sub
            } else {
                return Ok(lhs);
            };
            self.advance();
            let rhs = self.product()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn product(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.is_symbol("*") {
                BinaryOp::Mul
            } else if self.is_symbol("/") {
                BinaryOp::Div
            } else {
                return Ok(lhs);
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let op = if self.is_symbol("-") {
            UnaryOp::Neg
        } else if self.is_symbol("+") {
            UnaryOp::Plus
        } else {
            return self.primary();
        };
        self.advance();
        let operand = self.nested(Self::unary)?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let position = self.position();
        match self.advance() {
            Token::Number(value) => Ok(Expr::Literal(Value::Number(value))),
            Token::Text(text) => Ok(Expr::Literal(Value::Text(text))),
            Token::Symbol("(") => {
                let inner = self.ternary()?;
                self.expect_symbol(")")?;
                Ok(inner)
            }
            Token::Symbol("[") => Ok(Expr::List(self.arguments("]")?)),
            Token::Ident(name) if name == "True" => Ok(Expr::Literal(true.into())),
            Token::Ident(name) if name == "False" => Ok(Expr::Literal(false.into())),
            Token::Ident(name) if name == "None" => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) if KEYWORDS.contains(&name.as_str()) => {
                Err((position, format!("unexpected keyword '{name}'")))
            }
            Token::Ident(name) if name == ENTITY => self.attribute(),
            Token::Ident(name) if self.is_symbol("(") => self.call(&name, position),
            Token::Ident(name) => {
                if self.variables.contains(&name) {
                    Ok(Expr::Variable(name))
                } else {
                    Err((position, format!("unknown identifier '{name}'")))
                }
            }
            Token::End => Err((position, "unexpected end of formula".to_string())),
            Token::Symbol(symbol) => Err((position, format!("unexpected '{symbol}'"))),
        }
    }

    fn attribute(&mut self) -> ParseResult<Expr> {
        self.expect_symbol(".")?;
        let position = self.position();
        match self.advance() {
            Token::Ident(name) if ENTITY_ATTRIBUTES.contains(&name.as_str()) => Ok(Expr::Attribute(name)),
            Token::Ident(name) => Err((position, format!("unknown entity attribute '{name}'"))),
            _ => Err((position, "expected an attribute name after 'entity.'".to_string())),
        }
    }

    /// Comma-separated expressions up to `close`, which is consumed.
    fn arguments(&mut self, close: &str) -> ParseResult<Vec<Expr>> {
        let mut items = Vec::new();
        while !self.is_symbol(close) {
            items.push(self.ternary()?);
            if !self.is_symbol(",") {
                break;
            }
            self.advance();
        }
        self.expect_symbol(close)?;
        Ok(items)
    }

    fn call(&mut self, name: &str, position: usize) -> ParseResult<Expr> {
        let function =
            Function::lookup(name).ok_or_else(|| (position, format!("unknown function '{name}'")))?;
        self.expect_symbol("(")?;
        let args = self.arguments(")")?;

        let (min, max) = function.arity();
        if args.len() < min || args.len() > max {
            return Err((
                position,
                format!("{}() takes {} argument(s), got {}", function.name(), arity_text(min, max), args.len()),
            ));
        }
        Ok(Expr::Call {
            function,
            args,
        })
    }
}

fn arity_text(min: usize, max: usize) -> String {
    if min == max {
        min.to_string()
    } else if max == usize::MAX {
        format!("at least {min}")
    } else {
        format!("{min} to {max}")
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

/// Compiles `source` into an expression tree.
///
/// Identifiers other than `variables`, `entity.<attribute>`, the built-in
/// functions and the keywords are rejected.
pub fn parse(source: &str, variables: &BTreeSet<String>) -> Result<Expr, BkstgError> {
    let error = |position: usize, message: String| BkstgError::FormulaParse {
        formula: source.to_string(),
        position,
        message,
    };

    if source.len() > MAX_FORMULA_LENGTH {
        return Err(error(0, format!("formula longer than {MAX_FORMULA_LENGTH} characters")));
    }

    let tokens = tokenize(source).map_err(|(pos, msg)| error(pos, msg))?;
    let mut parser = Parser::new(tokens, variables);
    let expr = parser.expression().map_err(|(pos, msg)| error(pos, msg))?;
    if !parser.at_end() {
        return Err(error(parser.position(), "unexpected trailing input".to_string()));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    fn scores(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    fn eval(source: &str, pairs: &[(&str, f64)]) -> Result<f64, EvalError> {
        let names: Vec<&str> = pairs.iter().map(|(k, _)| *k).collect();
        parse(source, &vars(&names)).unwrap().eval(&scores(pairs))
    }

    fn parse_error(source: &str) -> (usize, String) {
        match parse(source, &vars(&["a", "b"])) {
            Err(BkstgError::FormulaParse { position, message, .. }) => (position, message),
            other => panic!("expected a parse error for {source:?}, got {other:?}"),
        }
    }

    fn service() -> EntityContext {
        EntityContext {
            kind: "Component".to_string(),
            entity_type: Some("service".to_string()),
            lifecycle: Some("production".to_string()),
            namespace: "default".to_string(),
            name: "checkout".to_string(),
            tags: vec!["critical".to_string(), "payments".to_string()],
            ..EntityContext::default()
        }
    }

    fn eval_entity(source: &str, entity: Option<&EntityContext>) -> Result<Value, EvalError> {
        parse(source, &BTreeSet::new()).unwrap().evaluate(&Env::new(entity))
    }

    #[test]
    fn test_weighted_sum() {
        let value =
            eval("(test_coverage*0.6)+(doc_quality*0.4)", &[("test_coverage", 85.0), ("doc_quality", 70.0)])
                .unwrap();
        assert!((value - 79.0).abs() < 1e-9);
    }

    #[test]
    fn test_precedence_and_unary() {
        assert_eq!(eval("1 + 2 * 3 - -4 / 2", &[]).unwrap(), 9.0);
        assert_eq!(eval("-(1 + 2) * +2", &[]).unwrap(), -6.0);
        assert_eq!(eval("1.5e1 + .5", &[]).unwrap(), 15.5);
    }

    #[test]
    fn test_conditional_and_booleans() {
        let formula = "a * 2 if a >= 50 and not b else 0";
        assert_eq!(eval(formula, &[("a", 60.0), ("b", 0.0)]).unwrap(), 120.0);
        assert_eq!(eval(formula, &[("a", 60.0), ("b", 1.0)]).unwrap(), 0.0);
        assert_eq!(eval("a or 7", &[("a", 0.0)]).unwrap(), 7.0);
        assert_eq!(eval("a and 7", &[("a", 0.0)]).unwrap(), 0.0);
        assert_eq!(eval("True + True", &[]).unwrap(), 2.0);
    }

    #[test]
    fn test_chained_comparison() {
        assert_eq!(eval("0 <= a < 10", &[("a", 5.0)]).unwrap(), 1.0);
        assert_eq!(eval("0 <= a < 10", &[("a", 10.0)]).unwrap(), 0.0);
    }

    #[test]
    fn test_functions() {
        let pairs = [("a", 3.0), ("b", -8.0)];
        assert_eq!(eval("min(a, b, 1)", &pairs).unwrap(), -8.0);
        assert_eq!(eval("max(a, b)", &pairs).unwrap(), 3.0);
        assert_eq!(eval("abs(b)", &pairs).unwrap(), 8.0);
        assert_eq!(eval("avg(a, 5)", &pairs).unwrap(), 4.0);
        assert_eq!(eval("round(2.5)", &pairs).unwrap(), 2.0);
        assert_eq!(eval("round(1.256, 2)", &pairs).unwrap(), 1.26);
        assert_eq!(eval("sum([a, b, 10])", &pairs).unwrap(), 5.0);
        assert_eq!(eval("sqrt(16) + floor(2.7) + ceil(0.2)", &pairs).unwrap(), 7.0);
        assert_eq!(eval("pow(a, 2)", &pairs).unwrap(), 9.0);
        assert_eq!(eval("len('abc') + len([1, 2])", &pairs).unwrap(), 5.0);
        assert_eq!(eval("avg([])", &pairs).unwrap(), 0.0);
    }

    #[test]
    fn test_data_failures() {
        assert_eq!(eval("a / b", &[("a", 1.0), ("b", 0.0)]), Err(EvalError::DivisionByZero));
        let expr = parse("a + b", &vars(&["a", "b"])).unwrap();
        assert_eq!(
            expr.eval(&scores(&[("a", 1.0)])),
            Err(EvalError::MissingVariable("b".to_string()))
        );
        assert_eq!(eval("a * 1e308 * 10", &[("a", 1.0)]), Err(EvalError::NonFinite));
        assert_eq!(eval("sqrt(0 - 1)", &[]), Err(EvalError::NonFinite));
        assert!(matches!(eval("'x' * 2", &[]), Err(EvalError::TypeMismatch(_))));
        assert!(matches!(eval("'high'", &[]), Err(EvalError::TypeMismatch(m)) if m.contains("expected a number")));
    }

    #[test]
    fn test_untaken_branch_is_not_evaluated() {
        let expr = parse("a if a > 0 else b / 0", &vars(&["a", "b"])).unwrap();
        assert_eq!(expr.eval(&scores(&[("a", 2.0)])), Ok(2.0));
    }

    #[test]
    fn test_entity_attributes_and_membership() {
        let entity = service();
        assert_eq!(eval_entity("entity.lifecycle == 'production'", Some(&entity)), Ok(Value::from(true)));
        assert_eq!(eval_entity("'critical' in entity.tags", Some(&entity)), Ok(Value::from(true)));
        assert_eq!(eval_entity("'legacy' not in entity.tags", Some(&entity)), Ok(Value::from(true)));
        assert_eq!(
            eval_entity("entity.type in ['service', \"website\"]", Some(&entity)),
            Ok(Value::from(true))
        );
        assert_eq!(eval_entity("entity.owner", Some(&entity)), Ok(Value::Null));
        assert_eq!(eval_entity("len(entity.tags)", Some(&entity)), Ok(Value::Number(2.0)));
        assert_eq!(
            eval_entity("entity.name + '-' + entity.namespace", Some(&entity)),
            Ok(Value::Text("checkout-default".to_string()))
        );
    }

    #[test]
    fn test_entity_attributes_without_entity_are_none() {
        assert_eq!(eval_entity("entity.lifecycle", None), Ok(Value::Null));
        assert_eq!(eval_entity("'critical' in entity.tags", None), Ok(Value::from(false)));
        assert_eq!(eval_entity("entity.kind == 'Component'", None), Ok(Value::from(false)));
    }

    #[test]
    fn test_string_literals() {
        assert_eq!(eval_entity(r#"'it\'s' + "\tx""#, None), Ok(Value::Text("it's\tx".to_string())));
        assert_eq!(eval_entity("str(1.5) + 'é'", None), Ok(Value::Text("1.5é".to_string())));
        assert_eq!(eval_entity("'b' > 'a'", None), Ok(Value::from(true)));
        assert!(matches!(eval_entity("'b' > 1", None), Err(EvalError::TypeMismatch(_))));
    }

    #[test]
    fn test_parse_errors_carry_position() {
        assert_eq!(parse_error("a + c"), (4, "unknown identifier 'c'".to_string()));
        assert_eq!(parse_error("a + "), (4, "unexpected end of formula".to_string()));
        assert_eq!(parse_error("a $ b").0, 2);
        assert_eq!(parse_error("(a + b").0, 6);
        assert_eq!(parse_error("a b").0, 2);
        assert!(parse_error("a if b").1.contains("else"));
        assert!(parse_error("exp(a)").1.contains("unknown function"));
        assert!(parse_error("abs(a, b)").1.contains("takes 1"));
        assert!(parse_error("import").1.contains("unknown identifier"));
        assert_eq!(parse_error("'open").0, 0);
        assert!(parse_error("entity.secret").1.contains("unknown entity attribute 'secret'"));
        assert!(parse_error("entity").1.contains("expected '.'"));
        assert!(parse_error("a = 1").1.contains("trailing"));
    }

    #[test]
    fn test_limits() {
        let long = format!("a{}", " + a".repeat(MAX_FORMULA_LENGTH));
        assert!(parse_error(&long).1.contains("longer than"));

        let grouped = format!("{}a{}", "(".repeat(30), ")".repeat(30));
        assert!(parse(&grouped, &vars(&["a"])).is_ok());
        let deep = format!("{}a{}", "(".repeat(60), ")".repeat(60));
        assert!(parse_error(&deep).1.contains("deeper than"));

        let nested = format!("{}a{}", "abs(".repeat(60), ")".repeat(60));
        assert!(parse_error(&nested).1.contains("deeper than"));
    }

    #[test]
    fn test_variables_are_collected() {
        let expr = parse("min(a, b) if a > 0 else a", &vars(&["a", "b", "c"])).unwrap();
        assert_eq!(expr.variables().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
