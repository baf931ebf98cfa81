//! Predicate descriptions over typed entities
//!
//! An [`Expr`] is a query-language independent tree: boolean connectives,
//! comparisons, member references, literals and a fixed set of string
//! matches. [`Column`] and [`Predicate`] build such trees with the entity
//! type carried at compile time.

use std::fmt;
use std::marker::PhantomData;

use crate::value::Value;

/// A table-backed entity known at compile time
///
/// # Example
///
/// ```
/// use driftguard::query::{Column, Entity};
///
/// struct User;
///
/// impl Entity for User {
///     const TABLE: &'static str = "users";
///     const COLUMNS: &'static [&'static str] = &["Id", "Name", "Age"];
/// }
///
/// const AGE: Column<User> = Column::new("Age");
/// let adults = AGE.gt(18);
/// ```
pub trait Entity {
    /// Table name
    const TABLE: &'static str;
    /// Column names members may refer to
    const COLUMNS: &'static [&'static str];
}

/// Binary node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Add,
    Subtract,
}

impl BinaryOp {
    /// SQL symbol for comparisons and connectives; `None` for arithmetic
    pub fn symbol(self) -> Option<&'static str> {
        match self {
            BinaryOp::And => Some("AND"),
            BinaryOp::Or => Some("OR"),
            BinaryOp::Eq => Some("="),
            BinaryOp::Ne => Some("<>"),
            BinaryOp::Gt => Some(">"),
            BinaryOp::Ge => Some(">="),
            BinaryOp::Lt => Some("<"),
            BinaryOp::Le => Some("<="),
            BinaryOp::Add | BinaryOp::Subtract => None,
        }
    }

    pub fn is_connective(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

/// Supported string-match calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringMatch {
    Contains,
    StartsWith,
    EndsWith,
}

/// Where a member reference points
#[derive(Debug, Clone, PartialEq)]
pub enum MemberSource {
    /// A column of the queried entity
    Entity,
    /// A value captured from the caller's scope, bound as a parameter
    Captured(Value),
}

/// Predicate expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Member {
        name: String,
        source: MemberSource,
    },
    Literal(Value),
    StringMatch {
        method: StringMatch,
        target: Box<Expr>,
        pattern: Box<Expr>,
    },
    Not(Box<Expr>),
    Conditional {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
    /// Any other method call, by name
    Call {
        method: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Reference to a column of the queried entity
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Member {
            name: name.into(),
            source: MemberSource::Entity,
        }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn string_match(method: StringMatch, target: Expr, pattern: Expr) -> Self {
        Expr::StringMatch {
            method,
            target: Box::new(target),
            pattern: Box::new(pattern),
        }
    }

    /// Node kind, as reported in compiler errors
    pub fn kind(&self) -> String {
        match self {
            Expr::Binary { op, .. } => format!("Binary({op:?})"),
            Expr::Member { .. } => "Member".to_string(),
            Expr::Literal(_) => "Literal".to_string(),
            Expr::StringMatch { method, .. } => format!("StringMatch({method:?})"),
            Expr::Not(_) => "Not".to_string(),
            Expr::Conditional { .. } => "Conditional".to_string(),
            Expr::Call { method, .. } => format!("Call({method})"),
        }
    }
}

/// A member captured from the caller's scope rather than read from the entity
///
/// Renders as a bound parameter, never as a column.
pub fn captured(name: impl Into<String>, value: impl Into<Value>) -> Expr {
    Expr::Member {
        name: name.into(),
        source: MemberSource::Captured(value.into()),
    }
}

/// A typed column of entity `E`
pub struct Column<E> {
    name: &'static str,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Column<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Column<E> {}

impl<E> fmt::Debug for Column<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Column").field(&self.name).finish()
    }
}

impl<E> Column<E> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _entity: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn expr(&self) -> Expr {
        Expr::column(self.name)
    }

    /// Compare against an arbitrary operand (for example a [`captured`] member)
    pub fn compare(&self, op: BinaryOp, operand: Expr) -> Predicate<E> {
        Predicate::from_expr(Expr::binary(op, self.expr(), operand))
    }

    pub fn eq(&self, value: impl Into<Value>) -> Predicate<E> {
        self.compare(BinaryOp::Eq, Expr::literal(value))
    }

    pub fn ne(&self, value: impl Into<Value>) -> Predicate<E> {
        self.compare(BinaryOp::Ne, Expr::literal(value))
    }

    pub fn gt(&self, value: impl Into<Value>) -> Predicate<E> {
        self.compare(BinaryOp::Gt, Expr::literal(value))
    }

    pub fn ge(&self, value: impl Into<Value>) -> Predicate<E> {
        self.compare(BinaryOp::Ge, Expr::literal(value))
    }

    pub fn lt(&self, value: impl Into<Value>) -> Predicate<E> {
        self.compare(BinaryOp::Lt, Expr::literal(value))
    }

    pub fn le(&self, value: impl Into<Value>) -> Predicate<E> {
        self.compare(BinaryOp::Le, Expr::literal(value))
    }

    pub fn contains(&self, pattern: impl Into<String>) -> Predicate<E> {
        self.string_match(StringMatch::Contains, pattern)
    }

    pub fn starts_with(&self, pattern: impl Into<String>) -> Predicate<E> {
        self.string_match(StringMatch::StartsWith, pattern)
    }

    pub fn ends_with(&self, pattern: impl Into<String>) -> Predicate<E> {
        self.string_match(StringMatch::EndsWith, pattern)
    }

    fn string_match(&self, method: StringMatch, pattern: impl Into<String>) -> Predicate<E> {
        Predicate::from_expr(Expr::string_match(
            method,
            self.expr(),
            Expr::literal(pattern.into()),
        ))
    }

    pub fn asc(&self) -> OrderBy {
        OrderBy::new(self.name, SortDirection::Ascending)
    }

    pub fn desc(&self) -> OrderBy {
        OrderBy::new(self.name, SortDirection::Descending)
    }
}

/// A boolean predicate over entity `E`
pub struct Predicate<E> {
    expr: Expr,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Predicate<E> {
    fn clone(&self) -> Self {
        Self::from_expr(self.expr.clone())
    }
}

impl<E> fmt::Debug for Predicate<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Predicate").field(&self.expr).finish()
    }
}

impl<E> Predicate<E> {
    /// Wrap an untyped tree; members are still checked at compile time
    pub fn from_expr(expr: Expr) -> Self {
        Self {
            expr,
            _entity: PhantomData,
        }
    }

    #[must_use]
    pub fn and(self, other: Predicate<E>) -> Self {
        Self::from_expr(Expr::binary(BinaryOp::And, self.expr, other.expr))
    }

    #[must_use]
    pub fn or(self, other: Predicate<E>) -> Self {
        Self::from_expr(Expr::binary(BinaryOp::Or, self.expr, other.expr))
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn into_expr(self) -> Expr {
        self.expr
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

/// One ordering key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn new(column: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }
}
