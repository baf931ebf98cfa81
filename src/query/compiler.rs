//! Predicate compilation to parameterized SQL fragments.
//!
//! Placeholders are named `@p1`, `@p2`, ... in the order values are bound
//! while walking the tree. Numbering restarts at `@p1` for every compile
//! call, so compiled fragments never share state.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::marker::PhantomData;

use crate::query::error::QueryError;
use crate::query::expr::{BinaryOp, Entity, Expr, MemberSource, OrderBy, Predicate, StringMatch};
use crate::value::Value;

static PLACEHOLDER: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| Regex::new(r"@(p\d+)"));

/// Output of one compile call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledQuery {
    /// Filter fragment without the `WHERE` keyword; empty when unfiltered
    pub where_clause: String,
    /// `ORDER BY ...`; empty when unordered
    pub order_clause: String,
    /// `LIMIT n OFFSET m`, either part optional; empty when unpaged
    pub paging_clause: String,
    /// Bound values keyed by placeholder name (`p1`, `p2`, ...)
    pub parameters: BTreeMap<String, Value>,
}

impl CompiledQuery {
    /// Full `SELECT` over `table`
    pub fn select_sql(&self, table: &str, columns: &[&str]) -> String {
        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.join(", ")
        };
        let mut sql = format!("SELECT {projection} FROM {table}");
        for (keyword, clause) in [
            ("WHERE ", &self.where_clause),
            ("", &self.order_clause),
            ("", &self.paging_clause),
        ] {
            if !clause.is_empty() {
                sql.push(' ');
                sql.push_str(keyword);
                sql.push_str(clause);
            }
        }
        sql
    }

    /// `SELECT COUNT(*)` over `table` honouring the filter only
    pub fn count_sql(&self, table: &str) -> String {
        if self.where_clause.is_empty() {
            format!("SELECT COUNT(*) FROM {table}")
        } else {
            format!("SELECT COUNT(*) FROM {table} WHERE {}", self.where_clause)
        }
    }

    /// Rewrite `@pN` placeholders in `sql` to `$1, $2, ...` in order of
    /// first appearance, returning the matching positional values
    ///
    /// # Errors
    ///
    /// Returns `QueryError::UnboundPlaceholder` if `sql` names a placeholder
    /// this query did not bind.
    pub fn to_positional(&self, sql: &str) -> Result<(String, Vec<Value>), QueryError> {
        let pattern = PLACEHOLDER
            .as_ref()
            .map_err(|e| QueryError::Rewrite(e.to_string()))?;
        let mut order: Vec<&str> = Vec::new();
        let mut values = Vec::new();
        let mut rewritten = String::with_capacity(sql.len());
        let mut last = 0;

        for captures in pattern.captures_iter(sql) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let position = match order.iter().position(|seen| *seen == name.as_str()) {
                Some(index) => index + 1,
                None => {
                    let value = self
                        .parameters
                        .get(name.as_str())
                        .ok_or_else(|| QueryError::UnboundPlaceholder(name.as_str().to_string()))?;
                    order.push(name.as_str());
                    values.push(value.clone());
                    order.len()
                }
            };
            rewritten.push_str(&sql[last..whole.start()]);
            rewritten.push('$');
            rewritten.push_str(&position.to_string());
            last = whole.end();
        }
        rewritten.push_str(&sql[last..]);
        Ok((rewritten, values))
    }
}

/// Per-call placeholder state
#[derive(Default)]
struct BindContext {
    next: usize,
    parameters: BTreeMap<String, Value>,
}

impl BindContext {
    fn bind(&mut self, value: Value) -> String {
        self.next += 1;
        let name = format!("p{}", self.next);
        let placeholder = format!("@{name}");
        self.parameters.insert(name, value);
        placeholder
    }
}

/// Compiles expression trees against one entity's column set
#[derive(Debug, Clone, Copy)]
pub struct QueryCompiler {
    entity: &'static str,
    columns: &'static [&'static str],
}

impl QueryCompiler {
    pub fn new(entity: &'static str, columns: &'static [&'static str]) -> Self {
        Self { entity, columns }
    }

    pub fn for_entity<E: Entity>() -> Self {
        Self::new(E::TABLE, E::COLUMNS)
    }

    /// Compile a filter, ordering and paging into SQL fragments
    ///
    /// # Errors
    ///
    /// Returns `QueryError::UnsupportedExpression` for node kinds outside the
    /// supported set and `QueryError::UnknownMember` for references to
    /// columns the entity does not have.
    pub fn compile(
        &self,
        filter: Option<&Expr>,
        order_by: &[OrderBy],
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<CompiledQuery, QueryError> {
        let mut ctx = BindContext::default();
        let where_clause = match filter {
            Some(expr) => self.render(expr, &mut ctx)?,
            None => String::new(),
        };

        let mut keys = Vec::with_capacity(order_by.len());
        for key in order_by {
            let column = self.column(&key.column)?;
            keys.push(format!("{column} {}", key.direction.as_sql()));
        }
        let order_clause = if keys.is_empty() {
            String::new()
        } else {
            format!("ORDER BY {}", keys.join(", "))
        };

        let paging_clause = match (limit, offset) {
            (Some(n), Some(m)) => format!("LIMIT {n} OFFSET {m}"),
            (Some(n), None) => format!("LIMIT {n}"),
            (None, Some(m)) => format!("OFFSET {m}"),
            (None, None) => String::new(),
        };

        Ok(CompiledQuery {
            where_clause,
            order_clause,
            paging_clause,
            parameters: ctx.parameters,
        })
    }

    /// Compile a filter alone
    ///
    /// # Errors
    ///
    /// Same as [`QueryCompiler::compile`].
    pub fn compile_filter(&self, filter: &Expr) -> Result<CompiledQuery, QueryError> {
        self.compile(Some(filter), &[], None, None)
    }

    fn column<'a>(&self, name: &'a str) -> Result<&'a str, QueryError> {
        if self.columns.iter().any(|column| *column == name) {
            Ok(name)
        } else {
            Err(QueryError::UnknownMember {
                entity: self.entity,
                member: name.to_string(),
            })
        }
    }

    fn render(&self, expr: &Expr, ctx: &mut BindContext) -> Result<String, QueryError> {
        match expr {
            Expr::Binary { op, left, right } => self.render_binary(*op, left, right, ctx),
            Expr::Member {
                name,
                source: MemberSource::Entity,
            } => self.column(name).map(str::to_string),
            Expr::Member {
                source: MemberSource::Captured(value),
                ..
            } => Ok(ctx.bind(value.clone())),
            Expr::Literal(value) => Ok(ctx.bind(value.clone())),
            Expr::StringMatch {
                method,
                target,
                pattern,
            } => {
                let target = self.render(target, ctx)?;
                // concat() is variadic "any"; the cast lets Postgres type the parameter
                let pattern = format!("CAST({} AS TEXT)", self.render(pattern, ctx)?);
                let like = match method {
                    StringMatch::Contains => format!("CONCAT('%', {pattern}, '%')"),
                    StringMatch::StartsWith => format!("CONCAT({pattern}, '%')"),
                    StringMatch::EndsWith => format!("CONCAT('%', {pattern})"),
                };
                Ok(format!("{target} LIKE {like}"))
            }
            Expr::Not(_) | Expr::Conditional { .. } | Expr::Call { .. } => {
                Err(QueryError::UnsupportedExpression(expr.kind()))
            }
        }
    }

    fn render_binary(
        &self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        ctx: &mut BindContext,
    ) -> Result<String, QueryError> {
        let symbol = op
            .symbol()
            .ok_or_else(|| QueryError::UnsupportedExpression(format!("Binary({op:?})")))?;

        if op.is_connective() {
            let left = self.render(left, ctx)?;
            let right = self.render(right, ctx)?;
            return Ok(format!("({left} {symbol} {right})"));
        }

        if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            let null_test = if op == BinaryOp::Eq { "IS NULL" } else { "IS NOT NULL" };
            if is_null(right) {
                return Ok(format!("{} {null_test}", self.render(left, ctx)?));
            }
            if is_null(left) {
                return Ok(format!("{} {null_test}", self.render(right, ctx)?));
            }
        }

        let left = self.render(left, ctx)?;
        let right = self.render(right, ctx)?;
        Ok(format!("{left} {symbol} {right}"))
    }
}

fn is_null(expr: &Expr) -> bool {
    match expr {
        Expr::Literal(value) => value.is_null(),
        Expr::Member {
            source: MemberSource::Captured(value),
            ..
        } => value.is_null(),
        _ => false,
    }
}

/// Chainable select over entity `E`
///
/// # Example
///
/// ```
/// use driftguard::query::{Column, Entity, SelectQuery};
///
/// struct User;
/// impl Entity for User {
///     const TABLE: &'static str = "users";
///     const COLUMNS: &'static [&'static str] = &["Name", "Age"];
/// }
/// const AGE: Column<User> = Column::new("Age");
/// const NAME: Column<User> = Column::new("Name");
///
/// let compiled = SelectQuery::<User>::new()
///     .filter(AGE.gt(18).and(NAME.contains("an")))
///     .order_by(NAME.asc())
///     .limit(10)
///     .compile()?;
/// assert_eq!(compiled.where_clause, "(Age > @p1 AND Name LIKE CONCAT('%', CAST(@p2 AS TEXT), '%'))");
/// # Ok::<(), driftguard::query::QueryError>(())
/// ```
pub struct SelectQuery<E> {
    filter: Option<Expr>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Default for SelectQuery<E> {
    fn default() -> Self {
        Self {
            filter: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            _entity: PhantomData,
        }
    }
}

impl<E> Clone for SelectQuery<E> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> SelectQuery<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter; repeated calls are joined with `AND`
    #[must_use]
    pub fn filter(mut self, predicate: Predicate<E>) -> Self {
        let expr = predicate.into_expr();
        self.filter = Some(match self.filter.take() {
            Some(existing) => Expr::binary(BinaryOp::And, existing, expr),
            None => expr,
        });
        self
    }

    #[must_use]
    pub fn order_by(mut self, key: OrderBy) -> Self {
        self.order_by.push(key);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// # Errors
    ///
    /// See [`QueryCompiler::compile`].
    pub fn compile(&self) -> Result<CompiledQuery, QueryError> {
        QueryCompiler::for_entity::<E>().compile(
            self.filter.as_ref(),
            &self.order_by,
            self.limit,
            self.offset,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::query::expr::{captured, Column};

    struct Person;

    impl Entity for Person {
        const TABLE: &'static str = "people";
        const COLUMNS: &'static [&'static str] = &["Name", "Age", "Email"];
    }

    const NAME: Column<Person> = Column::new("Name");
    const AGE: Column<Person> = Column::new("Age");
    const EMAIL: Column<Person> = Column::new("Email");

    fn compiler() -> QueryCompiler {
        QueryCompiler::for_entity::<Person>()
    }

    #[test]
    fn test_connective_with_comparison_and_contains() {
        let predicate = AGE.gt(18).and(NAME.contains("an"));
        let compiled = compiler().compile_filter(predicate.expr()).unwrap();

        assert_eq!(
            compiled.where_clause,
            "(Age > @p1 AND Name LIKE CONCAT('%', CAST(@p2 AS TEXT), '%'))"
        );
        assert_eq!(compiled.parameters.len(), 2);
        assert_eq!(compiled.parameters["p1"], Value::Int(18));
        assert_eq!(compiled.parameters["p2"], Value::Text("an".into()));
    }

    #[test]
    fn test_prefix_and_suffix_matches() {
        let compiled = compiler()
            .compile_filter(NAME.starts_with("Jo").or(EMAIL.ends_with(".org")).expr())
            .unwrap();
        assert_eq!(
            compiled.where_clause,
            "(Name LIKE CONCAT(CAST(@p1 AS TEXT), '%') OR Email LIKE CONCAT('%', CAST(@p2 AS TEXT)))"
        );
    }

    #[test]
    fn test_null_comparisons_render_without_placeholders() {
        let compiled = compiler()
            .compile_filter(EMAIL.eq(Value::Null).and(NAME.ne(Value::Null)).expr())
            .unwrap();
        assert_eq!(compiled.where_clause, "(Email IS NULL AND Name IS NOT NULL)");
        assert!(compiled.parameters.is_empty());
    }

    #[test]
    fn test_captured_member_binds_value() {
        let predicate = AGE.compare(BinaryOp::Ge, captured("minimum", 21));
        let compiled = compiler().compile_filter(predicate.expr()).unwrap();
        assert_eq!(compiled.where_clause, "Age >= @p1");
        assert_eq!(compiled.parameters["p1"], Value::Int(21));
    }

    #[test]
    fn test_each_compile_restarts_numbering() {
        let c = compiler();
        let first = c.compile_filter(AGE.eq(1).expr()).unwrap();
        let second = c.compile_filter(AGE.eq(2).expr()).unwrap();
        assert_eq!(first.where_clause, "Age = @p1");
        assert_eq!(second.where_clause, "Age = @p1");
        assert_eq!(second.parameters["p1"], Value::Int(2));
    }

    #[test]
    fn test_unsupported_nodes_are_rejected() {
        let not = Expr::Not(Box::new(AGE.eq(1).into_expr()));
        assert_eq!(
            compiler().compile_filter(&not),
            Err(QueryError::UnsupportedExpression("Not".into()))
        );

        let call = Expr::Call {
            method: "lower".into(),
            args: vec![NAME.expr()],
        };
        assert!(matches!(
            compiler().compile_filter(&call),
            Err(QueryError::UnsupportedExpression(kind)) if kind == "Call(lower)"
        ));

        let arithmetic = Expr::binary(BinaryOp::Add, AGE.expr(), Expr::literal(1));
        assert!(matches!(
            compiler().compile_filter(&arithmetic),
            Err(QueryError::UnsupportedExpression(_))
        ));
    }

    #[test]
    fn test_unknown_member_is_rejected() {
        let expr = Expr::binary(BinaryOp::Eq, Expr::column("Salary"), Expr::literal(1));
        assert_eq!(
            compiler().compile_filter(&expr),
            Err(QueryError::UnknownMember {
                entity: "people",
                member: "Salary".into()
            })
        );
    }

    #[test]
    fn test_ordering_and_paging() {
        let compiled = SelectQuery::<Person>::new()
            .filter(AGE.gt(30))
            .order_by(AGE.desc())
            .order_by(NAME.asc())
            .limit(10)
            .offset(20)
            .compile()
            .unwrap();
        assert_eq!(compiled.order_clause, "ORDER BY Age DESC, Name ASC");
        assert_eq!(compiled.paging_clause, "LIMIT 10 OFFSET 20");
        assert_eq!(
            compiled.select_sql(Person::TABLE, Person::COLUMNS),
            "SELECT Name, Age, Email FROM people WHERE Age > @p1 ORDER BY Age DESC, Name ASC LIMIT 10 OFFSET 20"
        );
        assert_eq!(
            compiled.count_sql(Person::TABLE),
            "SELECT COUNT(*) FROM people WHERE Age > @p1"
        );
    }

    #[test]
    fn test_offset_without_limit() {
        let compiled = SelectQuery::<Person>::new().offset(5).compile().unwrap();
        assert_eq!(compiled.paging_clause, "OFFSET 5");
        assert!(compiled.where_clause.is_empty());
    }

    #[test]
    fn test_repeated_filters_join_with_and() {
        let query = SelectQuery::<Person>::new()
            .filter(AGE.gt(1))
            .filter(AGE.lt(9));
        assert_eq!(
            query.compile().unwrap().where_clause,
            "(Age > @p1 AND Age < @p2)"
        );
    }

    #[test]
    fn test_to_positional_rewrites_in_appearance_order() {
        let mut compiled = CompiledQuery::default();
        compiled.parameters.insert("p1".into(), Value::Int(1));
        compiled.parameters.insert("p2".into(), Value::Int(2));
        compiled.parameters.insert("p10".into(), Value::Int(10));

        let (sql, values) = compiled
            .to_positional("a = @p10 AND b = @p2 AND c = @p1 AND d = @p10")
            .unwrap();
        assert_eq!(sql, "a = $1 AND b = $2 AND c = $3 AND d = $1");
        assert_eq!(values, vec![Value::Int(10), Value::Int(2), Value::Int(1)]);
    }

    #[test]
    fn test_to_positional_reports_unbound_placeholder() {
        let compiled = CompiledQuery::default();
        assert_eq!(
            compiled.to_positional("a = @p1"),
            Err(QueryError::UnboundPlaceholder("p1".into()))
        );
    }
}
