//! Typed predicate queries.
//!
//! Entities declare their table and columns through [`Entity`]; predicates
//! are built with [`Column`] and combined with [`Predicate::and`] /
//! [`Predicate::or`]. [`QueryCompiler`] turns the resulting [`Expr`] tree
//! into a parameterized `WHERE` fragment with `@pN` placeholders, and
//! [`Repository`] runs it against a [`crate::executor::Store`].
//!
//! # Examples
//!
//! ```
//! use driftguard::query::{Column, Entity, QueryCompiler};
//! use driftguard::Value;
//!
//! struct User;
//! impl Entity for User {
//!     const TABLE: &'static str = "users";
//!     const COLUMNS: &'static [&'static str] = &["Name", "Age"];
//! }
//! const AGE: Column<User> = Column::new("Age");
//! const NAME: Column<User> = Column::new("Name");
//!
//! let predicate = AGE.gt(18).and(NAME.contains("an"));
//! let compiled = QueryCompiler::for_entity::<User>().compile_filter(predicate.expr())?;
//! assert_eq!(compiled.parameters["p1"], Value::Int(18));
//! # Ok::<(), driftguard::query::QueryError>(())
//! ```

pub mod compiler;
pub mod error;
pub mod expr;
pub mod repository;

pub use compiler::{CompiledQuery, QueryCompiler, SelectQuery};
pub use error::QueryError;
pub use expr::{
    captured, BinaryOp, Column, Entity, Expr, MemberSource, OrderBy, Predicate, SortDirection,
    StringMatch,
};
pub use repository::Repository;
