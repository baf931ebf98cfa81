//! Query compilation and execution errors

use crate::executor::StoreError;

/// Errors raised while compiling or running a predicate query
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The expression tree contains a node kind the compiler cannot render
    #[error("Unsupported expression: {0}")]
    UnsupportedExpression(String),
    /// A member reference does not name a column of the entity
    #[error("'{member}' is not a column of {entity}")]
    UnknownMember { entity: &'static str, member: String },
    /// A placeholder in the SQL has no bound value
    #[error("Placeholder @{0} has no bound value")]
    UnboundPlaceholder(String),
    /// The placeholder pattern could not be compiled
    #[error("Placeholder rewriting failed: {0}")]
    Rewrite(String),
    /// Storage failure while executing the compiled query
    #[error(transparent)]
    Storage(#[from] StoreError),
}
