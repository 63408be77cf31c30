//! Expression language adapter for derived attributes.

use thiserror::Error;

use super::access::AccessRecordingReader;
use crate::graph::{GraphError, NodeId, PropertyValue};

#[derive(Error, Debug)]
pub enum ExpressionError {
    #[error("parse error at byte {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("evaluation failed: {0}")]
    Eval(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Result of evaluating a derived expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    /// A scalar (or scalar list) value.
    Value(PropertyValue),
    /// Model element nodes; stored as derived-target edges.
    Elements(Vec<NodeId>),
}

/// The engine consults expression languages only through this trait. Every
/// graph read an evaluation performs must flow through the supplied
/// [`AccessRecordingReader`], which is what makes dependency-tracked
/// invalidation possible.
pub trait ExpressionLanguage: Send + Sync {
    /// Language identifier, referenced by derived attribute registrations.
    fn id(&self) -> &str;

    /// Syntax check; called at registration before any graph mutation.
    fn validate(&self, expression: &str) -> Result<(), ExpressionError>;

    fn evaluate(
        &self,
        expression: &str,
        element: NodeId,
        reader: &AccessRecordingReader<'_>,
    ) -> Result<Evaluated, ExpressionError>;
}
