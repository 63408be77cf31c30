use std::path::PathBuf;

use thiserror::Error;

use crate::derived::ExpressionError;
use crate::graph::GraphError;
use crate::indexer::IndexerState;
use crate::metamodel::RegistryError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backend transaction failed: {0}")]
    BackendTransaction(#[from] GraphError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("invalid expression for derived attribute {attribute}: {source}")]
    InvalidExpression {
        attribute: String,
        #[source]
        source: ExpressionError,
    },

    #[error("no expression language registered under id {0:?}")]
    NoSuchLanguage(String),

    #[error("indexer is not running (state: {0})")]
    NotRunning(IndexerState),
}
