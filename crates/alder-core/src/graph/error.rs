//! Graph backend error types.

use thiserror::Error;

use super::{EdgeId, NodeId};

/// Errors raised by graph backend implementations.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Node handle does not exist (or was deleted).
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// Edge handle does not exist (or was deleted).
    #[error("edge {0} not found")]
    EdgeNotFound(EdgeId),

    /// Named secondary index does not exist.
    #[error("index '{0}' not found")]
    IndexNotFound(String),

    /// A node still has edges attached and cannot be deleted.
    #[error("node {node} still has {edges} attached edges")]
    NodeInUse { node: NodeId, edges: usize },

    /// A transaction is already open on this backend.
    #[error("a transaction is already open on this backend")]
    TransactionOpen,

    /// Batch mode is active, so transactions are unavailable.
    #[error("batch mode is active; complete the batch before opening a transaction")]
    BatchModeActive,

    /// Batch mode requested while a transaction is open.
    #[error("cannot enter batch mode while a transaction is open")]
    TransactionActive,

    /// Batch mode exit requested while not in batch mode.
    #[error("backend is not in batch mode")]
    NotInBatchMode,

    /// The backend failed to commit a transaction.
    #[error("transaction commit failed: {0}")]
    CommitFailed(String),
}
