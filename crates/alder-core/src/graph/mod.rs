//! Property-graph backend abstraction.
//!
//! The synchronization engine talks to storage exclusively through
//! [`GraphBackend`], so concrete stores (embedded, server-side, in-memory)
//! are interchangeable. The contract has two execution modes:
//!
//! - **Transactional**: [`GraphBackend::begin_transaction`] returns a
//!   [`Transaction`] scope that must be marked [`Transaction::success`]
//!   before it is dropped; a scope dropped any other way rolls back.
//! - **Batch**: [`GraphBackend::enter_batch_mode`] /
//!   [`GraphBackend::exit_batch_mode`] bracket bulk loads, deferring index
//!   maintenance until exit for throughput.
//!
//! The two modes are mutually exclusive on one backend instance.
//!
//! Property keys and labels are escaped with [`escape`] on write and
//! reversed on read, so reserved characters behave identically on every
//! backend.

pub mod escape;
mod error;
mod memory;

pub use error::GraphError;
pub use memory::{MemoryGraph, MutationCounters};

use serde::{Deserialize, Serialize};

/// Opaque node handle.
pub type NodeId = u64;

/// Opaque edge handle.
pub type EdgeId = u64;

/// A property value stored on a node or edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Canonical string form, used for secondary-index values and
    /// signature input. Stable across runs for equal values.
    pub fn canonical(&self) -> String {
        match self {
            PropertyValue::Bool(b) => format!("b:{}", b),
            PropertyValue::Int(i) => format!("i:{}", i),
            PropertyValue::Float(f) => format!("f:{}", f),
            PropertyValue::Str(s) => format!("s:{}", s),
            PropertyValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.canonical()).collect();
                format!("l:[{}]", parts.join(","))
            }
        }
    }

    /// Display form without the type tag, for CLI output and index values.
    pub fn display(&self) -> String {
        match self {
            PropertyValue::Bool(b) => b.to_string(),
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::Float(f) => f.to_string(),
            PropertyValue::Str(s) => s.clone(),
            PropertyValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.display()).collect();
                format!("[{}]", parts.join(", "))
            }
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Str(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Str(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        PropertyValue::Float(f)
    }
}

/// An edge as seen from a node traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRef {
    pub id: EdgeId,
    pub label: String,
    pub from: NodeId,
    pub to: NodeId,
}

/// Execution mode of a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Transactional,
    Batch,
}

/// Commit/rollback half of an open transaction, implemented per backend.
pub trait TxHandle: Send {
    fn commit(&mut self) -> Result<(), GraphError>;
    fn rollback(&mut self) -> Result<(), GraphError>;
}

/// A transaction scope.
///
/// Call [`Transaction::success`] to commit. Dropping the scope without it,
/// or calling [`Transaction::failure`], rolls back every mutation made
/// since [`GraphBackend::begin_transaction`].
pub struct Transaction {
    handle: Option<Box<dyn TxHandle>>,
}

impl Transaction {
    pub fn new(handle: Box<dyn TxHandle>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Commit the transaction.
    pub fn success(mut self) -> Result<(), GraphError> {
        match self.handle.take() {
            Some(mut h) => h.commit(),
            None => Ok(()),
        }
    }

    /// Roll the transaction back explicitly.
    pub fn failure(mut self) -> Result<(), GraphError> {
        match self.handle.take() {
            Some(mut h) => h.rollback(),
            None => Ok(()),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(mut h) = self.handle.take() {
            // Scope left without an explicit success: roll back.
            let _ = h.rollback();
        }
    }
}

/// The pluggable property-graph store contract.
///
/// All methods take `&self`; implementations synchronize internally so the
/// engine can hold the backend behind an `Arc<dyn GraphBackend>`.
pub trait GraphBackend: Send + Sync {
    /// Create a node with the given properties and label.
    fn create_node(
        &self,
        properties: &[(String, PropertyValue)],
        label: &str,
    ) -> Result<NodeId, GraphError>;

    /// Create a directed edge between two existing nodes.
    fn create_relationship(
        &self,
        from: NodeId,
        to: NodeId,
        label: &str,
        properties: &[(String, PropertyValue)],
    ) -> Result<EdgeId, GraphError>;

    /// Delete a node. Fails with [`GraphError::NodeInUse`] while edges are
    /// still attached; callers dereference first.
    fn delete_node(&self, node: NodeId) -> Result<(), GraphError>;

    /// Delete an edge.
    fn delete_relationship(&self, edge: EdgeId) -> Result<(), GraphError>;

    fn node_exists(&self, node: NodeId) -> bool;

    fn node_label(&self, node: NodeId) -> Result<String, GraphError>;

    fn node_property(&self, node: NodeId, key: &str) -> Result<Option<PropertyValue>, GraphError>;

    fn set_node_property(
        &self,
        node: NodeId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), GraphError>;

    fn remove_node_property(&self, node: NodeId, key: &str) -> Result<(), GraphError>;

    fn node_property_keys(&self, node: NodeId) -> Result<Vec<String>, GraphError>;

    /// Outgoing edges, optionally filtered by label.
    fn outgoing(&self, node: NodeId, label: Option<&str>) -> Result<Vec<EdgeRef>, GraphError>;

    /// Incoming edges, optionally filtered by label.
    fn incoming(&self, node: NodeId, label: Option<&str>) -> Result<Vec<EdgeRef>, GraphError>;

    fn edge_property(&self, edge: EdgeId, key: &str) -> Result<Option<PropertyValue>, GraphError>;

    fn set_edge_property(
        &self,
        edge: EdgeId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), GraphError>;

    /// All nodes, optionally restricted to one label. Order is unspecified
    /// but stable between calls without intervening writes.
    fn all_nodes(&self, label: Option<&str>) -> Result<Vec<NodeId>, GraphError>;

    /// Open a transaction scope. Fails while batch mode is active or
    /// another transaction is open.
    fn begin_transaction(&self) -> Result<Transaction, GraphError>;

    fn mode(&self) -> BackendMode;

    /// Switch to batch mode. Fails while a transaction is open; entering
    /// batch mode twice is a no-op.
    fn enter_batch_mode(&self) -> Result<(), GraphError>;

    /// Leave batch mode, flushing deferred index maintenance.
    fn exit_batch_mode(&self) -> Result<(), GraphError>;

    /// Ensure a named secondary index exists.
    fn get_or_create_index(&self, name: &str) -> Result<(), GraphError>;

    fn index_exists(&self, name: &str) -> bool;

    fn index_names(&self) -> Vec<String>;

    /// Add a node to an index under (key, value).
    fn index_put(
        &self,
        index: &str,
        key: &str,
        value: &str,
        node: NodeId,
    ) -> Result<(), GraphError>;

    /// Remove one (key, value, node) entry.
    fn index_remove(
        &self,
        index: &str,
        key: &str,
        value: &str,
        node: NodeId,
    ) -> Result<(), GraphError>;

    /// Remove a node from every entry of one index.
    fn index_remove_node(&self, index: &str, node: NodeId) -> Result<(), GraphError>;

    /// Exact lookup.
    fn index_get(&self, index: &str, key: &str, value: &str) -> Result<Vec<NodeId>, GraphError>;

    /// Wildcard lookup: `value_pattern` is an exact value, `*` for any
    /// value under the key, or a `prefix*` form.
    fn index_query(
        &self,
        index: &str,
        key: &str,
        value_pattern: &str,
    ) -> Result<Vec<NodeId>, GraphError>;
}
