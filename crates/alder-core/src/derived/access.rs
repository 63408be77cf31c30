//! Access-recording graph reads.
//!
//! Derived computations read the graph through this wrapper so the engine
//! learns which (element, property) pairs each derived value depends on.
//! The recorded set becomes the value's entry in the access log; the next
//! change to any recorded pair invalidates exactly that value.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use crate::graph::{GraphBackend, GraphError, NodeId, PropertyValue};
use crate::sync::{
    file_uri, EDGE_LABEL_FILE, FILE_PATH_PROPERTY, FILE_REPOSITORY_PROPERTY, PROPERTY_CONTAINMENT,
};

use super::PROPERTY_DERIVED_FLAG;

/// One recorded read.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Access {
    pub element: NodeId,
    pub property: String,
}

/// Optional traversal scope. Subtree containment wins over file scoping by
/// construction: a reader carries at most one scope.
#[derive(Debug, Clone)]
pub enum ReadScope {
    /// Only elements owned by this file (full `repo////path` identifier).
    File(String),
    /// Only elements inside the containment subtree rooted here.
    Subtree(NodeId),
}

pub struct AccessRecordingReader<'a> {
    backend: &'a dyn GraphBackend,
    scope: Option<ReadScope>,
    accesses: Mutex<Vec<Access>>,
}

impl<'a> AccessRecordingReader<'a> {
    pub fn new(backend: &'a dyn GraphBackend) -> Self {
        Self {
            backend,
            scope: None,
            accesses: Mutex::new(Vec::new()),
        }
    }

    pub fn scoped(backend: &'a dyn GraphBackend, scope: ReadScope) -> Self {
        Self {
            backend,
            scope: Some(scope),
            accesses: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, element: NodeId, property: &str) {
        self.accesses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Access {
                element,
                property: property.to_string(),
            });
    }

    /// Deduplicated reads performed so far; draining resets the log.
    pub fn take_accesses(&self) -> Vec<Access> {
        let drained = std::mem::take(
            &mut *self.accesses.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut unique: BTreeSet<Access> = BTreeSet::new();
        unique.extend(drained);
        unique.into_iter().collect()
    }

    /// Recorded read of an attribute slot.
    pub fn attribute(
        &self,
        element: NodeId,
        name: &str,
    ) -> Result<Option<PropertyValue>, GraphError> {
        self.record(element, name);
        self.backend.node_property(element, name)
    }

    /// Recorded read of a reference slot: target elements of the named
    /// outgoing edges, skipping derived-value edges and targets outside the
    /// scope.
    pub fn targets(&self, element: NodeId, reference: &str) -> Result<Vec<NodeId>, GraphError> {
        self.record(element, reference);
        let mut out = Vec::new();
        for edge in self.backend.outgoing(element, Some(reference))? {
            if self
                .backend
                .edge_property(edge.id, PROPERTY_DERIVED_FLAG)?
                .is_some()
            {
                continue;
            }
            if self.in_scope(edge.to)? {
                out.push(edge.to);
            }
        }
        Ok(out)
    }

    fn in_scope(&self, node: NodeId) -> Result<bool, GraphError> {
        match &self.scope {
            None => Ok(true),
            Some(ReadScope::File(uri)) => {
                for edge in self.backend.outgoing(node, Some(EDGE_LABEL_FILE))? {
                    let repository = self
                        .backend
                        .node_property(edge.to, FILE_REPOSITORY_PROPERTY)?;
                    let path = self.backend.node_property(edge.to, FILE_PATH_PROPERTY)?;
                    if let (Some(PropertyValue::Str(repository)), Some(PropertyValue::Str(path))) =
                        (repository, path)
                    {
                        if file_uri(&repository, &path) == *uri {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
            Some(ReadScope::Subtree(root)) => {
                // Walk containment edges upward.
                let mut current = node;
                let mut seen = BTreeSet::new();
                loop {
                    if current == *root {
                        return Ok(true);
                    }
                    if !seen.insert(current) {
                        return Ok(false);
                    }
                    let mut parent = None;
                    for edge in self.backend.incoming(current, None)? {
                        if self
                            .backend
                            .edge_property(edge.id, PROPERTY_CONTAINMENT)?
                            .is_some()
                        {
                            parent = Some(edge.from);
                            break;
                        }
                    }
                    match parent {
                        Some(p) => current = p,
                        None => return Ok(false),
                    }
                }
            }
        }
    }
}
