//! In-memory reference backend.
//!
//! Implements the full [`GraphBackend`] contract: transactions roll back
//! through a write-ahead undo journal, batch mode defers secondary-index
//! maintenance until exit, and the two modes are mutually exclusive.
//! Integration tests and the CLI run against this backend; persistent
//! stores plug in behind the same trait.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    escape, BackendMode, EdgeId, EdgeRef, GraphBackend, GraphError, NodeId, PropertyValue,
    Transaction, TxHandle,
};

/// Counts of applied mutations, used to verify no-op syncs stay no-ops.
/// Rollback restores are not counted; mutations later rolled back are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationCounters {
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    pub edges_created: u64,
    pub edges_deleted: u64,
    pub properties_set: u64,
    pub properties_removed: u64,
    pub index_entries_added: u64,
    pub index_entries_removed: u64,
}

impl MutationCounters {
    pub fn total(&self) -> u64 {
        self.nodes_created
            + self.nodes_deleted
            + self.edges_created
            + self.edges_deleted
            + self.properties_set
            + self.properties_removed
            + self.index_entries_added
            + self.index_entries_removed
    }
}

#[derive(Debug, Clone)]
struct NodeRecord {
    label: String,
    props: BTreeMap<String, PropertyValue>,
    out: Vec<EdgeId>,
    inc: Vec<EdgeId>,
}

#[derive(Debug, Clone)]
struct EdgeRecord {
    label: String,
    from: NodeId,
    to: NodeId,
    props: BTreeMap<String, PropertyValue>,
}

/// key -> value -> nodes.
type IndexStore = BTreeMap<String, BTreeMap<String, BTreeSet<NodeId>>>;

enum UndoOp {
    DeleteNode(NodeId),
    DeleteEdge(EdgeId),
    RestoreNode(NodeId, NodeRecord),
    RestoreEdge(EdgeId, EdgeRecord),
    RestoreNodeProp(NodeId, String, Option<PropertyValue>),
    RestoreEdgeProp(EdgeId, String, Option<PropertyValue>),
    IndexUnput {
        index: String,
        key: String,
        value: String,
        node: NodeId,
    },
    IndexReput {
        index: String,
        entries: Vec<(String, String, NodeId)>,
    },
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    nodes: BTreeMap<NodeId, NodeRecord>,
    edges: BTreeMap<EdgeId, EdgeRecord>,
    indexes: BTreeMap<String, IndexStore>,
    batch: bool,
    /// Index maintenance deferred while in batch mode.
    pending_index: Vec<(String, String, String, NodeId)>,
    journal: Option<Vec<UndoOp>>,
    counters: MutationCounters,
}

impl Inner {
    fn node(&self, id: NodeId) -> Result<&NodeRecord, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut NodeRecord, GraphError> {
        self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))
    }

    fn edge(&self, id: EdgeId) -> Result<&EdgeRecord, GraphError> {
        self.edges.get(&id).ok_or(GraphError::EdgeNotFound(id))
    }

    fn record(&mut self, op: UndoOp) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(op);
        }
    }

    fn apply_index_put(&mut self, index: &str, key: &str, value: &str, node: NodeId) -> bool {
        let store = self.indexes.entry(index.to_string()).or_default();
        store
            .entry(key.to_string())
            .or_default()
            .entry(value.to_string())
            .or_default()
            .insert(node)
    }

    fn apply_index_remove(&mut self, index: &str, key: &str, value: &str, node: NodeId) -> bool {
        let Some(store) = self.indexes.get_mut(index) else {
            return false;
        };
        let Some(by_value) = store.get_mut(key) else {
            return false;
        };
        let Some(nodes) = by_value.get_mut(value) else {
            return false;
        };
        let removed = nodes.remove(&node);
        if nodes.is_empty() {
            by_value.remove(value);
        }
        removed
    }

    fn rollback(&mut self, journal: Vec<UndoOp>) {
        for op in journal.into_iter().rev() {
            match op {
                UndoOp::DeleteNode(id) => {
                    self.nodes.remove(&id);
                }
                UndoOp::DeleteEdge(id) => {
                    if let Some(edge) = self.edges.remove(&id) {
                        if let Some(n) = self.nodes.get_mut(&edge.from) {
                            n.out.retain(|e| *e != id);
                        }
                        if let Some(n) = self.nodes.get_mut(&edge.to) {
                            n.inc.retain(|e| *e != id);
                        }
                    }
                }
                UndoOp::RestoreNode(id, rec) => {
                    self.nodes.insert(id, rec);
                }
                UndoOp::RestoreEdge(id, rec) => {
                    if let Some(n) = self.nodes.get_mut(&rec.from) {
                        n.out.push(id);
                    }
                    if let Some(n) = self.nodes.get_mut(&rec.to) {
                        n.inc.push(id);
                    }
                    self.edges.insert(id, rec);
                }
                UndoOp::RestoreNodeProp(id, key, old) => {
                    if let Some(n) = self.nodes.get_mut(&id) {
                        match old {
                            Some(v) => {
                                n.props.insert(key, v);
                            }
                            None => {
                                n.props.remove(&key);
                            }
                        }
                    }
                }
                UndoOp::RestoreEdgeProp(id, key, old) => {
                    if let Some(e) = self.edges.get_mut(&id) {
                        match old {
                            Some(v) => {
                                e.props.insert(key, v);
                            }
                            None => {
                                e.props.remove(&key);
                            }
                        }
                    }
                }
                UndoOp::IndexUnput {
                    index,
                    key,
                    value,
                    node,
                } => {
                    self.apply_index_remove(&index, &key, &value, node);
                }
                UndoOp::IndexReput { index, entries } => {
                    for (key, value, node) in entries {
                        self.apply_index_put(&index, &key, &value, node);
                    }
                }
            }
        }
    }
}

/// The in-memory store.
#[derive(Default)]
pub struct MemoryGraph {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the mutation counters.
    pub fn mutation_counters(&self) -> MutationCounters {
        self.lock().counters
    }

    /// Number of live nodes (any label).
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Number of live edges (any label).
    pub fn edge_count(&self) -> usize {
        self.lock().edges.len()
    }
}

struct MemoryTx {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTx {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TxHandle for MemoryTx {
    fn commit(&mut self) -> Result<(), GraphError> {
        let mut inner = self.lock();
        inner.journal = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), GraphError> {
        let mut inner = self.lock();
        if let Some(journal) = inner.journal.take() {
            inner.rollback(journal);
        }
        Ok(())
    }
}

impl GraphBackend for MemoryGraph {
    fn create_node(
        &self,
        properties: &[(String, PropertyValue)],
        label: &str,
    ) -> Result<NodeId, GraphError> {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let mut props = BTreeMap::new();
        for (key, value) in properties {
            props.insert(escape::escape(key), value.clone());
        }
        inner.nodes.insert(
            id,
            NodeRecord {
                label: escape::escape(label),
                props,
                out: Vec::new(),
                inc: Vec::new(),
            },
        );
        inner.counters.nodes_created += 1;
        inner.counters.properties_set += properties.len() as u64;
        inner.record(UndoOp::DeleteNode(id));
        Ok(id)
    }

    fn create_relationship(
        &self,
        from: NodeId,
        to: NodeId,
        label: &str,
        properties: &[(String, PropertyValue)],
    ) -> Result<EdgeId, GraphError> {
        let mut inner = self.lock();
        inner.node(from)?;
        inner.node(to)?;

        let id = inner.next_id;
        inner.next_id += 1;

        let mut props = BTreeMap::new();
        for (key, value) in properties {
            props.insert(escape::escape(key), value.clone());
        }
        inner.edges.insert(
            id,
            EdgeRecord {
                label: escape::escape(label),
                from,
                to,
                props,
            },
        );
        inner.node_mut(from)?.out.push(id);
        inner.node_mut(to)?.inc.push(id);
        inner.counters.edges_created += 1;
        inner.record(UndoOp::DeleteEdge(id));
        Ok(id)
    }

    fn delete_node(&self, node: NodeId) -> Result<(), GraphError> {
        let mut inner = self.lock();
        let record = inner.node(node)?;
        let attached = record.out.len() + record.inc.len();
        if attached > 0 {
            return Err(GraphError::NodeInUse {
                node,
                edges: attached,
            });
        }
        let record = inner.nodes.remove(&node).ok_or(GraphError::NodeNotFound(node))?;
        inner.counters.nodes_deleted += 1;
        inner.record(UndoOp::RestoreNode(node, record));
        Ok(())
    }

    fn delete_relationship(&self, edge: EdgeId) -> Result<(), GraphError> {
        let mut inner = self.lock();
        let record = inner.edges.remove(&edge).ok_or(GraphError::EdgeNotFound(edge))?;
        if let Some(n) = inner.nodes.get_mut(&record.from) {
            n.out.retain(|e| *e != edge);
        }
        if let Some(n) = inner.nodes.get_mut(&record.to) {
            n.inc.retain(|e| *e != edge);
        }
        inner.counters.edges_deleted += 1;
        inner.record(UndoOp::RestoreEdge(edge, record));
        Ok(())
    }

    fn node_exists(&self, node: NodeId) -> bool {
        self.lock().nodes.contains_key(&node)
    }

    fn node_label(&self, node: NodeId) -> Result<String, GraphError> {
        Ok(escape::unescape(&self.lock().node(node)?.label))
    }

    fn node_property(&self, node: NodeId, key: &str) -> Result<Option<PropertyValue>, GraphError> {
        let inner = self.lock();
        Ok(inner.node(node)?.props.get(&escape::escape(key)).cloned())
    }

    fn set_node_property(
        &self,
        node: NodeId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), GraphError> {
        let mut inner = self.lock();
        let stored_key = escape::escape(key);
        let old = inner.node_mut(node)?.props.insert(stored_key.clone(), value);
        inner.counters.properties_set += 1;
        inner.record(UndoOp::RestoreNodeProp(node, stored_key, old));
        Ok(())
    }

    fn remove_node_property(&self, node: NodeId, key: &str) -> Result<(), GraphError> {
        let mut inner = self.lock();
        let stored_key = escape::escape(key);
        let old = inner.node_mut(node)?.props.remove(&stored_key);
        if let Some(old) = old {
            inner.counters.properties_removed += 1;
            inner.record(UndoOp::RestoreNodeProp(node, stored_key, Some(old)));
        }
        Ok(())
    }

    fn node_property_keys(&self, node: NodeId) -> Result<Vec<String>, GraphError> {
        let inner = self.lock();
        Ok(inner
            .node(node)?
            .props
            .keys()
            .map(|k| escape::unescape(k))
            .collect())
    }

    fn outgoing(&self, node: NodeId, label: Option<&str>) -> Result<Vec<EdgeRef>, GraphError> {
        let inner = self.lock();
        let wanted = label.map(escape::escape);
        let mut result = Vec::new();
        for id in &inner.node(node)?.out {
            let edge = inner.edge(*id)?;
            if wanted.as_deref().map_or(true, |w| w == edge.label) {
                result.push(EdgeRef {
                    id: *id,
                    label: escape::unescape(&edge.label),
                    from: edge.from,
                    to: edge.to,
                });
            }
        }
        Ok(result)
    }

    fn incoming(&self, node: NodeId, label: Option<&str>) -> Result<Vec<EdgeRef>, GraphError> {
        let inner = self.lock();
        let wanted = label.map(escape::escape);
        let mut result = Vec::new();
        for id in &inner.node(node)?.inc {
            let edge = inner.edge(*id)?;
            if wanted.as_deref().map_or(true, |w| w == edge.label) {
                result.push(EdgeRef {
                    id: *id,
                    label: escape::unescape(&edge.label),
                    from: edge.from,
                    to: edge.to,
                });
            }
        }
        Ok(result)
    }

    fn edge_property(&self, edge: EdgeId, key: &str) -> Result<Option<PropertyValue>, GraphError> {
        let inner = self.lock();
        Ok(inner.edge(edge)?.props.get(&escape::escape(key)).cloned())
    }

    fn set_edge_property(
        &self,
        edge: EdgeId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), GraphError> {
        let mut inner = self.lock();
        let stored_key = escape::escape(key);
        let record = inner.edges.get_mut(&edge).ok_or(GraphError::EdgeNotFound(edge))?;
        let old = record.props.insert(stored_key.clone(), value);
        inner.counters.properties_set += 1;
        inner.record(UndoOp::RestoreEdgeProp(edge, stored_key, old));
        Ok(())
    }

    fn all_nodes(&self, label: Option<&str>) -> Result<Vec<NodeId>, GraphError> {
        let inner = self.lock();
        let wanted = label.map(escape::escape);
        Ok(inner
            .nodes
            .iter()
            .filter(|(_, n)| wanted.as_deref().map_or(true, |w| w == n.label))
            .map(|(id, _)| *id)
            .collect())
    }

    fn begin_transaction(&self) -> Result<Transaction, GraphError> {
        let mut inner = self.lock();
        if inner.batch {
            return Err(GraphError::BatchModeActive);
        }
        if inner.journal.is_some() {
            return Err(GraphError::TransactionOpen);
        }
        inner.journal = Some(Vec::new());
        Ok(Transaction::new(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
        })))
    }

    fn mode(&self) -> BackendMode {
        if self.lock().batch {
            BackendMode::Batch
        } else {
            BackendMode::Transactional
        }
    }

    fn enter_batch_mode(&self) -> Result<(), GraphError> {
        let mut inner = self.lock();
        if inner.journal.is_some() {
            return Err(GraphError::TransactionActive);
        }
        inner.batch = true;
        Ok(())
    }

    fn exit_batch_mode(&self) -> Result<(), GraphError> {
        let mut inner = self.lock();
        if !inner.batch {
            return Err(GraphError::NotInBatchMode);
        }
        let pending = std::mem::take(&mut inner.pending_index);
        for (index, key, value, node) in pending {
            if inner.apply_index_put(&index, &key, &value, node) {
                inner.counters.index_entries_added += 1;
            }
        }
        inner.batch = false;
        Ok(())
    }

    fn get_or_create_index(&self, name: &str) -> Result<(), GraphError> {
        let mut inner = self.lock();
        inner.indexes.entry(escape::escape(name)).or_default();
        Ok(())
    }

    fn index_exists(&self, name: &str) -> bool {
        self.lock().indexes.contains_key(&escape::escape(name))
    }

    fn index_names(&self) -> Vec<String> {
        self.lock()
            .indexes
            .keys()
            .map(|k| escape::unescape(k))
            .collect()
    }

    fn index_put(
        &self,
        index: &str,
        key: &str,
        value: &str,
        node: NodeId,
    ) -> Result<(), GraphError> {
        let mut inner = self.lock();
        let name = escape::escape(index);
        if !inner.indexes.contains_key(&name) {
            return Err(GraphError::IndexNotFound(index.to_string()));
        }
        if inner.batch {
            // Deferred until exit_batch_mode.
            inner
                .pending_index
                .push((name, key.to_string(), value.to_string(), node));
            return Ok(());
        }
        if inner.apply_index_put(&name, key, value, node) {
            inner.counters.index_entries_added += 1;
            inner.record(UndoOp::IndexUnput {
                index: name,
                key: key.to_string(),
                value: value.to_string(),
                node,
            });
        }
        Ok(())
    }

    fn index_remove(
        &self,
        index: &str,
        key: &str,
        value: &str,
        node: NodeId,
    ) -> Result<(), GraphError> {
        let mut inner = self.lock();
        let name = escape::escape(index);
        if inner.apply_index_remove(&name, key, value, node) {
            inner.counters.index_entries_removed += 1;
            inner.record(UndoOp::IndexReput {
                index: name,
                entries: vec![(key.to_string(), value.to_string(), node)],
            });
        }
        Ok(())
    }

    fn index_remove_node(&self, index: &str, node: NodeId) -> Result<(), GraphError> {
        let mut inner = self.lock();
        let name = escape::escape(index);
        let Some(store) = inner.indexes.get_mut(&name) else {
            return Ok(());
        };
        let mut removed = Vec::new();
        for (key, by_value) in store.iter_mut() {
            let mut emptied = Vec::new();
            for (value, nodes) in by_value.iter_mut() {
                if nodes.remove(&node) {
                    removed.push((key.clone(), value.clone(), node));
                    if nodes.is_empty() {
                        emptied.push(value.clone());
                    }
                }
            }
            for value in emptied {
                by_value.remove(&value);
            }
        }
        if !removed.is_empty() {
            inner.counters.index_entries_removed += removed.len() as u64;
            inner.record(UndoOp::IndexReput {
                index: name,
                entries: removed,
            });
        }
        Ok(())
    }

    fn index_get(&self, index: &str, key: &str, value: &str) -> Result<Vec<NodeId>, GraphError> {
        let inner = self.lock();
        let name = escape::escape(index);
        let store = inner
            .indexes
            .get(&name)
            .ok_or_else(|| GraphError::IndexNotFound(index.to_string()))?;
        Ok(store
            .get(key)
            .and_then(|by_value| by_value.get(value))
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default())
    }

    fn index_query(
        &self,
        index: &str,
        key: &str,
        value_pattern: &str,
    ) -> Result<Vec<NodeId>, GraphError> {
        let inner = self.lock();
        let name = escape::escape(index);
        let store = inner
            .indexes
            .get(&name)
            .ok_or_else(|| GraphError::IndexNotFound(index.to_string()))?;
        let Some(by_value) = store.get(key) else {
            return Ok(Vec::new());
        };

        let mut out = BTreeSet::new();
        if value_pattern == "*" {
            for nodes in by_value.values() {
                out.extend(nodes.iter().copied());
            }
        } else if let Some(prefix) = value_pattern.strip_suffix('*') {
            for (value, nodes) in by_value.iter() {
                if value.starts_with(prefix) {
                    out.extend(nodes.iter().copied());
                }
            }
        } else if let Some(nodes) = by_value.get(value_pattern) {
            out.extend(nodes.iter().copied());
        }
        Ok(out.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, PropertyValue)]) -> Vec<(String, PropertyValue)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_create_and_read_node() {
        let g = MemoryGraph::new();
        let n = g
            .create_node(&props(&[("name", "t1".into())]), "element")
            .unwrap();

        assert!(g.node_exists(n));
        assert_eq!(g.node_label(n).unwrap(), "element");
        assert_eq!(g.node_property(n, "name").unwrap(), Some("t1".into()));
        assert_eq!(g.node_property(n, "missing").unwrap(), None);
    }

    #[test]
    fn test_reserved_property_keys_round_trip() {
        let g = MemoryGraph::new();
        let n = g.create_node(&[], "element").unwrap();
        g.set_node_property(n, "ns.uri:inner key", PropertyValue::Int(5))
            .unwrap();

        assert_eq!(
            g.node_property(n, "ns.uri:inner key").unwrap(),
            Some(PropertyValue::Int(5))
        );
        assert_eq!(
            g.node_property_keys(n).unwrap(),
            vec!["ns.uri:inner key".to_string()]
        );
    }

    #[test]
    fn test_rollback_on_drop() {
        let g = MemoryGraph::new();
        let keep = g.create_node(&[], "element").unwrap();

        {
            let tx = g.begin_transaction().unwrap();
            let n = g.create_node(&[], "element").unwrap();
            g.create_relationship(keep, n, "children", &[]).unwrap();
            g.set_node_property(keep, "label", "x".into()).unwrap();
            drop(tx);
        }

        assert_eq!(g.node_count(), 1);
        assert_eq!(g.edge_count(), 0);
        assert_eq!(g.node_property(keep, "label").unwrap(), None);
    }

    #[test]
    fn test_commit_keeps_mutations() {
        let g = MemoryGraph::new();
        let tx = g.begin_transaction().unwrap();
        let a = g.create_node(&[], "element").unwrap();
        let b = g.create_node(&[], "element").unwrap();
        g.create_relationship(a, b, "children", &[]).unwrap();
        tx.success().unwrap();

        assert_eq!(g.node_count(), 2);
        assert_eq!(g.outgoing(a, Some("children")).unwrap().len(), 1);
        assert_eq!(g.incoming(b, Some("children")).unwrap().len(), 1);
    }

    #[test]
    fn test_rollback_restores_deleted() {
        let g = MemoryGraph::new();
        let a = g.create_node(&props(&[("label", "a".into())]), "element").unwrap();
        let b = g.create_node(&[], "element").unwrap();
        let e = g.create_relationship(a, b, "children", &[]).unwrap();

        let tx = g.begin_transaction().unwrap();
        g.delete_relationship(e).unwrap();
        g.delete_node(b).unwrap();
        tx.failure().unwrap();

        assert!(g.node_exists(b));
        assert_eq!(g.outgoing(a, Some("children")).unwrap().len(), 1);
        assert_eq!(g.node_property(a, "label").unwrap(), Some("a".into()));
    }

    #[test]
    fn test_delete_node_with_edges_is_rejected() {
        let g = MemoryGraph::new();
        let a = g.create_node(&[], "element").unwrap();
        let b = g.create_node(&[], "element").unwrap();
        g.create_relationship(a, b, "children", &[]).unwrap();

        match g.delete_node(a) {
            Err(GraphError::NodeInUse { edges, .. }) => assert_eq!(edges, 1),
            other => panic!("expected NodeInUse, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_mode_exclusion() {
        let g = MemoryGraph::new();

        let tx = g.begin_transaction().unwrap();
        assert!(matches!(
            g.enter_batch_mode(),
            Err(GraphError::TransactionActive)
        ));
        tx.success().unwrap();

        g.enter_batch_mode().unwrap();
        assert_eq!(g.mode(), BackendMode::Batch);
        assert!(matches!(
            g.begin_transaction(),
            Err(GraphError::BatchModeActive)
        ));
        g.exit_batch_mode().unwrap();
        assert_eq!(g.mode(), BackendMode::Transactional);
        assert!(matches!(g.exit_batch_mode(), Err(GraphError::NotInBatchMode)));
    }

    #[test]
    fn test_batch_mode_defers_index_entries() {
        let g = MemoryGraph::new();
        g.get_or_create_index("files").unwrap();
        let n = g.create_node(&[], "file").unwrap();

        g.enter_batch_mode().unwrap();
        g.index_put("files", "id", "repo////a.model", n).unwrap();
        // Not visible until the batch is flushed.
        assert!(g.index_get("files", "id", "repo////a.model").unwrap().is_empty());
        g.exit_batch_mode().unwrap();

        assert_eq!(
            g.index_get("files", "id", "repo////a.model").unwrap(),
            vec![n]
        );
    }

    #[test]
    fn test_index_wildcard_queries() {
        let g = MemoryGraph::new();
        g.get_or_create_index("files").unwrap();
        let a = g.create_node(&[], "file").unwrap();
        let b = g.create_node(&[], "file").unwrap();
        let c = g.create_node(&[], "file").unwrap();
        g.index_put("files", "id", "repo1////a.model", a).unwrap();
        g.index_put("files", "id", "repo1////b.model", b).unwrap();
        g.index_put("files", "id", "repo2////c.model", c).unwrap();

        assert_eq!(g.index_query("files", "id", "*").unwrap().len(), 3);
        assert_eq!(
            g.index_query("files", "id", "repo1////*").unwrap(),
            vec![a, b]
        );
        assert_eq!(
            g.index_query("files", "id", "repo2////c.model").unwrap(),
            vec![c]
        );
    }

    #[test]
    fn test_index_remove_node_clears_all_entries() {
        let g = MemoryGraph::new();
        g.get_or_create_index("accesses").unwrap();
        let d = g.create_node(&[], "derived").unwrap();
        g.index_put("accesses", "7", "children", d).unwrap();
        g.index_put("accesses", "9", "label", d).unwrap();

        g.index_remove_node("accesses", d).unwrap();
        assert!(g.index_query("accesses", "7", "*").unwrap().is_empty());
        assert!(g.index_query("accesses", "9", "*").unwrap().is_empty());
    }

    #[test]
    fn test_index_rollback() {
        let g = MemoryGraph::new();
        g.get_or_create_index("roots").unwrap();
        let n = g.create_node(&[], "element").unwrap();
        g.index_put("roots", "repo////f.model", "t1", n).unwrap();

        let tx = g.begin_transaction().unwrap();
        g.index_remove("roots", "repo////f.model", "t1", n).unwrap();
        g.index_put("roots", "repo////f.model", "t2", n).unwrap();
        drop(tx);

        assert_eq!(g.index_get("roots", "repo////f.model", "t1").unwrap(), vec![n]);
        assert!(g.index_get("roots", "repo////f.model", "t2").unwrap().is_empty());
    }

    #[test]
    fn test_mutation_counters() {
        let g = MemoryGraph::new();
        let before = g.mutation_counters();
        let a = g.create_node(&props(&[("x", PropertyValue::Int(1))]), "element").unwrap();
        let b = g.create_node(&[], "element").unwrap();
        g.create_relationship(a, b, "children", &[]).unwrap();
        let after = g.mutation_counters();

        assert_eq!(after.nodes_created - before.nodes_created, 2);
        assert_eq!(after.edges_created - before.edges_created, 1);
        assert_eq!(after.properties_set - before.properties_set, 1);
    }
}
