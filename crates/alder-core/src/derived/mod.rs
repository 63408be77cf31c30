//! Derived attribute engine.
//!
//! A derived value lives in its own graph node, linked from its element by
//! an edge labelled with the attribute name and flagged `isDerived`. The
//! value is recomputed when the access log says one of its recorded reads
//! was touched by a committed change; until then a `_NYD##` marker stands
//! in for the value and queries report it as pending.

mod access;
mod language;
mod path;

pub use access::{Access, AccessRecordingReader, ReadScope};
pub use language::{Evaluated, ExpressionError, ExpressionLanguage};
pub use path::{PathLanguage, PATH_LANGUAGE_ID};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::events::{ChangeEvent, ChangeListener, ListenerError};
use crate::graph::{GraphBackend, GraphError, NodeId, PropertyValue};
use crate::metamodel::{DerivedSpec, MetamodelRegistry};
use crate::model::TypeRef;

/// Derived-value nodes pending their first computation.
pub const INDEX_DERIVED_PROXIES: &str = "derived-proxies";
/// Access log: (element id, property name) -> derived-value nodes.
pub const INDEX_DERIVED_ACCESSES: &str = "derived-accesses";
pub const NODE_LABEL_DERIVED: &str = "derived";
/// Edges from a derived-value node to the elements it evaluates to.
pub const EDGE_LABEL_DERIVED_TARGET: &str = "derivedTarget";
/// Flag on element -> derived-value edges.
pub const PROPERTY_DERIVED_FLAG: &str = "isDerived";
/// Prefix of the marker standing in for a not-yet-computed value.
pub const PENDING_MARKER_PREFIX: &str = "_NYD##";

const ATTRIBUTE_PROPERTY: &str = "attribute";
const LANGUAGE_PROPERTY: &str = "language";
const EXPRESSION_PROPERTY: &str = "expression";
const INDEXED_PROPERTY: &str = "indexed";
const IS_MANY_PROPERTY: &str = "isMany";
const INDEX_NAME_PROPERTY: &str = "indexName";
const PENDING_KEY: &str = "derived";
const WILDCARD_PROPERTY: &str = "*";

pub(crate) const LISTENER_NAME: &str = "derived-invalidation";

#[derive(Default)]
struct EventBuffer {
    /// Events of the currently open change envelope.
    staged: Vec<(NodeId, String)>,
    /// Events of committed envelopes, awaiting invalidation processing.
    committed: Vec<(NodeId, String)>,
}

pub struct DerivedEngine {
    backend: Arc<dyn GraphBackend>,
    languages: RwLock<BTreeMap<String, Arc<dyn ExpressionLanguage>>>,
    buffer: Mutex<EventBuffer>,
}

impl DerivedEngine {
    pub fn new(backend: Arc<dyn GraphBackend>) -> Self {
        Self {
            backend,
            languages: RwLock::new(BTreeMap::new()),
            buffer: Mutex::new(EventBuffer::default()),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, EventBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ensure_indexes(&self) -> Result<(), GraphError> {
        self.backend.get_or_create_index(INDEX_DERIVED_PROXIES)?;
        self.backend.get_or_create_index(INDEX_DERIVED_ACCESSES)?;
        Ok(())
    }

    pub fn add_language(&self, language: Arc<dyn ExpressionLanguage>) {
        self.languages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(language.id().to_string(), language);
    }

    pub fn language(&self, id: &str) -> Option<Arc<dyn ExpressionLanguage>> {
        self.languages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Creates the pending derived-value node for one (element, spec) pair
    /// and registers it for first computation. Participates in the caller's
    /// transaction or batch.
    pub fn seed(
        &self,
        element: NodeId,
        type_ref: &TypeRef,
        spec: &DerivedSpec,
    ) -> Result<NodeId, GraphError> {
        let marker = format!("{}{}", PENDING_MARKER_PREFIX, spec.expression);
        let mut props = vec![
            (
                ATTRIBUTE_PROPERTY.to_string(),
                spec.attribute.as_str().into(),
            ),
            (LANGUAGE_PROPERTY.to_string(), spec.language.as_str().into()),
            (
                EXPRESSION_PROPERTY.to_string(),
                spec.expression.as_str().into(),
            ),
            (INDEXED_PROPERTY.to_string(), spec.indexed.into()),
            (spec.attribute.clone(), PropertyValue::Str(marker)),
        ];
        if spec.indexed {
            props.push((
                INDEX_NAME_PROPERTY.to_string(),
                MetamodelRegistry::attribute_index_name(type_ref, &spec.attribute).into(),
            ));
        }
        let derived = self.backend.create_node(&props, NODE_LABEL_DERIVED)?;
        self.backend.create_relationship(
            element,
            derived,
            &spec.attribute,
            &[(PROPERTY_DERIVED_FLAG.to_string(), true.into())],
        )?;
        self.backend
            .index_put(INDEX_DERIVED_PROXIES, PENDING_KEY, &spec.language, derived)?;
        Ok(derived)
    }

    /// Evaluates one derived value and rewrites its access log. Returns
    /// `false` (leaving the pending marker in place) when evaluation fails;
    /// the failure is logged, never propagated.
    fn compute_one(&self, derived: NodeId) -> Result<bool, GraphError> {
        let Some(PropertyValue::Str(attribute)) =
            self.backend.node_property(derived, ATTRIBUTE_PROPERTY)?
        else {
            return Ok(false);
        };
        let Some(PropertyValue::Str(language_id)) =
            self.backend.node_property(derived, LANGUAGE_PROPERTY)?
        else {
            return Ok(false);
        };
        let Some(PropertyValue::Str(expression)) =
            self.backend.node_property(derived, EXPRESSION_PROPERTY)?
        else {
            return Ok(false);
        };

        let Some(owner) = self
            .backend
            .incoming(derived, Some(&attribute))?
            .first()
            .map(|e| e.from)
        else {
            warn!(derived, %attribute, "derived value has no owning element");
            return Ok(false);
        };
        let Some(language) = self.language(&language_id) else {
            warn!(language = %language_id, %attribute, "expression language not registered");
            return Ok(false);
        };

        let reader = AccessRecordingReader::new(self.backend.as_ref());
        let result = match language.evaluate(&expression, owner, &reader) {
            Ok(result) => result,
            Err(err) => {
                warn!(%attribute, element = owner, %err, "derived computation failed");
                return Ok(false);
            }
        };

        // Rewrite the access log with the fresh read set.
        self.backend.index_remove_node(INDEX_DERIVED_ACCESSES, derived)?;
        for access in reader.take_accesses() {
            self.backend.index_put(
                INDEX_DERIVED_ACCESSES,
                &access.element.to_string(),
                &access.property,
                derived,
            )?;
        }

        for edge in self.backend.outgoing(derived, Some(EDGE_LABEL_DERIVED_TARGET))? {
            self.backend.delete_relationship(edge.id)?;
        }

        let value = match result {
            Evaluated::Value(value) => {
                self.backend
                    .set_node_property(derived, IS_MANY_PROPERTY, false.into())?;
                value
            }
            Evaluated::Elements(targets) => {
                self.backend
                    .set_node_property(derived, IS_MANY_PROPERTY, true.into())?;
                for target in &targets {
                    self.backend.create_relationship(
                        derived,
                        *target,
                        EDGE_LABEL_DERIVED_TARGET,
                        &[],
                    )?;
                }
                PropertyValue::Int(targets.len() as i64)
            }
        };
        self.backend
            .set_node_property(derived, &attribute, value.clone())?;

        if let Some(PropertyValue::Str(index_name)) =
            self.backend.node_property(derived, INDEX_NAME_PROPERTY)?
        {
            self.backend.get_or_create_index(&index_name)?;
            self.backend.index_remove_node(&index_name, owner)?;
            self.backend
                .index_put(&index_name, &attribute, &value.display(), owner)?;
        }

        self.backend.index_remove_node(INDEX_DERIVED_PROXIES, derived)?;
        Ok(true)
    }

    /// First-time computation of every pending derived value. Returns how
    /// many were computed.
    pub fn process_pending(&self) -> Result<usize, GraphError> {
        let pending = self
            .backend
            .index_query(INDEX_DERIVED_PROXIES, PENDING_KEY, "*")?;
        if pending.is_empty() {
            return Ok(0);
        }

        let tx = self.backend.begin_transaction()?;
        let mut computed = 0;
        for derived in pending {
            if !self.backend.node_exists(derived) {
                self.backend.index_remove_node(INDEX_DERIVED_PROXIES, derived)?;
                continue;
            }
            if self.compute_one(derived)? {
                computed += 1;
            }
        }
        tx.success()?;

        if computed > 0 {
            debug!(computed, "computed pending derived values");
        }
        Ok(computed)
    }

    /// Recomputes the derived values invalidated by the committed events
    /// buffered since the last call. Returns how many were recomputed.
    pub fn process_invalidations(&self) -> Result<usize, GraphError> {
        let committed = std::mem::take(&mut self.buffer().committed);
        if committed.is_empty() {
            return Ok(0);
        }

        let mut invalidated: BTreeSet<NodeId> = BTreeSet::new();
        for (element, property) in &committed {
            let hits = if property == WILDCARD_PROPERTY {
                self.backend
                    .index_query(INDEX_DERIVED_ACCESSES, &element.to_string(), "*")?
            } else {
                self.backend
                    .index_get(INDEX_DERIVED_ACCESSES, &element.to_string(), property)?
            };
            invalidated.extend(hits);
        }
        invalidated.retain(|derived| self.backend.node_exists(*derived));
        if invalidated.is_empty() {
            return Ok(0);
        }

        let tx = self.backend.begin_transaction()?;
        for derived in &invalidated {
            if let (Some(PropertyValue::Str(attribute)), Some(PropertyValue::Str(expression))) = (
                self.backend.node_property(*derived, ATTRIBUTE_PROPERTY)?,
                self.backend.node_property(*derived, EXPRESSION_PROPERTY)?,
            ) {
                self.backend.set_node_property(
                    *derived,
                    &attribute,
                    PropertyValue::Str(format!("{}{}", PENDING_MARKER_PREFIX, expression)),
                )?;
            }
        }
        let mut recomputed = 0;
        for derived in &invalidated {
            if self.compute_one(*derived)? {
                recomputed += 1;
            }
        }
        tx.success()?;

        debug!(recomputed, "recomputed invalidated derived values");
        Ok(recomputed)
    }

    /// Derived-value node of `(element, attribute)`, if registered.
    pub fn derived_node(
        &self,
        element: NodeId,
        attribute: &str,
    ) -> Result<Option<NodeId>, GraphError> {
        for edge in self.backend.outgoing(element, Some(attribute))? {
            if self
                .backend
                .edge_property(edge.id, PROPERTY_DERIVED_FLAG)?
                .is_some()
            {
                return Ok(Some(edge.to));
            }
        }
        Ok(None)
    }

    /// Current value; `None` while pending (re)computation or unregistered.
    pub fn value_of(
        &self,
        element: NodeId,
        attribute: &str,
    ) -> Result<Option<PropertyValue>, GraphError> {
        let Some(derived) = self.derived_node(element, attribute)? else {
            return Ok(None);
        };
        match self.backend.node_property(derived, attribute)? {
            Some(PropertyValue::Str(s)) if s.starts_with(PENDING_MARKER_PREFIX) => Ok(None),
            other => Ok(other),
        }
    }

    /// Element targets of a many-valued derived attribute, in evaluation
    /// order.
    pub fn targets_of(&self, element: NodeId, attribute: &str) -> Result<Vec<NodeId>, GraphError> {
        let Some(derived) = self.derived_node(element, attribute)? else {
            return Ok(Vec::new());
        };
        Ok(self
            .backend
            .outgoing(derived, Some(EDGE_LABEL_DERIVED_TARGET))?
            .into_iter()
            .map(|e| e.to)
            .collect())
    }

    /// Elements whose derived attribute `attribute` contains `target`,
    /// nearest first (ascending target count).
    pub fn reverse_of(&self, attribute: &str, target: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let mut owners: Vec<(i64, NodeId)> = Vec::new();
        for edge in self.backend.incoming(target, Some(EDGE_LABEL_DERIVED_TARGET))? {
            let derived = edge.from;
            match self.backend.node_property(derived, ATTRIBUTE_PROPERTY)? {
                Some(PropertyValue::Str(name)) if name == attribute => {}
                _ => continue,
            }
            let count = match self.backend.node_property(derived, attribute)? {
                Some(PropertyValue::Int(count)) => count,
                _ => i64::MAX,
            };
            if let Some(owner_edge) = self.backend.incoming(derived, Some(attribute))?.first() {
                owners.push((count, owner_edge.from));
            }
        }
        owners.sort();
        Ok(owners.into_iter().map(|(_, owner)| owner).collect())
    }
}

impl ChangeListener for DerivedEngine {
    fn name(&self) -> &str {
        LISTENER_NAME
    }

    fn on_event(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
        let mut buffer = self.buffer();
        match event {
            ChangeEvent::ChangeStart { .. } => buffer.staged.clear(),
            ChangeEvent::ChangeSuccess { .. } => {
                let staged = std::mem::take(&mut buffer.staged);
                buffer.committed.extend(staged);
            }
            ChangeEvent::ChangeFailure { .. } => buffer.staged.clear(),
            ChangeEvent::ElementAdded {
                element,
                transient: false,
            }
            | ChangeEvent::ElementRemoved {
                element,
                transient: false,
            } => buffer
                .staged
                .push((*element, WILDCARD_PROPERTY.to_string())),
            ChangeEvent::AttributeUpdated {
                element,
                name,
                transient: false,
            }
            | ChangeEvent::AttributeRemoved {
                element,
                name,
                transient: false,
            } => buffer.staged.push((*element, name.clone())),
            ChangeEvent::ReferenceAdded {
                source,
                label,
                transient: false,
                ..
            }
            | ChangeEvent::ReferenceRemoved {
                source,
                label,
                transient: false,
                ..
            } => buffer.staged.push((*source, label.clone())),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::sync::PROPERTY_CONTAINMENT;

    const MM: &str = "http://example.org/tree";

    fn spec(attribute: &str, expression: &str) -> DerivedSpec {
        DerivedSpec {
            attribute: attribute.to_string(),
            language: PATH_LANGUAGE_ID.to_string(),
            expression: expression.to_string(),
            indexed: false,
        }
    }

    fn engine(backend: &Arc<MemoryGraph>) -> DerivedEngine {
        let engine = DerivedEngine::new(backend.clone() as Arc<dyn GraphBackend>);
        engine.ensure_indexes().unwrap();
        engine.add_language(Arc::new(PathLanguage::new()));
        engine
    }

    fn link(g: &MemoryGraph, from: NodeId, to: NodeId) {
        g.create_relationship(
            from,
            to,
            "children",
            &[(PROPERTY_CONTAINMENT.to_string(), true.into())],
        )
        .unwrap();
    }

    #[test]
    fn test_seed_then_process_pending() {
        let backend = Arc::new(MemoryGraph::new());
        let engine = engine(&backend);
        let tree = TypeRef::new(MM, "Tree");

        let a = backend.create_node(&[], "element").unwrap();
        let b = backend.create_node(&[], "element").unwrap();
        link(&backend, a, b);

        let count = spec("descendantCount", "size(closure(children))");
        engine.seed(a, &tree, &count).unwrap();
        engine.seed(b, &tree, &count).unwrap();

        // Pending until processed.
        assert_eq!(engine.value_of(a, "descendantCount").unwrap(), None);

        assert_eq!(engine.process_pending().unwrap(), 2);
        assert_eq!(
            engine.value_of(a, "descendantCount").unwrap(),
            Some(PropertyValue::Int(1))
        );
        assert_eq!(
            engine.value_of(b, "descendantCount").unwrap(),
            Some(PropertyValue::Int(0))
        );
        // Nothing left pending.
        assert_eq!(engine.process_pending().unwrap(), 0);
    }

    #[test]
    fn test_invalidation_recomputes_dependent_values_only() {
        let backend = Arc::new(MemoryGraph::new());
        let engine = engine(&backend);
        let tree = TypeRef::new(MM, "Tree");

        let a = backend.create_node(&[], "element").unwrap();
        let b = backend.create_node(&[], "element").unwrap();
        let lone = backend.create_node(&[], "element").unwrap();
        link(&backend, a, b);

        let count = spec("descendantCount", "size(closure(children))");
        for element in [a, b, lone] {
            engine.seed(element, &tree, &count).unwrap();
        }
        engine.process_pending().unwrap();

        // A new child under b, reported through the listener interface.
        let c = backend.create_node(&[], "element").unwrap();
        link(&backend, b, c);
        engine
            .on_event(&ChangeEvent::ChangeStart {
                file: "f".to_string(),
            })
            .unwrap();
        engine
            .on_event(&ChangeEvent::ReferenceAdded {
                source: b,
                target: c,
                label: "children".to_string(),
                transient: false,
            })
            .unwrap();
        engine
            .on_event(&ChangeEvent::ChangeSuccess {
                file: "f".to_string(),
            })
            .unwrap();

        // Only the ancestor chain of the change recomputes: a and b read
        // (b, children); lone did not.
        assert_eq!(engine.process_invalidations().unwrap(), 2);
        assert_eq!(
            engine.value_of(a, "descendantCount").unwrap(),
            Some(PropertyValue::Int(2))
        );
        assert_eq!(
            engine.value_of(b, "descendantCount").unwrap(),
            Some(PropertyValue::Int(1))
        );
        assert_eq!(
            engine.value_of(lone, "descendantCount").unwrap(),
            Some(PropertyValue::Int(0))
        );
    }

    #[test]
    fn test_change_failure_discards_staged_events() {
        let backend = Arc::new(MemoryGraph::new());
        let engine = engine(&backend);
        let tree = TypeRef::new(MM, "Tree");

        let a = backend.create_node(&[], "element").unwrap();
        engine
            .seed(a, &tree, &spec("descendantCount", "size(closure(children))"))
            .unwrap();
        engine.process_pending().unwrap();

        engine
            .on_event(&ChangeEvent::ChangeStart {
                file: "f".to_string(),
            })
            .unwrap();
        engine
            .on_event(&ChangeEvent::ReferenceAdded {
                source: a,
                target: a,
                label: "children".to_string(),
                transient: false,
            })
            .unwrap();
        engine
            .on_event(&ChangeEvent::ChangeFailure {
                file: "f".to_string(),
            })
            .unwrap();

        assert_eq!(engine.process_invalidations().unwrap(), 0);
    }

    #[test]
    fn test_transient_events_are_ignored() {
        let backend = Arc::new(MemoryGraph::new());
        let engine = engine(&backend);

        engine
            .on_event(&ChangeEvent::ChangeStart {
                file: "f".to_string(),
            })
            .unwrap();
        engine
            .on_event(&ChangeEvent::ElementAdded {
                element: 7,
                transient: true,
            })
            .unwrap();
        engine
            .on_event(&ChangeEvent::ChangeSuccess {
                file: "f".to_string(),
            })
            .unwrap();

        assert_eq!(engine.process_invalidations().unwrap(), 0);
    }

    #[test]
    fn test_reverse_navigation_nearest_first() {
        let backend = Arc::new(MemoryGraph::new());
        let engine = engine(&backend);
        let tree = TypeRef::new(MM, "Tree");

        // t6 contains t3 and t5; t3 contains t4.
        let t6 = backend.create_node(&[], "element").unwrap();
        let t3 = backend.create_node(&[], "element").unwrap();
        let t5 = backend.create_node(&[], "element").unwrap();
        let t4 = backend.create_node(&[], "element").unwrap();
        link(&backend, t6, t3);
        link(&backend, t6, t5);
        link(&backend, t3, t4);

        let descendants = spec("descendants", "closure(children)");
        for element in [t6, t3, t5, t4] {
            engine.seed(element, &tree, &descendants).unwrap();
        }
        engine.process_pending().unwrap();

        assert_eq!(engine.targets_of(t3, "descendants").unwrap(), vec![t4]);
        assert_eq!(engine.reverse_of("descendants", t4).unwrap(), vec![t3, t6]);
    }

    #[test]
    fn test_failed_computation_stays_pending() {
        let backend = Arc::new(MemoryGraph::new());
        let engine = engine(&backend);
        let tree = TypeRef::new(MM, "Tree");

        let a = backend.create_node(&[], "element").unwrap();
        engine
            .seed(
                a,
                &tree,
                &DerivedSpec {
                    attribute: "broken".to_string(),
                    language: "no-such-language".to_string(),
                    expression: "self.x".to_string(),
                    indexed: false,
                },
            )
            .unwrap();

        assert_eq!(engine.process_pending().unwrap(), 0);
        assert_eq!(engine.value_of(a, "broken").unwrap(), None);
    }
}
