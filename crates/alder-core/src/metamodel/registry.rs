//! Graph-persisted metamodel registry.
//!
//! Registration writes metamodel and type nodes plus a textual snapshot of
//! each descriptor into the graph; [`MetamodelRegistry::restore`] rebuilds
//! the in-memory lookups from those snapshots on restart, without the
//! original metamodel sources. All fast-path lookups (type nodes, slots,
//! supertypes, derived specs) are served from memory.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{MetamodelDescriptor, RegistryError, SlotDescriptor};
use crate::events::{ChangeBus, ChangeEvent};
use crate::graph::{GraphBackend, NodeId, PropertyValue};
use crate::model::TypeRef;

/// Metamodel nodes keyed by URI.
pub const INDEX_METAMODELS: &str = "metamodels";

pub(crate) const NODE_LABEL_METAMODEL: &str = "metamodel";
pub(crate) const NODE_LABEL_TYPE: &str = "type";
/// Edge from a type node to its owning metamodel node.
pub(crate) const EDGE_LABEL_METAMODEL: &str = "metamodel";
pub(crate) const EDGE_LABEL_SUPERTYPE: &str = "supertype";
pub(crate) const EDGE_LABEL_DEPENDENCY: &str = "dependency";

const URI_PROPERTY: &str = "uri";
const VERSION_PROPERTY: &str = "version";
/// Holds the `dump_to_text` snapshot on the metamodel node.
const RESOURCE_PROPERTY: &str = "resource";
const NAME_PROPERTY: &str = "name";
const ABSTRACT_PROPERTY: &str = "abstract";
const INTERFACE_PROPERTY: &str = "interface";

/// Type-node marker slots; elements created later pick these up.
const DERIVED_MARKER_PREFIX: &str = "derived##";
const INDEXED_MARKER_PREFIX: &str = "indexed##";

/// A registered derived attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedSpec {
    pub attribute: String,
    pub language: String,
    pub expression: String,
    #[serde(default)]
    pub indexed: bool,
}

#[derive(Default)]
struct Inner {
    descriptors: BTreeMap<String, MetamodelDescriptor>,
    metamodel_nodes: BTreeMap<String, NodeId>,
    type_nodes: BTreeMap<TypeRef, NodeId>,
    derived: BTreeMap<TypeRef, Vec<DerivedSpec>>,
    indexed: BTreeMap<TypeRef, BTreeSet<String>>,
}

pub struct MetamodelRegistry {
    backend: Arc<dyn GraphBackend>,
    inner: RwLock<Inner>,
}

impl MetamodelRegistry {
    pub fn new(backend: Arc<dyn GraphBackend>) -> Self {
        Self {
            backend,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebuilds the in-memory lookups from the graph. Returns how many
    /// metamodels were restored.
    pub fn restore(&self) -> Result<usize, RegistryError> {
        self.backend.get_or_create_index(INDEX_METAMODELS)?;

        let mut inner = self.write();
        let mut restored = 0;
        for mm_node in self.backend.index_query(INDEX_METAMODELS, "id", "*")? {
            let Some(PropertyValue::Str(uri)) = self.backend.node_property(mm_node, URI_PROPERTY)?
            else {
                continue;
            };
            let Some(PropertyValue::Str(snapshot)) =
                self.backend.node_property(mm_node, RESOURCE_PROPERTY)?
            else {
                continue;
            };
            let descriptor: MetamodelDescriptor = serde_json::from_str(&snapshot)?;

            for edge in self.backend.incoming(mm_node, Some(EDGE_LABEL_METAMODEL))? {
                let type_node = edge.from;
                let Some(PropertyValue::Str(name)) =
                    self.backend.node_property(type_node, NAME_PROPERTY)?
                else {
                    continue;
                };
                let type_ref = TypeRef::new(uri.clone(), name);
                for key in self.backend.node_property_keys(type_node)? {
                    if let Some(attr) = key.strip_prefix(DERIVED_MARKER_PREFIX) {
                        if let Some(PropertyValue::Str(spec)) =
                            self.backend.node_property(type_node, &key)?
                        {
                            let spec: DerivedSpec = serde_json::from_str(&spec)?;
                            debug_assert_eq!(spec.attribute, attr);
                            let specs = inner.derived.entry(type_ref.clone()).or_default();
                            specs.retain(|s| s.attribute != spec.attribute);
                            specs.push(spec);
                        }
                    } else if let Some(attr) = key.strip_prefix(INDEXED_MARKER_PREFIX) {
                        inner
                            .indexed
                            .entry(type_ref.clone())
                            .or_default()
                            .insert(attr.to_string());
                    }
                }
                inner.type_nodes.insert(type_ref, type_node);
            }

            inner.metamodel_nodes.insert(uri.clone(), mm_node);
            inner.descriptors.insert(uri, descriptor);
            restored += 1;
        }

        if restored > 0 {
            info!(count = restored, "restored metamodels from graph");
        }
        Ok(restored)
    }

    /// Registers a metamodel, persisting its snapshot. Returns `false` when
    /// the URI is already registered (the duplicate is skipped). Dependencies
    /// must be registered first.
    pub fn register(
        &self,
        descriptor: MetamodelDescriptor,
        snapshot: &str,
        bus: &ChangeBus,
    ) -> Result<bool, RegistryError> {
        if self.contains(&descriptor.uri) {
            debug!(uri = %descriptor.uri, "metamodel already registered, skipping");
            return Ok(false);
        }
        for dependency in &descriptor.dependencies {
            if !self.contains(dependency) {
                return Err(RegistryError::MetamodelNotFound(dependency.clone()));
            }
        }

        bus.emit(&ChangeEvent::ChangeStart {
            file: descriptor.uri.clone(),
        });
        match self.register_in_graph(&descriptor, snapshot, bus) {
            Ok((mm_node, type_nodes)) => {
                bus.emit(&ChangeEvent::ChangeSuccess {
                    file: descriptor.uri.clone(),
                });
                let mut inner = self.write();
                inner.metamodel_nodes.insert(descriptor.uri.clone(), mm_node);
                inner.type_nodes.extend(type_nodes);
                info!(uri = %descriptor.uri, types = descriptor.types.len(), "registered metamodel");
                inner.descriptors.insert(descriptor.uri.clone(), descriptor);
                Ok(true)
            }
            Err(err) => {
                bus.emit(&ChangeEvent::ChangeFailure {
                    file: descriptor.uri.clone(),
                });
                Err(err)
            }
        }
    }

    fn register_in_graph(
        &self,
        descriptor: &MetamodelDescriptor,
        snapshot: &str,
        bus: &ChangeBus,
    ) -> Result<(NodeId, BTreeMap<TypeRef, NodeId>), RegistryError> {
        let tx = self.backend.begin_transaction()?;

        let mm_node = self.backend.create_node(
            &[
                (URI_PROPERTY.to_string(), descriptor.uri.as_str().into()),
                (
                    VERSION_PROPERTY.to_string(),
                    descriptor.version.as_str().into(),
                ),
                (RESOURCE_PROPERTY.to_string(), snapshot.into()),
            ],
            NODE_LABEL_METAMODEL,
        )?;
        self.backend
            .index_put(INDEX_METAMODELS, "id", &descriptor.uri, mm_node)?;

        for dependency in &descriptor.dependencies {
            // Checked registered by the caller.
            if let Some(dep_node) = self.read().metamodel_nodes.get(dependency) {
                self.backend
                    .create_relationship(mm_node, *dep_node, EDGE_LABEL_DEPENDENCY, &[])?;
            }
        }

        let mut local = BTreeMap::new();
        for ty in &descriptor.types {
            let type_node = self.backend.create_node(
                &[
                    (NAME_PROPERTY.to_string(), ty.name.as_str().into()),
                    (ABSTRACT_PROPERTY.to_string(), ty.is_abstract.into()),
                    (INTERFACE_PROPERTY.to_string(), ty.is_interface.into()),
                ],
                NODE_LABEL_TYPE,
            )?;
            self.backend
                .create_relationship(type_node, mm_node, EDGE_LABEL_METAMODEL, &[])?;
            local.insert(TypeRef::new(descriptor.uri.clone(), ty.name.clone()), type_node);
        }

        for ty in &descriptor.types {
            let from = local[&TypeRef::new(descriptor.uri.clone(), ty.name.clone())];
            for supertype in &ty.supertypes {
                let super_ref = TypeRef::parse(supertype, &descriptor.uri);
                let to = match local.get(&super_ref) {
                    Some(node) => *node,
                    None => *self.read().type_nodes.get(&super_ref).ok_or_else(|| {
                        RegistryError::TypeNotFound {
                            metamodel: super_ref.metamodel.clone(),
                            name: super_ref.name.clone(),
                        }
                    })?,
                };
                self.backend
                    .create_relationship(from, to, EDGE_LABEL_SUPERTYPE, &[])?;
            }
        }

        bus.emit(&ChangeEvent::MetamodelAdded {
            uri: descriptor.uri.clone(),
        });
        for ty in &descriptor.types {
            bus.emit(&ChangeEvent::TypeAdded {
                metamodel: descriptor.uri.clone(),
                name: ty.name.clone(),
            });
        }

        tx.success()?;
        Ok((mm_node, local))
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.read().descriptors.contains_key(uri)
    }

    pub fn descriptor(&self, uri: &str) -> Option<MetamodelDescriptor> {
        self.read().descriptors.get(uri).cloned()
    }

    pub fn metamodel_uris(&self) -> Vec<String> {
        self.read().descriptors.keys().cloned().collect()
    }

    pub fn has_type(&self, type_ref: &TypeRef) -> bool {
        self.read().type_nodes.contains_key(type_ref)
    }

    pub fn type_node(&self, type_ref: &TypeRef) -> Result<NodeId, RegistryError> {
        let inner = self.read();
        if let Some(node) = inner.type_nodes.get(type_ref) {
            return Ok(*node);
        }
        if inner.descriptors.contains_key(&type_ref.metamodel) {
            Err(RegistryError::TypeNotFound {
                metamodel: type_ref.metamodel.clone(),
                name: type_ref.name.clone(),
            })
        } else {
            Err(RegistryError::MetamodelNotFound(type_ref.metamodel.clone()))
        }
    }

    /// Transitive supertypes, nearest first, without `type_ref` itself.
    pub fn all_supertypes(&self, type_ref: &TypeRef) -> Vec<TypeRef> {
        let inner = self.read();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([type_ref.clone()]);
        let mut result = Vec::new();
        while let Some(current) = queue.pop_front() {
            let Some(descriptor) = inner.descriptors.get(&current.metamodel) else {
                continue;
            };
            let Some(ty) = descriptor.type_named(&current.name) else {
                continue;
            };
            for supertype in &ty.supertypes {
                let super_ref = TypeRef::parse(supertype, &current.metamodel);
                if seen.insert(super_ref.clone()) {
                    result.push(super_ref.clone());
                    queue.push_back(super_ref);
                }
            }
        }
        result
    }

    /// Graph nodes of every transitive supertype.
    pub fn supertype_nodes(&self, type_ref: &TypeRef) -> Result<Vec<NodeId>, RegistryError> {
        self.all_supertypes(type_ref)
            .iter()
            .map(|s| self.type_node(s))
            .collect()
    }

    /// Declared plus inherited attribute slots; a subtype redeclaration
    /// shadows its supertype's slot.
    pub fn attributes_of(&self, type_ref: &TypeRef) -> Vec<SlotDescriptor> {
        self.collect_slots(type_ref, |ty| &ty.attributes)
    }

    /// Declared plus inherited reference slots.
    pub fn references_of(&self, type_ref: &TypeRef) -> Vec<SlotDescriptor> {
        self.collect_slots(type_ref, |ty| &ty.references)
    }

    fn collect_slots(
        &self,
        type_ref: &TypeRef,
        select: impl Fn(&super::TypeDescriptor) -> &Vec<SlotDescriptor>,
    ) -> Vec<SlotDescriptor> {
        let inner = self.read();
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        let chain = std::iter::once(type_ref.clone()).chain(self.all_supertypes(type_ref));
        for current in chain {
            let Some(ty) = inner
                .descriptors
                .get(&current.metamodel)
                .and_then(|d| d.type_named(&current.name))
            else {
                continue;
            };
            for slot in select(ty) {
                if seen.insert(slot.name.clone()) {
                    result.push(slot.clone());
                }
            }
        }
        result
    }

    pub fn attribute_slot(&self, type_ref: &TypeRef, name: &str) -> Option<SlotDescriptor> {
        self.attributes_of(type_ref).into_iter().find(|s| s.name == name)
    }

    pub fn reference_slot(&self, type_ref: &TypeRef, name: &str) -> Option<SlotDescriptor> {
        self.references_of(type_ref).into_iter().find(|s| s.name == name)
    }

    /// Records a derived attribute on the type node (marker slot) and in
    /// memory. Participates in the caller's open transaction.
    pub fn add_derived(
        &self,
        type_ref: &TypeRef,
        spec: &DerivedSpec,
    ) -> Result<NodeId, RegistryError> {
        let type_node = self.type_node(type_ref)?;
        let marker = format!("{}{}", DERIVED_MARKER_PREFIX, spec.attribute);
        self.backend.set_node_property(
            type_node,
            &marker,
            PropertyValue::Str(serde_json::to_string(spec)?),
        )?;

        let mut inner = self.write();
        let specs = inner.derived.entry(type_ref.clone()).or_default();
        specs.retain(|s| s.attribute != spec.attribute);
        specs.push(spec.clone());
        Ok(type_node)
    }

    /// Records an indexed plain attribute. The slot must be declared on the
    /// type or one of its supertypes.
    pub fn add_indexed(&self, type_ref: &TypeRef, attribute: &str) -> Result<NodeId, RegistryError> {
        if self.attribute_slot(type_ref, attribute).is_none() {
            return Err(RegistryError::SlotNotFound {
                metamodel: type_ref.metamodel.clone(),
                name: type_ref.name.clone(),
                slot: attribute.to_string(),
            });
        }
        let type_node = self.type_node(type_ref)?;
        let marker = format!("{}{}", INDEXED_MARKER_PREFIX, attribute);
        self.backend
            .set_node_property(type_node, &marker, PropertyValue::Bool(true))?;

        self.write()
            .indexed
            .entry(type_ref.clone())
            .or_default()
            .insert(attribute.to_string());
        Ok(type_node)
    }

    /// Derived specs applying to instances of `type_ref`, including specs
    /// declared on its supertypes, each paired with its declaring type. A
    /// subtype redeclaration shadows its supertype's spec.
    pub fn derived_for(&self, type_ref: &TypeRef) -> Vec<(TypeRef, DerivedSpec)> {
        let inner = self.read();
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        let chain = std::iter::once(type_ref.clone()).chain(self.all_supertypes(type_ref));
        for current in chain {
            if let Some(specs) = inner.derived.get(&current) {
                for spec in specs {
                    if seen.insert(spec.attribute.clone()) {
                        result.push((current.clone(), spec.clone()));
                    }
                }
            }
        }
        result
    }

    /// Indexed plain attributes applying to instances of `type_ref`, each
    /// paired with its declaring type.
    pub fn indexed_for(&self, type_ref: &TypeRef) -> Vec<(TypeRef, String)> {
        let inner = self.read();
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        let chain = std::iter::once(type_ref.clone()).chain(self.all_supertypes(type_ref));
        for current in chain {
            if let Some(attrs) = inner.indexed.get(&current) {
                for attr in attrs {
                    if seen.insert(attr.clone()) {
                        result.push((current.clone(), attr.clone()));
                    }
                }
            }
        }
        result
    }

    /// Name of the per-attribute secondary index for `(type, attribute)`.
    pub fn attribute_index_name(type_ref: &TypeRef, attribute: &str) -> String {
        format!("{}##{}##{}", type_ref.metamodel, type_ref.name, attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::metamodel::{JsonMetamodelParser, MetamodelParser};

    fn tree_descriptor() -> MetamodelDescriptor {
        serde_json::from_str(
            r#"{
            "uri": "http://example.org/tree",
            "version": "1.0",
            "types": [
                { "name": "Named", "abstract": true,
                  "attributes": [{ "name": "label" }] },
                { "name": "Tree", "supertypes": ["Named"],
                  "attributes": [{ "name": "weight" }],
                  "references": [
                    { "name": "children", "many": true, "containment": true }
                  ] }
            ]
        }"#,
        )
        .unwrap()
    }

    fn register(registry: &MetamodelRegistry, descriptor: MetamodelDescriptor) -> bool {
        let snapshot = JsonMetamodelParser::new().dump_to_text(&descriptor).unwrap();
        registry
            .register(descriptor, &snapshot, &ChangeBus::new())
            .unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let backend = Arc::new(MemoryGraph::new());
        let registry = MetamodelRegistry::new(backend.clone() as Arc<dyn GraphBackend>);
        registry.restore().unwrap();

        assert!(register(&registry, tree_descriptor()));
        // Duplicate registration is skipped, not an error.
        assert!(!register(&registry, tree_descriptor()));

        let tree = TypeRef::new("http://example.org/tree", "Tree");
        let named = TypeRef::new("http://example.org/tree", "Named");
        assert!(registry.has_type(&tree));
        assert_ne!(
            registry.type_node(&tree).unwrap(),
            registry.type_node(&named).unwrap()
        );
        assert_eq!(registry.all_supertypes(&tree), vec![named]);

        let attrs: Vec<String> = registry
            .attributes_of(&tree)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(attrs, vec!["weight".to_string(), "label".to_string()]);
        assert!(registry.reference_slot(&tree, "children").unwrap().containment);
        assert!(registry.attribute_slot(&tree, "label").is_some());
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let backend = Arc::new(MemoryGraph::new());
        let registry = MetamodelRegistry::new(backend as Arc<dyn GraphBackend>);
        registry.restore().unwrap();

        let descriptor = MetamodelDescriptor {
            uri: "http://example.org/extension".to_string(),
            version: String::new(),
            dependencies: vec!["http://example.org/missing".to_string()],
            types: vec![],
        };
        let err = registry
            .register(descriptor, "{}", &ChangeBus::new())
            .unwrap_err();
        assert!(matches!(err, RegistryError::MetamodelNotFound(_)));
    }

    #[test]
    fn test_restore_rebuilds_lookups() {
        let backend: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
        let tree = TypeRef::new("http://example.org/tree", "Tree");

        let first = MetamodelRegistry::new(backend.clone());
        first.restore().unwrap();
        assert!(register(&first, tree_descriptor()));
        first
            .add_derived(
                &tree,
                &DerivedSpec {
                    attribute: "descendantCount".to_string(),
                    language: "path".to_string(),
                    expression: "size(closure(children))".to_string(),
                    indexed: false,
                },
            )
            .unwrap();
        first.add_indexed(&tree, "label").unwrap();
        let type_node = first.type_node(&tree).unwrap();

        let second = MetamodelRegistry::new(backend);
        assert_eq!(second.restore().unwrap(), 1);
        assert_eq!(second.type_node(&tree).unwrap(), type_node);
        assert_eq!(second.attributes_of(&tree).len(), 2);

        let derived = second.derived_for(&tree);
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].1.attribute, "descendantCount");
        assert_eq!(derived[0].1.expression, "size(closure(children))");
        assert!(second.indexed_for(&tree).iter().any(|(_, a)| a == "label"));
    }

    #[test]
    fn test_abstract_flag_is_persisted() {
        let backend: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
        let registry = MetamodelRegistry::new(backend.clone());
        registry.restore().unwrap();
        register(&registry, tree_descriptor());

        let named = TypeRef::new("http://example.org/tree", "Named");
        let node = registry.type_node(&named).unwrap();
        assert_eq!(
            backend.node_property(node, "abstract").unwrap(),
            Some(PropertyValue::Bool(true))
        );
    }

    #[test]
    fn test_derived_spec_inherited_by_subtypes() {
        let backend = Arc::new(MemoryGraph::new());
        let registry = MetamodelRegistry::new(backend as Arc<dyn GraphBackend>);
        registry.restore().unwrap();
        register(&registry, tree_descriptor());

        let named = TypeRef::new("http://example.org/tree", "Named");
        let tree = TypeRef::new("http://example.org/tree", "Tree");
        registry
            .add_derived(
                &named,
                &DerivedSpec {
                    attribute: "labelLength".to_string(),
                    language: "path".to_string(),
                    expression: "self.label".to_string(),
                    indexed: false,
                },
            )
            .unwrap();

        let derived = registry.derived_for(&tree);
        assert_eq!(derived.len(), 1);
        // Declared on the supertype; index names stay keyed by it.
        assert_eq!(derived[0].0, named);
        assert_eq!(derived[0].1.attribute, "labelLength");
    }
}
