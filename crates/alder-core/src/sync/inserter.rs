//! Element insertion and update against one file.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::derived::{DerivedEngine, PROPERTY_DERIVED_FLAG};
use crate::events::{ChangeBus, ChangeEvent};
use crate::graph::{GraphBackend, GraphError, NodeId, PropertyValue};
use crate::metamodel::{EffectiveMetamodel, MetamodelRegistry};
use crate::model::{ElementRef, ModelElement};

use super::error::SyncError;
use super::{
    file_uri, SyncReport, EDGE_LABEL_FILE, EDGE_LABEL_KIND, EDGE_LABEL_TYPE, FRAGMENT_UNIQUE_VALUE,
    IDENTIFIER_PROPERTY, INDEX_FILES, INDEX_FRAGMENTS, INDEX_PROXIES, INDEX_ROOTS,
    NODE_LABEL_ELEMENT, PROPERTY_CONTAINER, PROPERTY_CONTAINMENT, PROXY_KEY,
    PROXY_PROPERTY_PREFIX, SIGNATURE_PROPERTY, TRANSIENT_EDGE_LABELS,
};

/// Per-file change counts, merged into the cycle report on success.
#[derive(Debug, Default)]
pub(crate) struct FileStats {
    pub elements_added: usize,
    pub elements_updated: usize,
    pub elements_removed: usize,
    pub references_resolved: usize,
    pub derived_seeded: usize,
}

impl FileStats {
    pub(crate) fn merge_into(&self, report: &mut SyncReport) {
        report.elements_added += self.elements_added;
        report.elements_updated += self.elements_updated;
        report.elements_removed += self.elements_removed;
        report.references_resolved += self.references_resolved;
        report.derived_seeded += self.derived_seeded;
    }
}

/// Everything the per-file passes need, borrowed from the engine.
pub(crate) struct FileContext<'a> {
    pub backend: &'a dyn GraphBackend,
    pub registry: &'a MetamodelRegistry,
    pub derived: &'a DerivedEngine,
    pub bus: &'a ChangeBus,
    pub effective: &'a EffectiveMetamodel,
    pub repository: &'a str,
    pub path: &'a str,
    pub file_node: NodeId,
    /// Marks events of bulk loads; listeners may skip them.
    pub transient: bool,
}

impl FileContext<'_> {
    pub(crate) fn file_uri(&self) -> String {
        file_uri(self.repository, self.path)
    }

    /// Creates the node for one parsed element, or reuses the singleton node
    /// for a fragment-unique element. Returns `None` for elements excluded
    /// by the effective metamodel.
    pub(crate) fn create_element(
        &self,
        element: &dyn ModelElement,
        stats: &mut FileStats,
    ) -> Result<Option<NodeId>, SyncError> {
        let type_ref = element.type_ref();
        if !self
            .effective
            .includes_type(&type_ref.metamodel, &type_ref.name)
        {
            debug!(%type_ref, fragment = element.uri_fragment(), "type excluded, skipping element");
            return Ok(None);
        }
        let type_node = self.registry.type_node(type_ref)?;
        let fragment = element.uri_fragment();

        // A fragment-unique singleton already indexed elsewhere just gains
        // this file.
        if element.is_fragment_unique() {
            let existing = self
                .backend
                .index_get(INDEX_FRAGMENTS, fragment, FRAGMENT_UNIQUE_VALUE)?;
            if let Some(&node) = existing.first() {
                let claimed = self
                    .backend
                    .outgoing(node, Some(EDGE_LABEL_FILE))?
                    .iter()
                    .any(|e| e.to == self.file_node);
                if !claimed {
                    self.backend
                        .create_relationship(node, self.file_node, EDGE_LABEL_FILE, &[])?;
                }
                return Ok(Some(node));
            }
        }

        let mut props: Vec<(String, PropertyValue)> = vec![
            (IDENTIFIER_PROPERTY.to_string(), fragment.into()),
            (SIGNATURE_PROPERTY.to_string(), element.signature().into()),
        ];
        for slot in self.registry.attributes_of(type_ref) {
            if !element.is_feature_set(&slot.name) {
                continue;
            }
            if !self
                .effective
                .includes_slot(&type_ref.metamodel, &type_ref.name, &slot.name)
            {
                continue;
            }
            if let Some(value) = element.attribute(&slot.name) {
                props.push((slot.name.clone(), value));
            }
        }
        let node = self.backend.create_node(&props, NODE_LABEL_ELEMENT)?;

        self.backend
            .create_relationship(node, type_node, EDGE_LABEL_TYPE, &[])?;
        for super_node in self.registry.supertype_nodes(type_ref)? {
            self.backend
                .create_relationship(node, super_node, EDGE_LABEL_KIND, &[])?;
        }
        self.backend
            .create_relationship(node, self.file_node, EDGE_LABEL_FILE, &[])?;

        if element.is_root() {
            self.backend
                .index_put(INDEX_ROOTS, &self.file_uri(), fragment, node)?;
        }
        if element.is_fragment_unique() {
            self.backend
                .index_put(INDEX_FRAGMENTS, fragment, FRAGMENT_UNIQUE_VALUE, node)?;
        }
        for (declaring, attribute) in self.registry.indexed_for(type_ref) {
            if let Some(value) = element.attribute(&attribute) {
                let name = MetamodelRegistry::attribute_index_name(&declaring, &attribute);
                self.backend.get_or_create_index(&name)?;
                self.backend
                    .index_put(&name, &attribute, &value.display(), node)?;
            }
        }
        for (declaring, spec) in self.registry.derived_for(type_ref) {
            self.derived.seed(node, &declaring, &spec)?;
            stats.derived_seeded += 1;
        }

        self.bus.emit(&ChangeEvent::ElementAdded {
            element: node,
            transient: self.transient,
        });
        stats.elements_added += 1;
        Ok(Some(node))
    }

    /// Brings the attributes of an existing node in line with the parsed
    /// element, emitting one event per attribute that moved.
    pub(crate) fn update_element(
        &self,
        node: NodeId,
        element: &dyn ModelElement,
        stats: &mut FileStats,
    ) -> Result<(), SyncError> {
        let type_ref = element.type_ref();
        self.backend
            .set_node_property(node, SIGNATURE_PROPERTY, element.signature().into())?;

        let mut desired: BTreeMap<String, PropertyValue> = BTreeMap::new();
        for slot in self.registry.attributes_of(type_ref) {
            if !element.is_feature_set(&slot.name) {
                continue;
            }
            if !self
                .effective
                .includes_slot(&type_ref.metamodel, &type_ref.name, &slot.name)
            {
                continue;
            }
            if let Some(value) = element.attribute(&slot.name) {
                desired.insert(slot.name.clone(), value);
            }
        }
        let indexed: HashMap<String, _> = self
            .registry
            .indexed_for(type_ref)
            .into_iter()
            .map(|(declaring, attribute)| (attribute, declaring))
            .collect();

        let current: Vec<String> = self
            .backend
            .node_property_keys(node)?
            .into_iter()
            .filter(|key| {
                key != IDENTIFIER_PROPERTY
                    && key != SIGNATURE_PROPERTY
                    && !key.starts_with(PROXY_PROPERTY_PREFIX)
            })
            .collect();

        for key in &current {
            if desired.contains_key(key) {
                continue;
            }
            self.backend.remove_node_property(node, key)?;
            if let Some(declaring) = indexed.get(key) {
                let name = MetamodelRegistry::attribute_index_name(declaring, key);
                if self.backend.index_exists(&name) {
                    self.backend.index_remove_node(&name, node)?;
                }
            }
            self.bus.emit(&ChangeEvent::AttributeRemoved {
                element: node,
                name: key.clone(),
                transient: self.transient,
            });
        }
        for (key, value) in desired {
            if self.backend.node_property(node, &key)?.as_ref() == Some(&value) {
                continue;
            }
            self.backend.set_node_property(node, &key, value.clone())?;
            if let Some(declaring) = indexed.get(&key) {
                let name = MetamodelRegistry::attribute_index_name(declaring, &key);
                self.backend.get_or_create_index(&name)?;
                self.backend.index_remove_node(&name, node)?;
                self.backend
                    .index_put(&name, &key, &value.display(), node)?;
            }
            self.bus.emit(&ChangeEvent::AttributeUpdated {
                element: node,
                name: key,
                transient: self.transient,
            });
        }

        // Root membership follows the flag.
        let uri = self.file_uri();
        let fragment = element.uri_fragment();
        let in_roots = self
            .backend
            .index_get(INDEX_ROOTS, &uri, fragment)?
            .contains(&node);
        if element.is_root() && !in_roots {
            self.backend.index_put(INDEX_ROOTS, &uri, fragment, node)?;
        } else if !element.is_root() && in_roots {
            self.backend
                .index_remove(INDEX_ROOTS, &uri, fragment, node)?;
        }

        stats.elements_updated += 1;
        Ok(())
    }

    /// Diffs the node's reference edges against the parsed element. Targets
    /// that cannot be resolved yet are parked as proxy slots; `rebuild`
    /// rewrites the existing proxy slots from scratch first (update path).
    pub(crate) fn apply_references(
        &self,
        node: NodeId,
        element: &dyn ModelElement,
        resolver: &mut TargetResolver,
        rebuild: bool,
        stats: &mut FileStats,
    ) -> Result<(), SyncError> {
        let type_ref = element.type_ref();

        let mut desired: Vec<(String, NodeId, bool, bool)> = Vec::new();
        let mut unresolved: BTreeMap<String, Vec<(String, String, bool, bool)>> = BTreeMap::new();
        for name in element.reference_names() {
            let Some(slot) = self.registry.reference_slot(type_ref, &name) else {
                debug!(%type_ref, slot = %name, "undeclared reference slot, ignoring");
                continue;
            };
            if !self
                .effective
                .includes_slot(&type_ref.metamodel, &type_ref.name, &name)
            {
                continue;
            }
            let Some(targets) = element.reference(&name, false) else {
                continue;
            };
            for target in targets {
                match resolver.resolve(self.backend, self.path, &target)? {
                    Some(target_node) => {
                        desired.push((name.clone(), target_node, slot.containment, slot.container));
                    }
                    None => {
                        let target_uri = file_uri(
                            self.repository,
                            target.path.as_deref().unwrap_or(self.path),
                        );
                        unresolved.entry(target_uri).or_default().push((
                            target.fragment,
                            name.clone(),
                            slot.containment,
                            slot.container,
                        ));
                    }
                }
            }
        }

        let mut existing = Vec::new();
        for edge in self.backend.outgoing(node, None)? {
            if TRANSIENT_EDGE_LABELS.contains(&edge.label.as_str()) {
                continue;
            }
            if self
                .backend
                .edge_property(edge.id, PROPERTY_DERIVED_FLAG)?
                .is_some()
            {
                continue;
            }
            existing.push(edge);
        }

        let desired_set: HashSet<(&str, NodeId)> = desired
            .iter()
            .map(|(label, target, _, _)| (label.as_str(), *target))
            .collect();
        let mut existing_set: HashSet<(String, NodeId)> = HashSet::new();
        for edge in &existing {
            if desired_set.contains(&(edge.label.as_str(), edge.to)) {
                existing_set.insert((edge.label.clone(), edge.to));
                continue;
            }
            self.backend.delete_relationship(edge.id)?;
            self.bus.emit(&ChangeEvent::ReferenceRemoved {
                source: node,
                target: edge.to,
                label: edge.label.clone(),
                transient: self.transient,
            });
        }

        for (label, target, containment, container) in desired {
            if existing_set.contains(&(label.clone(), target)) {
                continue;
            }
            existing_set.insert((label.clone(), target));
            let mut props: Vec<(String, PropertyValue)> = Vec::new();
            if containment {
                props.push((PROPERTY_CONTAINMENT.to_string(), true.into()));
            }
            if container {
                props.push((PROPERTY_CONTAINER.to_string(), true.into()));
            }
            self.backend
                .create_relationship(node, target, &label, &props)?;
            self.bus.emit(&ChangeEvent::ReferenceAdded {
                source: node,
                target,
                label,
                transient: self.transient,
            });
            stats.references_resolved += 1;
        }

        if rebuild {
            for key in self.backend.node_property_keys(node)? {
                if let Some(uri) = key.strip_prefix(PROXY_PROPERTY_PREFIX) {
                    let uri = uri.to_string();
                    self.backend.remove_node_property(node, &key)?;
                    self.backend
                        .index_remove(INDEX_PROXIES, PROXY_KEY, &uri, node)?;
                }
            }
        }
        for (target_uri, quads) in unresolved {
            add_proxy_references(self.backend, node, &target_uri, &quads)?;
        }
        Ok(())
    }
}

/// Parks unresolved targets on `node` under the proxy slot for their file,
/// deduplicating repeated quads, and registers the node in the proxy index.
pub(crate) fn add_proxy_references(
    backend: &dyn GraphBackend,
    node: NodeId,
    target_uri: &str,
    quads: &[(String, String, bool, bool)],
) -> Result<(), GraphError> {
    let key = format!("{PROXY_PROPERTY_PREFIX}{target_uri}");
    let mut list = match backend.node_property(node, &key)? {
        Some(PropertyValue::List(list)) => list,
        _ => Vec::new(),
    };
    for (fragment, label, containment, container) in quads {
        let quad = [
            PropertyValue::Str(fragment.clone()),
            PropertyValue::Str(label.clone()),
            PropertyValue::Bool(*containment),
            PropertyValue::Bool(*container),
        ];
        if !list.chunks(4).any(|chunk| chunk == quad) {
            list.extend(quad);
        }
    }
    backend.set_node_property(node, &key, PropertyValue::List(list))?;
    backend.index_put(INDEX_PROXIES, PROXY_KEY, target_uri, node)?;
    Ok(())
}

/// Per-cycle cache of fragment-to-node maps, one per file of the repository
/// being synchronised. Maps for files untouched this cycle are read from
/// the graph on first use.
pub(crate) struct TargetResolver {
    repository: String,
    files: HashMap<String, HashMap<String, NodeId>>,
}

impl TargetResolver {
    pub(crate) fn new(repository: &str) -> Self {
        Self {
            repository: repository.to_string(),
            files: HashMap::new(),
        }
    }

    pub(crate) fn install(&mut self, path: &str, map: HashMap<String, NodeId>) {
        self.files.insert(path.to_string(), map);
    }

    /// Drops a cached map whose file failed mid-update; the rolled-back
    /// state is reloaded from the graph on next use.
    pub(crate) fn forget(&mut self, path: &str) {
        self.files.remove(path);
    }

    pub(crate) fn file_map(
        &mut self,
        backend: &dyn GraphBackend,
        path: &str,
    ) -> Result<Option<&HashMap<String, NodeId>>, GraphError> {
        if !self.files.contains_key(path) {
            let Some(file_node) = backend
                .index_get(INDEX_FILES, &self.repository, path)?
                .first()
                .copied()
            else {
                return Ok(None);
            };
            let mut map = HashMap::new();
            for edge in backend.incoming(file_node, Some(EDGE_LABEL_FILE))? {
                if let Some(PropertyValue::Str(fragment)) =
                    backend.node_property(edge.from, IDENTIFIER_PROPERTY)?
                {
                    map.insert(fragment, edge.from);
                }
            }
            self.files.insert(path.to_string(), map);
        }
        Ok(self.files.get(path))
    }

    /// Resolves one written target to a node, if its element is indexed.
    /// Local targets fall back to the fragment-unique singletons.
    pub(crate) fn resolve(
        &mut self,
        backend: &dyn GraphBackend,
        current_path: &str,
        target: &ElementRef,
    ) -> Result<Option<NodeId>, GraphError> {
        match &target.path {
            Some(path) => Ok(self
                .file_map(backend, path)?
                .and_then(|map| map.get(&target.fragment).copied())),
            None => {
                if let Some(&node) = self
                    .files
                    .get(current_path)
                    .and_then(|map| map.get(&target.fragment))
                {
                    return Ok(Some(node));
                }
                Ok(backend
                    .index_get(INDEX_FRAGMENTS, &target.fragment, FRAGMENT_UNIQUE_VALUE)?
                    .first()
                    .copied())
            }
        }
    }
}
