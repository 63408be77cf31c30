//! The indexer facade: one graph, one type registry, one change bus, any
//! number of repositories and parsers, kept in sync by polling or on demand.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::derived::{
    AccessRecordingReader, DerivedEngine, Evaluated, ExpressionLanguage, PathLanguage, ReadScope,
};
use crate::events::{ChangeBus, ChangeListener};
use crate::graph::{GraphBackend, NodeId, PropertyValue};
use crate::metamodel::{
    DerivedSpec, EffectiveMetamodel, MetamodelParser, MetamodelRegistry, RegistryError,
};
use crate::model::{ModelParser, TypeRef};
use crate::repository::RepositoryAdapter;
use crate::sync::{
    SyncEngine, SyncError, SyncMetrics, SyncOutcome, TrackedRepository, EDGE_LABEL_FILE,
    EDGE_LABEL_KIND, EDGE_LABEL_TYPE, IDENTIFIER_PROPERTY, INDEX_FILES, INDEX_FRAGMENTS,
    INDEX_PROXIES, INDEX_ROOTS, NODE_LABEL_ELEMENT, NODE_LABEL_FILE,
};

/// Lifecycle state of a [`ModelIndexer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerState {
    /// Accepting queries and synchronisation requests.
    Running,
    /// A synchronisation cycle is in flight; queries still work.
    Updating,
    /// Shut down; queries and synchronisation are rejected.
    Stopped,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            IndexerState::Running => "running",
            IndexerState::Updating => "updating",
            IndexerState::Stopped => "stopped",
        })
    }
}

/// Coarse content counts, for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub metamodels: usize,
    pub repositories: usize,
    pub files: usize,
    pub elements: usize,
}

/// Owns every moving part of one index and exposes the public API:
/// registration of repositories, parsers, metamodels and derived or indexed
/// attributes, on-demand and polled synchronisation, and graph queries.
pub struct ModelIndexer {
    id: String,
    backend: Arc<dyn GraphBackend>,
    registry: Arc<MetamodelRegistry>,
    bus: Arc<ChangeBus>,
    derived: Arc<DerivedEngine>,
    engine: SyncEngine,
    parsers: Arc<RwLock<Vec<Arc<dyn ModelParser>>>>,
    metamodel_parsers: RwLock<Vec<Arc<dyn MetamodelParser>>>,
    repositories: Arc<RwLock<Vec<Arc<TrackedRepository>>>>,
    effective: Arc<RwLock<EffectiveMetamodel>>,
    state: RwLock<IndexerState>,
    /// Serialises cycles; `sync_now` callers that lose the race coalesce.
    cycle_lock: tokio::sync::Mutex<()>,
    pending: AtomicBool,
    cancel: Arc<AtomicBool>,
    metrics: Mutex<SyncMetrics>,
    config: Config,
    poll_wake: Notify,
    shutdown_flag: AtomicBool,
}

impl ModelIndexer {
    /// Builds an indexer over `backend`, restoring any metamodels already
    /// persisted there. The path expression language is registered out of
    /// the box.
    pub fn new(backend: Arc<dyn GraphBackend>, config: Config) -> Result<Self, SyncError> {
        for index in [INDEX_FILES, INDEX_PROXIES, INDEX_ROOTS, INDEX_FRAGMENTS] {
            backend.get_or_create_index(index)?;
        }

        let registry = Arc::new(MetamodelRegistry::new(Arc::clone(&backend)));
        let restored = registry.restore()?;
        if restored > 0 {
            info!(metamodels = restored, "restored type registry from graph");
        }

        let derived = Arc::new(DerivedEngine::new(Arc::clone(&backend)));
        derived.ensure_indexes()?;
        derived.add_language(Arc::new(PathLanguage::new()));

        let bus = Arc::new(ChangeBus::new());
        bus.subscribe(Arc::clone(&derived) as Arc<dyn ChangeListener>);

        let scratch = config.storage.imports_path();
        std::fs::create_dir_all(&scratch).map_err(|source| SyncError::Io {
            path: scratch.clone(),
            source,
        })?;

        let parsers: Arc<RwLock<Vec<Arc<dyn ModelParser>>>> = Arc::new(RwLock::new(Vec::new()));
        let repositories: Arc<RwLock<Vec<Arc<TrackedRepository>>>> =
            Arc::new(RwLock::new(Vec::new()));
        let effective = Arc::new(RwLock::new(EffectiveMetamodel::everything()));
        let cancel = Arc::new(AtomicBool::new(false));

        let engine = SyncEngine::new(
            Arc::clone(&backend),
            Arc::clone(&registry),
            Arc::clone(&bus),
            Arc::clone(&derived),
            Arc::clone(&parsers),
            Arc::clone(&repositories),
            Arc::clone(&effective),
            scratch,
            config.sync.fetch_timeout(),
            Arc::clone(&cancel),
        );

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            backend,
            registry,
            bus,
            derived,
            engine,
            parsers,
            metamodel_parsers: RwLock::new(Vec::new()),
            repositories,
            effective,
            state: RwLock::new(IndexerState::Running),
            cycle_lock: tokio::sync::Mutex::new(()),
            pending: AtomicBool::new(false),
            cancel,
            metrics: Mutex::new(SyncMetrics::default()),
            config,
            poll_wake: Notify::new(),
            shutdown_flag: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> IndexerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: IndexerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn ensure_running(&self) -> Result<(), SyncError> {
        let state = self.state();
        if state == IndexerState::Stopped {
            return Err(SyncError::NotRunning(state));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Starts tracking a repository. Returns `false` if one with the same
    /// URL is already tracked.
    pub fn add_repository(&self, adapter: Arc<dyn RepositoryAdapter>) -> bool {
        let mut repositories = self
            .repositories
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if repositories
            .iter()
            .any(|tracked| tracked.adapter.url() == adapter.url())
        {
            return false;
        }
        info!(url = adapter.url(), "tracking repository");
        repositories.push(Arc::new(TrackedRepository::new(adapter)));
        true
    }

    /// Registers a model parser, replacing any previous one with the same id.
    pub fn add_model_parser(&self, parser: Arc<dyn ModelParser>) {
        let mut parsers = self.parsers.write().unwrap_or_else(PoisonError::into_inner);
        parsers.retain(|existing| existing.id() != parser.id());
        parsers.push(parser);
    }

    /// Registers a metamodel parser, replacing any previous one with the
    /// same id.
    pub fn add_metamodel_parser(&self, parser: Arc<dyn MetamodelParser>) {
        let mut parsers = self
            .metamodel_parsers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        parsers.retain(|existing| existing.id() != parser.id());
        parsers.push(parser);
    }

    /// Registers an additional expression language for derived attributes.
    pub fn add_expression_language(&self, language: Arc<dyn ExpressionLanguage>) {
        self.derived.add_language(language);
    }

    /// Parses and registers the metamodel file at `path`. Returns `false`
    /// if the metamodel was already registered.
    pub async fn register_metamodel(&self, path: &Path) -> Result<bool, SyncError> {
        self.ensure_running()?;
        let parser = {
            let parsers = self
                .metamodel_parsers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            parsers.iter().find(|p| p.can_parse(path)).cloned()
        }
        .ok_or_else(|| RegistryError::NoParser(path.to_path_buf()))?;

        let descriptor = parser.parse(path).await?;
        let snapshot = parser.dump_to_text(&descriptor)?;
        Ok(self.registry.register(descriptor, &snapshot, &self.bus)?)
    }

    /// Restricts synchronisation to the given effective metamodel from the
    /// next cycle on. Already-indexed content is not re-filtered.
    pub fn set_effective_metamodel(&self, effective: EffectiveMetamodel) {
        *self
            .effective
            .write()
            .unwrap_or_else(PoisonError::into_inner) = effective;
    }

    // ------------------------------------------------------------------
    // Derived and indexed attributes
    // ------------------------------------------------------------------

    /// Declares a derived attribute on a type and seeds it on every existing
    /// instance, then computes the seeded values. The expression is
    /// validated before anything is touched. Returns the number of
    /// instances seeded.
    pub async fn add_derived_attribute(
        &self,
        metamodel: &str,
        type_name: &str,
        attribute: &str,
        language_id: &str,
        expression: &str,
        indexed: bool,
    ) -> Result<usize, SyncError> {
        self.ensure_running()?;
        let language = self
            .derived
            .language(language_id)
            .ok_or_else(|| SyncError::NoSuchLanguage(language_id.to_string()))?;
        language
            .validate(expression)
            .map_err(|source| SyncError::InvalidExpression {
                attribute: attribute.to_string(),
                source,
            })?;

        let type_ref = TypeRef::new(metamodel, type_name);
        self.registry.type_node(&type_ref)?;
        let spec = DerivedSpec {
            attribute: attribute.to_string(),
            language: language_id.to_string(),
            expression: expression.to_string(),
            indexed,
        };

        let mut seeded = 0;
        let tx = self.backend.begin_transaction()?;
        self.registry.add_derived(&type_ref, &spec)?;
        for element in self.instance_nodes(&type_ref)? {
            if self.derived.derived_node(element, attribute)?.is_none() {
                self.derived.seed(element, &type_ref, &spec)?;
                seeded += 1;
            }
        }
        tx.success()?;

        self.derived.process_pending()?;
        Ok(seeded)
    }

    /// Declares an attribute index on a type and backfills it from every
    /// existing instance. Returns the number of entries filled.
    pub async fn add_indexed_attribute(
        &self,
        metamodel: &str,
        type_name: &str,
        attribute: &str,
    ) -> Result<usize, SyncError> {
        self.ensure_running()?;
        let type_ref = TypeRef::new(metamodel, type_name);

        let mut filled = 0;
        let tx = self.backend.begin_transaction()?;
        self.registry.add_indexed(&type_ref, attribute)?;
        let name = MetamodelRegistry::attribute_index_name(&type_ref, attribute);
        self.backend.get_or_create_index(&name)?;
        for element in self.instance_nodes(&type_ref)? {
            if let Some(value) = self.backend.node_property(element, attribute)? {
                self.backend
                    .index_put(&name, attribute, &value.display(), element)?;
                filled += 1;
            }
        }
        tx.success()?;
        Ok(filled)
    }

    // ------------------------------------------------------------------
    // Synchronisation
    // ------------------------------------------------------------------

    /// Runs one synchronisation cycle, or coalesces into the one already
    /// running. Requests received while a cycle runs are folded into a
    /// single follow-up cycle.
    pub async fn sync_now(&self) -> Result<SyncOutcome, SyncError> {
        self.ensure_running()?;
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            self.pending.store(true, Ordering::SeqCst);
            return Ok(SyncOutcome::Coalesced);
        };
        loop {
            self.set_state(IndexerState::Updating);
            let result = self.engine.run().await;
            self.set_state(IndexerState::Running);
            let report = result?;
            self.record_metrics(&report);
            if !self.pending.swap(false, Ordering::SeqCst) {
                return Ok(SyncOutcome::Completed(report));
            }
        }
    }

    /// Spawns the polling loop. The interval starts at the configured base,
    /// doubles while cycles find nothing, and snaps back to the base as
    /// soon as a cycle observes a change.
    pub fn start_polling(self: &Arc<Self>) -> JoinHandle<()> {
        let indexer = Arc::clone(self);
        tokio::spawn(async move {
            let base = indexer.config.sync.base_poll_interval();
            let max = indexer.config.sync.max_poll_interval();
            let mut interval = base;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = indexer.poll_wake.notified() => {}
                }
                if indexer.shutdown_flag.load(Ordering::SeqCst) {
                    break;
                }
                match indexer.sync_now().await {
                    Ok(SyncOutcome::Completed(report)) if report.changed() => interval = base,
                    Ok(SyncOutcome::Completed(_)) => interval = (interval * 2).min(max),
                    Ok(SyncOutcome::Coalesced) => {}
                    Err(error) => {
                        warn!(%error, "synchronisation cycle failed");
                        interval = (interval * 2).min(max);
                    }
                }
            }
        })
    }

    /// Stops the indexer: interrupts a running cycle at the next file
    /// boundary, stops the polling loop, and rejects further requests.
    pub async fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
        self.poll_wake.notify_waiters();
        // Wait out a cycle that is still applying changes.
        let _guard = self.cycle_lock.lock().await;
        self.set_state(IndexerState::Stopped);
    }

    fn record_metrics(&self, report: &crate::sync::SyncReport) {
        let mut metrics = self
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        metrics.cycles += 1;
        metrics.last_duration_ms = report.duration.as_millis() as u64;
        metrics.files_synchronised += report.files_synchronised as u64;
        metrics.elements_added += report.elements_added as u64;
        metrics.elements_updated += report.elements_updated as u64;
        metrics.elements_removed += report.elements_removed as u64;
        metrics.derived_recomputed += report.derived_recomputed as u64;
        metrics.last_cycle_at = Some(chrono::Utc::now());
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Looks up one element by repository URL, file path and fragment.
    pub fn element_by_identity(
        &self,
        repository: &str,
        path: &str,
        fragment: &str,
    ) -> Result<Option<NodeId>, SyncError> {
        self.ensure_running()?;
        let Some(file_node) = self
            .backend
            .index_get(INDEX_FILES, repository, path)?
            .first()
            .copied()
        else {
            return Ok(None);
        };
        for edge in self.backend.incoming(file_node, Some(EDGE_LABEL_FILE))? {
            if let Some(PropertyValue::Str(identifier)) =
                self.backend.node_property(edge.from, IDENTIFIER_PROPERTY)?
            {
                if identifier == fragment {
                    return Ok(Some(edge.from));
                }
            }
        }
        Ok(None)
    }

    /// All instances of a type, including instances of its subtypes.
    pub fn instances_of(
        &self,
        metamodel: &str,
        type_name: &str,
    ) -> Result<Vec<NodeId>, SyncError> {
        self.ensure_running()?;
        self.instance_nodes(&TypeRef::new(metamodel, type_name))
    }

    fn instance_nodes(&self, type_ref: &TypeRef) -> Result<Vec<NodeId>, SyncError> {
        let type_node = self.registry.type_node(type_ref)?;
        let mut instances = BTreeSet::new();
        for edge in self.backend.incoming(type_node, Some(EDGE_LABEL_TYPE))? {
            instances.insert(edge.from);
        }
        for edge in self.backend.incoming(type_node, Some(EDGE_LABEL_KIND))? {
            instances.insert(edge.from);
        }
        Ok(instances.into_iter().collect())
    }

    pub fn attribute_of(
        &self,
        element: NodeId,
        name: &str,
    ) -> Result<Option<PropertyValue>, SyncError> {
        self.ensure_running()?;
        Ok(self.backend.node_property(element, name)?)
    }

    /// Current value of a derived attribute, or `None` while it is still
    /// pending computation.
    pub fn derived_of(
        &self,
        element: NodeId,
        attribute: &str,
    ) -> Result<Option<PropertyValue>, SyncError> {
        self.ensure_running()?;
        Ok(self.derived.value_of(element, attribute)?)
    }

    /// Elements an element-valued derived attribute currently points at.
    pub fn derived_targets(
        &self,
        element: NodeId,
        attribute: &str,
    ) -> Result<Vec<NodeId>, SyncError> {
        self.ensure_running()?;
        Ok(self.derived.targets_of(element, attribute)?)
    }

    /// Elements whose derived attribute `attribute` contains `target`,
    /// nearest first.
    pub fn reverse_derived(
        &self,
        attribute: &str,
        target: NodeId,
    ) -> Result<Vec<NodeId>, SyncError> {
        self.ensure_running()?;
        Ok(self.derived.reverse_of(attribute, target)?)
    }

    /// Exact-value lookup against a declared attribute index. Types without
    /// the index yield no results.
    pub fn indexed_lookup(
        &self,
        metamodel: &str,
        type_name: &str,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<NodeId>, SyncError> {
        self.ensure_running()?;
        let type_ref = TypeRef::new(metamodel, type_name);
        let name = MetamodelRegistry::attribute_index_name(&type_ref, attribute);
        if !self.backend.index_exists(&name) {
            return Ok(Vec::new());
        }
        Ok(self.backend.index_get(&name, attribute, value)?)
    }

    /// Evaluates an expression against one element without registering it
    /// as a derived attribute.
    pub fn evaluate(
        &self,
        language_id: &str,
        expression: &str,
        element: NodeId,
        scope: Option<ReadScope>,
    ) -> Result<Evaluated, SyncError> {
        self.ensure_running()?;
        let language = self
            .derived
            .language(language_id)
            .ok_or_else(|| SyncError::NoSuchLanguage(language_id.to_string()))?;
        let reader = match scope {
            Some(scope) => AccessRecordingReader::scoped(&*self.backend, scope),
            None => AccessRecordingReader::new(&*self.backend),
        };
        Ok(language.evaluate(expression, element, &reader)?)
    }

    pub fn stats(&self) -> Result<IndexStats, SyncError> {
        self.ensure_running()?;
        Ok(IndexStats {
            metamodels: self.registry.metamodel_uris().len(),
            repositories: self
                .repositories
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            files: self.backend.all_nodes(Some(NODE_LABEL_FILE))?.len(),
            elements: self.backend.all_nodes(Some(NODE_LABEL_ELEMENT))?.len(),
        })
    }

    pub fn metamodel_uris(&self) -> Vec<String> {
        self.registry.metamodel_uris()
    }

    // ------------------------------------------------------------------
    // Change listeners
    // ------------------------------------------------------------------

    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) {
        self.bus.subscribe(listener);
    }

    pub fn unsubscribe(&self, name: &str) -> bool {
        self.bus.unsubscribe(name)
    }

    pub fn listener_error_count(&self, name: &str) -> u64 {
        self.bus.error_count(name)
    }
}
