//! Incremental synchronisation of repository contents into the graph.
//!
//! One cycle asks every tracked repository for its delta since the last
//! synchronised revision, applies deletions first, then loads new files in
//! batch mode and diffs updated files element-by-element inside a
//! transaction. Cross-file references that cannot be resolved yet are
//! parked as proxy slots and retried whenever their target file is
//! processed. Derived values are seeded per element and brought up to date
//! at the end of the cycle.

mod deletion;
mod diff;
mod error;
mod inserter;

pub use error::SyncError;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::derived::DerivedEngine;
use crate::events::{ChangeBus, ChangeEvent};
use crate::graph::{GraphBackend, GraphError, NodeId, PropertyValue};
use crate::metamodel::{EffectiveMetamodel, MetamodelRegistry};
use crate::model::{IdentityKey, ModelParser, ParsedModel};
use crate::repository::{ChangeType, RepositoryAdapter};

use self::diff::diff_file;
use self::inserter::{FileContext, FileStats, TargetResolver};

/// Separator between repository URL and path in file identifiers.
pub const FILE_INDEX_SEPARATOR: &str = "////";

pub const NODE_LABEL_FILE: &str = "file";
pub const NODE_LABEL_ELEMENT: &str = "element";

/// Structural edge from an element to its owning file node.
pub const EDGE_LABEL_FILE: &str = "file";
/// Structural edge from an element to its type node.
pub const EDGE_LABEL_TYPE: &str = "typeOf";
/// Structural edge from an element to each transitive supertype node.
pub const EDGE_LABEL_KIND: &str = "kindOf";

/// Structural edges, excluded from reference diffing.
pub const TRANSIENT_EDGE_LABELS: [&str; 3] = [EDGE_LABEL_FILE, EDGE_LABEL_TYPE, EDGE_LABEL_KIND];

pub const FILE_REPOSITORY_PROPERTY: &str = "repository";
pub const FILE_PATH_PROPERTY: &str = "path";
/// Repository revision a file node was last synchronised at.
pub const FILE_REVISION_PROPERTY: &str = "revision";

pub const IDENTIFIER_PROPERTY: &str = "identifier";
pub const SIGNATURE_PROPERTY: &str = "signature";

/// Edge flags mirroring the slot's containment declaration.
pub const PROPERTY_CONTAINMENT: &str = "isContainment";
pub const PROPERTY_CONTAINER: &str = "isContainer";

/// Node property prefix holding unresolved reference targets, one slot per
/// target file.
pub const PROXY_PROPERTY_PREFIX: &str = "_proxyRef:";
pub(crate) const PROXY_KEY: &str = "_proxyRef";

/// File nodes by (repository URL, path).
pub const INDEX_FILES: &str = "files";
/// Nodes holding unresolved references, by target file identifier.
pub const INDEX_PROXIES: &str = "proxies";
/// Root elements by (file identifier, fragment).
pub const INDEX_ROOTS: &str = "roots";
/// Fragment-unique singletons by fragment.
pub const INDEX_FRAGMENTS: &str = "fragments";
pub(crate) const FRAGMENT_UNIQUE_VALUE: &str = "unique";

/// Full identifier of a file within the index: `repository////path`.
pub fn file_uri(repository: &str, path: &str) -> String {
    format!("{repository}{FILE_INDEX_SEPARATOR}{path}")
}

/// Outcome of a synchronisation request.
#[derive(Debug)]
pub enum SyncOutcome {
    /// A cycle ran to completion.
    Completed(SyncReport),
    /// A cycle was already in flight; the request was folded into the run
    /// that follows it.
    Coalesced,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

/// What one synchronisation cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub files_synchronised: usize,
    /// Files whose revision or content was already up to date.
    pub files_skipped: usize,
    pub files_failed: Vec<FileFailure>,
    pub elements_added: usize,
    pub elements_updated: usize,
    pub elements_removed: usize,
    pub references_resolved: usize,
    pub derived_seeded: usize,
    pub derived_recomputed: usize,
    /// Cycle was interrupted; unprocessed files are retried next cycle.
    pub cancelled: bool,
    pub duration: Duration,
}

impl SyncReport {
    /// Whether the cycle observed any repository change at all.
    pub fn changed(&self) -> bool {
        self.files_synchronised > 0 || self.files_skipped > 0 || !self.files_failed.is_empty()
    }
}

/// Running totals across cycles.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncMetrics {
    pub cycles: u64,
    pub last_duration_ms: u64,
    pub files_synchronised: u64,
    pub elements_added: u64,
    pub elements_updated: u64,
    pub elements_removed: u64,
    pub derived_recomputed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// A registered repository plus the revision the graph reflects. The
/// revision only advances after a fully successful cycle, so failed files
/// are retried and already-committed ones skipped by their file revision.
pub(crate) struct TrackedRepository {
    pub(crate) adapter: Arc<dyn RepositoryAdapter>,
    pub(crate) last_revision: Mutex<Option<String>>,
}

impl TrackedRepository {
    pub(crate) fn new(adapter: Arc<dyn RepositoryAdapter>) -> Self {
        Self {
            adapter,
            last_revision: Mutex::new(None),
        }
    }
}

pub(crate) struct SyncEngine {
    backend: Arc<dyn GraphBackend>,
    registry: Arc<MetamodelRegistry>,
    bus: Arc<ChangeBus>,
    derived: Arc<DerivedEngine>,
    parsers: Arc<RwLock<Vec<Arc<dyn ModelParser>>>>,
    repositories: Arc<RwLock<Vec<Arc<TrackedRepository>>>>,
    effective: Arc<RwLock<EffectiveMetamodel>>,
    scratch: PathBuf,
    fetch_timeout: Duration,
    cancel: Arc<AtomicBool>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: Arc<dyn GraphBackend>,
        registry: Arc<MetamodelRegistry>,
        bus: Arc<ChangeBus>,
        derived: Arc<DerivedEngine>,
        parsers: Arc<RwLock<Vec<Arc<dyn ModelParser>>>>,
        repositories: Arc<RwLock<Vec<Arc<TrackedRepository>>>>,
        effective: Arc<RwLock<EffectiveMetamodel>>,
        scratch: PathBuf,
        fetch_timeout: Duration,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            backend,
            registry,
            bus,
            derived,
            parsers,
            repositories,
            effective,
            scratch,
            fetch_timeout,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Runs one cycle over all tracked repositories.
    pub(crate) async fn run(&self) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let mut report = SyncReport::default();

        self.bus.emit(&ChangeEvent::SynchroniseStart);
        let result = self.run_cycle(&mut report).await;
        self.bus.emit(&ChangeEvent::SynchroniseEnd);
        result?;

        report.duration = started.elapsed();
        info!(
            files = report.files_synchronised,
            skipped = report.files_skipped,
            failed = report.files_failed.len(),
            added = report.elements_added,
            updated = report.elements_updated,
            removed = report.elements_removed,
            derived = report.derived_recomputed,
            ms = report.duration.as_millis() as u64,
            "synchronisation cycle finished"
        );
        Ok(report)
    }

    async fn run_cycle(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let repositories: Vec<Arc<TrackedRepository>> = self
            .repositories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let effective = self
            .effective
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for tracked in repositories {
            if self.cancelled() {
                report.cancelled = true;
                break;
            }
            self.sync_repository(&tracked, &effective, report).await?;
        }

        self.derived.process_pending()?;
        report.derived_recomputed += self.derived.process_invalidations()?;
        Ok(())
    }

    /// Synchronises one repository; adapter failures are recorded and do not
    /// stop the cycle.
    async fn sync_repository(
        &self,
        tracked: &TrackedRepository,
        effective: &EffectiveMetamodel,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let url = tracked.adapter.url().to_string();
        let from = tracked
            .last_revision
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let current = match tracked.adapter.current_revision().await {
            Ok(revision) => revision,
            Err(err) => {
                warn!(repository = %url, %err, "repository unavailable, skipping");
                report.files_failed.push(FileFailure {
                    path: url,
                    reason: err.to_string(),
                });
                return Ok(());
            }
        };
        if from.as_deref() == Some(current.as_str()) {
            debug!(repository = %url, revision = %current, "repository up to date");
            return Ok(());
        }

        let commits = match tracked.adapter.delta(from.as_deref(), &current).await {
            Ok(commits) => commits,
            Err(err) => {
                warn!(repository = %url, %err, "failed to read repository delta");
                report.files_failed.push(FileFailure {
                    path: url,
                    reason: err.to_string(),
                });
                return Ok(());
            }
        };

        // Latest change per path, preserving first-seen order.
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, ChangeType> = HashMap::new();
        for commit in &commits {
            for item in &commit.items {
                if !latest.contains_key(&item.path) {
                    order.push(item.path.clone());
                }
                latest.insert(item.path.clone(), item.change);
            }
        }

        let mut ok = true;
        let mut resolver = TargetResolver::new(&url);

        // Deletions first, so files renamed within one delta free their
        // identities before the new paths are loaded.
        for path in order.iter().filter(|p| latest[*p] == ChangeType::Deleted) {
            if self.cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            if !self.delete_indexed_file(&url, path, effective, report)? {
                ok = false;
            }
        }

        // Decide per upsert whether any work is needed at all.
        let mut to_process: Vec<(String, Arc<dyn ModelParser>, Option<NodeId>)> = Vec::new();
        for path in order.iter().filter(|p| latest[*p] != ChangeType::Deleted) {
            let file_node = self.file_node(&url, path)?;
            if let Some(node) = file_node {
                let stamped = self.backend.node_property(node, FILE_REVISION_PROPERTY)?;
                if matches!(stamped, Some(PropertyValue::Str(rev)) if rev == current) {
                    report.files_skipped += 1;
                    continue;
                }
            }
            let Some(parser) = self.parser_for(path) else {
                debug!(repository = %url, %path, "no parser accepts file, ignoring");
                continue;
            };
            to_process.push((path.clone(), parser, file_node));
        }

        let parses = join_all(to_process.iter().map(|(path, parser, _)| {
            self.fetch_and_parse(
                tracked.adapter.clone(),
                current.clone(),
                path.clone(),
                parser.clone(),
            )
        }))
        .await;

        let mut processed: Vec<String> = Vec::new();
        for ((path, _, file_node), parsed) in to_process.into_iter().zip(parses) {
            if self.cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            let parsed = match parsed {
                Ok(parsed) => parsed,
                Err(reason) => {
                    warn!(repository = %url, %path, %reason, "failed to load file");
                    report.files_failed.push(FileFailure { path, reason });
                    ok = false;
                    continue;
                }
            };
            let applied = match file_node {
                None => {
                    self.load_new_file(&url, &path, &current, &parsed, effective, &mut resolver, report)
                }
                Some(node) => self.update_file(
                    &url, &path, &current, node, &parsed, effective, &mut resolver, report,
                ),
            };
            match applied {
                Ok(()) => processed.push(path),
                Err(err) => {
                    warn!(repository = %url, %path, %err, "failed to synchronise file");
                    resolver.forget(&path);
                    let fatal = matches!(
                        err,
                        SyncError::BackendTransaction(GraphError::CommitFailed(_))
                    );
                    report.files_failed.push(FileFailure {
                        path,
                        reason: err.to_string(),
                    });
                    ok = false;
                    if fatal {
                        return Err(err);
                    }
                }
            }
        }

        // Retry proxies parked against the files touched this cycle.
        for path in &processed {
            if !self.resolve_proxies_for_file(&url, path, &mut resolver, report)? {
                ok = false;
            }
        }

        if ok {
            *tracked
                .last_revision
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(current);
        }
        Ok(())
    }

    fn parser_for(&self, path: &str) -> Option<Arc<dyn ModelParser>> {
        self.parsers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.can_parse(std::path::Path::new(path)))
            .cloned()
    }

    fn file_node(&self, url: &str, path: &str) -> Result<Option<NodeId>, GraphError> {
        Ok(self
            .backend
            .index_get(INDEX_FILES, url, path)?
            .first()
            .copied())
    }

    async fn fetch_and_parse(
        &self,
        adapter: Arc<dyn RepositoryAdapter>,
        revision: String,
        path: String,
        parser: Arc<dyn ModelParser>,
    ) -> Result<ParsedModel, String> {
        let destination = self.scratch.join(&path);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| format!("staging directory: {err}"))?;
        }
        let imported = tokio::time::timeout(
            self.fetch_timeout,
            adapter.import_file(&revision, &path, &destination),
        )
        .await
        .map_err(|_| format!("timed out fetching after {:?}", self.fetch_timeout))?
        .map_err(|err| err.to_string())?;
        parser.parse(&imported).await.map_err(|err| err.to_string())
    }

    fn context<'a>(
        &'a self,
        url: &'a str,
        path: &'a str,
        effective: &'a EffectiveMetamodel,
        file_node: NodeId,
        transient: bool,
    ) -> FileContext<'a> {
        FileContext {
            backend: &*self.backend,
            registry: &self.registry,
            derived: &self.derived,
            bus: &self.bus,
            effective,
            repository: url,
            path,
            file_node,
            transient,
        }
    }

    /// Batch-loads a file not yet in the graph.
    #[allow(clippy::too_many_arguments)]
    fn load_new_file(
        &self,
        url: &str,
        path: &str,
        revision: &str,
        parsed: &ParsedModel,
        effective: &EffectiveMetamodel,
        resolver: &mut TargetResolver,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let uri = file_uri(url, path);
        self.backend.enter_batch_mode()?;
        self.bus.emit(&ChangeEvent::ChangeStart { file: uri.clone() });

        match self.batch_load(url, path, revision, parsed, effective, resolver) {
            Ok(stats) => match self.backend.exit_batch_mode() {
                Ok(()) => {
                    self.bus.emit(&ChangeEvent::ChangeSuccess { file: uri });
                    stats.merge_into(report);
                    report.files_synchronised += 1;
                    Ok(())
                }
                Err(exit_err) => {
                    self.bus.emit(&ChangeEvent::ChangeFailure { file: uri });
                    Err(exit_err.into())
                }
            },
            Err(err) => {
                self.bus.emit(&ChangeEvent::ChangeFailure { file: uri });
                if let Err(exit_err) = self.backend.exit_batch_mode() {
                    warn!(%exit_err, "failed to leave batch mode after aborted load");
                }
                self.remove_partial_file(url, path, effective)?;
                Err(err)
            }
        }
    }

    fn batch_load(
        &self,
        url: &str,
        path: &str,
        revision: &str,
        parsed: &ParsedModel,
        effective: &EffectiveMetamodel,
        resolver: &mut TargetResolver,
    ) -> Result<FileStats, SyncError> {
        let file_node = self.backend.create_node(
            &[
                (FILE_REPOSITORY_PROPERTY.to_string(), url.into()),
                (FILE_PATH_PROPERTY.to_string(), path.into()),
                (FILE_REVISION_PROPERTY.to_string(), revision.into()),
            ],
            NODE_LABEL_FILE,
        )?;
        self.backend.index_put(INDEX_FILES, url, path, file_node)?;
        self.bus.emit(&ChangeEvent::FileAdded {
            repository: url.to_string(),
            path: path.to_string(),
        });

        let ctx = self.context(url, path, effective, file_node, true);
        let mut stats = FileStats::default();

        let mut fragments: HashMap<String, NodeId> = HashMap::new();
        let mut created: Vec<(usize, NodeId)> = Vec::new();
        for (index, element) in parsed.elements.iter().enumerate() {
            if let Some(node) = ctx.create_element(element.as_ref(), &mut stats)? {
                fragments.insert(element.uri_fragment().to_string(), node);
                created.push((index, node));
            }
        }
        resolver.install(path, fragments);

        for (index, node) in created {
            ctx.apply_references(
                node,
                parsed.elements[index].as_ref(),
                resolver,
                false,
                &mut stats,
            )?;
        }
        Ok(stats)
    }

    /// Deletes whatever an aborted batch load managed to write.
    fn remove_partial_file(
        &self,
        url: &str,
        path: &str,
        effective: &EffectiveMetamodel,
    ) -> Result<(), SyncError> {
        let Some(file_node) = self.file_node(url, path)? else {
            return Ok(());
        };
        let ctx = self.context(url, path, effective, file_node, true);
        let tx = self.backend.begin_transaction()?;
        let mut discarded = FileStats::default();
        deletion::delete_file(&ctx, &mut discarded)?;
        tx.success()?;
        Ok(())
    }

    /// Diffs an already-indexed file against its parsed contents and applies
    /// the delta inside one transaction.
    #[allow(clippy::too_many_arguments)]
    fn update_file(
        &self,
        url: &str,
        path: &str,
        revision: &str,
        file_node: NodeId,
        parsed: &ParsedModel,
        effective: &EffectiveMetamodel,
        resolver: &mut TargetResolver,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let uri = file_uri(url, path);

        let mut existing: HashMap<IdentityKey, (NodeId, String)> = HashMap::new();
        let mut fragments: HashMap<String, NodeId> = HashMap::new();
        for edge in self.backend.incoming(file_node, Some(EDGE_LABEL_FILE))? {
            let node = edge.from;
            let Some(PropertyValue::Str(fragment)) =
                self.backend.node_property(node, IDENTIFIER_PROPERTY)?
            else {
                continue;
            };
            let signature = match self.backend.node_property(node, SIGNATURE_PROPERTY)? {
                Some(PropertyValue::Str(signature)) => signature,
                _ => String::new(),
            };
            let unique = self
                .backend
                .index_get(INDEX_FRAGMENTS, &fragment, FRAGMENT_UNIQUE_VALUE)?
                .contains(&node);
            let key = if unique {
                IdentityKey::Unique {
                    fragment: fragment.clone(),
                }
            } else {
                IdentityKey::Scoped {
                    path: path.to_string(),
                    fragment: fragment.clone(),
                }
            };
            existing.insert(key, (node, signature));
            fragments.insert(fragment, node);
        }

        let diff = diff_file(&parsed.elements, &existing, path);
        if diff.is_empty() {
            // Same content at a new revision; restamp without an envelope.
            let tx = self.backend.begin_transaction()?;
            self.backend
                .set_node_property(file_node, FILE_REVISION_PROPERTY, revision.into())?;
            tx.success()?;
            resolver.install(path, fragments);
            report.files_skipped += 1;
            return Ok(());
        }
        debug!(
            repository = %url,
            %path,
            added = diff.added.len(),
            changed = diff.changed.len(),
            removed = diff.removed.len(),
            "applying file delta"
        );

        self.bus.emit(&ChangeEvent::ChangeStart { file: uri.clone() });
        let ctx = self.context(url, path, effective, file_node, false);
        match Self::transactional_update(
            &ctx,
            revision,
            parsed,
            &diff,
            &mut fragments,
            resolver,
        ) {
            Ok(stats) => {
                self.bus.emit(&ChangeEvent::ChangeSuccess { file: uri });
                resolver.install(path, fragments);
                stats.merge_into(report);
                report.files_synchronised += 1;
                Ok(())
            }
            Err(err) => {
                self.bus.emit(&ChangeEvent::ChangeFailure { file: uri });
                Err(err)
            }
        }
    }

    fn transactional_update(
        ctx: &FileContext<'_>,
        revision: &str,
        parsed: &ParsedModel,
        diff: &diff::DiffResult,
        fragments: &mut HashMap<String, NodeId>,
        resolver: &mut TargetResolver,
    ) -> Result<FileStats, SyncError> {
        let mut stats = FileStats::default();
        let tx = ctx.backend.begin_transaction()?;

        let mut touched: Vec<(usize, NodeId)> = Vec::new();
        for &index in &diff.added {
            let element = parsed.elements[index].as_ref();
            if let Some(node) = ctx.create_element(element, &mut stats)? {
                fragments.insert(element.uri_fragment().to_string(), node);
                touched.push((index, node));
            }
        }
        for &(index, node) in &diff.changed {
            ctx.update_element(node, parsed.elements[index].as_ref(), &mut stats)?;
            touched.push((index, node));
        }
        for (key, node) in &diff.removed {
            deletion::detach_element(ctx, *node, false, &mut stats)?;
            fragments.remove(key.fragment());
        }

        // References after all nodes exist, so in-file targets resolve.
        resolver.install(ctx.path, fragments.clone());
        for (index, node) in touched {
            ctx.apply_references(node, parsed.elements[index].as_ref(), resolver, true, &mut stats)?;
        }

        ctx.backend
            .set_node_property(ctx.file_node, FILE_REVISION_PROPERTY, revision.into())?;
        tx.success()?;
        Ok(stats)
    }

    /// Removes a deleted file and its elements. Returns `false` when the
    /// deletion failed (recorded, cycle continues).
    fn delete_indexed_file(
        &self,
        url: &str,
        path: &str,
        effective: &EffectiveMetamodel,
        report: &mut SyncReport,
    ) -> Result<bool, SyncError> {
        let Some(file_node) = self.file_node(url, path)? else {
            return Ok(true);
        };
        let uri = file_uri(url, path);
        self.bus.emit(&ChangeEvent::ChangeStart { file: uri.clone() });

        let ctx = self.context(url, path, effective, file_node, false);
        let mut stats = FileStats::default();
        let deleted = (|| -> Result<(), SyncError> {
            let tx = self.backend.begin_transaction()?;
            deletion::delete_file(&ctx, &mut stats)?;
            tx.success()?;
            Ok(())
        })();

        match deleted {
            Ok(()) => {
                self.bus.emit(&ChangeEvent::ChangeSuccess { file: uri });
                stats.merge_into(report);
                report.files_synchronised += 1;
                Ok(true)
            }
            Err(err) => {
                warn!(repository = %url, %path, %err, "failed to delete indexed file");
                self.bus.emit(&ChangeEvent::ChangeFailure { file: uri });
                report.files_failed.push(FileFailure {
                    path: path.to_string(),
                    reason: err.to_string(),
                });
                Ok(false)
            }
        }
    }

    /// Resolves proxies parked against one file. Returns `false` when the
    /// attempt failed.
    fn resolve_proxies_for_file(
        &self,
        url: &str,
        path: &str,
        resolver: &mut TargetResolver,
        report: &mut SyncReport,
    ) -> Result<bool, SyncError> {
        let uri = file_uri(url, path);
        let holders = self.backend.index_get(INDEX_PROXIES, PROXY_KEY, &uri)?;
        if holders.is_empty() {
            return Ok(true);
        }
        let Some(map) = resolver.file_map(&*self.backend, path)?.cloned() else {
            return Ok(true);
        };

        self.bus.emit(&ChangeEvent::ChangeStart { file: uri.clone() });
        let applied = (|| -> Result<usize, SyncError> {
            let tx = self.backend.begin_transaction()?;
            let mut resolved = 0;
            for holder in &holders {
                if !self.backend.node_exists(*holder) {
                    self.backend
                        .index_remove(INDEX_PROXIES, PROXY_KEY, &uri, *holder)?;
                    continue;
                }
                resolved += self.resolve_proxies_on(*holder, &uri, &map)?;
            }
            tx.success()?;
            Ok(resolved)
        })();

        match applied {
            Ok(resolved) => {
                self.bus.emit(&ChangeEvent::ChangeSuccess { file: uri });
                if resolved > 0 {
                    debug!(repository = %url, %path, resolved, "resolved proxy references");
                    report.references_resolved += resolved;
                }
                Ok(true)
            }
            Err(err) => {
                warn!(repository = %url, %path, %err, "failed to resolve proxies");
                self.bus.emit(&ChangeEvent::ChangeFailure { file: uri });
                report.files_failed.push(FileFailure {
                    path: path.to_string(),
                    reason: err.to_string(),
                });
                Ok(false)
            }
        }
    }

    fn resolve_proxies_on(
        &self,
        holder: NodeId,
        uri: &str,
        map: &HashMap<String, NodeId>,
    ) -> Result<usize, SyncError> {
        let key = format!("{PROXY_PROPERTY_PREFIX}{uri}");
        let Some(PropertyValue::List(list)) = self.backend.node_property(holder, &key)? else {
            self.backend
                .index_remove(INDEX_PROXIES, PROXY_KEY, uri, holder)?;
            return Ok(0);
        };

        let mut retained: Vec<PropertyValue> = Vec::new();
        let mut resolved = 0;
        for quad in list.chunks(4) {
            let [PropertyValue::Str(fragment), PropertyValue::Str(label), PropertyValue::Bool(containment), PropertyValue::Bool(container)] =
                quad
            else {
                continue;
            };
            match map.get(fragment.as_str()) {
                Some(&target) if self.backend.node_exists(target) => {
                    let already = self
                        .backend
                        .outgoing(holder, Some(label))?
                        .iter()
                        .any(|e| e.to == target);
                    if !already {
                        let mut props: Vec<(String, PropertyValue)> = Vec::new();
                        if *containment {
                            props.push((PROPERTY_CONTAINMENT.to_string(), true.into()));
                        }
                        if *container {
                            props.push((PROPERTY_CONTAINER.to_string(), true.into()));
                        }
                        self.backend.create_relationship(holder, target, label, &props)?;
                        self.bus.emit(&ChangeEvent::ReferenceAdded {
                            source: holder,
                            target,
                            label: label.clone(),
                            transient: false,
                        });
                    }
                    resolved += 1;
                }
                _ => retained.extend_from_slice(quad),
            }
        }

        if retained.is_empty() {
            self.backend.remove_node_property(holder, &key)?;
            self.backend
                .index_remove(INDEX_PROXIES, PROXY_KEY, uri, holder)?;
        } else {
            self.backend
                .set_node_property(holder, &key, PropertyValue::List(retained))?;
        }
        Ok(resolved)
    }
}
