use crate::backup::BackupStore;
use crate::plugin::{self, ComponentCode, Instance, LoadContext, PluginCatalog};
use crate::registry::RegistryStore;
use crate::report::{DependencyReport, DependencyStatus, LoadedInfo, SyncReport};
use crate::source::ComponentSource;
use crate::{archive, fsops, resolver};
use alfred_core::{
    ComponentKind, ComponentMetadata, ComponentRecord, Config, Error, Paths, Registry, Result,
};
use chrono::{DateTime, Local, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ffi::OsStr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn, Span};

/// Tunables of the component manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// How long a completed discovery is reused before listing again.
    pub discovery_ttl: Duration,
    pub max_backups: usize,
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            discovery_ttl: Duration::from_secs(config.sync.discovery_ttl_secs),
            max_backups: config.sync.max_backups,
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct LoadedComponent {
    kind: ComponentKind,
    code: Arc<dyn ComponentCode>,
    instance: Option<Instance>,
    provides: Vec<String>,
    load_seq: u64,
    loaded_at: DateTime<Utc>,
}

impl LoadedComponent {
    fn handle(&self, id: &str) -> LoadedHandle {
        LoadedHandle {
            id: id.to_string(),
            kind: self.kind,
            instance: self.instance.clone(),
            load_seq: self.load_seq,
        }
    }
}

#[derive(Default)]
struct LoadedSet {
    components: HashMap<String, LoadedComponent>,
    /// capability name -> providing component id
    capabilities: HashMap<String, String>,
    next_seq: u64,
}

/// Returned by [`ComponentManager::load`].
#[derive(Clone)]
pub struct LoadedHandle {
    pub id: String,
    pub kind: ComponentKind,
    pub instance: Option<Instance>,
    pub load_seq: u64,
}

fn guarded<T>(id: &str, op: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|_| Err(Error::Contract(format!("{} panicked during {}", id, op))))
}

/// Registry, cache, backups and lifecycle of downloadable components.
///
/// The `registry` mutex guards both the in-memory registry and every change
/// to a component's cache or backup directory. The `loaded` mutex is held
/// for a whole load or unload; when both are needed `loaded` is taken first.
pub struct ComponentManager {
    paths: Paths,
    source: Arc<dyn ComponentSource>,
    catalog: PluginCatalog,
    options: ManagerOptions,
    store: RegistryStore,
    backups: BackupStore,
    registry: Mutex<Registry>,
    loaded: Mutex<LoadedSet>,
    span: Span,
}

impl ComponentManager {
    pub fn new(
        paths: Paths,
        source: Arc<dyn ComponentSource>,
        catalog: PluginCatalog,
        options: ManagerOptions,
    ) -> Self {
        Self::with_span(paths, source, catalog, options, tracing::info_span!("components"))
    }

    pub fn with_span(
        paths: Paths,
        source: Arc<dyn ComponentSource>,
        catalog: PluginCatalog,
        options: ManagerOptions,
        span: Span,
    ) -> Self {
        let store = RegistryStore::new(paths.registry_file());
        let registry = span.in_scope(|| store.load(source.org()));
        let backups = BackupStore::new(paths.backups_dir());
        Self {
            paths,
            source,
            catalog,
            options,
            store,
            backups,
            registry: Mutex::new(registry),
            loaded: Mutex::new(LoadedSet::default()),
            span,
        }
    }

    pub fn catalog(&self) -> &PluginCatalog {
        &self.catalog
    }

    // ── Discovery ──────────────────────────────────────────────────────

    /// Refreshes the registry from the source and returns its components.
    ///
    /// Without `force_refresh` a discovery completed within the TTL is reused.
    /// If the listing fails the cached registry is returned unchanged.
    pub async fn discover(&self, force_refresh: bool) -> BTreeMap<String, ComponentRecord> {
        if !force_refresh {
            let registry = self.registry.lock().await;
            if let Some(last) = registry.last_sync {
                let fresh = Utc::now()
                    .signed_duration_since(last)
                    .to_std()
                    .map(|age| age < self.options.discovery_ttl)
                    .unwrap_or(false);
                if fresh {
                    debug!(parent: &self.span, "Using cached component registry");
                    return registry.components.clone();
                }
            }
        }

        info!(parent: &self.span, org = %self.source.org(), "Discovering components");
        let repos = match self.source.list_repositories().await {
            Ok(repos) => repos,
            Err(e) => {
                error!(parent: &self.span, error = %e, "Component discovery failed, using cached registry");
                return self.registry.lock().await.components.clone();
            }
        };

        let mut discovered = Vec::new();
        for repo in repos {
            let Some((kind, id)) = ComponentKind::parse_repo_name(&repo.name) else {
                continue;
            };
            match self.source.fetch_metadata(&repo.name).await {
                Ok(meta) => {
                    let mut record = ComponentRecord::from_metadata(&id, kind, &repo.name, meta);
                    record.repo_url = repo.html_url.clone();
                    record.last_updated = repo.updated_at.clone();
                    debug!(parent: &self.span, component = %id, kind = %kind, "Discovered component");
                    discovered.push(record);
                }
                Err(e) => {
                    warn!(parent: &self.span, repo = %repo.name, error = %e, "Skipping repository without usable metadata");
                }
            }
        }

        let mut registry = self.registry.lock().await;
        let count = discovered.len();
        for record in discovered {
            registry.upsert_remote(record);
        }
        registry.last_sync = Some(Utc::now());
        registry.source_org = self.source.org().to_string();
        if let Err(e) = self.store.save(&registry) {
            error!(parent: &self.span, error = %e, "Failed to save component registry");
        }
        info!(parent: &self.span, count, "Component discovery complete");
        registry.components.clone()
    }

    // ── Download ───────────────────────────────────────────────────────

    /// Downloads `id` (the tag `version` if given, else the branch head) into
    /// the cache, then every dependency that is not cached yet.
    ///
    /// Returns whether `id` itself was installed. Dependency failures are
    /// logged only; the subsequent load reports them.
    pub async fn download(&self, id: &str, version: Option<&str>) -> bool {
        let mut queue: VecDeque<(String, Option<String>)> = VecDeque::new();
        queue.push_back((id.to_string(), version.map(str::to_string)));
        let mut visited: HashSet<String> = HashSet::new();

        while let Some((current, pinned)) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            match self.fetch_and_install(&current, pinned.as_deref()).await {
                Ok(dependencies) => {
                    for dep in dependencies {
                        if !visited.contains(&dep) && !self.is_locally_available(&dep).await {
                            queue.push_back((dep, None));
                        }
                    }
                }
                Err(e) if current == id => {
                    error!(parent: &self.span, component = %id, error = %e, "Download failed");
                    return false;
                }
                Err(e) => {
                    warn!(
                        parent: &self.span,
                        component = %id,
                        dependency = %current,
                        error = %e,
                        "Dependency download failed"
                    );
                }
            }
        }
        true
    }

    /// Installs one component and returns its dependency ids.
    async fn fetch_and_install(&self, id: &str, version: Option<&str>) -> Result<Vec<String>> {
        let known = self.registry.lock().await.contains(id);
        if !known {
            debug!(parent: &self.span, component = %id, "Unknown component, refreshing registry");
            self.discover(true).await;
        }

        let repo = {
            let registry = self.registry.lock().await;
            let record = registry
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("Component {} is not registered", id)))?;
            format!("{}{}", record.kind.repo_prefix(), id)
        };

        info!(
            parent: &self.span,
            component = %id,
            version = version.unwrap_or("latest"),
            "Downloading component"
        );
        let bytes = self.source.fetch_archive(&repo, version).await?;

        let mut registry = self.registry.lock().await;
        let cache_dir = self.paths.cache_dir();
        std::fs::create_dir_all(&cache_dir)?;
        let target = self.paths.component_cache_dir(id);
        archive::install(&bytes, &cache_dir, id, &target)?;

        let record = registry
            .components
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Component {} is not registered", id)))?;
        let previous = record.clone();
        // Tags often carry a `v` prefix the metadata version lacks.
        let installed_version = read_metadata(&target)
            .map(|meta| meta.version)
            .or_else(|| version.map(|tag| tag.trim_start_matches('v').to_string()))
            .unwrap_or_else(|| record.version.clone());
        record.locally_available = true;
        record.local_path = Some(target);
        record.local_version = Some(installed_version);
        record.download_time = Some(Utc::now());
        record.fallback_used = false;
        let dependencies = record.dependencies.clone();

        if let Err(e) = self.store.save(&registry) {
            registry.components.insert(id.to_string(), previous);
            return Err(e);
        }
        info!(parent: &self.span, component = %id, "Component downloaded");
        Ok(dependencies)
    }

    // ── Dependencies ───────────────────────────────────────────────────

    /// Dependencies of `id` in load order, or `None` if `id` is unknown or
    /// part of a cycle.
    pub async fn resolve_dependencies(&self, id: &str) -> Option<Vec<String>> {
        let registry = self.registry.lock().await;
        let resolved = resolver::resolve(&registry, id);
        if resolved.is_none() {
            warn!(parent: &self.span, component = %id, "Dependencies unresolved (unknown component or cycle)");
        }
        resolved
    }

    pub async fn dependency_report(&self, id: &str) -> Option<DependencyReport> {
        let loaded: HashSet<String> = self.loaded.lock().await.components.keys().cloned().collect();
        let registry = self.registry.lock().await;
        let record = registry.get(id)?;

        let dependencies: Vec<DependencyStatus> = record
            .dependencies
            .iter()
            .map(|dep| {
                let dep_record = registry.get(dep);
                let sub_dependencies = dep_record.map(|r| r.dependencies.clone()).unwrap_or_default();
                DependencyStatus {
                    id: dep.clone(),
                    available: dep_record.is_some(),
                    locally_available: dep_record.map(|r| r.locally_available).unwrap_or(false),
                    loaded: loaded.contains(dep),
                    resolved: dep_record.is_some() && sub_dependencies.iter().all(|s| registry.contains(s)),
                    sub_dependencies,
                }
            })
            .collect();

        Some(DependencyReport {
            component_id: id.to_string(),
            total_dependencies: dependencies.len(),
            all_resolved: dependencies.iter().all(|d| d.available && d.resolved),
            dependencies,
        })
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Loads `id` and, first, everything it depends on.
    ///
    /// An already loaded component is returned as is. On any failure the
    /// components loaded by this call are unloaded again, newest first, and
    /// `None` is returned.
    pub async fn load(&self, id: &str, ctx: &LoadContext) -> Option<LoadedHandle> {
        let mut loaded = self.loaded.lock().await;
        if let Some(existing) = loaded.components.get(id) {
            debug!(parent: &self.span, component = %id, "Component already loaded");
            return Some(existing.handle(id));
        }

        let mut newly_loaded = Vec::new();
        match self.load_graph(id, ctx, &mut loaded, &mut newly_loaded).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(parent: &self.span, component = %id, error = %e, "Failed to load component");
                for dep in newly_loaded.iter().rev() {
                    warn!(parent: &self.span, component = %dep, "Unloading after failed load");
                    self.teardown(&mut loaded, dep);
                }
                None
            }
        }
    }

    async fn load_graph(
        &self,
        id: &str,
        ctx: &LoadContext,
        loaded: &mut LoadedSet,
        newly_loaded: &mut Vec<String>,
    ) -> Result<LoadedHandle> {
        if !self.is_locally_available(id).await && !self.download(id, None).await {
            return Err(Error::NotFound(format!(
                "{} is not cached and could not be downloaded",
                id
            )));
        }

        let mut order = self
            .resolve_dependencies(id)
            .await
            .ok_or_else(|| Error::Dependency(format!("Cannot resolve dependencies of {}", id)))?;
        order.push(id.to_string());

        for current in &order {
            if loaded.components.contains_key(current) {
                continue;
            }
            if !self.is_locally_available(current).await && !self.download(current, None).await {
                return Err(Error::Dependency(format!(
                    "Dependency {} of {} is unavailable",
                    current, id
                )));
            }
            self.bring_up(current, ctx, loaded).await?;
            newly_loaded.push(current.clone());
        }

        loaded
            .components
            .get(id)
            .map(|c| c.handle(id))
            .ok_or_else(|| Error::Other(format!("{} missing after load", id)))
    }

    async fn bring_up(&self, id: &str, ctx: &LoadContext, loaded: &mut LoadedSet) -> Result<()> {
        let record = self
            .registry
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Component {} is not registered", id)))?;
        if !record.locally_available {
            return Err(Error::NotFound(format!("Component {} is not cached", id)));
        }

        let dir = record
            .local_path
            .clone()
            .unwrap_or_else(|| self.paths.component_cache_dir(id));
        let symbol = plugin::entry_symbol(&dir, id)?;
        let code = self.catalog.instantiate(&symbol).ok_or_else(|| {
            Error::Contract(format!("Symbol '{}' of {} is not linked into this build", symbol, id))
        })?;
        let config = ctx.config.component_config(id);

        let instance = match record.kind {
            ComponentKind::Agent => {
                let Some(entry) = code.agent() else {
                    warn!(parent: &self.span, component = %id, "Agent lacks start/stop, unloading its code");
                    return Err(Error::Contract(format!("Agent {} does not expose start/stop", id)));
                };
                Some(guarded(id, "start", || entry.start(&ctx.bus, &ctx.state, &config))?)
            }
            ComponentKind::Module => {
                let Some(entry) = code.module() else {
                    warn!(parent: &self.span, component = %id, "Module lacks initialize/cleanup, unloading its code");
                    return Err(Error::Contract(format!(
                        "Module {} does not expose initialize/cleanup",
                        id
                    )));
                };
                Some(guarded(id, "initialize", || entry.initialize(id, &config))?)
            }
            ComponentKind::Provider => None,
        };

        let load_seq = loaded.next_seq;
        loaded.next_seq += 1;
        for capability in &record.provides {
            if let Some(previous) = loaded.capabilities.insert(capability.clone(), id.to_string()) {
                if previous != id {
                    warn!(
                        parent: &self.span,
                        capability = %capability,
                        previous = %previous,
                        provider = %id,
                        "Capability already provided, last loaded component wins"
                    );
                }
            }
        }
        loaded.components.insert(
            id.to_string(),
            LoadedComponent {
                kind: record.kind,
                code,
                instance,
                provides: record.provides,
                load_seq,
                loaded_at: Utc::now(),
            },
        );
        info!(parent: &self.span, component = %id, kind = %record.kind, load_seq, "Component loaded");
        Ok(())
    }

    /// Stops and removes `id` from the loaded set. Returns true once `id`
    /// is not loaded, including when it was not loaded to begin with.
    pub async fn unload(&self, id: &str) -> bool {
        let mut loaded = self.loaded.lock().await;
        if !loaded.components.contains_key(id) {
            debug!(parent: &self.span, component = %id, "Component not loaded");
            return true;
        }

        let dependents = self.loaded_dependents(&loaded, id).await;
        if !dependents.is_empty() {
            warn!(
                parent: &self.span,
                component = %id,
                dependents = ?dependents,
                "Unloading a component that loaded components depend on"
            );
        }
        self.teardown(&mut loaded, id);
        info!(parent: &self.span, component = %id, "Component unloaded");
        true
    }

    fn teardown(&self, loaded: &mut LoadedSet, id: &str) {
        let Some(component) = loaded.components.remove(id) else {
            return;
        };

        if let Some(instance) = &component.instance {
            let result = match component.kind {
                ComponentKind::Agent => component
                    .code
                    .agent()
                    .map(|entry| guarded(id, "stop", || entry.stop(instance))),
                ComponentKind::Module => component
                    .code
                    .module()
                    .map(|entry| guarded(id, "cleanup", || entry.cleanup(instance))),
                ComponentKind::Provider => None,
            };
            if let Some(Err(e)) = result {
                warn!(parent: &self.span, component = %id, error = %e, "Component shutdown failed, removing it anyway");
            }
        }

        // Hand capabilities back to the newest remaining provider.
        for capability in &component.provides {
            if loaded.capabilities.get(capability).map(String::as_str) != Some(id) {
                continue;
            }
            let replacement = loaded
                .components
                .iter()
                .filter(|(_, c)| c.provides.contains(capability))
                .max_by_key(|(_, c)| c.load_seq)
                .map(|(other, _)| other.clone());
            match replacement {
                Some(other) => {
                    loaded.capabilities.insert(capability.clone(), other);
                }
                None => {
                    loaded.capabilities.remove(capability);
                }
            }
        }
    }

    async fn loaded_dependents(&self, loaded: &LoadedSet, id: &str) -> Vec<String> {
        let registry = self.registry.lock().await;
        let mut dependents: Vec<String> = loaded
            .components
            .keys()
            .filter(|other| {
                registry
                    .get(other)
                    .map(|r| r.dependencies.iter().any(|d| d == id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        dependents.sort();
        dependents
    }

    /// Loaded components that declare a dependency on `id`.
    pub async fn dependents_of(&self, id: &str) -> Vec<String> {
        let loaded = self.loaded.lock().await;
        self.loaded_dependents(&loaded, id).await
    }

    // ── Sync, backups and fallback ─────────────────────────────────────

    /// Full resynchronization: forced discovery, download of every component
    /// whose cached version differs from the registry, then one backup
    /// snapshot of all cached components plus the registry file, followed by
    /// backup rotation.
    pub async fn sync_all(&self) -> SyncReport {
        info!(parent: &self.span, "Starting component synchronization");
        let mut report = SyncReport::default();
        self.discover(true).await;

        let stale: Vec<String> = {
            let registry = self.registry.lock().await;
            registry
                .components
                .values()
                .filter(|r| r.needs_update())
                .map(|r| r.id.clone())
                .collect()
        };
        for id in stale {
            match self.fetch_and_install(&id, None).await {
                Ok(_) => report.updated.push(id),
                Err(e) => {
                    warn!(parent: &self.span, component = %id, error = %e, "Sync download failed");
                    report.failed.push(id);
                }
            }
        }

        let registry = self.registry.lock().await;
        if let Err(e) = self.snapshot(&registry, &mut report) {
            error!(parent: &self.span, error = %e, "Backup snapshot failed");
            report.error = Some(e.to_string());
        }
        info!(
            parent: &self.span,
            updated = report.updated.len(),
            failed = report.failed.len(),
            backed_up = report.backed_up.len(),
            "Component synchronization complete"
        );
        report
    }

    fn snapshot(&self, registry: &Registry, report: &mut SyncReport) -> Result<()> {
        let snapshot = self.backups.create_snapshot(Local::now())?;
        report.backup_path = Some(snapshot.clone());

        for record in registry.components.values().filter(|r| r.locally_available) {
            let cached = record
                .local_path
                .clone()
                .unwrap_or_else(|| self.paths.component_cache_dir(&record.id));
            if !cached.is_dir() {
                warn!(parent: &self.span, component = %record.id, "Cached copy missing, not backed up");
                continue;
            }
            match fsops::copy_dir_all(&cached, &snapshot.join(&record.id)) {
                Ok(()) => report.backed_up.push(record.id.clone()),
                Err(e) => warn!(parent: &self.span, component = %record.id, error = %e, "Failed to back up component"),
            }
        }

        self.store.save(registry)?;
        let registry_name = self
            .store
            .path()
            .file_name()
            .ok_or_else(|| Error::Registry("Registry path has no file name".to_string()))?;
        std::fs::copy(self.store.path(), snapshot.join(registry_name))?;

        report.removed_backups = self.backups.rotate(self.options.max_backups)?;
        info!(parent: &self.span, backup = %snapshot.display(), "Backup snapshot created");
        Ok(())
    }

    /// Keeps the `max_backups` newest snapshots. Returns how many were removed.
    pub async fn rotate_backups(&self, max_backups: usize) -> usize {
        let _registry = self.registry.lock().await;
        match self.backups.rotate(max_backups) {
            Ok(removed) => removed.len(),
            Err(e) => {
                error!(parent: &self.span, error = %e, "Backup rotation failed");
                0
            }
        }
    }

    /// Restores `id` from the newest backup containing it.
    ///
    /// True if the component is cached afterwards. Without a backup the
    /// registry is left untouched and false is returned.
    pub async fn use_fallback(&self, id: &str) -> bool {
        let mut registry = self.registry.lock().await;
        if registry.is_locally_available(id) {
            debug!(parent: &self.span, component = %id, "Component already cached, no fallback needed");
            return true;
        }

        let Some(backup) = self.backups.find_latest_containing(id) else {
            warn!(parent: &self.span, component = %id, "No backup contains this component");
            return false;
        };
        let target = self.paths.component_cache_dir(id);
        let installed = std::fs::create_dir_all(self.paths.cache_dir())
            .map_err(Error::from)
            .and_then(|_| fsops::install_copy(&backup, &target));
        if let Err(e) = installed {
            error!(parent: &self.span, component = %id, error = %e, "Failed to restore component from backup");
            return false;
        }

        let previous = registry.components.get(id).cloned();
        let registry_name = self.store.path().file_name();
        let backup_version = read_metadata(&backup).map(|m| m.version);
        let record = registry
            .components
            .entry(id.to_string())
            .or_insert_with(|| restored_record(id, &backup, registry_name));
        record.locally_available = true;
        record.local_path = Some(target);
        record.fallback_used = true;
        record.fallback_time = Some(Utc::now());
        if backup_version.is_some() {
            record.local_version = backup_version;
        }

        if let Err(e) = self.store.save(&registry) {
            error!(parent: &self.span, component = %id, error = %e, "Failed to save registry after fallback");
            match previous {
                Some(previous) => registry.components.insert(id.to_string(), previous),
                None => registry.components.remove(id),
            };
            return false;
        }
        info!(parent: &self.span, component = %id, backup = %backup.display(), "Component restored from backup");
        true
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub async fn record(&self, id: &str) -> Option<ComponentRecord> {
        self.registry.lock().await.get(id).cloned()
    }

    /// Registered components, optionally filtered by kind and category.
    pub async fn list(&self, kind: Option<ComponentKind>, category: Option<&str>) -> Vec<ComponentRecord> {
        let registry = self.registry.lock().await;
        registry
            .components
            .values()
            .filter(|r| kind.map(|k| r.kind == k).unwrap_or(true))
            .filter(|r| category.map(|c| r.category == c).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.registry.lock().await.last_sync
    }

    pub async fn is_locally_available(&self, id: &str) -> bool {
        self.registry.lock().await.is_locally_available(id)
    }

    pub async fn is_loaded(&self, id: &str) -> bool {
        self.loaded.lock().await.components.contains_key(id)
    }

    pub async fn instance(&self, id: &str) -> Option<Instance> {
        self.loaded
            .lock()
            .await
            .components
            .get(id)
            .and_then(|c| c.instance.clone())
    }

    /// Loaded components in load order.
    pub async fn loaded_components(&self) -> Vec<LoadedInfo> {
        let loaded = self.loaded.lock().await;
        let mut infos: Vec<LoadedInfo> = loaded
            .components
            .iter()
            .map(|(id, c)| LoadedInfo {
                id: id.clone(),
                kind: c.kind,
                load_seq: c.load_seq,
                loaded_at: c.loaded_at,
            })
            .collect();
        infos.sort_by_key(|i| i.load_seq);
        infos
    }

    /// Loaded component currently answering for `capability`.
    pub async fn provider_of(&self, capability: &str) -> Option<String> {
        self.loaded.lock().await.capabilities.get(capability).cloned()
    }
}

fn read_metadata(dir: &Path) -> Option<ComponentMetadata> {
    let content = std::fs::read_to_string(dir.join("metadata.json")).ok()?;
    serde_json::from_str(&content).ok()
}

/// Record of `id` in the registry copy saved next to a backup.
fn snapshot_record(backup: &Path, registry_name: Option<&OsStr>, id: &str) -> Option<ComponentRecord> {
    let saved = backup.parent()?.join(registry_name?);
    let content = std::fs::read_to_string(saved).ok()?;
    let mut registry: Registry = serde_json::from_str(&content).ok()?;
    registry.components.remove(id)
}

/// Record for a component only known through a backup copy.
fn restored_record(id: &str, backup: &Path, registry_name: Option<&OsStr>) -> ComponentRecord {
    let mut record = match snapshot_record(backup, registry_name, id) {
        Some(mut saved) => {
            saved.download_time = None;
            saved
        }
        None => restored_from_metadata(id, backup),
    };
    record.from_backup = true;
    record
}

fn restored_from_metadata(id: &str, backup: &Path) -> ComponentRecord {
    match read_metadata(backup) {
        Some(meta) => {
            let kind = meta.kind.unwrap_or(ComponentKind::Module);
            ComponentRecord::from_metadata(id, kind, id, meta)
        }
        None => {
            let mut record = ComponentRecord::new(id, ComponentKind::Module);
            record.description = "Restored from backup".to_string();
            record.version = "unknown".to_string();
            record
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{AgentEntry, CodeOnly, ComponentInstance, ModuleEntry};
    use crate::source::{LocalSource, RemoteRepository};
    use alfred_runtime::{MessageBus, StateManager};
    use async_trait::async_trait;
    use std::any::Any;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Probe;

    impl ComponentInstance for Probe {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    struct CountingAgent(Arc<Counters>);

    impl AgentEntry for CountingAgent {
        fn start(&self, _bus: &MessageBus, _state: &StateManager, _config: &serde_json::Value) -> Result<Instance> {
            self.0.starts.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Probe))
        }

        fn stop(&self, _instance: &Instance) -> Result<()> {
            self.0.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl ComponentCode for CountingAgent {
        fn agent(&self) -> Option<&dyn AgentEntry> {
            Some(self)
        }
    }

    struct PlainModule;

    impl ModuleEntry for PlainModule {
        fn initialize(&self, _id: &str, _config: &serde_json::Value) -> Result<Instance> {
            Ok(Arc::new(Probe))
        }
    }

    impl ComponentCode for PlainModule {
        fn module(&self) -> Option<&dyn ModuleEntry> {
            Some(self)
        }
    }

    struct FailingModule;

    impl ModuleEntry for FailingModule {
        fn initialize(&self, _id: &str, _config: &serde_json::Value) -> Result<Instance> {
            Err(Error::Other("initialize failed".to_string()))
        }
    }

    impl ComponentCode for FailingModule {
        fn module(&self) -> Option<&dyn ModuleEntry> {
            Some(self)
        }
    }

    struct OfflineSource;

    #[async_trait]
    impl ComponentSource for OfflineSource {
        fn org(&self) -> &str {
            "alfred-project"
        }

        async fn list_repositories(&self) -> Result<Vec<RemoteRepository>> {
            Err(Error::Http("offline".to_string()))
        }

        async fn fetch_metadata(&self, _repo: &str) -> Result<ComponentMetadata> {
            Err(Error::Http("offline".to_string()))
        }

        async fn fetch_archive(&self, _repo: &str, _version: Option<&str>) -> Result<Vec<u8>> {
            Err(Error::Http("offline".to_string()))
        }
    }

    fn add_repo(
        mirror: &Path,
        kind: ComponentKind,
        id: &str,
        version: &str,
        deps: &[&str],
        provides: &[&str],
        symbol: &str,
    ) {
        let dir = mirror.join(format!("{}{}", kind.repo_prefix(), id));
        std::fs::create_dir_all(&dir).unwrap();
        let meta = serde_json::json!({
            "name": id,
            "description": format!("{} component", id),
            "version": version,
            "kind": kind,
            "dependencies": deps,
            "provides": provides,
        });
        std::fs::write(dir.join("metadata.json"), meta.to_string()).unwrap();
        std::fs::write(dir.join("main.json"), serde_json::json!({ "symbol": symbol }).to_string()).unwrap();
    }

    struct Harness {
        _temp: TempDir,
        mirror: PathBuf,
        paths: Paths,
        counters: Arc<Counters>,
        manager: ComponentManager,
        ctx: LoadContext,
    }

    fn catalog(counters: &Arc<Counters>) -> PluginCatalog {
        let mut catalog = PluginCatalog::new();
        let c = Arc::clone(counters);
        catalog.register("weather", move || Arc::new(CountingAgent(Arc::clone(&c))));
        catalog.register("geo", || Arc::new(CodeOnly));
        catalog.register("home", || Arc::new(PlainModule));
        catalog.register("not_an_agent", || Arc::new(CodeOnly));
        catalog.register("failing", || Arc::new(FailingModule));
        catalog
    }

    fn context() -> LoadContext {
        let bus = MessageBus::new();
        LoadContext {
            state: StateManager::new(bus.clone()),
            bus,
            config: Arc::new(Config::default()),
        }
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let mirror = temp.path().join("mirror");
        add_repo(&mirror, ComponentKind::Provider, "geo", "1.0.0", &[], &["geocoding"], "geo");
        add_repo(&mirror, ComponentKind::Agent, "weather", "1.0.0", &["geo"], &["weather_forecast"], "weather");
        add_repo(&mirror, ComponentKind::Module, "home", "0.3.0", &[], &["lights"], "home");

        let paths = Paths::with_base(temp.path().join("alfred"));
        paths.ensure_dirs().unwrap();
        let counters = Arc::new(Counters::default());
        let manager = ComponentManager::new(
            paths.clone(),
            Arc::new(LocalSource::new(mirror.clone(), "alfred-project", "main")),
            catalog(&counters),
            ManagerOptions::default(),
        );
        Harness {
            _temp: temp,
            mirror,
            paths,
            counters,
            manager,
            ctx: context(),
        }
    }

    #[tokio::test]
    async fn test_discover_registers_components() {
        let h = harness();
        std::fs::create_dir_all(h.mirror.join("alfred-agent-nometa")).unwrap();
        std::fs::create_dir_all(h.mirror.join("docs")).unwrap();

        let components = h.manager.discover(false).await;
        assert_eq!(components.len(), 3);
        assert_eq!(components["weather"].kind, ComponentKind::Agent);
        assert_eq!(components["weather"].dependencies, vec!["geo".to_string()]);
        assert_eq!(components["home"].version, "0.3.0");
        assert!(h.manager.last_sync().await.is_some());
        assert!(h.paths.registry_file().exists());

        // Within the TTL the cached registry is reused.
        add_repo(&h.mirror, ComponentKind::Module, "late", "0.1.0", &[], &[], "home");
        assert_eq!(h.manager.discover(false).await.len(), 3);
        assert_eq!(h.manager.discover(true).await.len(), 4);

        let agents = h.manager.list(Some(ComponentKind::Agent), None).await;
        assert_eq!(agents.len(), 1);
        assert!(h.manager.list(None, Some("media")).await.is_empty());
    }

    #[tokio::test]
    async fn test_discover_failure_keeps_cache() {
        let h = harness();
        h.manager.discover(false).await;

        let offline = ComponentManager::new(
            h.paths.clone(),
            Arc::new(OfflineSource),
            PluginCatalog::new(),
            ManagerOptions::default(),
        );
        let components = offline.discover(true).await;
        assert_eq!(components.len(), 3);
    }

    #[tokio::test]
    async fn test_download_is_idempotent() {
        let h = harness();
        assert!(h.manager.download("geo", None).await);
        let first = h.manager.record("geo").await.unwrap();
        assert!(first.locally_available);
        assert_eq!(first.local_version.as_deref(), Some("1.0.0"));
        assert!(h.paths.component_cache_dir("geo").join("main.json").is_file());

        assert!(h.manager.download("geo", None).await);
        let mut second = h.manager.record("geo").await.unwrap();
        second.download_time = first.download_time;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_download_pulls_dependencies() {
        let h = harness();
        assert!(h.manager.download("weather", None).await);
        assert!(h.manager.is_locally_available("geo").await);
        assert!(!h.manager.is_locally_available("home").await);
    }

    #[tokio::test]
    async fn test_download_unknown_component_fails() {
        let h = harness();
        assert!(!h.manager.download("nonexistent", None).await);
        assert!(h.manager.record("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_download_keeps_record() {
        let h = harness();
        h.manager.discover(false).await;
        let before = h.manager.record("geo").await.unwrap();
        let saved_before = std::fs::read(h.paths.registry_file()).unwrap();

        assert!(!h.manager.download("geo", Some("9.9.9")).await);
        let after = h.manager.record("geo").await.unwrap();
        assert_eq!(before, after);
        assert!(!after.locally_available);
        assert!(after.download_time.is_none());
        assert_eq!(std::fs::read(h.paths.registry_file()).unwrap(), saved_before);
        assert!(!h.paths.component_cache_dir("geo").exists());
    }

    /// Serves the branch head for any tag, like a tag named `v1.0.0`.
    struct TaggedSource(LocalSource);

    #[async_trait]
    impl ComponentSource for TaggedSource {
        fn org(&self) -> &str {
            self.0.org()
        }

        async fn list_repositories(&self) -> Result<Vec<RemoteRepository>> {
            self.0.list_repositories().await
        }

        async fn fetch_metadata(&self, repo: &str) -> Result<ComponentMetadata> {
            self.0.fetch_metadata(repo).await
        }

        async fn fetch_archive(&self, repo: &str, _version: Option<&str>) -> Result<Vec<u8>> {
            self.0.fetch_archive(repo, None).await
        }
    }

    #[tokio::test]
    async fn test_pinned_tag_records_installed_version() {
        let h = harness();
        let manager = ComponentManager::new(
            h.paths.clone(),
            Arc::new(TaggedSource(LocalSource::new(h.mirror.clone(), "alfred-project", "main"))),
            catalog(&h.counters),
            ManagerOptions::default(),
        );
        assert!(manager.download("geo", Some("v1.0.0")).await);
        let record = manager.record("geo").await.unwrap();
        assert_eq!(record.local_version.as_deref(), Some("1.0.0"));
        assert!(!record.needs_update());

        let report = manager.sync_all().await;
        assert!(!report.updated.contains(&"geo".to_string()));
    }

    #[tokio::test]
    async fn test_load_does_not_restart_loaded_agent() {
        let h = harness();
        let first = h.manager.load("weather", &h.ctx).await.unwrap();
        let second = h.manager.load("weather", &h.ctx).await.unwrap();
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(first.load_seq, second.load_seq);
        assert!(first.instance.is_some());
    }

    #[tokio::test]
    async fn test_dependencies_load_first() {
        let h = harness();
        let handle = h.manager.load("weather", &h.ctx).await.unwrap();
        assert_eq!(handle.kind, ComponentKind::Agent);

        let order: Vec<String> = h
            .manager
            .loaded_components()
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(order, vec!["geo".to_string(), "weather".to_string()]);
        assert_eq!(h.manager.provider_of("geocoding").await.as_deref(), Some("geo"));
        assert_eq!(h.manager.provider_of("weather_forecast").await.as_deref(), Some("weather"));
        assert_eq!(h.manager.dependents_of("geo").await, vec!["weather".to_string()]);
        // Providers have code but no instance.
        assert!(h.manager.instance("geo").await.is_none());
        assert!(h.manager.instance("weather").await.is_some());
    }

    #[tokio::test]
    async fn test_unload_then_load_restores_capabilities() {
        let h = harness();
        h.manager.load("weather", &h.ctx).await.unwrap();

        assert!(h.manager.unload("weather").await);
        assert_eq!(h.counters.stops.load(Ordering::SeqCst), 1);
        assert!(!h.manager.is_loaded("weather").await);
        assert!(h.manager.is_loaded("geo").await);
        assert!(h.manager.provider_of("weather_forecast").await.is_none());

        h.manager.load("weather", &h.ctx).await.unwrap();
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 2);
        assert_eq!(h.manager.provider_of("weather_forecast").await.as_deref(), Some("weather"));
    }

    #[tokio::test]
    async fn test_unload_not_loaded_is_noop() {
        let h = harness();
        assert!(h.manager.unload("weather").await);
        assert_eq!(h.counters.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_module_load_and_unload() {
        let h = harness();
        let handle = h.manager.load("home", &h.ctx).await.unwrap();
        assert_eq!(handle.kind, ComponentKind::Module);
        assert!(handle.instance.is_some());
        assert!(h.manager.unload("home").await);
        assert!(!h.manager.is_loaded("home").await);
    }

    #[tokio::test]
    async fn test_agent_without_contract_is_not_loaded() {
        let h = harness();
        add_repo(&h.mirror, ComponentKind::Agent, "fake", "0.1.0", &[], &["fake_cap"], "not_an_agent");

        assert!(h.manager.load("fake", &h.ctx).await.is_none());
        assert!(!h.manager.is_loaded("fake").await);
        assert!(h.manager.provider_of("fake_cap").await.is_none());
        // The code was cached even though loading failed.
        assert!(h.manager.is_locally_available("fake").await);
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_not_loaded() {
        let h = harness();
        add_repo(&h.mirror, ComponentKind::Module, "ghost", "0.1.0", &[], &[], "no_such_symbol");
        assert!(h.manager.load("ghost", &h.ctx).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_dependency_leaves_nothing_loaded() {
        let h = harness();
        add_repo(&h.mirror, ComponentKind::Module, "broken", "0.1.0", &[], &[], "failing");
        add_repo(&h.mirror, ComponentKind::Agent, "needy", "0.1.0", &["geo", "broken"], &[], "weather");

        assert!(h.manager.load("needy", &h.ctx).await.is_none());
        assert!(h.manager.loaded_components().await.is_empty());
        assert!(h.manager.provider_of("geocoding").await.is_none());
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previously_loaded_dependencies() {
        let h = harness();
        h.manager.load("geo", &h.ctx).await.unwrap();
        add_repo(&h.mirror, ComponentKind::Module, "broken", "0.1.0", &["geo"], &[], "failing");

        assert!(h.manager.load("broken", &h.ctx).await.is_none());
        assert!(h.manager.is_loaded("geo").await);
    }

    #[tokio::test]
    async fn test_cycle_aborts_load() {
        let h = harness();
        add_repo(&h.mirror, ComponentKind::Module, "cyc-a", "0.1.0", &["cyc-b"], &[], "home");
        add_repo(&h.mirror, ComponentKind::Module, "cyc-b", "0.1.0", &["cyc-a"], &[], "home");

        assert!(h.manager.load("cyc-a", &h.ctx).await.is_none());
        assert!(h.manager.resolve_dependencies("cyc-a").await.is_none());
        assert!(h.manager.loaded_components().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_dependency_aborts_load() {
        let h = harness();
        add_repo(&h.mirror, ComponentKind::Agent, "lonely", "0.1.0", &["nowhere"], &[], "weather");

        assert!(h.manager.load("lonely", &h.ctx).await.is_none());
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_capability_last_loaded_wins() {
        let h = harness();
        add_repo(&h.mirror, ComponentKind::Provider, "geo2", "0.1.0", &[], &["geocoding"], "geo");

        h.manager.load("geo", &h.ctx).await.unwrap();
        h.manager.load("geo2", &h.ctx).await.unwrap();
        assert_eq!(h.manager.provider_of("geocoding").await.as_deref(), Some("geo2"));

        h.manager.unload("geo2").await;
        assert_eq!(h.manager.provider_of("geocoding").await.as_deref(), Some("geo"));
    }

    #[tokio::test]
    async fn test_dependency_report() {
        let h = harness();
        add_repo(&h.mirror, ComponentKind::Agent, "lonely", "0.1.0", &["geo", "nowhere"], &[], "weather");
        h.manager.discover(false).await;

        let report = h.manager.dependency_report("weather").await.unwrap();
        assert_eq!(report.total_dependencies, 1);
        assert!(report.all_resolved);
        let geo = &report.dependencies[0];
        assert_eq!(geo.id, "geo");
        assert!(geo.available && geo.resolved);
        assert!(!geo.locally_available && !geo.loaded);

        h.manager.load("geo", &h.ctx).await.unwrap();
        let report = h.manager.dependency_report("lonely").await.unwrap();
        assert_eq!(report.total_dependencies, 2);
        assert!(!report.all_resolved);
        assert!(report.dependencies[0].loaded);
        assert!(!report.dependencies[1].available);

        assert!(h.manager.dependency_report("unknown").await.is_none());
    }

    fn backup_count(paths: &Paths) -> usize {
        BackupStore::new(paths.backups_dir()).list().unwrap().len()
    }

    #[tokio::test]
    async fn test_sync_all_creates_one_backup() {
        let h = harness();
        assert!(h.manager.download("geo", None).await);

        let report = h.manager.sync_all().await;
        assert!(report.success());
        assert_eq!(report.updated, vec!["home".to_string(), "weather".to_string()]);
        assert_eq!(report.backed_up.len(), 3);
        assert_eq!(backup_count(&h.paths), 1);

        let backup = report.backup_path.unwrap();
        assert!(backup.join("geo").join("main.json").is_file());
        assert!(backup.join("weather").is_dir());
        assert!(backup.join("components.json").is_file());
    }

    #[tokio::test]
    async fn test_sync_all_refreshes_changed_versions() {
        let h = harness();
        h.manager.sync_all().await;
        add_repo(&h.mirror, ComponentKind::Provider, "geo", "1.1.0", &[], &["geocoding"], "geo");

        let report = h.manager.sync_all().await;
        assert_eq!(report.updated, vec!["geo".to_string()]);
        let geo = h.manager.record("geo").await.unwrap();
        assert_eq!(geo.local_version.as_deref(), Some("1.1.0"));
    }

    #[tokio::test]
    async fn test_sync_rotation_keeps_seven() {
        let h = harness();
        for _ in 0..9 {
            h.manager.sync_all().await;
        }
        assert_eq!(backup_count(&h.paths), 7);
        assert_eq!(h.manager.rotate_backups(3).await, 4);
        assert_eq!(backup_count(&h.paths), 3);
    }

    #[tokio::test]
    async fn test_fallback_restores_from_backup() {
        let h = harness();
        assert!(h.manager.download("geo", None).await);
        h.manager.sync_all().await;

        // Lose the cache and the registry, then come back offline.
        std::fs::remove_dir_all(h.paths.cache_dir()).unwrap();
        std::fs::remove_file(h.paths.registry_file()).unwrap();
        let offline = ComponentManager::new(
            h.paths.clone(),
            Arc::new(OfflineSource),
            catalog(&h.counters),
            ManagerOptions::default(),
        );

        assert!(!offline.download("geo", None).await);
        assert!(offline.use_fallback("geo").await);

        let record = offline.record("geo").await.unwrap();
        assert!(record.locally_available);
        assert!(record.fallback_used);
        assert!(record.fallback_time.is_some());
        assert!(record.from_backup);
        assert_eq!(record.kind, ComponentKind::Provider);
        assert_eq!(record.local_version.as_deref(), Some("1.0.0"));
        assert!(h.paths.component_cache_dir("geo").join("main.json").is_file());

        assert!(offline.load("geo", &h.ctx).await.is_some());
        // Already cached: nothing to restore.
        assert!(offline.use_fallback("geo").await);
    }

    #[tokio::test]
    async fn test_fallback_without_backup_changes_nothing() {
        let h = harness();
        let offline = ComponentManager::new(
            h.paths.clone(),
            Arc::new(OfflineSource),
            PluginCatalog::new(),
            ManagerOptions::default(),
        );
        assert!(!offline.use_fallback("geo").await);
        assert!(offline.record("geo").await.is_none());
        assert!(!h.paths.registry_file().exists());
    }
}
