use crate::builtins;
use crate::command::{CommandReply, CoreCommand};
use alfred_components::source;
use alfred_components::{ComponentManager, ComponentSource, LoadContext, ManagerOptions, PluginCatalog};
use alfred_core::{topics, ComponentKind, Config, Message, Paths, Result};
use alfred_runtime::bus::Callback;
use alfred_runtime::{MessageBus, StateManager};
use alfred_scheduler::SyncService;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Span};

const SENDER: &str = "core";
const SCHEDULER_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TOPIC: &str = "core_flush";

pub const STATE_SYSTEM_STATUS: &str = "system_status";
pub const STATE_START_TIME: &str = "start_time";
pub const STATE_LOADED_MODULES: &str = "loaded_modules";
pub const STATE_LOADED_AGENTS: &str = "loaded_agents";

type ReplyFuture = Pin<Box<dyn Future<Output = CommandReply> + Send>>;

#[derive(Default)]
struct Lifecycle {
    running: bool,
    started_at: Option<DateTime<Utc>>,
    subscriptions: Vec<(&'static str, Callback)>,
    scheduler_shutdown: Option<broadcast::Sender<()>>,
    scheduler_task: Option<JoinHandle<()>>,
}

/// Composition root: owns the bus, the state store and the component
/// manager, and turns `core_command` messages into manager calls.
pub struct AlfredCore {
    config: Arc<Config>,
    bus: MessageBus,
    state: StateManager,
    manager: Arc<ComponentManager>,
    lifecycle: Mutex<Lifecycle>,
    stop_requested: Notify,
    span: Span,
}

impl AlfredCore {
    pub fn new(config: Config, paths: Paths, source: Arc<dyn ComponentSource>, catalog: PluginCatalog) -> Arc<Self> {
        let span = tracing::info_span!("alfred", name = %config.name);
        let bus = MessageBus::with_span(tracing::info_span!(parent: &span, "message_bus"));
        let state = StateManager::with_span(bus.clone(), tracing::info_span!(parent: &span, "state"));
        let manager = Arc::new(ComponentManager::with_span(
            paths,
            source,
            catalog,
            ManagerOptions::from_config(&config),
            tracing::info_span!(parent: &span, "components"),
        ));
        Arc::new(Self {
            config: Arc::new(config),
            bus,
            state,
            manager,
            lifecycle: Mutex::new(Lifecycle::default()),
            stop_requested: Notify::new(),
            span,
        })
    }

    /// Core wired to the configured source and the built-in catalog.
    pub fn from_config(config: Config, paths: Paths) -> Result<Arc<Self>> {
        let source = source::from_config(&config.source)?;
        Ok(Self::new(config, paths, source, builtins::catalog()))
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn manager(&self) -> &Arc<ComponentManager> {
        &self.manager
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn context(&self) -> LoadContext {
        LoadContext {
            bus: self.bus.clone(),
            state: self.state.clone(),
            config: Arc::clone(&self.config),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.running
    }

    /// Ids in the `loaded_modules` state list.
    pub fn loaded_modules(&self) -> Vec<String> {
        string_list(&self.state, STATE_LOADED_MODULES)
    }

    pub fn loaded_agents(&self) -> Vec<String> {
        string_list(&self.state, STATE_LOADED_AGENTS)
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Starts the bus, the command loop and the sync scheduler, then loads
    /// the configured startup components. Returns false if already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            debug!(parent: &self.span, "Core already running");
            return false;
        }
        info!(parent: &self.span, version = %self.config.version, "Starting Alfred");

        // Subscribe before the dispatcher runs so events held over from a
        // previous run reach the fresh lists.
        self.state.set(STATE_LOADED_MODULES, json!([]), true);
        self.state.set(STATE_LOADED_AGENTS, json!([]), true);
        let mut subscriptions = self.subscribe_events();
        let (tx, rx) = mpsc::unbounded_channel();
        subscriptions.push((topics::CORE_COMMAND, self.subscribe_commands(tx)));

        if !self.bus.start() {
            error!(parent: &self.span, "Message bus failed to start");
            for (topic, callback) in subscriptions {
                self.bus.unsubscribe(topic, &callback);
            }
            return false;
        }
        lifecycle.subscriptions = subscriptions;
        tokio::spawn(Arc::clone(self).command_loop(rx));

        self.state.set(STATE_SYSTEM_STATUS, json!("starting"), true);
        let started_at = Utc::now();
        self.state.set(STATE_START_TIME, json!(started_at.to_rfc3339()), true);

        if self.config.sync.enabled {
            match SyncService::new(Arc::clone(&self.manager), &self.config.sync) {
                Ok(service) => {
                    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
                    lifecycle.scheduler_task = Some(tokio::spawn(Arc::new(service).run_loop(shutdown_rx)));
                    lifecycle.scheduler_shutdown = Some(shutdown_tx);
                }
                Err(e) => warn!(parent: &self.span, error = %e, "Sync scheduler disabled"),
            }
        }
        lifecycle.running = true;
        lifecycle.started_at = Some(started_at);
        drop(lifecycle);

        for id in &self.config.startup_modules {
            let reply = self.load_component(id, false).await;
            if !reply.ok {
                warn!(parent: &self.span, module = %id, message = %reply.message, "Startup module not loaded");
            }
        }
        for id in &self.config.startup_agents {
            let reply = self.load_component(id, true).await;
            if !reply.ok {
                warn!(parent: &self.span, agent = %id, message = %reply.message, "Startup agent not loaded");
            }
        }

        self.state.set(STATE_SYSTEM_STATUS, json!("running"), true);
        self.bus.publish(
            topics::SYSTEM,
            json!({ "event": "startup", "version": self.config.version }),
            SENDER,
        );
        info!(parent: &self.span, "Alfred is running");
        true
    }

    /// Unloads every component (agents first, newest first), stops the
    /// scheduler and the bus. Returns false if not running.
    pub async fn stop(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            debug!(parent: &self.span, "Core not running");
            return false;
        }
        info!(parent: &self.span, "Stopping Alfred");
        self.state.set(STATE_SYSTEM_STATUS, json!("stopping"), true);
        let uptime_secs = lifecycle
            .started_at
            .map(|t| Utc::now().signed_duration_since(t).num_seconds())
            .unwrap_or(0);
        self.bus.publish(
            topics::SYSTEM,
            json!({ "event": "shutdown", "uptime_secs": uptime_secs }),
            SENDER,
        );

        let mut loaded = self.manager.loaded_components().await;
        loaded.sort_by_key(|info| (info.kind != ComponentKind::Agent, std::cmp::Reverse(info.load_seq)));
        for info in loaded {
            if self.manager.unload(&info.id).await {
                self.publish_lifecycle_event(&info.id, info.kind, false);
            }
        }

        if let Some(shutdown) = lifecycle.scheduler_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut task) = lifecycle.scheduler_task.take() {
            if tokio::time::timeout(SCHEDULER_STOP_TIMEOUT, &mut task).await.is_err() {
                warn!(parent: &self.span, "Sync scheduler busy, aborting it");
                task.abort();
            }
        }

        self.flush_bus().await;

        // Dropping the command subscription closes the command channel; the
        // command loop exits once it drains.
        for (topic, callback) in lifecycle.subscriptions.drain(..) {
            self.bus.unsubscribe(topic, &callback);
        }

        self.state.set(STATE_SYSTEM_STATUS, json!("stopped"), true);
        let bus = self.bus.clone();
        match tokio::task::spawn_blocking(move || bus.stop()).await {
            Ok(true) => {}
            Ok(false) => warn!(parent: &self.span, "Message bus did not stop in time"),
            Err(e) => error!(parent: &self.span, error = %e, "Message bus stop task failed"),
        }
        lifecycle.running = false;
        lifecycle.started_at = None;
        info!(parent: &self.span, uptime_secs, "Alfred stopped");
        true
    }

    /// Waits until every message queued so far has been dispatched.
    async fn flush_bus(&self) {
        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let marker = self.bus.subscribe(FLUSH_TOPIC, move |_msg: &Message| {
            if let Some(tx) = tx.lock().ok().and_then(|mut slot| slot.take()) {
                let _ = tx.send(());
            }
        });
        self.bus.publish(FLUSH_TOPIC, Value::Null, SENDER);
        if tokio::time::timeout(FLUSH_TIMEOUT, rx).await.is_err() {
            warn!(parent: &self.span, "Message bus did not drain in time");
        }
        self.bus.unsubscribe(FLUSH_TOPIC, &marker);
    }

    /// Resolves once a `stop` command has been executed.
    pub async fn stop_requested(&self) {
        self.stop_requested.notified().await
    }

    pub async fn restart(self: &Arc<Self>) -> bool {
        info!(parent: &self.span, "Restarting Alfred");
        self.stop().await;
        self.start().await
    }

    // ── Commands ───────────────────────────────────────────────────────

    pub async fn execute(self: &Arc<Self>, command: CoreCommand) -> CommandReply {
        let name = command.name();
        debug!(parent: &self.span, command = name, "Executing core command");
        match command {
            CoreCommand::LoadModule { module_id } => self.load_component(&module_id, false).await,
            CoreCommand::UnloadModule { module_id } => self.unload_component(&module_id, false).await,
            CoreCommand::LoadAgent { agent_id } => self.load_component(&agent_id, true).await,
            CoreCommand::UnloadAgent { agent_id } => self.unload_component(&agent_id, true).await,
            CoreCommand::Stop => {
                self.stop_requested.notify_one();
                if self.stop().await {
                    CommandReply::ok(name, "Alfred stopped")
                } else {
                    CommandReply::failed(name, "Alfred is not running")
                }
            }
            CoreCommand::Restart => {
                if self.restart().await {
                    CommandReply::ok(name, "Alfred restarted")
                } else {
                    CommandReply::failed(name, "Restart failed")
                }
            }
        }
    }

    fn execute_boxed(self: Arc<Self>, command: CoreCommand) -> ReplyFuture {
        Box::pin(async move { self.execute(command).await })
    }

    async fn command_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<CoreCommand>) {
        debug!(parent: &self.span, "Command loop started");
        while let Some(command) = rx.recv().await {
            let reply = Arc::clone(&self).execute_boxed(command).await;
            if reply.ok {
                info!(parent: &self.span, command = %reply.command, message = %reply.message, "Command done");
            } else {
                warn!(parent: &self.span, command = %reply.command, message = %reply.message, "Command failed");
            }
            self.reply(&reply);
        }
        debug!(parent: &self.span, "Command loop finished");
    }

    fn reply(&self, reply: &CommandReply) {
        match serde_json::to_value(reply) {
            Ok(data) => self.bus.publish(topics::CORE_RESPONSE, data, SENDER),
            Err(e) => error!(parent: &self.span, error = %e, "Failed to encode command reply"),
        }
    }

    fn kind_matches(kind: ComponentKind, agent: bool) -> bool {
        match kind {
            ComponentKind::Agent => agent,
            ComponentKind::Module | ComponentKind::Provider => !agent,
        }
    }

    /// Loads a module (or provider) when `agent` is false, an agent
    /// otherwise. Falls back to a backup copy once when the component
    /// cannot be fetched.
    async fn load_component(&self, id: &str, agent: bool) -> CommandReply {
        let command = if agent { "load_agent" } else { "load_module" };
        let wanted = if agent { "agent" } else { "module" };

        let mut record = self.manager.record(id).await;
        if record.is_none() {
            self.manager.discover(false).await;
            record = self.manager.record(id).await;
        }
        if let Some(record) = &record {
            if !Self::kind_matches(record.kind, agent) {
                return CommandReply::failed(command, format!("{} is of kind {}, expected {}", id, record.kind, wanted));
            }
        }

        let before: HashSet<String> = self
            .manager
            .loaded_components()
            .await
            .into_iter()
            .map(|info| info.id)
            .collect();
        let ctx = self.context();
        let mut handle = self.manager.load(id, &ctx).await;
        if handle.is_none() && self.restore_from_backup(id).await {
            handle = self.manager.load(id, &ctx).await;
        }
        let Some(handle) = handle else {
            return CommandReply::failed(command, format!("Failed to load {} {}", wanted, id));
        };
        if !Self::kind_matches(handle.kind, agent) {
            // Only known after a fallback restored an unregistered component.
            self.manager.unload(id).await;
            return CommandReply::failed(command, format!("{} is of kind {}, expected {}", id, handle.kind, wanted));
        }

        for info in self.manager.loaded_components().await {
            if !before.contains(&info.id) {
                self.publish_lifecycle_event(&info.id, info.kind, true);
            }
        }
        CommandReply::ok(command, format!("Loaded {} {}", wanted, id))
    }

    /// Restores `id` and each of its dependencies missing from the cache
    /// from backups. Returns whether anything was restored.
    async fn restore_from_backup(&self, id: &str) -> bool {
        let mut restored = false;
        if !self.manager.is_locally_available(id).await {
            warn!(parent: &self.span, component = %id, "Load failed, trying backup copy");
            if !self.manager.use_fallback(id).await {
                return false;
            }
            restored = true;
        }
        // The restored record may be the first to name the dependencies.
        for dep in self.manager.resolve_dependencies(id).await.unwrap_or_default() {
            if self.manager.is_locally_available(&dep).await {
                continue;
            }
            if self.manager.use_fallback(&dep).await {
                restored = true;
            } else {
                warn!(parent: &self.span, component = %id, dependency = %dep, "No backup copy of dependency");
            }
        }
        restored
    }

    async fn unload_component(&self, id: &str, agent: bool) -> CommandReply {
        let command = if agent { "unload_agent" } else { "unload_module" };
        let wanted = if agent { "agent" } else { "module" };

        let loaded = self.manager.loaded_components().await;
        let Some(info) = loaded.iter().find(|info| info.id == id) else {
            return CommandReply::ok(command, format!("{} {} is not loaded", wanted, id));
        };
        if !Self::kind_matches(info.kind, agent) {
            return CommandReply::failed(command, format!("{} is of kind {}, expected {}", id, info.kind, wanted));
        }

        let dependents = self.manager.dependents_of(id).await;
        if !dependents.is_empty() {
            warn!(parent: &self.span, component = %id, dependents = ?dependents, "Unloading a dependency of loaded components");
        }
        if !self.manager.unload(id).await {
            return CommandReply::failed(command, format!("Failed to unload {} {}", wanted, id));
        }
        self.publish_lifecycle_event(id, info.kind, false);
        CommandReply::ok(command, format!("Unloaded {} {}", wanted, id))
    }

    fn publish_lifecycle_event(&self, id: &str, kind: ComponentKind, loaded: bool) {
        let (topic, field) = match (kind, loaded) {
            (ComponentKind::Agent, true) => (topics::AGENT_LOADED, "agent_id"),
            (ComponentKind::Agent, false) => (topics::AGENT_UNLOADED, "agent_id"),
            (_, true) => (topics::MODULE_LOADED, "module_id"),
            (_, false) => (topics::MODULE_UNLOADED, "module_id"),
        };
        self.bus.publish(topic, json!({ field: id }), SENDER);
    }

    // ── Bus wiring ─────────────────────────────────────────────────────

    fn subscribe_commands(&self, tx: mpsc::UnboundedSender<CoreCommand>) -> Callback {
        let bus = self.bus.clone();
        let span = self.span.clone();
        self.bus.subscribe(topics::CORE_COMMAND, move |msg: &Message| {
            match serde_json::from_value::<CoreCommand>(msg.data.clone()) {
                Ok(command) => {
                    if tx.send(command).is_err() {
                        warn!(parent: &span, "Command loop gone, dropping command");
                    }
                }
                Err(e) => {
                    warn!(parent: &span, sender = %msg.sender, error = %e, "Invalid core command");
                    let reply = CommandReply::failed(
                        msg.str_field("command").unwrap_or("unknown"),
                        format!("Invalid command: {}", e),
                    );
                    if let Ok(data) = serde_json::to_value(&reply) {
                        bus.publish(topics::CORE_RESPONSE, data, SENDER);
                    }
                }
            }
        })
    }

    /// Keeps the loaded lists in state in step with lifecycle events.
    fn subscribe_events(&self) -> Vec<(&'static str, Callback)> {
        let tracked = [
            (topics::MODULE_LOADED, STATE_LOADED_MODULES, "module_id", true),
            (topics::MODULE_UNLOADED, STATE_LOADED_MODULES, "module_id", false),
            (topics::AGENT_LOADED, STATE_LOADED_AGENTS, "agent_id", true),
            (topics::AGENT_UNLOADED, STATE_LOADED_AGENTS, "agent_id", false),
        ];
        tracked
            .into_iter()
            .map(|(topic, key, field, added)| {
                let state = self.state.clone();
                let callback = self.bus.subscribe(topic, move |msg: &Message| {
                    if let Some(id) = msg.str_field(field) {
                        track(&state, key, id, added);
                    }
                });
                (topic, callback)
            })
            .collect()
    }
}

fn string_list(state: &StateManager, key: &str) -> Vec<String> {
    state
        .get(key)
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

fn track(state: &StateManager, key: &str, id: &str, added: bool) {
    let mut ids = string_list(state, key);
    let present = ids.iter().any(|existing| existing == id);
    match (added, present) {
        (true, false) => ids.push(id.to_string()),
        (false, true) => ids.retain(|existing| existing != id),
        _ => return,
    }
    state.set(key, Value::from(ids), true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alfred_components::LocalSource;
    use std::path::Path;
    use std::sync::mpsc as std_mpsc;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    fn add_repo(mirror: &Path, kind: ComponentKind, id: &str, deps: &[&str], symbol: &str) {
        let dir = mirror.join(format!("{}{}", kind.repo_prefix(), id));
        std::fs::create_dir_all(&dir).unwrap();
        let meta = json!({ "name": id, "version": "1.0.0", "dependencies": deps });
        std::fs::write(dir.join("metadata.json"), meta.to_string()).unwrap();
        std::fs::write(dir.join("main.json"), json!({ "symbol": symbol }).to_string()).unwrap();
    }

    fn core(temp: &TempDir, config: Config) -> Arc<AlfredCore> {
        let mirror = temp.path().join("mirror");
        add_repo(&mirror, ComponentKind::Module, "sysinfo", &[], "system_info");
        add_repo(&mirror, ComponentKind::Agent, "pulse", &["sysinfo"], "heartbeat");
        AlfredCore::new(
            config,
            Paths::with_base(temp.path().join("alfred")),
            Arc::new(LocalSource::new(mirror, "alfred-project", "main")),
            builtins::catalog(),
        )
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.sync.enabled = false;
        config
    }

    fn collector(bus: &MessageBus, topic: &str) -> std_mpsc::Receiver<Message> {
        let (tx, rx) = std_mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        bus.subscribe(topic, move |msg| {
            let _ = tx.lock().unwrap().send(msg.clone());
        });
        rx
    }

    /// Waits until the state list `key` equals `expected`.
    fn wait_for_list(core: &AlfredCore, key: &str, expected: &[&str]) {
        let deadline = std::time::Instant::now() + WAIT;
        loop {
            if string_list(core.state(), key) == expected {
                return;
            }
            assert!(std::time::Instant::now() < deadline, "{} never became {:?}", key, expected);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_and_stop() {
        let temp = TempDir::new().unwrap();
        let core = core(&temp, test_config());
        let system = collector(core.bus(), topics::SYSTEM);

        assert!(core.start().await);
        assert!(!core.start().await);
        assert!(core.is_running().await);
        assert_eq!(core.state().get(STATE_SYSTEM_STATUS), Some(json!("running")));
        assert!(core.state().get(STATE_START_TIME).is_some());
        let startup = system.recv_timeout(WAIT).unwrap();
        assert_eq!(startup.data["event"], "startup");

        assert!(core.stop().await);
        assert!(!core.stop().await);
        assert!(!core.bus().is_running());
        assert_eq!(core.state().get(STATE_SYSTEM_STATUS), Some(json!("stopped")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_agent_tracks_state_lists() {
        let temp = TempDir::new().unwrap();
        let core = core(&temp, test_config());
        let loaded = collector(core.bus(), topics::MODULE_LOADED);
        core.start().await;

        let reply = core.execute(CoreCommand::LoadAgent { agent_id: "pulse".to_string() }).await;
        assert!(reply.ok, "{}", reply.message);
        assert_eq!(loaded.recv_timeout(WAIT).unwrap().data["module_id"], "sysinfo");
        wait_for_list(&core, STATE_LOADED_AGENTS, &["pulse"]);
        wait_for_list(&core, STATE_LOADED_MODULES, &["sysinfo"]);

        let reply = core.execute(CoreCommand::UnloadAgent { agent_id: "pulse".to_string() }).await;
        assert!(reply.ok);
        wait_for_list(&core, STATE_LOADED_AGENTS, &[]);
        assert_eq!(core.loaded_modules(), vec!["sysinfo".to_string()]);

        core.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_kind_mismatch_is_rejected() {
        let temp = TempDir::new().unwrap();
        let core = core(&temp, test_config());
        core.start().await;

        let reply = core.execute(CoreCommand::LoadModule { module_id: "pulse".to_string() }).await;
        assert!(!reply.ok);
        assert!(reply.message.contains("agent"));
        assert!(!core.manager().is_loaded("pulse").await);

        let reply = core.execute(CoreCommand::UnloadAgent { agent_id: "pulse".to_string() }).await;
        assert!(reply.ok);
        core.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_commands_over_bus() {
        let temp = TempDir::new().unwrap();
        let core = core(&temp, test_config());
        let responses = collector(core.bus(), topics::CORE_RESPONSE);
        core.start().await;

        core.bus().publish(topics::CORE_COMMAND, json!({ "command": "load_module", "module_id": "sysinfo" }), "test");
        let reply: CommandReply = serde_json::from_value(responses.recv_timeout(WAIT).unwrap().data).unwrap();
        assert_eq!(reply.command, "load_module");
        assert!(reply.ok, "{}", reply.message);
        assert!(core.manager().is_loaded("sysinfo").await);

        core.bus().publish(topics::CORE_COMMAND, json!({ "command": "load_module" }), "test");
        let reply: CommandReply = serde_json::from_value(responses.recv_timeout(WAIT).unwrap().data).unwrap();
        assert!(!reply.ok);
        assert!(reply.message.starts_with("Invalid command"));

        core.bus().publish(topics::CORE_COMMAND, json!({ "command": "load_agent", "agent_id": "missing" }), "test");
        let reply: CommandReply = serde_json::from_value(responses.recv_timeout(WAIT).unwrap().data).unwrap();
        assert!(!reply.ok);

        core.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_startup_components_and_stop_unloads() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config();
        config.startup_agents = vec!["pulse".to_string()];
        let core = core(&temp, config);

        core.start().await;
        assert!(core.manager().is_loaded("pulse").await);
        assert!(core.manager().is_loaded("sysinfo").await);

        core.stop().await;
        assert!(core.manager().loaded_components().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_reloads_nothing_but_runs_again() {
        let temp = TempDir::new().unwrap();
        let core = core(&temp, test_config());
        core.start().await;
        core.execute(CoreCommand::LoadModule { module_id: "sysinfo".to_string() }).await;

        let reply = core.execute(CoreCommand::Restart).await;
        assert!(reply.ok);
        assert!(core.is_running().await);
        assert!(!core.manager().is_loaded("sysinfo").await);
        wait_for_list(&core, STATE_LOADED_MODULES, &[]);

        let reply = core.execute(CoreCommand::Stop).await;
        assert!(reply.ok);
        assert!(!core.is_running().await);
        tokio::time::timeout(WAIT, core.stop_requested()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_falls_back_to_backup() {
        let temp = TempDir::new().unwrap();
        let core = core(&temp, test_config());
        assert!(core.manager().sync_all().await.success());

        // Same layout, but the source is gone and so is the cache.
        let paths = Paths::with_base(temp.path().join("alfred"));
        std::fs::remove_dir_all(paths.cache_dir()).unwrap();
        std::fs::remove_file(paths.registry_file()).unwrap();
        let offline = AlfredCore::new(
            test_config(),
            paths,
            Arc::new(LocalSource::new(temp.path().join("nowhere"), "alfred-project", "main")),
            builtins::catalog(),
        );
        offline.start().await;

        let reply = offline.execute(CoreCommand::LoadModule { module_id: "sysinfo".to_string() }).await;
        assert!(reply.ok, "{}", reply.message);
        let record = offline.manager().record("sysinfo").await.unwrap();
        assert!(record.fallback_used);
        offline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_agent_fallback_restores_dependencies() {
        let temp = TempDir::new().unwrap();
        let online = core(&temp, test_config());
        assert!(online.manager().download("pulse", None).await);
        let report = online.manager().sync_all().await;
        assert!(report.backed_up.contains(&"pulse".to_string()));
        assert!(report.backed_up.contains(&"sysinfo".to_string()));

        let paths = Paths::with_base(temp.path().join("alfred"));
        std::fs::remove_dir_all(paths.cache_dir()).unwrap();
        std::fs::remove_file(paths.registry_file()).unwrap();
        let offline = AlfredCore::new(
            test_config(),
            paths,
            Arc::new(LocalSource::new(temp.path().join("nowhere"), "alfred-project", "main")),
            builtins::catalog(),
        );
        offline.start().await;

        let reply = offline.execute(CoreCommand::LoadAgent { agent_id: "pulse".to_string() }).await;
        assert!(reply.ok, "{}", reply.message);
        for id in ["pulse", "sysinfo"] {
            let record = offline.manager().record(id).await.unwrap();
            assert!(record.locally_available, "{} not restored", id);
            assert!(record.fallback_used);
            assert!(offline.manager().is_loaded(id).await);
        }
        assert_eq!(offline.manager().record("pulse").await.unwrap().kind, ComponentKind::Agent);
        offline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_clears_state_lists() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config();
        config.startup_agents = vec!["pulse".to_string()];
        let core = core(&temp, config);

        core.start().await;
        wait_for_list(&core, STATE_LOADED_AGENTS, &["pulse"]);
        wait_for_list(&core, STATE_LOADED_MODULES, &["sysinfo"]);

        core.stop().await;
        assert!(core.loaded_agents().is_empty());
        assert!(core.loaded_modules().is_empty());
    }
}
