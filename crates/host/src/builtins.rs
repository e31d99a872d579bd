//! Components compiled into the host binary.
//!
//! Their repositories only need an entry file naming the symbol, e.g.
//! `{"symbol": "heartbeat"}`.

use alfred_components::{AgentEntry, ComponentCode, ComponentInstance, Instance, ModuleEntry, PluginCatalog};
use alfred_core::{Error, Result};
use alfred_runtime::{MessageBus, StateManager};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const HEARTBEAT_TOPIC: &str = "heartbeat";

/// Catalog with every built-in component registered.
pub fn catalog() -> PluginCatalog {
    let mut catalog = PluginCatalog::new();
    register(&mut catalog);
    catalog
}

pub fn register(catalog: &mut PluginCatalog) {
    catalog.register("heartbeat", || Arc::new(HeartbeatAgent));
    catalog.register("system_info", || Arc::new(SystemInfoModule));
}

fn default_interval_ms() -> u64 {
    60_000
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatConfig {
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
}

/// Publishes a `heartbeat` message and updates `last_heartbeat` at a fixed interval.
pub struct HeartbeatAgent;

pub struct HeartbeatInstance {
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    beats: Arc<AtomicU64>,
}

impl HeartbeatInstance {
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::SeqCst)
    }
}

impl ComponentInstance for HeartbeatInstance {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn status(&self) -> serde_json::Value {
        json!({ "beats": self.beats() })
    }
}

impl AgentEntry for HeartbeatAgent {
    fn start(&self, bus: &MessageBus, state: &StateManager, config: &serde_json::Value) -> Result<Instance> {
        let config: HeartbeatConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Config(format!("Invalid heartbeat config: {}", e)))?;
        if config.interval_ms == 0 {
            return Err(Error::Validation("Heartbeat interval must be positive".to_string()));
        }
        let interval = Duration::from_millis(config.interval_ms);

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let beats = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&beats);
        let bus = bus.clone();
        let state = state.clone();
        let worker = std::thread::Builder::new()
            .name("alfred-heartbeat".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        let now = Utc::now().to_rfc3339();
                        bus.publish(HEARTBEAT_TOPIC, json!({ "count": count, "timestamp": now }), "heartbeat");
                        state.set("last_heartbeat", json!(now), true);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        info!(interval_ms = config.interval_ms, "Heartbeat started");
        Ok(Arc::new(HeartbeatInstance {
            stop_tx: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
            beats,
        }))
    }

    fn stop(&self, instance: &Instance) -> Result<()> {
        let heartbeat = instance
            .as_any()
            .downcast_ref::<HeartbeatInstance>()
            .ok_or_else(|| Error::Contract("Not a heartbeat instance".to_string()))?;

        if let Some(tx) = heartbeat.stop_tx.lock().map_err(|_| Error::Other("poisoned".to_string()))?.take() {
            let _ = tx.send(());
        }
        let worker = heartbeat
            .worker
            .lock()
            .map_err(|_| Error::Other("poisoned".to_string()))?
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("Heartbeat thread panicked");
            }
        }
        debug!(beats = heartbeat.beats(), "Heartbeat stopped");
        Ok(())
    }
}

impl ComponentCode for HeartbeatAgent {
    fn agent(&self) -> Option<&dyn AgentEntry> {
        Some(self)
    }
}

/// Reports where the host runs.
pub struct SystemInfoModule;

pub struct SystemInfo {
    id: String,
    initialized_at: DateTime<Utc>,
}

impl ComponentInstance for SystemInfo {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "initialized_at": self.initialized_at.to_rfc3339(),
        })
    }
}

impl ModuleEntry for SystemInfoModule {
    fn initialize(&self, id: &str, _config: &serde_json::Value) -> Result<Instance> {
        Ok(Arc::new(SystemInfo {
            id: id.to_string(),
            initialized_at: Utc::now(),
        }))
    }
}

impl ComponentCode for SystemInfoModule {
    fn module(&self) -> Option<&dyn ModuleEntry> {
        Some(self)
    }
}
