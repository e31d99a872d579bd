use alfred_core::{topics, Message};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Span};

/// Subscriber callback. Identity (`Arc::ptr_eq`) is what `unsubscribe` matches on.
pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

enum Envelope {
    Deliver(Message),
    /// Wakes the dispatcher of the given generation so it can exit.
    Shutdown(u64),
}

struct Inner {
    subscribers: RwLock<HashMap<String, Vec<Callback>>>,
    tx: mpsc::UnboundedSender<Envelope>,
    /// Parked here while no dispatcher owns it.
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    /// Messages dequeued after a stop request, delivered first on restart.
    held: Mutex<VecDeque<Message>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    generation: AtomicU64,
    span: Span,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Topic based publish/subscribe with a single dispatcher thread.
///
/// Delivery is globally FIFO and callbacks never run concurrently. For each
/// message the topic's own subscribers run first, then the `"*"` subscribers.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_span(tracing::info_span!("message_bus"))
    }

    /// Creates a bus whose log events are emitted under `span`.
    pub fn with_span(span: Span) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                tx,
                rx: Mutex::new(Some(rx)),
                held: Mutex::new(VecDeque::new()),
                worker: Mutex::new(None),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                span,
            }),
        }
    }

    /// Launches the dispatcher. Returns false if it could not be started.
    pub fn start(&self) -> bool {
        let inner = &self.inner;
        let mut worker = lock(&inner.worker);
        if inner.running.load(Ordering::SeqCst) {
            debug!(parent: &inner.span, "Message bus already running");
            return true;
        }
        if lock(&inner.rx).is_none() {
            warn!(parent: &inner.span, "Previous dispatcher is still draining, cannot start yet");
            return false;
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(inner);
        let spawned = std::thread::Builder::new()
            .name("alfred-bus".to_string())
            .spawn(move || dispatch_loop(shared, generation));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!(parent: &inner.span, generation, "Message bus started");
                true
            }
            Err(e) => {
                inner.running.store(false, Ordering::SeqCst);
                error!(parent: &inner.span, error = %e, "Failed to spawn dispatcher thread");
                false
            }
        }
    }

    /// Stops the dispatcher, waiting at most five seconds for it to exit.
    ///
    /// Returns false when the wait timed out; the dispatcher then finishes the
    /// callback it is running and exits on its own. Undelivered messages stay
    /// queued for the next `start`.
    pub fn stop(&self) -> bool {
        let inner = &self.inner;
        let handle = {
            let mut worker = lock(&inner.worker);
            if !inner.running.swap(false, Ordering::SeqCst) {
                debug!(parent: &inner.span, "Message bus not running");
                return true;
            }
            let generation = inner.generation.load(Ordering::SeqCst);
            let _ = inner.tx.send(Envelope::Shutdown(generation));
            worker.take()
        };

        let Some(handle) = handle else {
            return true;
        };
        if handle.thread().id() == std::thread::current().id() {
            debug!(parent: &inner.span, "Stop requested from inside a callback");
            return true;
        }

        let deadline = Instant::now() + STOP_TIMEOUT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    parent: &inner.span,
                    timeout_secs = STOP_TIMEOUT.as_secs(),
                    "Dispatcher did not stop in time"
                );
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.join().is_err() {
            error!(parent: &inner.span, "Dispatcher thread panicked");
        }
        info!(parent: &inner.span, "Message bus stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Enqueues a message and returns immediately. Safe from any thread,
    /// including from inside a callback.
    pub fn publish(&self, topic: &str, data: serde_json::Value, sender: &str) {
        let msg = Message::new(topic, data, sender);
        debug!(parent: &self.inner.span, topic = %msg.topic, sender = %msg.sender, "Publishing message");
        if self.inner.tx.send(Envelope::Deliver(msg)).is_err() {
            warn!(parent: &self.inner.span, topic = %topic, "Message queue closed, dropping message");
        }
    }

    /// Registers `f` for `topic` (or `"*"`) and returns its handle for `unsubscribe`.
    pub fn subscribe<F>(&self, topic: &str, f: F) -> Callback
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(f);
        self.subscribe_callback(topic, Arc::clone(&callback));
        callback
    }

    pub fn subscribe_callback(&self, topic: &str, callback: Callback) {
        let mut subs = self.inner.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        subs.entry(topic.to_string()).or_default().push(callback);
        debug!(parent: &self.inner.span, topic = %topic, count = subs[topic].len(), "Subscribed");
    }

    /// Removes one registration of `callback` from `topic`. Returns false if
    /// nothing matched. A topic left without subscribers is dropped entirely.
    pub fn unsubscribe(&self, topic: &str, callback: &Callback) -> bool {
        let mut subs = self.inner.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subs.get_mut(topic) else {
            return false;
        };
        let Some(pos) = list.iter().position(|c| Arc::ptr_eq(c, callback)) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            subs.remove(topic);
        }
        debug!(parent: &self.inner.span, topic = %topic, "Unsubscribed");
        true
    }

    pub fn topics(&self) -> Vec<String> {
        let subs = self.inner.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        let mut topics: Vec<String> = subs.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let subs = self.inner.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        subs.get(topic).map(|l| l.len()).unwrap_or(0)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn deliver(&self, msg: &Message) {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let (direct, wildcard) = {
            let subs = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
            let direct = if msg.topic == topics::WILDCARD {
                Vec::new()
            } else {
                subs.get(&msg.topic).cloned().unwrap_or_default()
            };
            let wildcard = subs.get(topics::WILDCARD).cloned().unwrap_or_default();
            (direct, wildcard)
        };

        for callback in direct.iter().chain(wildcard.iter()) {
            if catch_unwind(AssertUnwindSafe(|| callback(msg))).is_err() {
                error!(topic = %msg.topic, sender = %msg.sender, "Subscriber panicked while handling message");
            }
        }
    }
}

fn dispatch_loop(inner: Arc<Inner>, generation: u64) {
    let _enter = inner.span.enter();
    let Some(mut rx) = lock(&inner.rx).take() else {
        error!("Dispatcher started without a queue");
        inner.running.store(false, Ordering::SeqCst);
        return;
    };
    debug!(generation, "Dispatcher running");

    loop {
        let held = lock(&inner.held).pop_front();
        let msg = match held {
            Some(msg) => msg,
            None => match rx.blocking_recv() {
                Some(Envelope::Deliver(msg)) => msg,
                Some(Envelope::Shutdown(g)) if g == generation => break,
                Some(Envelope::Shutdown(_)) => continue,
                None => break,
            },
        };

        if !inner.running.load(Ordering::SeqCst) {
            lock(&inner.held).push_front(msg);
            break;
        }
        inner.deliver(&msg);
    }

    *lock(&inner.rx) = Some(rx);
    debug!(generation, "Dispatcher exited");
}
