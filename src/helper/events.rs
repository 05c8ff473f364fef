use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};

/// One intercepted node method call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub method: String,
    pub args: Vec<Value>,
    pub node_id: String,
    pub node_type: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

impl CallRecord {
    /// Name the record is emitted under, `call:<method>`.
    pub fn event(&self) -> String {
        format!("call:{}", self.method)
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Task {
    Run(Job),
    Flush(oneshot::Sender<()>),
}

/// FIFO queue of deferred jobs drained by one worker.
///
/// Inside a tokio runtime the worker is a task on that runtime, otherwise a
/// plain thread. A worker whose runtime went away is replaced on the next post.
#[derive(Default)]
pub struct Scheduler {
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Task::Run(Box::new(job)));
    }

    /// Resolves once every job posted before the call has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Task::Flush(tx));
        let _ = rx.await;
    }

    fn enqueue(&self, task: Task) {
        let mut guard = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        let task = match guard.as_ref() {
            Some(tx) => match tx.send(task) {
                Ok(()) => return,
                Err(mpsc::error::SendError(task)) => task,
            },
            None => task,
        };
        let tx = spawn_worker();
        if tx.send(task).is_err() {
            error!("scheduler worker exited before its first job");
        }
        *guard = Some(tx);
    }
}

fn spawn_worker() -> mpsc::UnboundedSender<Task> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                while let Some(task) = rx.recv().await {
                    run(task);
                }
            });
        }
        Err(_) => {
            let spawned = std::thread::Builder::new()
                .name("node-test-scheduler".into())
                .spawn(move || {
                    while let Some(task) = rx.blocking_recv() {
                        run(task);
                    }
                });
            if let Err(err) = spawned {
                error!("cannot start scheduler thread: {err}");
            }
        }
    }
    debug!("scheduler worker started");
    tx
}

fn run(task: Task) {
    match task {
        Task::Run(job) => {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                warn!("deferred job panicked");
            }
        }
        Task::Flush(done) => {
            let _ = done.send(());
        }
    }
}

pub type Listener = Arc<dyn Fn(&CallRecord) + Send + Sync>;

/// Where intercepted calls surface to test code.
pub struct EventSurface {
    listeners: DashMap<String, Vec<Listener>>,
    tx: broadcast::Sender<CallRecord>,
    scheduler: Scheduler,
}

impl EventSurface {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            listeners: DashMap::new(),
            tx,
            scheduler: Scheduler::new(),
        })
    }

    /// Registers `handler` for `event`, e.g. `"call:send"`.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&CallRecord) + Send + Sync + 'static,
    {
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// `None` removes every listener.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        match event {
            Some(event) => {
                self.listeners.remove(event);
            }
            None => self.listeners.clear(),
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map(|l| l.len()).unwrap_or(0)
    }

    /// Every delivered record, in delivery order.
    pub fn subscribe(&self) -> broadcast::Receiver<CallRecord> {
        self.tx.subscribe()
    }

    /// Queues delivery of `record`; it is never delivered before this returns.
    pub fn emit_deferred(self: &Arc<Self>, record: CallRecord) {
        let surface = Arc::clone(self);
        self.scheduler.post(move || surface.deliver(&record));
    }

    pub async fn flush(&self) {
        self.scheduler.flush().await;
    }

    fn deliver(&self, record: &CallRecord) {
        let handlers: Vec<Listener> = self
            .listeners
            .get(&record.event())
            .map(|l| l.value().clone())
            .unwrap_or_default();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(record))).is_err() {
                warn!(event = %record.event(), "listener panicked");
            }
        }
        let _ = self.tx.send(record.clone());
    }
}
