//! Channel-backed worker handle.
//!
//! Requests travel over an unbounded mpsc queue to a serve loop that owns
//! the [`WorkerService`]; each request carries a oneshot for its response.
//! The serve loop handles one request at a time.
//!
//! Ending a worker closes the queue and waits for the loop to drain, up to
//! a grace period. Past that, or on [`terminate`](WorkerHandle::terminate),
//! the kill flag makes the loop drop whatever call it is stuck in.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use filegrid_core::WorkerId;

use crate::error::{WorkerError, WorkerResult};
use crate::handle::{EventHandler, WorkerHandle, WorkerKind};
use crate::service::{WorkerContext, WorkerService};

/// How long [`end`](WorkerHandle::end) lets queued calls drain.
pub const DEFAULT_END_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for the serve loop once it has been told to stop.
const KILL_GRACE: Duration = Duration::from_millis(500);

struct Request {
    method: String,
    payload: Value,
    reply: oneshot::Sender<WorkerResult<Value>>,
}

/// Subscribers for worker-published events.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
}

impl EventBus {
    /// Call `handler` for every future `event`.
    pub fn subscribe(&self, event: &str, handler: EventHandler) {
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    /// Deliver `payload` to every handler subscribed to `event`.
    pub fn emit(&self, event: &str, payload: Value) {
        let handlers = self.handlers.read().get(event).cloned().unwrap_or_default();
        for handler in handlers {
            handler(payload.clone());
        }
    }
}

/// Client side of a worker reached through a request channel.
pub struct ChannelWorker {
    id: WorkerId,
    kind: WorkerKind,
    requests: Mutex<Option<mpsc::UnboundedSender<Request>>>,
    events: Arc<EventBus>,
    kill: watch::Sender<bool>,
    stopped: watch::Receiver<bool>,
    end_grace: Duration,
}

impl ChannelWorker {
    /// Serve `service` on a task of the current runtime.
    pub fn spawn_in_process(id: WorkerId, service: Box<dyn WorkerService>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = watch::channel(false);
        let events = Arc::new(EventBus::default());
        let ctx = WorkerContext::new(id, events.clone());

        tokio::spawn(serve(service, rx, ctx, kill_rx, stopped_tx));
        debug!(worker_id = id, "in-process worker started");

        Self {
            id,
            kind: WorkerKind::InProcess,
            requests: Mutex::new(Some(tx)),
            events,
            kill: kill_tx,
            stopped: stopped_rx,
            end_grace: DEFAULT_END_GRACE,
        }
    }

    /// Serve `service` on a new OS thread with its own runtime.
    pub async fn spawn_dedicated(id: WorkerId, service: Box<dyn WorkerService>) -> WorkerResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = watch::channel(false);
        let (started_tx, started_rx) = oneshot::channel::<Result<(), String>>();
        let events = Arc::new(EventBus::default());
        let ctx = WorkerContext::new(id, events.clone());

        std::thread::Builder::new()
            .name(format!("filegrid-worker-{id}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = started_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = started_tx.send(Ok(()));
                runtime.block_on(serve(service, rx, ctx, kill_rx, stopped_tx));
            })
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        match started_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(WorkerError::Spawn(message)),
            Err(_) => {
                return Err(WorkerError::Spawn(
                    "worker thread exited during startup".to_string(),
                ));
            }
        }
        debug!(worker_id = id, "dedicated worker started");

        Ok(Self {
            id,
            kind: WorkerKind::Dedicated,
            requests: Mutex::new(Some(tx)),
            events,
            kill: kill_tx,
            stopped: stopped_rx,
            end_grace: DEFAULT_END_GRACE,
        })
    }

    /// Override how long [`end`](WorkerHandle::end) waits before killing.
    pub fn with_end_grace(mut self, grace: Duration) -> Self {
        self.end_grace = grace;
        self
    }

    /// Id the worker was spawned under.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Whether the serve loop has exited.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow() || self.stopped.has_changed().is_err()
    }

    /// Whether the serve loop exited within `limit`.
    async fn wait_stopped(&self, limit: Duration) -> bool {
        let mut stopped = self.stopped.clone();
        // A dropped sender means the loop is gone too.
        tokio::time::timeout(limit, raised(&mut stopped)).await.is_ok()
    }

    async fn kill(&self) {
        self.kill.send_replace(true);
        if !self.wait_stopped(KILL_GRACE).await {
            // Only a service blocking its thread outright gets here.
            warn!(worker_id = self.id, kind = ?self.kind, "worker still busy after kill");
        }
    }
}

#[async_trait]
impl WorkerHandle for ChannelWorker {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    async fn call(&self, method: &str, payload: Value) -> WorkerResult<Value> {
        let (reply, response) = oneshot::channel();
        {
            let requests = self.requests.lock();
            let tx = requests.as_ref().ok_or(WorkerError::Closed)?;
            tx.send(Request {
                method: method.to_string(),
                payload,
                reply,
            })
            .map_err(|_| WorkerError::Closed)?;
        }
        response.await.map_err(|_| WorkerError::Closed)?
    }

    fn subscribe(&self, event: &str, handler: EventHandler) {
        self.events.subscribe(event, handler);
    }

    async fn end(&self) {
        // Closing the queue lets the serve loop drain and exit.
        let sender = self.requests.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        if !self.wait_stopped(self.end_grace).await {
            warn!(
                worker_id = self.id,
                grace = ?self.end_grace,
                "worker did not drain, killing"
            );
            self.kill().await;
        }
        debug!(worker_id = self.id, kind = ?self.kind, "worker ended");
    }

    async fn terminate(&self) {
        drop(self.requests.lock().take());
        self.kill().await;
        debug!(worker_id = self.id, kind = ?self.kind, "worker terminated");
    }
}

impl fmt::Debug for ChannelWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWorker")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

async fn serve(
    mut service: Box<dyn WorkerService>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    ctx: WorkerContext,
    mut kill: watch::Receiver<bool>,
    stopped: watch::Sender<bool>,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = raised(&mut kill) => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let Request {
            method,
            payload,
            reply,
        } = request;
        // A killed call drops `reply`; its caller sees `Closed`.
        let result = tokio::select! {
            biased;
            _ = raised(&mut kill) => break,
            result = service.handle(&method, payload, &ctx) => result,
        };
        if let Err(e) = &result {
            warn!(worker_id = ctx.id(), %method, error = %e, "worker call failed");
        }
        let _ = reply.send(result);
    }
    let _ = stopped.send(true);
}

/// Resolve once `flag` is true or its sender is gone.
async fn raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}
