//! Work executed inside a worker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use filegrid_core::WorkerId;

use crate::channel::EventBus;
use crate::error::{WorkerError, WorkerResult};
use crate::protocol::{
    Analysis, Buffer, EvictRequest, EvictResponse, Handshake, LogEvent, PathRequest, event, method,
};

/// What a worker does with the calls it receives.
#[async_trait]
pub trait WorkerService: Send + 'static {
    async fn handle(&mut self, method: &str, payload: Value, ctx: &WorkerContext) -> WorkerResult<Value>;
}

/// Worker-side view of its own identity and event channel.
#[derive(Clone)]
pub struct WorkerContext {
    id: WorkerId,
    events: Arc<EventBus>,
}

impl WorkerContext {
    /// Context for worker `id` publishing on `events`.
    pub(crate) fn new(id: WorkerId, events: Arc<EventBus>) -> Self {
        Self { id, events }
    }

    /// Id the worker was spawned under.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Publish `event` to everyone subscribed on the handle.
    pub fn emit(&self, event: &str, payload: Value) {
        self.events.emit(event, payload);
    }

    fn log(&self, worker_id: WorkerId, message: impl Into<String>) {
        let entry = LogEvent {
            worker_id,
            message: message.into(),
        };
        if let Ok(payload) = serde_json::to_value(entry) {
            self.emit(event::LOG, payload);
        }
    }
}

/// Default service: keeps in-editor buffers and caches one analysis per
/// path until it is evicted.
#[derive(Debug, Default)]
pub struct FileWorker {
    worker_id: Option<WorkerId>,
    buffers: HashMap<String, String>,
    cache: HashMap<String, Analysis>,
}

impl FileWorker {
    /// A worker with no buffers and an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    async fn analyze(&mut self, path: String) -> WorkerResult<Analysis> {
        if let Some(cached) = self.cache.get(&path) {
            return Ok(Analysis {
                cached: true,
                ..cached.clone()
            });
        }

        let (content, from_buffer) = match self.buffers.get(&path) {
            Some(buffer) => (buffer.as_bytes().to_vec(), true),
            None => {
                let bytes = tokio::fs::read(&path).await.map_err(|e| WorkerError::Call {
                    method: method::ANALYZE.to_string(),
                    message: format!("{path}: {e}"),
                })?;
                (bytes, false)
            }
        };

        let analysis = Analysis {
            path: path.clone(),
            bytes: content.len() as u64,
            lines: count_lines(&content),
            cached: false,
            from_buffer,
        };
        self.cache.insert(path, analysis.clone());
        Ok(analysis)
    }
}

#[async_trait]
impl WorkerService for FileWorker {
    async fn handle(&mut self, method: &str, payload: Value, ctx: &WorkerContext) -> WorkerResult<Value> {
        match method {
            method::HANDSHAKE => {
                let handshake: Handshake = parse(payload)?;
                self.worker_id = Some(handshake.worker_id);
                ctx.log(handshake.worker_id, "handshake complete");
                reply(&handshake)
            }
            method::PING => Ok(json!("pong")),
            method::UPDATE_BUFFER => {
                let buffer: Buffer = parse(payload)?;
                self.cache.remove(&buffer.path);
                self.buffers.insert(buffer.path, buffer.content);
                Ok(Value::Null)
            }
            method::CLEAR_BUFFER => {
                let request: PathRequest = parse(payload)?;
                self.cache.remove(&request.path);
                let cleared = self.buffers.remove(&request.path).is_some();
                Ok(json!({ "cleared": cleared }))
            }
            method::GET_BUFFERS => {
                let mut buffers: Vec<Buffer> = self
                    .buffers
                    .iter()
                    .map(|(path, content)| Buffer {
                        path: path.clone(),
                        content: content.clone(),
                    })
                    .collect();
                buffers.sort_by(|a, b| a.path.cmp(&b.path));
                reply(&buffers)
            }
            method::EVICT => {
                let request: EvictRequest = parse(payload)?;
                let evicted = self.cache.remove(&request.path).is_some();
                debug!(worker_id = ctx.id(), path = %request.path, reason = %request.reason, evicted, "evicted");
                reply(&EvictResponse { evicted })
            }
            method::ANALYZE => {
                let request: PathRequest = parse(payload)?;
                let analysis = self.analyze(request.path).await?;
                reply(&analysis)
            }
            other => Err(WorkerError::UnknownMethod(other.to_string())),
        }
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> WorkerResult<T> {
    Ok(serde_json::from_value(payload)?)
}

fn reply<T: Serialize>(value: &T) -> WorkerResult<Value> {
    Ok(serde_json::to_value(value)?)
}

fn count_lines(content: &[u8]) -> u64 {
    let newlines = content.iter().filter(|&&b| b == b'\n').count() as u64;
    match content.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}
