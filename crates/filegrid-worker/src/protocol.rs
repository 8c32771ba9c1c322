//! Method catalogue and payload shapes for the default worker service.

use serde::{Deserialize, Serialize};

use filegrid_core::WorkerId;

pub mod method {
    pub const HANDSHAKE: &str = "handshake";
    pub const PING: &str = "ping";
    pub const UPDATE_BUFFER: &str = "update_buffer";
    pub const CLEAR_BUFFER: &str = "clear_buffer";
    pub const GET_BUFFERS: &str = "get_buffers";
    pub const EVICT: &str = "evict";
    pub const ANALYZE: &str = "analyze";
}

pub mod event {
    /// Free-form log line: [`LogEvent`](super::LogEvent).
    pub const LOG: &str = "log";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    pub worker_id: WorkerId,
}

/// An in-editor (unsaved) file content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Buffer {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvictRequest {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvictResponse {
    /// Whether a cached result existed.
    pub evicted: bool,
}

/// Result of analyzing one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Analysis {
    pub path: String,
    pub bytes: u64,
    pub lines: u64,
    /// Served from the worker's cache.
    pub cached: bool,
    /// Computed from an in-editor buffer rather than disk.
    pub from_buffer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEvent {
    pub worker_id: WorkerId,
    pub message: String,
}
