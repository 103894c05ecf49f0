//! Transport contract: the operations the watch machinery needs from an
//! OADA-style connection.
//!
//! Implementations handle the actual protocol (HTTP, WebSocket, ...); this
//! crate only consumes the trait. A shared connection may serve many
//! `ListWatch` instances; every operation is independent.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::types::ChangeBatch;

// ============================================================================
// Connection — user-provided transport layer
// ============================================================================

/// The change feed a [`Connection::watch`] call produces.
///
/// Batches arrive in list-revision order. The stream ending means the feed
/// is gone: the watch treats an end it did not request as fatal.
pub type ChangeFeed = BoxStream<'static, Result<ChangeBatch, TransportError>>;

/// User-implemented transport for a tree-oriented store.
///
/// Paths are absolute store paths. `tree` parameters, when given, describe
/// the resource tree so the transport can materialize missing parents (PUT)
/// or recurse into links (GET).
#[async_trait]
pub trait Connection: Send + Sync {
    async fn head(&self, path: &str) -> Result<Response, TransportError>;

    async fn get(&self, path: &str, tree: Option<&Value>) -> Result<Response, TransportError>;

    async fn put(
        &self,
        path: &str,
        data: Value,
        tree: Option<&Value>,
    ) -> Result<Response, TransportError>;

    async fn post(
        &self,
        path: &str,
        data: Value,
        content_type: &str,
    ) -> Result<Response, TransportError>;

    async fn delete(&self, path: &str) -> Result<Response, TransportError>;

    /// Open a tree-mode change feed over `path`, starting after `rev` when
    /// given, else at the current tip.
    async fn watch(&self, path: &str, rev: Option<u64>) -> Result<ChangeFeed, TransportError>;
}

// ============================================================================
// Response
// ============================================================================

/// A transport response: status, headers, optional JSON body.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub data: Option<Value>,
}

impl Response {
    /// A bare success with no body.
    pub fn ok() -> Self {
        Self {
            status: 200,
            ..Self::default()
        }
    }

    /// A success carrying a JSON body.
    pub fn with_data(data: Value) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            data: Some(data),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// ============================================================================
// TransportError
// ============================================================================

/// Transport-level failure, with the protocol status when one exists.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Whether the target does not exist (or is unauthorized in a way the
    /// store uses to mask nonexistence).
    pub fn is_missing(&self) -> bool {
        matches!(self.status, Some(403 | 404))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for TransportError {}
