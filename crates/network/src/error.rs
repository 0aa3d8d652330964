use std::sync::Mutex;

use thiserror::Error;

use crate::session::Handle;

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Broad classification of a failure, stable across message wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad proxy URI, non-positive timeout, malformed header spec
    InvalidConfig,
    /// Hostname could not be resolved
    Resolution,
    /// Proxy unreachable, rejected or malformed handshake
    ProxyHandshake,
    /// TLS handshake failure, secure or insecure mode
    Tls,
    /// Transport-level connect/read/write failure
    Io,
    /// Connect, handshake or read exceeded the configured bound
    Timeout,
    /// Malformed URL or malformed HTTP response
    Protocol,
    /// Operation on an unknown or already-closed handle
    InvalidHandle,
    /// Destination file could not be opened or written
    OutputTarget,
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid header spec: {0}")]
    HeaderSpec(String),

    #[error("Failed to resolve {host}: {reason}")]
    Resolution { host: String, reason: String },

    #[error("Proxy {proxy} unreachable: {reason}")]
    ProxyUnreachable { proxy: String, reason: String },

    #[error("Proxy refused connection to {target}: {reason} (reply code {code:#04x})")]
    ProxyRejected {
        target: String,
        code: u8,
        reason: String,
    },

    #[error("Proxy handshake failed: {0}")]
    ProxyHandshake(String),

    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    #[error("Connection to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Timed out after {timeout_ms}ms while {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Invalid URL: {0}")]
    Url(String),

    #[error("Malformed HTTP response: {0}")]
    Response(String),

    #[error("JSON decode failed: {0}")]
    Json(String),

    #[error("Invalid connection handle {0}")]
    InvalidHandle(Handle),

    #[error("Invalid connection handle {0}")]
    InvalidRawHandle(i32),

    #[error("Too many open sessions (limit {0})")]
    SessionLimit(usize),

    #[error("Output target {path}: {reason}")]
    Output { path: String, reason: String },
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Config(_) | TunnelError::HeaderSpec(_) => ErrorKind::InvalidConfig,
            TunnelError::Resolution { .. } => ErrorKind::Resolution,
            TunnelError::ProxyUnreachable { .. }
            | TunnelError::ProxyRejected { .. }
            | TunnelError::ProxyHandshake(_) => ErrorKind::ProxyHandshake,
            TunnelError::Tls { .. } => ErrorKind::Tls,
            TunnelError::Connect { .. } | TunnelError::Io(_) | TunnelError::SessionLimit(_) => {
                ErrorKind::Io
            }
            TunnelError::Timeout { .. } => ErrorKind::Timeout,
            TunnelError::Url(_) | TunnelError::Response(_) | TunnelError::Json(_) => {
                ErrorKind::Protocol
            }
            TunnelError::InvalidHandle(_) | TunnelError::InvalidRawHandle(_) => {
                ErrorKind::InvalidHandle
            }
            TunnelError::Output { .. } => ErrorKind::OutputTarget,
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        TunnelError::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Single-slot holder for the most recent failure message.
///
/// Not a queue: a new failure replaces the previous message whether or not it
/// was read. Shared by every thread using the owning client, last write wins.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    message: Mutex<Option<String>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, err: &TunnelError) {
        let mut slot = self.message.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(err.to_string());
    }

    /// Current message, or an empty string when nothing has failed.
    pub fn get(&self) -> String {
        self.message
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }

    pub fn take(&self) -> Option<String> {
        self.message.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Records the error of a failed result and passes the result through.
    pub fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.record(e);
        }
        result
    }
}
