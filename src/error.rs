//! Error types for the gateway.

use std::error::Error as StdError;
use thiserror::Error;

use crate::packet::ParseError;
use crate::session::SessionError;
use crate::translator::TranslateError;

/// Boxed error type used for error chaining across crate boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Gateway-specific errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// Tunnel endpoint creation failed.
    #[error("Tunnel error: {0}")]
    Tunnel(#[source] ErrorContext),

    /// Network I/O error.
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error. Fatal at startup; the gateway refuses to run.
    #[error("Configuration error: {0}")]
    Config(#[source] ErrorContext),

    /// Packet could not be decoded.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Packet could not be translated to the sibling family.
    #[error("Translate error: {0}")]
    Translate(#[from] TranslateError),

    /// Session table error (port/identifier exhaustion).
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// A tunnel endpoint failed repeatedly and the datapath gave up.
    #[error("Tunnel {name} failed {failures} consecutive reads/writes")]
    TunnelIo { name: String, failures: u32 },
}

impl GatewayError {
    /// Create a tunnel error with context only.
    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::Tunnel(ErrorContext::new(message))
    }

    /// Create a tunnel error with preserved source.
    pub fn tunnel_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Tunnel(ErrorContext::with_source(message, source))
    }

    /// Create a configuration error with context only.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ErrorContext::new(message))
    }

    /// Create a configuration error with preserved source.
    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Config(ErrorContext::with_source(message, source))
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
