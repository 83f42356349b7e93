//! Error types for compile dispatch
//!
//! Failures are split by how the orchestrator reacts to them:
//! - [`ConfigError`]: a caller mistake, raised immediately and never retried
//! - [`TransportError`]: a failed daemon call; only [`TransportError::is_transient`]
//!   kinds earn the single retry
//! - [`CompileError`]: anything else that can go wrong while compiling; it is
//!   reported as an internal error instead of escaping `compile`

use std::io;
use thiserror::Error;

/// Invalid setup detected before any compile is attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown compiler type '{0}'")]
    UnknownCompiler(String),
    #[error("unknown platform tag '{0}'")]
    UnknownPlatform(String),
}

/// Failure of one daemon call
#[derive(Debug, Error)]
pub enum TransportError {
    /// The daemon went away before the call completed
    #[error("daemon connection dropped: {0}")]
    ConnectionDropped(#[source] io::Error),
    /// A reply arrived but could not be decoded
    #[error("daemon response could not be decoded: {0}")]
    Undecodable(String),
    /// The request itself could not be encoded
    #[error("request could not be sent: {0}")]
    Request(String),
    /// The daemon answered with something the protocol does not allow here
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The daemon rejected the request
    #[error("daemon error: {0}")]
    Remote(String),
    #[error("daemon i/o error: {0}")]
    Io(#[source] io::Error),
}

impl TransportError {
    /// Whether a fresh connection attempt may succeed where this one failed.
    ///
    /// Only dropped connections and undecodable responses qualify. Timeouts
    /// and every other failure are terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionDropped(_) | TransportError::Undecodable(_)
        )
    }

    /// Classify an i/o error raised while talking to the daemon
    pub fn from_io(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => TransportError::ConnectionDropped(error),
            io::ErrorKind::InvalidData => TransportError::Undecodable(error.to_string()),
            _ => TransportError::Io(error),
        }
    }
}

/// Failure anywhere in a compile that is not a plain compiler error
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("compiler entry point panicked: {0}")]
    EntryPointPanicked(String),
    #[error("failed to run compiler: {0}")]
    Io(#[from] io::Error),
}
