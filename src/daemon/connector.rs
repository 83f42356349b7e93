//! Daemon discovery and connection
//!
//! A failed discovery is never an error here: the orchestrator always has
//! the in-process route, so every failure is reported as an absent daemon.

use crate::compiler::CompilerKind;
use crate::config::WarmcConfig;
use crate::daemon::client::{DaemonHandle, SocketDaemon};
use crate::daemon::protocol::{
    read_message, write_message, LeaseSession, Message, SessionId, NO_SESSION,
};
use anyhow::{anyhow, Result};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One daemon-side compilation context, valid for a single compile attempt
pub struct Session {
    daemon: Option<Box<dyn DaemonHandle>>,
    id: SessionId,
}

impl Session {
    /// No daemon could be reached
    pub fn absent() -> Self {
        Self {
            daemon: None,
            id: NO_SESSION,
        }
    }

    /// A leased session on a live daemon
    pub fn new(daemon: Box<dyn DaemonHandle>, id: SessionId) -> Self {
        Self {
            daemon: Some(daemon),
            id,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.daemon.is_none()
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn into_daemon(self) -> Option<Box<dyn DaemonHandle>> {
        self.daemon
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connected", &!self.is_absent())
            .field("id", &self.id)
            .finish()
    }
}

/// Finds a daemon for a compiler target
pub trait ConnectionManager {
    /// Connect to a daemon, or report it absent
    fn connect(&self, kind: CompilerKind) -> Session;
}

impl<T: ConnectionManager + ?Sized> ConnectionManager for &T {
    fn connect(&self, kind: CompilerKind) -> Session {
        (**self).connect(kind)
    }
}

/// Connection manager for a daemon listening on a unix socket
#[derive(Debug, Clone)]
pub struct UnixSocketConnector {
    socket_path: PathBuf,
}

impl UnixSocketConnector {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn from_config(config: &WarmcConfig) -> Self {
        Self::new(config.socket_path())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Check if a daemon is accepting connections
    pub fn is_daemon_running(&self) -> bool {
        self.socket_path.exists() && UnixStream::connect(&self.socket_path).is_ok()
    }

    fn try_connect(&self, kind: CompilerKind) -> Result<Session> {
        if !self.socket_path.exists() {
            return Err(anyhow!("no socket at {}", self.socket_path.display()));
        }

        let mut stream = UnixStream::connect(&self.socket_path)
            .map_err(|e| anyhow!("Failed to connect to daemon: {}", e))?;

        let lease = Message::LeaseSession(LeaseSession {
            platform: kind.platform_tag(),
            client_pid: std::process::id(),
        });
        write_message(&mut stream, &lease, 0)
            .map_err(|e| anyhow!("Failed to send lease request: {}", e))?;

        let (reply, _) = read_message(&mut stream)
            .map_err(|e| anyhow!("Failed to read lease reply: {}", e))?;

        match reply {
            Message::SessionLeased(leased) => {
                let daemon = SocketDaemon::new(stream).with_next_message_id(1);
                Ok(Session::new(Box::new(daemon), leased.session_id))
            }
            Message::Error(reply) => Err(anyhow!("daemon refused session: {}", reply.message)),
            other => Err(anyhow!("unexpected {} reply to lease request", other.kind())),
        }
    }
}

impl ConnectionManager for UnixSocketConnector {
    fn connect(&self, kind: CompilerKind) -> Session {
        match self.try_connect(kind) {
            Ok(session) => {
                debug!(session_id = session.id(), "leased daemon session");
                session
            }
            Err(e) => {
                debug!(socket = %self.socket_path.display(), error = %e, "daemon unavailable");
                Session::absent()
            }
        }
    }
}
