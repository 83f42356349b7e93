//! RPC session: one compile request over an established daemon connection

use crate::compiler::{CompilationRequest, PlatformTag};
use crate::daemon::connector::Session;
use crate::daemon::protocol::{
    encode_message, read_message, Compile, Message, MessageId, SessionId, StateReply,
};
use crate::error::TransportError;
use crate::services::CompilationServices;
use std::io::Write;
use std::os::unix::net::UnixStream;
use tracing::{debug, trace};

/// The two buffers one daemon call fills
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutputStreams {
    /// Structured compiler output
    pub compiler: Vec<u8>,
    /// Free-text daemon log lines
    pub daemon_log: Vec<u8>,
}

/// Successful daemon call: the exit code verbatim plus both unparsed buffers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonResponse {
    pub exit_code: i32,
    pub streams: RawOutputStreams,
}

/// A live daemon endpoint able to run compiles
pub trait DaemonHandle: Send {
    /// Run one compile; blocks until the daemon has answered
    fn compile(
        &mut self,
        session_id: SessionId,
        platform: PlatformTag,
        arguments: &[String],
        services: &CompilationServices,
    ) -> Result<DaemonResponse, TransportError>;
}

/// Issue a compile request on a session.
///
/// The session is consumed: after a failure a new one has to come from the
/// connection manager.
pub fn invoke(session: Session, request: &CompilationRequest) -> Result<DaemonResponse, TransportError> {
    let session_id = session.id();
    let mut daemon = session
        .into_daemon()
        .ok_or_else(|| TransportError::Protocol("session has no daemon".to_string()))?;

    debug!(
        session_id,
        platform = %request.platform_tag(),
        args = request.arguments.len(),
        "sending compile request"
    );

    daemon.compile(
        session_id,
        request.platform_tag(),
        &request.arguments,
        &request.services,
    )
}

/// Daemon handle speaking the framed protocol over a unix socket
pub struct SocketDaemon {
    stream: UnixStream,
    message_id: MessageId,
}

impl SocketDaemon {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            message_id: 0,
        }
    }

    /// Continue numbering after messages already exchanged on this stream
    pub fn with_next_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    /// Get the next message ID
    fn next_message_id(&mut self) -> MessageId {
        let id = self.message_id;
        self.message_id = self.message_id.wrapping_add(1);
        id
    }

    fn send(&mut self, message: &Message, message_id: MessageId) -> Result<(), TransportError> {
        let bytes = encode_message(message, message_id)
            .map_err(|e| TransportError::Request(e.to_string()))?;
        self.stream
            .write_all(&bytes)
            .and_then(|_| self.stream.flush())
            .map_err(TransportError::from_io)
    }
}

impl DaemonHandle for SocketDaemon {
    fn compile(
        &mut self,
        session_id: SessionId,
        platform: PlatformTag,
        arguments: &[String],
        services: &CompilationServices,
    ) -> Result<DaemonResponse, TransportError> {
        let message_id = self.next_message_id();
        let request = Message::Compile(Compile {
            session_id,
            platform,
            arguments: arguments.to_vec(),
            incremental: services.is_incremental(),
        });
        self.send(&request, message_id)?;

        // Serve callbacks until the daemon reports the result
        loop {
            let (reply, _) = read_message(&mut self.stream).map_err(TransportError::from_io)?;
            match reply {
                Message::CancelQuery => {
                    let canceled = services.is_canceled();
                    trace!(canceled, "answering cancel query");
                    self.send(&Message::CancelStatus(canceled), message_id)?;
                }
                Message::StateQuery(query) => {
                    let value = services.lookup_state(&query.key);
                    trace!(key = %query.key, found = value.is_some(), "answering state query");
                    self.send(&Message::StateReply(StateReply { value }), message_id)?;
                }
                Message::CompileResult(result) => {
                    return Ok(DaemonResponse {
                        exit_code: result.exit_code,
                        streams: RawOutputStreams {
                            compiler: result.compiler_output,
                            daemon_log: result.daemon_log,
                        },
                    });
                }
                Message::Error(reply) => return Err(TransportError::Remote(reply.message)),
                other => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected {} message during compile",
                        other.kind()
                    )))
                }
            }
        }
    }
}
