//! Daemon wire protocol
//!
//! Length-prefixed binary messages over a unix socket:
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────┐
//! │   Length   │  Message ID  │  Payload (bincode)   │
//! │  (4 bytes) │  (4 bytes)   │  (variable length)   │
//! └────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! A compile conversation on one connection:
//!
//! ```text
//! client                          daemon
//!   LeaseSession          ──▶
//!                         ◀──     SessionLeased
//!   Compile               ──▶
//!                         ◀──     CancelQuery / StateQuery   (zero or more)
//!   CancelStatus / StateReply ──▶
//!                         ◀──     CompileResult
//! ```
//!
//! Any frame that cannot be decoded surfaces as `InvalidData`.

use crate::compiler::PlatformTag;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Maximum message size (10MB to prevent memory exhaustion)
const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Message ID counter type (unique per message for request/response correlation)
pub type MessageId = u32;

/// Daemon-side compilation context identifier
pub type SessionId = i32;

/// Session id meaning "no session" (or a daemon without session support)
pub const NO_SESSION: SessionId = 0;

/// Message envelope containing all possible message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Client asks for a session on this connection
    LeaseSession(LeaseSession),
    /// Daemon grants a session
    SessionLeased(SessionLeased),
    /// Client requests a compile
    Compile(Compile),
    /// Daemon returns the compile outcome with both output buffers
    CompileResult(CompileResult),
    /// Daemon asks whether the caller has canceled
    CancelQuery,
    /// Client answers a cancel query
    CancelStatus(bool),
    /// Daemon reads an incremental-state entry from the caller
    StateQuery(StateQuery),
    /// Client answers a state query
    StateReply(StateReply),
    /// Daemon rejects a request
    Error(ErrorReply),
    /// Request daemon shutdown
    Shutdown(Shutdown),
}

impl Message {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::LeaseSession(_) => "LeaseSession",
            Message::SessionLeased(_) => "SessionLeased",
            Message::Compile(_) => "Compile",
            Message::CompileResult(_) => "CompileResult",
            Message::CancelQuery => "CancelQuery",
            Message::CancelStatus(_) => "CancelStatus",
            Message::StateQuery(_) => "StateQuery",
            Message::StateReply(_) => "StateReply",
            Message::Error(_) => "Error",
            Message::Shutdown(_) => "Shutdown",
        }
    }
}

/// Session lease request (Client → Daemon)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseSession {
    pub platform: PlatformTag,
    /// Client process id, for daemon-side logging
    pub client_pid: u32,
}

/// Session lease acknowledgment (Daemon → Client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLeased {
    pub session_id: SessionId,
}

/// Compile request (Client → Daemon)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compile {
    pub session_id: SessionId,
    pub platform: PlatformTag,
    pub arguments: Vec<String>,
    /// Whether the caller can answer state queries
    pub incremental: bool,
}

/// Compile outcome (Daemon → Client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileResult {
    pub exit_code: i32,
    /// Structured compiler output
    pub compiler_output: Vec<u8>,
    /// Free-text daemon log lines
    pub daemon_log: Vec<u8>,
}

/// Incremental-state lookup (Daemon → Client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateQuery {
    pub key: String,
}

/// Incremental-state lookup result (Client → Daemon)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReply {
    pub value: Option<Vec<u8>>,
}

/// Rejection (Daemon → Client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
}

/// Daemon shutdown request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shutdown {
    /// Whether to stop without waiting for running compiles
    pub force: bool,
}

/// Encode a message into the wire format
///
/// Format: [4-byte length][4-byte message ID][bincode payload]
pub fn encode_message(message: &Message, message_id: MessageId) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let payload_len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Message too large: {} bytes", payload.len()),
            )
        })?;

    let mut buffer = Vec::with_capacity(8 + payload.len());

    // Length prefix covers message_id + payload
    buffer.extend_from_slice(&(payload_len + 4).to_le_bytes());
    buffer.extend_from_slice(&message_id.to_le_bytes());
    buffer.extend_from_slice(&payload);

    Ok(buffer)
}

/// Decode a message from the wire format
///
/// Returns (message, message_id)
pub fn decode_message<R: Read>(reader: &mut R) -> io::Result<(Message, MessageId)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let frame_len = u32::from_le_bytes(len_bytes);

    if frame_len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Message length too small",
        ));
    }
    if frame_len > MAX_MESSAGE_SIZE + 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", frame_len),
        ));
    }

    let mut id_bytes = [0u8; 4];
    reader.read_exact(&mut id_bytes)?;
    let message_id = u32::from_le_bytes(id_bytes);

    let mut payload = vec![0u8; (frame_len - 4) as usize];
    reader.read_exact(&mut payload)?;

    let message: Message = bincode::deserialize(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok((message, message_id))
}

/// Write a message to a stream
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &Message,
    message_id: MessageId,
) -> io::Result<()> {
    let bytes = encode_message(message, message_id)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a message from a stream
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<(Message, MessageId)> {
    decode_message(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_compile_conversation_in_one_buffer() {
        let messages = vec![
            (
                Message::LeaseSession(LeaseSession {
                    platform: PlatformTag::Jvm,
                    client_pid: 4242,
                }),
                1,
            ),
            (Message::SessionLeased(SessionLeased { session_id: 7 }), 1),
            (
                Message::Compile(Compile {
                    session_id: 7,
                    platform: PlatformTag::Jvm,
                    arguments: vec!["-d".to_string(), "out".to_string(), "a.kt".to_string()],
                    incremental: true,
                }),
                2,
            ),
            (Message::CancelQuery, 2),
            (Message::CancelStatus(false), 2),
            (
                Message::StateQuery(StateQuery {
                    key: "jvm/lookups".to_string(),
                }),
                2,
            ),
            (Message::StateReply(StateReply { value: None }), 2),
            (
                Message::CompileResult(CompileResult {
                    exit_code: 0,
                    compiler_output: b"INFO: no location: ok\n".to_vec(),
                    daemon_log: b"compiled in 12ms\n".to_vec(),
                }),
                2,
            ),
        ];

        let mut buffer = Vec::new();
        for (msg, id) in &messages {
            write_message(&mut buffer, msg, *id).unwrap();
        }

        let mut cursor = Cursor::new(buffer);
        for (expected_msg, expected_id) in &messages {
            let (msg, id) = read_message(&mut cursor).unwrap();
            assert_eq!(*expected_msg, msg);
            assert_eq!(*expected_id, id);
        }
    }

    #[test]
    fn test_message_too_large() {
        let message = Message::CompileResult(CompileResult {
            exit_code: 0,
            compiler_output: vec![b'x'; (MAX_MESSAGE_SIZE + 1) as usize],
            daemon_log: Vec::new(),
        });

        let err = encode_message(&message, 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_garbage_payload_is_invalid_data() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&8u32.to_le_bytes());
        frame.extend_from_slice(&1u32.to_le_bytes());
        frame.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);

        let err = read_message(&mut Cursor::new(frame)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_short_length_is_invalid_data() {
        let frame = 2u32.to_le_bytes().to_vec();
        let err = read_message(&mut Cursor::new(frame)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_frame_is_eof() {
        let bytes = encode_message(&Message::CancelQuery, 3).unwrap();
        let err = read_message(&mut Cursor::new(&bytes[..bytes.len() - 1])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_message_kind_names() {
        assert_eq!(Message::CancelQuery.kind(), "CancelQuery");
        assert_eq!(Message::Shutdown(Shutdown { force: false }).kind(), "Shutdown");
    }
}
