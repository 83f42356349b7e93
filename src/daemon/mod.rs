//! Compile daemon plumbing
//!
//! - `protocol`: message framing and serialization (length-prefixed binary format)
//! - `connector`: daemon discovery and session leasing
//! - `client`: one compile request over a leased session
//! - `server`: reference daemon serving compiles on a unix socket

pub mod client;
pub mod connector;
pub mod protocol;
pub mod server;

pub use client::{invoke, DaemonHandle, DaemonResponse, RawOutputStreams, SocketDaemon};
pub use connector::{ConnectionManager, Session, UnixSocketConnector};
pub use protocol::{
    decode_message, encode_message, read_message, write_message, Message, MessageId, SessionId,
    NO_SESSION,
};
pub use server::DaemonServer;
