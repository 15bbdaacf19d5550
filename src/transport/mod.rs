//! Wire layer shared by the edge client and the session server.
//!
//! Messages are JSON objects, one per line, over a persistent TCP connection.

mod link;
pub mod protocol;

pub use link::{
    Connector, Link, TcpConnector, TcpLink, TransportError, DEFAULT_MAX_MESSAGE_BYTES,
};
pub use protocol::{
    encode_line, parse_client_message, parse_server_message, Ack, AckCode, Action,
    ClientMessage, ControlRequest, ProtocolError,
};
