//! Socket interface for request sources

pub mod protocol;
pub mod server;

pub use protocol::{parse_command, serialize_reply, Command, FetchRequest, Reply, PROTOCOL_VERSION};
pub use server::IpcServer;
