pub mod protocol;
pub mod transport;

pub use protocol::Protocol;
pub use transport::{ConnectionConfig, ConnectionState, TcpTransport, Transport};
