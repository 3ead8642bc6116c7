use super::protocol::{HEADER_SIZE, Protocol};
use crate::error::NanonisError;
use log::{debug, warn};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Upper bound for a single external-interface reply
pub const EXTERNAL_REPLY_SIZE: usize = 1024;

/// Connection configuration for the TCP transport.
///
/// Contains timeout settings for different phases of the TCP connection lifecycle.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use aunis::ConnectionConfig;
///
/// // Customize timeouts for slow network
/// let config = ConnectionConfig {
///     connect_timeout: Duration::from_secs(30),
///     read_timeout: Duration::from_secs(60),
///     write_timeout: Duration::from_secs(10),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a TCP connection
    pub connect_timeout: Duration,
    /// Timeout for reading data from the server
    pub read_timeout: Duration,
    /// Timeout for writing data to the server
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Byte-level I/O towards the instrument and external interfaces.
///
/// Implementations own connection lifetime only; framing beyond the response
/// header and all command semantics live in the dispatcher.
pub trait Transport: Send {
    /// Open the persistent instrument connection. No retry is attempted.
    fn connect(&mut self, host: &str, port: u16) -> Result<(), NanonisError>;

    /// Close the instrument connection. Calling it while disconnected is a no-op.
    fn disconnect(&mut self);

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), NanonisError>;

    /// Read one response frame (header plus announced body), at most `max_bytes` long
    fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>, NanonisError>;

    /// Open a fresh connection, send `payload`, read one reply and close again.
    fn call_once(&mut self, host: &str, port: u16, payload: &[u8]) -> Result<Vec<u8>, NanonisError>;
}

/// [`Transport`] over `std::net::TcpStream`
#[derive(Debug, Default)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    config: ConnectionConfig,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ConnectionConfig) -> Self {
        Self {
            stream: None,
            config,
        }
    }

    /// Get the current connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn open(&self, host: &str, port: u16) -> Result<TcpStream, NanonisError> {
        let address = format!("{host}:{port}");
        let connect_error = |message: String| NanonisError::Connect {
            address: address.clone(),
            message,
        };

        let candidates: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| connect_error(format!("cannot resolve address: {e}")))?
            .collect();

        let mut last_error = connect_error("no addresses resolved".to_string());
        for socket_addr in candidates {
            debug!("Connecting to {socket_addr}");
            match TcpStream::connect_timeout(&socket_addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.config.read_timeout))?;
                    stream.set_write_timeout(Some(self.config.write_timeout))?;
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("Failed to connect to {socket_addr}: {e}");
                    last_error = connect_error(e.to_string());
                }
            }
        }
        Err(last_error)
    }

    fn stream(&mut self) -> Result<&mut TcpStream, NanonisError> {
        self.stream
            .as_mut()
            .ok_or_else(|| NanonisError::Transport("Not connected".to_string()))
    }

    /// Drop a stream that failed mid-frame; it can no longer be trusted to be in sync
    fn broken(&mut self, context: &str, e: std::io::Error) -> NanonisError {
        warn!("{context} failed, closing connection: {e}");
        self.stream = None;
        NanonisError::Transport(format!("{context}: {e}"))
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, host: &str, port: u16) -> Result<(), NanonisError> {
        self.disconnect();
        let stream = self.open(host, port)?;
        debug!("Successfully connected to Nanonis at {host}:{port}");
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!("Disconnected from Nanonis");
        }
    }

    fn state(&self) -> ConnectionState {
        if self.stream.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), NanonisError> {
        debug!("Sending frame ({} bytes)", frame.len());
        let result = self.stream()?.write_all(frame);
        result.map_err(|e| self.broken("Writing request", e))
    }

    fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>, NanonisError> {
        let mut header = [0u8; HEADER_SIZE];
        let result = self.stream()?.read_exact(&mut header);
        result.map_err(|e| self.broken("Reading response header", e))?;

        let body_size = Protocol::body_size(&header);
        debug!(
            "Response header for {:?}, body {} bytes",
            Protocol::command_name(&header),
            body_size
        );
        let body_size = usize::try_from(body_size).map_err(|_| {
            self.stream = None;
            NanonisError::Transport(format!("Negative body size {body_size} in response header"))
        })?;
        if HEADER_SIZE + body_size > max_bytes {
            self.stream = None;
            return Err(NanonisError::Transport(format!(
                "Response of {} bytes exceeds limit of {max_bytes}",
                HEADER_SIZE + body_size
            )));
        }

        let mut frame = vec![0u8; HEADER_SIZE + body_size];
        frame[..HEADER_SIZE].copy_from_slice(&header);
        let result = self.stream()?.read_exact(&mut frame[HEADER_SIZE..]);
        result.map_err(|e| self.broken("Reading response body", e))?;
        Ok(frame)
    }

    fn call_once(&mut self, host: &str, port: u16, payload: &[u8]) -> Result<Vec<u8>, NanonisError> {
        // The stream is dropped (and closed) on every return path.
        let mut stream = self.open(host, port)?;
        stream
            .write_all(payload)
            .map_err(|e| NanonisError::Transport(format!("Writing to {host}:{port}: {e}")))?;

        let mut reply = vec![0u8; EXTERNAL_REPLY_SIZE];
        let read = stream
            .read(&mut reply)
            .map_err(|e| NanonisError::Transport(format!("Reading from {host}:{port}: {e}")))?;
        reply.truncate(read);
        debug!("External reply from {host}:{port}: {} bytes", read);
        Ok(reply)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
