//! ZeroMQ request/reply transport to the tileboard servers.
//!
//! Each [`ZmqTransport`] wraps one REQ socket. REQ sockets enforce strict
//! send/receive alternation, which matches the board protocol: one request,
//! one reply, never two requests in flight.

use super::{Connector, Endpoint, Transport};
use crate::error::{AppResult, DaqError};
use std::time::Duration;
use tracing::{debug, info};

/// Socket options applied to every REQ socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketOptions {
    /// Receive timeout; `None` blocks forever
    pub recv_timeout: Option<Duration>,
    /// Send timeout; `None` blocks forever
    pub send_timeout: Option<Duration>,
    /// Linger period on close; `None` discards pending messages immediately
    pub linger: Option<Duration>,
}

/// Opens ZeroMQ REQ sockets sharing one context.
pub struct ZmqConnector {
    context: zmq::Context,
    options: SocketOptions,
}

impl ZmqConnector {
    /// Create a connector with its own ZeroMQ context.
    pub fn new(options: SocketOptions) -> Self {
        Self {
            context: zmq::Context::new(),
            options,
        }
    }
}

impl Default for ZmqConnector {
    fn default() -> Self {
        Self::new(SocketOptions::default())
    }
}

impl Connector for ZmqConnector {
    fn open(&self, endpoint: &Endpoint) -> AppResult<Box<dyn Transport>> {
        let socket = self.context.socket(zmq::REQ)?;
        socket.set_linger(millis_or(self.options.linger, 0))?;
        socket.set_rcvtimeo(millis_or(self.options.recv_timeout, -1))?;
        socket.set_sndtimeo(millis_or(self.options.send_timeout, -1))?;
        // a timed-out request must not wedge the socket for the next one
        socket.set_req_relaxed(true)?;
        socket.set_req_correlate(true)?;

        let address = endpoint.zmq_address();
        socket.connect(&address)?;
        info!("Connected REQ socket to {}", address);

        Ok(Box::new(ZmqTransport { socket, address }))
    }
}

/// One live REQ socket.
pub struct ZmqTransport {
    socket: zmq::Socket,
    address: String,
}

impl Transport for ZmqTransport {
    fn request(&mut self, message: &str) -> AppResult<String> {
        debug!(address = %self.address, "zmq send: {:?}", first_line(message));
        self.socket.send(message, 0)?;
        let reply = self
            .socket
            .recv_string(0)?
            .map_err(|bytes| DaqError::InvalidReply {
                command: first_line(message).to_owned(),
                reply: String::from_utf8_lossy(&bytes).into_owned(),
            })?;
        debug!(address = %self.address, "zmq recv: {:?}", first_line(&reply));
        Ok(reply)
    }
}

fn millis_or(duration: Option<Duration>, fallback: i32) -> i32 {
    duration
        .map(|d| i32::try_from(d.as_millis()).unwrap_or(i32::MAX))
        .unwrap_or(fallback)
}

/// Configuration payloads are whole YAML documents; only log their head.
fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("")
}
