//! Request/reply clients for the tileboard servers.
//!
//! The boards expose three plain-text request/reply services: the fast-control
//! (trigger/acquisition) server on the instrument, the data sink that writes
//! raw files, and the slow-control server that drives calibration registers
//! and general-purpose IO. All three share the [`MessageClient`] protocol:
//!
//! - every request is one string, every reply is one string
//! - readiness is signalled by a case-insensitive token in the reply
//!   (`"ready"`, `"running"`, `"notdone"`)
//! - configuration is always transmitted as a YAML dump of the *entire*
//!   working [`ConfigTree`], never a partial fragment
//!
//! ```text
//! client                      board
//!   | -- "configure" -------->  |
//!   | <------------- "ready" -- |
//!   | -- <full YAML tree> ----> |
//!   | <-------- "configured" -- |
//! ```
//!
//! The socket itself sits behind the [`Transport`] trait so the protocol
//! logic can be driven by the in-process simulator (`crate::sim`) or by test
//! doubles exactly as it is driven by ZeroMQ in production.

pub mod fast_control;
pub mod poll;
pub mod slow_control;
pub mod zmq_transport;

pub use fast_control::{FastCommandFlags, FastControlClient, GeneratorSettings, L1aSettings, RunState};
pub use poll::{Interrupt, PollPolicy};
pub use slow_control::{Reply, ReplyKind, SlowControlClient};
pub use zmq_transport::{SocketOptions, ZmqConnector};

use crate::config_tree::{self, ConfigTree};
use crate::error::{AppResult, DaqError};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Network location of one board service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or IP address
    pub address: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// ZeroMQ connect string for this endpoint.
    pub fn zmq_address(&self) -> String {
        format!("tcp://{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// One blocking request/reply channel.
///
/// Implementations must not be used for two requests at once; the board
/// protocol is strictly half-duplex.
pub trait Transport: Send {
    /// Send `message` and block until the reply arrives.
    fn request(&mut self, message: &str) -> AppResult<String>;
}

/// Opens transports to endpoints.
pub trait Connector: Send + Sync {
    /// Open a new live transport to `endpoint`.
    fn open(&self, endpoint: &Endpoint) -> AppResult<Box<dyn Transport>>;
}

/// Synchronous request/reply client owning a working configuration.
pub struct MessageClient {
    connector: Arc<dyn Connector>,
    endpoint: Option<Endpoint>,
    transport: Option<Box<dyn Transport>>,
    config: ConfigTree,
    poll: PollPolicy,
    interrupt: Option<Arc<dyn Interrupt>>,
}

impl MessageClient {
    /// Create an unconnected client that opens transports with `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            endpoint: None,
            transport: None,
            config: ConfigTree::new(),
            poll: PollPolicy::default(),
            interrupt: None,
        }
    }

    /// Set the policy used by blocking waits on this client.
    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// (Re)connect to `address:port` and load `document` as the working
    /// configuration. Any live transport is closed first, so calling this
    /// again is a clean reconnect.
    pub fn connect(&mut self, address: &str, port: u16, document: ConfigTree) -> AppResult<()> {
        self.close();
        let endpoint = Endpoint::new(address, port);
        let transport = self.connector.open(&endpoint)?;
        info!(%endpoint, "board client connected");
        self.transport = Some(transport);
        self.endpoint = Some(endpoint);
        self.config = document;
        Ok(())
    }

    /// Reopen the transport to the last endpoint, keeping the working
    /// configuration. Needed after a transport error leaves a REQ socket
    /// mid-request.
    pub fn reconnect(&mut self) -> AppResult<()> {
        let endpoint = self.endpoint.clone().ok_or(DaqError::NotConnected)?;
        self.close();
        self.transport = Some(self.connector.open(&endpoint)?);
        info!(%endpoint, "board client reconnected");
        Ok(())
    }

    /// Drop the live transport, if any.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            if let Some(endpoint) = &self.endpoint {
                debug!(%endpoint, "board client closed");
            }
        }
    }

    /// True while a transport is live.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Endpoint of the last `connect`.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Blocking round trip.
    pub fn send(&mut self, message: &str) -> AppResult<String> {
        let transport = self.transport.as_mut().ok_or(DaqError::NotConnected)?;
        transport.request(message)
    }

    /// Send `message` and report whether the reply contains `token`,
    /// ignoring case.
    pub fn check(&mut self, message: &str, token: &str) -> AppResult<bool> {
        let reply = self.send(message)?;
        Ok(reply_contains(&reply, token))
    }

    /// Push the working configuration to the board.
    ///
    /// With a fragment, it is deep-merged into the working configuration
    /// first. Either way the *entire* working tree is transmitted. The merge
    /// is validated before anything goes on the wire, so a structural
    /// conflict neither touches the board nor the working tree.
    pub fn configure(&mut self, fragment: Option<&ConfigTree>) -> AppResult<String> {
        let merged = match fragment {
            Some(fragment) => {
                let mut merged = self.config.clone();
                config_tree::merge(&mut merged, fragment)?;
                Some(merged)
            }
            None => None,
        };

        self.require_ready("configure")?;
        if let Some(merged) = merged {
            self.config = merged;
        }
        self.send_config()
    }

    /// Working configuration.
    pub fn config(&self) -> &ConfigTree {
        &self.config
    }

    /// Mutable working configuration.
    pub fn config_mut(&mut self) -> &mut ConfigTree {
        &mut self.config
    }

    /// Poll policy used by blocking waits.
    pub fn poll_policy(&self) -> PollPolicy {
        self.poll
    }

    /// Replace the poll policy.
    pub fn set_poll_policy(&mut self, poll: PollPolicy) {
        self.poll = poll;
    }

    /// Install the interrupt consulted between polls.
    pub fn set_interrupt(&mut self, interrupt: Arc<dyn Interrupt>) {
        self.interrupt = Some(interrupt);
    }

    /// Send `command` and fail with `NotReady` unless the reply says "ready".
    pub(crate) fn require_ready(&mut self, command: &str) -> AppResult<()> {
        let reply = self.send(command)?;
        if reply_contains(&reply, "ready") {
            Ok(())
        } else {
            warn!(command, %reply, "board not ready");
            Err(DaqError::NotReady {
                command: command.to_owned(),
                reply,
            })
        }
    }

    /// Transmit the full working tree.
    pub(crate) fn send_config(&mut self) -> AppResult<String> {
        let payload = self.config.to_yaml()?;
        self.send(&payload)
    }

    /// Repeat `message` on the poll policy until its reply contains `token`.
    pub(crate) fn poll_for(&mut self, message: &str, token: &str) -> AppResult<u32> {
        let policy = self.poll;
        let interrupt = self.interrupt.clone();
        policy.wait_until(message, interrupt.as_deref(), || self.check(message, token))
    }
}

impl fmt::Debug for MessageClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageClient")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("poll", &self.poll)
            .finish()
    }
}

fn reply_contains(reply: &str, token: &str) -> bool {
    reply.to_lowercase().contains(&token.to_lowercase())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transports for protocol unit tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Shared record of every message sent through a [`ScriptedConnector`].
    pub type SentLog = Arc<Mutex<Vec<String>>>;

    /// Replies from a queue, falling back to a responder function.
    pub struct ScriptedConnector {
        replies: Arc<Mutex<VecDeque<String>>>,
        fallback: fn(&str) -> String,
        sent: SentLog,
    }

    impl ScriptedConnector {
        pub fn new(fallback: fn(&str) -> String) -> Self {
            Self {
                replies: Arc::default(),
                fallback,
                sent: SentLog::default(),
            }
        }

        /// Queue replies consumed before the fallback is used.
        pub fn with_replies(self, replies: &[&str]) -> Self {
            self.replies
                .lock()
                .extend(replies.iter().map(|r| r.to_string()));
            self
        }

        pub fn sent(&self) -> SentLog {
            self.sent.clone()
        }
    }

    impl Connector for ScriptedConnector {
        fn open(&self, _endpoint: &Endpoint) -> AppResult<Box<dyn Transport>> {
            Ok(Box::new(ScriptedTransport {
                replies: self.replies.clone(),
                fallback: self.fallback,
                sent: self.sent.clone(),
            }))
        }
    }

    struct ScriptedTransport {
        replies: Arc<Mutex<VecDeque<String>>>,
        fallback: fn(&str) -> String,
        sent: SentLog,
    }

    impl Transport for ScriptedTransport {
        fn request(&mut self, message: &str) -> AppResult<String> {
            self.sent.lock().push(message.to_owned());
            let queued = self.replies.lock().pop_front();
            Ok(queued.unwrap_or_else(|| (self.fallback)(message)))
        }
    }

    /// Acknowledges every readiness check.
    pub fn always_ready(message: &str) -> String {
        match message {
            "configure" | "initialize" => "READY".into(),
            "start" => "running".into(),
            "run_done" => "done".into(),
            _ => "ok".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{always_ready, ScriptedConnector};
    use super::*;
    use crate::config_tree::make_nested;

    fn connected(connector: ScriptedConnector, doc: &str) -> MessageClient {
        let mut client = MessageClient::new(Arc::new(connector));
        client
            .connect("localhost", 6000, ConfigTree::from_yaml_str(doc).unwrap())
            .unwrap();
        client
    }

    #[test]
    fn send_requires_connection() {
        let mut client = MessageClient::new(Arc::new(ScriptedConnector::new(always_ready)));
        assert!(matches!(client.send("start"), Err(DaqError::NotConnected)));
    }

    #[test]
    fn reconnect_keeps_endpoint_and_working_config() {
        let connector = ScriptedConnector::new(always_ready);
        let sent = connector.sent();
        let mut client = connected(connector, "daq: {NEvents: 12}\n");

        client.reconnect().unwrap();
        assert!(client.is_connected());
        assert_eq!(client.endpoint(), Some(&Endpoint::new("localhost", 6000)));
        assert_eq!(
            client.config().get_path("daq.NEvents").and_then(|v| v.as_u64()),
            Some(12)
        );
        assert_eq!(client.send("stop").unwrap(), "ok");
        assert_eq!(*sent.lock(), vec!["stop"]);
    }

    #[test]
    fn reconnect_without_endpoint_is_not_connected() {
        let mut client = MessageClient::new(Arc::new(ScriptedConnector::new(always_ready)));
        assert!(matches!(client.reconnect(), Err(DaqError::NotConnected)));
    }

    #[test]
    fn check_is_case_insensitive() {
        let connector = ScriptedConnector::new(always_ready).with_replies(&["Board Is RUNNING"]);
        let mut client = connected(connector, "{}");
        assert!(client.check("start", "running").unwrap());
        assert!(!client.check("status", "running").unwrap());
    }

    #[test]
    fn configure_transmits_entire_merged_tree() {
        let connector = ScriptedConnector::new(always_ready);
        let sent = connector.sent();
        let mut client = connected(
            connector,
            "daq:\n  NEvents: 100\n  active_menu: randomL1A\nglobal:\n  serverIP: 10.0.0.2\n",
        );

        client
            .configure(Some(&make_nested(&["daq", "NEvents"], 250)))
            .unwrap();

        let sent = sent.lock();
        assert_eq!(sent[0], "configure");
        let payload = ConfigTree::from_yaml_str(&sent[1]).unwrap();
        assert_eq!(&payload, client.config());
        assert_eq!(
            payload.get_path("daq.NEvents").and_then(|v| v.as_u64()),
            Some(250)
        );
        assert!(payload.get_path("global.serverIP").is_some());
        assert!(payload.get_path("daq.active_menu").is_some());
    }

    #[test]
    fn configure_without_fragment_sends_working_tree() {
        let connector = ScriptedConnector::new(always_ready);
        let sent = connector.sent();
        let mut client = connected(connector, "a: 1\n");
        client.config_mut().set_path("b.c", 2).unwrap();

        client.configure(None).unwrap();

        let payload = ConfigTree::from_yaml_str(&sent.lock()[1]).unwrap();
        assert_eq!(payload.get_path("b.c").and_then(|v| v.as_u64()), Some(2));
    }

    #[test]
    fn configure_fails_when_not_ready() {
        let connector = ScriptedConnector::new(always_ready).with_replies(&["busy"]);
        let sent = connector.sent();
        let mut client = connected(connector, "a: 1\n");

        let err = client.configure(None).unwrap_err();
        assert!(matches!(err, DaqError::NotReady { ref reply, .. } if reply == "busy"));
        assert_eq!(sent.lock().len(), 1);
    }

    #[test]
    fn configure_conflict_sends_nothing() {
        let connector = ScriptedConnector::new(always_ready);
        let sent = connector.sent();
        let mut client = connected(connector, "daq:\n  NEvents: 100\n");
        let before = client.config().clone();

        let err = client
            .configure(Some(&make_nested(&["daq"], 5)))
            .unwrap_err();

        assert!(matches!(err, DaqError::StructureMismatch { .. }));
        assert!(sent.lock().is_empty());
        assert_eq!(client.config(), &before);
    }

    #[test]
    fn reconnect_replaces_transport_and_document() {
        let mut client = connected(ScriptedConnector::new(always_ready), "a: 1\n");
        client
            .connect("otherhost", 6001, ConfigTree::from_yaml_str("b: 2\n").unwrap())
            .unwrap();
        assert!(client.is_connected());
        assert_eq!(client.endpoint(), Some(&Endpoint::new("otherhost", 6001)));
        assert!(client.config().get_path("a").is_none());

        client.close();
        assert!(!client.is_connected());
    }
}
