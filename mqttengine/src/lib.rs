//! An MQTT 5 client core built around a single tokio eventloop.
//!
//! Application calls and packets read off the network are funneled through
//! one ordered command queue into the [`EventLoop`], which owns the
//! connection state, the per packet identifier transactions and the
//! subscription table. Calls that wait for an acknowledgement only suspend
//! the caller; the eventloop keeps serving everything else meanwhile.
//!
//! ```no_run
//! use mqttengine::{AsyncClient, Filter, Message, QoS, SessionConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (client, eventloop) = AsyncClient::new(10);
//! tokio::spawn(eventloop.run());
//!
//! let config = SessionConfig::new("t1", "localhost", 1883);
//! client.connect(config).await.unwrap();
//!
//! let filters = vec![Filter::new("sample/+", QoS::AtLeastOnce)];
//! client
//!     .subscribe(filters, |message: &Message| println!("{:?}", message))
//!     .await
//!     .unwrap();
//!
//! client
//!     .publish("sample/topic1", QoS::AtLeastOnce, false, "hello world")
//!     .await
//!     .unwrap();
//! # }
//! ```
//!
//! ## Important notes
//!
//! - Handlers run on the eventloop. Blocking inside a handler blocks
//!   connection progress.
//!
//! - Reconnection is opt in with [`SessionConfig::set_reconnect`]. It takes
//!   over only after a connection was established and then lost; the first
//!   `connect` failure is always returned to the caller.
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
extern crate log;

use std::fmt::{self, Debug, Formatter};
#[cfg(feature = "use-rustls")]
use std::sync::Arc;
use std::time::Duration;

mod client;
mod eventloop;
mod framed;
pub mod mqttbytes;
mod network;
mod notice;
mod reconnection_strategy;
mod state;
mod subscriptions;

#[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
mod tls;

pub use client::{AsyncClient, ClientError, PublishResult};
pub use eventloop::{ConnectionError, EventLoop};
pub use mqttbytes::*;
pub use network::{Connector, TcpConnector, TransportError, N};
pub use reconnection_strategy::{ReconnectionStrategy, TruncatedExponentialBackoff};
pub use state::{ConnectionState, MqttState, PublishAck, StateError};
pub use subscriptions::{Handler, Message};
#[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
pub use tls::Error as TlsError;
#[cfg(feature = "use-native-tls")]
pub use tokio_native_tls;
#[cfg(feature = "use-rustls")]
pub use tokio_rustls;
#[cfg(feature = "use-rustls")]
use tokio_rustls::rustls::ClientConfig;

/// Requests by the client to mqtt event loop. Request are
/// handled one by one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Connect(Connect),
    Publish(Publish),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    PingReq,
    Disconnect(Disconnect),
}

impl From<Publish> for Request {
    fn from(publish: Publish) -> Request {
        Request::Publish(publish)
    }
}

impl From<Subscribe> for Request {
    fn from(subscribe: Subscribe) -> Request {
        Request::Subscribe(subscribe)
    }
}

impl From<Unsubscribe> for Request {
    fn from(unsubscribe: Unsubscribe) -> Request {
        Request::Unsubscribe(unsubscribe)
    }
}

/// Transport methods. Defaults to TCP.
#[derive(Clone, Default)]
pub enum Transport {
    #[default]
    Tcp,
    #[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
    Tls(TlsConfiguration),
}

impl Transport {
    /// Use regular tcp as transport (default)
    pub fn tcp() -> Self {
        Self::Tcp
    }

    /// Use secure tcp with tls as transport. `ca: None` trusts the
    /// platform's root certificates
    #[cfg(feature = "use-rustls")]
    pub fn tls(
        ca: Option<Vec<u8>>,
        client_auth: Option<(Vec<u8>, Vec<u8>)>,
        alpn: Option<Vec<Vec<u8>>>,
    ) -> Self {
        let config = TlsConfiguration::Simple {
            ca,
            alpn,
            client_auth,
        };

        Self::tls_with_config(config)
    }

    #[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
    pub fn tls_with_config(tls_config: TlsConfiguration) -> Self {
        Self::Tls(tls_config)
    }
}

/// TLS configuration method
#[derive(Clone, Debug)]
#[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
pub enum TlsConfiguration {
    #[cfg(feature = "use-rustls")]
    Simple {
        /// ca certificate (PEM). Platform roots when absent
        ca: Option<Vec<u8>>,
        /// alpn settings
        alpn: Option<Vec<Vec<u8>>>,
        /// tls client_authentication: PEM certificate chain and PEM key
        client_auth: Option<(Vec<u8>, Vec<u8>)>,
    },
    #[cfg(feature = "use-native-tls")]
    SimpleNative {
        /// ca certificate (PEM). Platform roots when absent
        ca: Option<Vec<u8>>,
        /// pkcs12 binary der and
        /// password for use with der
        client_auth: Option<(Vec<u8>, String)>,
    },
    #[cfg(feature = "use-rustls")]
    /// Injected rustls ClientConfig for TLS, to allow more customisation.
    Rustls(Arc<ClientConfig>),
}

#[cfg(feature = "use-rustls")]
impl From<ClientConfig> for TlsConfiguration {
    fn from(config: ClientConfig) -> Self {
        TlsConfiguration::Rustls(Arc::new(config))
    }
}

/// What happens when a transaction runs out of retransmissions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Fail the call, log and carry on with the connection
    #[default]
    Drop,
    /// Fail the call and reset the connection
    Reset,
}

/// Backoff between reconnection attempts. The n-th consecutive attempt
/// waits `min_backoff * 2^(n-1)` plus up to `jitter`, never more than
/// `max_backoff`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectOptions {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        ReconnectOptions {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: Duration::from_secs(1),
        }
    }
}

/// Options to configure the behaviour of MQTT connection
#[derive(Clone)]
pub struct SessionConfig {
    /// broker address that you want to connect to
    broker_addr: String,
    /// broker port
    port: u16,
    transport: Transport,
    /// keep alive time to send pingreq to broker when the connection is idle
    keep_alive: Duration,
    /// clean (or) persistent session
    clean_start: bool,
    /// client identifier
    client_id: String,
    username: Option<String>,
    password: Option<Vec<u8>>,
    /// maximum incoming packet size (verifies remaining length of the packet)
    max_incoming_packet_size: usize,
    /// Maximum outgoing packet size
    max_outgoing_packet_size: usize,
    /// maximum number of outgoing inflight messages
    inflight: u16,
    /// Last will that will be issued on unexpected disconnect
    last_will: Option<LastWill>,
    connect_timeout: Duration,
    ack_timeout: Option<Duration>,
    max_retries: u16,
    ping_grace: Option<Duration>,
    timeout_policy: TimeoutPolicy,
    reconnect: Option<ReconnectOptions>,
    connect_properties: Properties,
}

impl SessionConfig {
    /// Create a [`SessionConfig`] object that contains default values for all settings other than
    /// - id: A string to identify the device connecting to a broker
    /// - host: The broker's domain name or IP address
    /// - port: The port number on which broker must be listening for incoming connections
    ///
    /// ```
    /// # use mqttengine::SessionConfig;
    /// let options = SessionConfig::new("123", "localhost", 1883);
    /// ```
    pub fn new<S: Into<String>, T: Into<String>>(id: S, host: T, port: u16) -> SessionConfig {
        SessionConfig {
            broker_addr: host.into(),
            port,
            transport: Transport::tcp(),
            keep_alive: Duration::from_secs(30),
            clean_start: true,
            client_id: id.into(),
            username: None,
            password: None,
            max_incoming_packet_size: 10 * 1024,
            max_outgoing_packet_size: 10 * 1024,
            inflight: 100,
            last_will: None,
            connect_timeout: Duration::from_secs(5),
            ack_timeout: None,
            max_retries: 3,
            ping_grace: None,
            timeout_policy: TimeoutPolicy::Drop,
            reconnect: None,
            connect_properties: Properties::new(),
        }
    }

    /// Broker address
    pub fn broker_address(&self) -> (String, u16) {
        (self.broker_addr.clone(), self.port)
    }

    pub fn set_last_will(&mut self, will: LastWill) -> &mut Self {
        self.last_will = Some(will);
        self
    }

    pub fn last_will(&self) -> Option<LastWill> {
        self.last_will.clone()
    }

    pub fn set_transport(&mut self, transport: Transport) -> &mut Self {
        self.transport = transport;
        self
    }

    pub fn transport(&self) -> Transport {
        self.transport.clone()
    }

    /// Set number of seconds after which client should ping the broker
    /// if there is no other data exchange. Zero turns keep alive off
    pub fn set_keep_alive(&mut self, duration: Duration) -> &mut Self {
        self.keep_alive = Duration::from_secs(duration.as_secs());
        self
    }

    /// Keep alive time
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Client identifier
    pub fn client_id(&self) -> String {
        self.client_id.clone()
    }

    /// Set packet size limit for outgoing an incoming packets
    pub fn set_max_packet_size(&mut self, incoming: usize, outgoing: usize) -> &mut Self {
        self.max_incoming_packet_size = incoming;
        self.max_outgoing_packet_size = outgoing;
        self
    }

    /// Maximum incoming and outgoing packet size
    pub fn max_packet_size(&self) -> (usize, usize) {
        (self.max_incoming_packet_size, self.max_outgoing_packet_size)
    }

    /// `clean_start = true` removes all the state from queues & instructs the broker
    /// to clean all the client state when client disconnects.
    ///
    /// When set `false`, broker will hold the client state and performs pending
    /// operations on the client when reconnection with same `client_id`
    /// happens.
    pub fn set_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.clean_start = clean_start;
        self
    }

    pub fn clean_start(&self) -> bool {
        self.clean_start
    }

    /// Username and password flags are set independently, each one only
    /// when its field is present
    pub fn set_username<U: Into<String>>(&mut self, username: U) -> &mut Self {
        self.username = Some(username.into());
        self
    }

    pub fn set_password<P: Into<Vec<u8>>>(&mut self, password: P) -> &mut Self {
        self.password = Some(password.into());
        self
    }

    pub fn set_credentials<U: Into<String>, P: Into<Vec<u8>>>(
        &mut self,
        username: U,
        password: P,
    ) -> &mut Self {
        self.set_username(username).set_password(password)
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Set number of concurrent in flight messages
    pub fn set_inflight(&mut self, inflight: u16) -> &mut Self {
        self.inflight = inflight.max(1);
        self
    }

    /// Number of concurrent in flight messages
    pub fn inflight(&self) -> u16 {
        self.inflight
    }

    /// Time allowed to open the transport and receive the CONNACK
    pub fn set_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Time to wait for an acknowledgement before a retransmission
    pub fn set_ack_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.ack_timeout = Some(timeout);
        self
    }

    /// Ack timeout. Falls back to the keep alive interval, or 30 seconds
    /// when keep alive is off
    pub fn ack_timeout(&self) -> Duration {
        match self.ack_timeout {
            Some(timeout) => timeout,
            None if self.keep_alive.is_zero() => Duration::from_secs(30),
            None => self.keep_alive,
        }
    }

    /// Number of retransmissions of a publish or pubrel before giving up
    pub fn set_max_retries(&mut self, retries: u16) -> &mut Self {
        self.max_retries = retries;
        self
    }

    pub fn max_retries(&self) -> u16 {
        self.max_retries
    }

    /// Time to wait for a PINGRESP before the connection is considered dead
    pub fn set_ping_grace(&mut self, grace: Duration) -> &mut Self {
        self.ping_grace = Some(grace);
        self
    }

    pub fn ping_grace(&self) -> Duration {
        self.ping_grace.unwrap_or(self.keep_alive)
    }

    pub fn set_timeout_policy(&mut self, policy: TimeoutPolicy) -> &mut Self {
        self.timeout_policy = policy;
        self
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        self.timeout_policy
    }

    /// Reconnect with backoff when an established connection is lost
    pub fn set_reconnect(&mut self, reconnect: ReconnectOptions) -> &mut Self {
        self.reconnect = Some(reconnect);
        self
    }

    pub fn reconnect(&self) -> Option<ReconnectOptions> {
        self.reconnect
    }

    /// Properties sent along with CONNECT
    pub fn set_connect_properties(&mut self, properties: Properties) -> &mut Self {
        self.connect_properties = properties;
        self
    }

    pub fn connect_properties(&self) -> &Properties {
        &self.connect_properties
    }

    /// CONNECT packet for this configuration
    pub(crate) fn connect_packet(&self) -> Connect {
        let mut connect = Connect::new(self.client_id.clone());
        connect.keep_alive = self.keep_alive.as_secs().min(u16::MAX as u64) as u16;
        connect.clean_start = self.clean_start;
        connect.last_will = self.last_will.clone();
        connect.username = self.username.clone();
        connect.password = self.password.clone().map(Into::into);
        connect.properties = self.connect_properties.clone();
        connect
    }
}

impl Debug for SessionConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("broker_addr", &self.broker_addr)
            .field("port", &self.port)
            .field("keep_alive", &self.keep_alive)
            .field("clean_start", &self.clean_start)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("max_packet_size", &self.max_packet_size())
            .field("inflight", &self.inflight)
            .field("last_will", &self.last_will)
            .field("connect_timeout", &self.connect_timeout)
            .field("ack_timeout", &self.ack_timeout())
            .field("max_retries", &self.max_retries)
            .field("timeout_policy", &self.timeout_policy)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_sane() {
        let config = SessionConfig::new("t1", "localhost", 1883);
        assert_eq!(config.keep_alive(), Duration::from_secs(30));
        assert!(config.clean_start());
        assert_eq!(config.inflight(), 100);
        assert_eq!(config.max_packet_size(), (10 * 1024, 10 * 1024));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.ack_timeout(), Duration::from_secs(30));
        assert_eq!(config.ping_grace(), Duration::from_secs(30));
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.timeout_policy(), TimeoutPolicy::Drop);
        assert_eq!(config.reconnect(), None);
    }

    #[test]
    fn ack_timeout_follows_keep_alive() {
        let mut config = SessionConfig::new("t1", "localhost", 1883);
        config.set_keep_alive(Duration::from_secs(5));
        assert_eq!(config.ack_timeout(), Duration::from_secs(5));

        config.set_keep_alive(Duration::ZERO);
        assert_eq!(config.ack_timeout(), Duration::from_secs(30));

        config.set_ack_timeout(Duration::from_secs(2));
        assert_eq!(config.ack_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn connect_packet_only_carries_present_credentials() {
        let mut config = SessionConfig::new("t1", "localhost", 1883);
        config.set_password("secret").set_clean_start(false);

        let connect = config.connect_packet();
        assert_eq!(connect.client_id, "t1");
        assert_eq!(connect.keep_alive, 30);
        assert!(!connect.clean_start);
        assert_eq!(connect.username, None);
        assert_eq!(connect.password.as_deref(), Some(&b"secret"[..]));
    }
}
