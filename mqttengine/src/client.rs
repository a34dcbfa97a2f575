//! Asynchronous handle to the eventloop. Every call is a command on the
//! eventloop's queue; calls which wait for the broker resolve when the
//! matching acknowledgement (or a timeout) is processed there.
use crate::eventloop::Command;
use crate::mqttbytes::{self, *};
use crate::network::{Connector, TcpConnector, TransportError};
use crate::notice::{NoticeFuture, NoticeTx};
use crate::{
    ConnectionError, ConnectionState, EventLoop, Handler, PublishAck, SessionConfig, StateError,
};

use bytes::Bytes;
use tokio::sync::oneshot;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Client Error
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection refused, return code: `{0:?}`")]
    ConnectRejected(ConnectReturnCode),
    #[error("Timeout while waiting for connack")]
    ConnectTimeout,
    #[error("Publish {0} wasn't acknowledged")]
    PublishTimeout(u16),
    #[error("Subscribe {0} wasn't acknowledged")]
    SubscribeTimeout(u16),
    #[error("Transaction {0} wasn't acknowledged")]
    TransactionTimeout(u16),
    #[error("Invalid topic name: {0:?}")]
    InvalidTopic(String),
    #[error("Invalid topic filter: {0:?}")]
    InvalidFilter(String),
    #[error("Serialization error: {0}")]
    Encoding(#[from] mqttbytes::Error),
    #[error("Transport: {0}")]
    Transport(#[from] TransportError),
    #[error("Not connected")]
    NotConnected,
    #[error("Not allowed while {0:?}")]
    InvalidState(ConnectionState),
    #[error("Mqtt state: {0}")]
    State(StateError),
    #[error("Connection lost: {0}")]
    ConnectionLost(Arc<ConnectionError>),
    #[error("Disconnected by the client")]
    Disconnected,
    #[error("Eventloop isn't running")]
    EventLoopGone,
}

impl From<StateError> for ClientError {
    fn from(e: StateError) -> ClientError {
        match e {
            StateError::InvalidState(state) => ClientError::InvalidState(state),
            e => ClientError::State(e),
        }
    }
}

impl From<ConnectionError> for ClientError {
    /// Why a connection attempt failed, as the `connect` caller sees it
    fn from(e: ConnectionError) -> ClientError {
        match e {
            ConnectionError::ConnectionRefused(code) => ClientError::ConnectRejected(code),
            ConnectionError::ConnectTimeout => ClientError::ConnectTimeout,
            ConnectionError::Transport(e) => ClientError::Transport(e),
            e => ClientError::ConnectionLost(Arc::new(e)),
        }
    }
}

/// Outcome of a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    /// QoS 0 publish is on the wire. Nothing else is tracked
    Sent,
    /// Terminal acknowledgement of a QoS 1 or 2 publish
    Acked(PublishAck),
}

/// `AsyncClient` to communicate with MQTT `Eventloop`
/// This is cloneable and can be used to asynchronously Publish, Subscribe.
#[derive(Clone, Debug)]
pub struct AsyncClient {
    request_tx: flume::Sender<Command>,
    ids: Arc<AtomicU64>,
}

impl AsyncClient {
    /// Create a new `AsyncClient` along with the eventloop it drives. `cap`
    /// bounds the command queue. Spawn [`EventLoop::run`] to make progress
    pub fn new(cap: usize) -> (AsyncClient, EventLoop) {
        AsyncClient::with_connector(cap, TcpConnector)
    }

    /// Same as [`AsyncClient::new`] with a custom way to open the byte
    /// stream to the broker
    pub fn with_connector<C: Connector + 'static>(
        cap: usize,
        connector: C,
    ) -> (AsyncClient, EventLoop) {
        let (request_tx, request_rx) = flume::bounded(cap.max(1));
        let eventloop = EventLoop::new(request_tx.downgrade(), request_rx, Arc::new(connector));

        let client = AsyncClient {
            request_tx,
            ids: Arc::new(AtomicU64::new(1)),
        };

        (client, eventloop)
    }

    /// Opens the transport, sends CONNECT and waits for the CONNACK
    pub async fn connect(&self, config: SessionConfig) -> Result<ConnAck, ClientError> {
        let (notice, rx) = NoticeTx::new();
        self.send(Command::Connect {
            config: Box::new(config),
            notice,
        })
        .await?;

        flatten(rx.await)
    }

    /// Sends a MQTT Publish to the eventloop
    pub async fn publish<S, V>(
        &self,
        topic: S,
        qos: QoS,
        retain: bool,
        payload: V,
    ) -> Result<PublishResult, ClientError>
    where
        S: Into<String>,
        V: Into<Bytes>,
    {
        self.publish_with_properties(topic, qos, retain, payload, Properties::new())
            .await
    }

    /// Publish with user properties, expiry and the like
    pub async fn publish_with_properties<S, V>(
        &self,
        topic: S,
        qos: QoS,
        retain: bool,
        payload: V,
        properties: Properties,
    ) -> Result<PublishResult, ClientError>
    where
        S: Into<String>,
        V: Into<Bytes>,
    {
        let topic = topic.into();
        if !valid_topic(&topic) {
            return Err(ClientError::InvalidTopic(topic));
        }

        let mut publish = Publish::new(topic, qos, payload);
        publish.retain = retain;
        publish.properties = properties;

        let id = self.next_id();
        let (notice, rx) = NoticeTx::new();
        self.send(Command::Publish {
            id,
            publish,
            notice,
        })
        .await?;

        NoticeFuture::new(rx, id, self.request_tx.clone()).await
    }

    /// Subscribes to `filters`. Messages on any of them go to `handler`,
    /// replacing the handler of a filter which was already subscribed
    pub async fn subscribe<T, H>(&self, filters: T, handler: H) -> Result<SubAck, ClientError>
    where
        T: IntoIterator<Item = Filter>,
        H: Handler + 'static,
    {
        let filters: Vec<Filter> = filters.into_iter().collect();
        if filters.is_empty() {
            return Err(ClientError::Encoding(mqttbytes::Error::EmptySubscription));
        }

        if let Some(filter) = filters.iter().find(|f| !valid_filter(&f.path)) {
            return Err(ClientError::InvalidFilter(filter.path.clone()));
        }

        let id = self.next_id();
        let (notice, rx) = NoticeTx::new();
        self.send(Command::Subscribe {
            id,
            subscribe: Subscribe::new(0, filters),
            handler: Arc::new(handler),
            notice,
        })
        .await?;

        NoticeFuture::new(rx, id, self.request_tx.clone()).await
    }

    /// Sends a MQTT Unsubscribe to the eventloop. Handlers of `filters` stop
    /// receiving messages right away
    pub async fn unsubscribe<T, S>(&self, filters: T) -> Result<UnsubAck, ClientError>
    where
        T: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filters: Vec<String> = filters.into_iter().map(Into::into).collect();
        if filters.is_empty() {
            return Err(ClientError::Encoding(mqttbytes::Error::EmptySubscription));
        }

        if let Some(filter) = filters.iter().find(|f| !valid_filter(f)) {
            return Err(ClientError::InvalidFilter(filter.clone()));
        }

        let id = self.next_id();
        let (notice, rx) = NoticeTx::new();
        self.send(Command::Unsubscribe {
            id,
            unsubscribe: Unsubscribe::new(0, filters),
            notice,
        })
        .await?;

        NoticeFuture::new(rx, id, self.request_tx.clone()).await
    }

    /// Sends DISCONNECT, closes the transport and stops any reconnection.
    /// Pending calls fail with [`ClientError::Disconnected`]. Succeeds
    /// locally even when the broker is unreachable
    pub async fn disconnect(&self, reason: DisconnectReasonCode) -> Result<(), ClientError> {
        let (notice, rx) = NoticeTx::new();
        self.send(Command::Disconnect { reason, notice }).await?;
        flatten(rx.await)
    }

    /// Current state of the connection, as seen by the eventloop
    pub async fn connection_state(&self) -> Result<ConnectionState, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::State(tx)).await?;
        rx.await.map_err(|_| ClientError::EventLoopGone)
    }

    async fn send(&self, command: Command) -> Result<(), ClientError> {
        self.request_tx
            .send_async(command)
            .await
            .map_err(|_| ClientError::EventLoopGone)
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }
}

fn flatten<T>(
    result: Result<Result<T, ClientError>, oneshot::error::RecvError>,
) -> Result<T, ClientError> {
    result.unwrap_or(Err(ClientError::EventLoopGone))
}

#[cfg(test)]
mod test {
    use super::*;
    use matches::assert_matches;

    #[tokio::test]
    async fn invalid_topics_fail_before_reaching_the_eventloop() {
        let (client, _eventloop) = AsyncClient::new(10);

        let e = client
            .publish("sample/+", QoS::AtMostOnce, false, "x")
            .await
            .unwrap_err();
        assert_matches!(e, ClientError::InvalidTopic(t) if t == "sample/+");

        let e = client
            .subscribe(vec![Filter::new("a/#/b", QoS::AtMostOnce)], |_: &crate::Message| {})
            .await
            .unwrap_err();
        assert_matches!(e, ClientError::InvalidFilter(f) if f == "a/#/b");

        let e = client.unsubscribe(Vec::<String>::new()).await.unwrap_err();
        assert_matches!(e, ClientError::Encoding(mqttbytes::Error::EmptySubscription));
    }

    #[tokio::test]
    async fn calls_fail_when_eventloop_is_gone() {
        let (client, eventloop) = AsyncClient::new(10);
        drop(eventloop);

        assert_matches!(
            client.connection_state().await,
            Err(ClientError::EventLoopGone)
        );
    }
}
