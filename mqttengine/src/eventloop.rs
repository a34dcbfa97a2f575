use crate::client::{ClientError, PublishResult};
use crate::framed::{self, Network};
use crate::mqttbytes::{self, *};
use crate::network::{Connector, TransportError, N};
use crate::notice::NoticeTx;
use crate::reconnection_strategy::{ReconnectionStrategy, TruncatedExponentialBackoff};
use crate::state::{ConnectionState, Event, MqttState, Retransmit, StateError};
use crate::subscriptions::{Handler, SubscriptionTable};
use crate::{Request, SessionConfig, TimeoutPolicy};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why a live connection (or a connection attempt) went away
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Transport: {0}")]
    Transport(#[from] TransportError),
    #[error("Mqtt state: {0}")]
    MqttState(#[from] StateError),
    #[error("Connection refused, return code: `{0:?}`")]
    ConnectionRefused(ConnectReturnCode),
    #[error("Timeout while waiting for connack")]
    ConnectTimeout,
    #[error("Broker closed the session: {0:?}")]
    ServerDisconnect(DisconnectReasonCode),
    #[error("No pingresp within the grace period")]
    PingTimeout,
    #[error("Transaction {0} ran out of retransmissions")]
    TransactionTimeout(u16),
}

/// Scheduled events. At most one of each is pending at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Transport and connack have to be done by now
    Connect,
    /// Acknowledgement of this packet identifier is due
    Ack(u16),
    KeepAlive,
    /// Pingresp is due
    PingResp,
    /// Next reconnection attempt
    Reconnect,
}

/// Everything the eventloop reacts to. Client calls, network activity and
/// timers all arrive through the same queue, one at a time
pub enum Command {
    Connect {
        config: Box<SessionConfig>,
        notice: NoticeTx<ConnAck>,
    },
    Publish {
        id: u64,
        publish: Publish,
        notice: NoticeTx<PublishResult>,
    },
    Subscribe {
        id: u64,
        subscribe: Subscribe,
        handler: Arc<dyn Handler>,
        notice: NoticeTx<SubAck>,
    },
    Unsubscribe {
        id: u64,
        unsubscribe: Unsubscribe,
        notice: NoticeTx<UnsubAck>,
    },
    Disconnect {
        reason: DisconnectReasonCode,
        notice: NoticeTx<()>,
    },
    State(oneshot::Sender<ConnectionState>),
    /// Caller of request `id` stopped waiting
    Cancel(u64),
    /// Connector finished. Tagged with the connection epoch it was started in
    Opened {
        epoch: u64,
        result: Result<Box<dyn N>, TransportError>,
    },
    Incoming {
        epoch: u64,
        packet: Packet,
    },
    NetworkDown {
        epoch: u64,
        error: TransportError,
    },
    Timer {
        timer: Timer,
        id: u64,
    },
}

impl Command {
    fn id(&self) -> Option<u64> {
        match self {
            Command::Publish { id, .. }
            | Command::Subscribe { id, .. }
            | Command::Unsubscribe { id, .. } => Some(*id),
            _ => None,
        }
    }

    fn fail(self, e: ClientError) {
        match self {
            Command::Connect { notice, .. } => notice.error(e),
            Command::Publish { notice, .. } => notice.error(e),
            Command::Subscribe { notice, .. } => notice.error(e),
            Command::Unsubscribe { notice, .. } => notice.error(e),
            Command::Disconnect { notice, .. } => notice.error(e),
            _ => (),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect { config, .. } => write!(f, "Connect({:?})", config.client_id()),
            Command::Publish { id, publish, .. } => write!(f, "Publish({id}, {publish:?})"),
            Command::Subscribe { id, subscribe, .. } => {
                write!(f, "Subscribe({id}, {:?})", subscribe.filters)
            }
            Command::Unsubscribe { id, unsubscribe, .. } => {
                write!(f, "Unsubscribe({id}, {:?})", unsubscribe.filters)
            }
            Command::Disconnect { reason, .. } => write!(f, "Disconnect({reason:?})"),
            Command::State(_) => write!(f, "State"),
            Command::Cancel(id) => write!(f, "Cancel({id})"),
            Command::Opened { epoch, result } => write!(f, "Opened({epoch}, {})", result.is_ok()),
            Command::Incoming { epoch, packet } => {
                write!(f, "Incoming({epoch}, {:?})", packet.packet_type())
            }
            Command::NetworkDown { epoch, error } => write!(f, "NetworkDown({epoch}, {error})"),
            Command::Timer { timer, id } => write!(f, "Timer({timer:?}, {id})"),
        }
    }
}

/// Call waiting for the acknowledgement of a packet identifier
enum Pending {
    Publish {
        id: u64,
        notice: NoticeTx<PublishResult>,
    },
    Subscribe {
        id: u64,
        filters: Vec<String>,
        notice: NoticeTx<SubAck>,
    },
    Unsubscribe {
        id: u64,
        notice: NoticeTx<UnsubAck>,
    },
    /// Subscription table replayed after a reconnection. Nobody waits on it
    Resubscribe { filters: Vec<String> },
}

impl Pending {
    fn id(&self) -> Option<u64> {
        match self {
            Pending::Publish { id, .. }
            | Pending::Subscribe { id, .. }
            | Pending::Unsubscribe { id, .. } => Some(*id),
            Pending::Resubscribe { .. } => None,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Pending::Publish { notice, .. } => notice.is_closed(),
            Pending::Subscribe { notice, .. } => notice.is_closed(),
            Pending::Unsubscribe { notice, .. } => notice.is_closed(),
            Pending::Resubscribe { .. } => false,
        }
    }

    fn fail(self, e: ClientError) {
        match self {
            Pending::Publish { notice, .. } => notice.error(e),
            Pending::Subscribe { notice, .. } => notice.error(e),
            Pending::Unsubscribe { notice, .. } => notice.error(e),
            Pending::Resubscribe { filters } => warn!("Resubscription of {:?} failed: {}", filters, e),
        }
    }
}

/// Eventloop for the mqtt connection. Owns the session state, the
/// subscription table and every timer. Runs until all [`AsyncClient`]s are
/// dropped
///
/// [`AsyncClient`]: crate::AsyncClient
pub struct EventLoop {
    /// Requests handle to receive client and network commands
    requests_rx: flume::Receiver<Command>,
    /// Handed to timer and network tasks. Doesn't keep the queue open
    requests_tx: flume::WeakSender<Command>,
    connector: Arc<dyn Connector>,
    /// Configuration of the last `connect`
    config: Option<SessionConfig>,
    /// Current state of the connection
    pub state: MqttState,
    subscriptions: SubscriptionTable,
    /// Calls waiting for acks, by packet identifier
    pending: HashMap<u16, Pending>,
    /// Requests waiting for a free inflight slot or for a reconnection
    backlog: VecDeque<Command>,
    connect_notice: Option<NoticeTx<ConnAck>>,
    network: Option<Network>,
    opener: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    /// Bumped whenever a connection attempt starts or a connection ends.
    /// Network events of older epochs are dropped
    epoch: u64,
    timers: HashMap<Timer, (u64, JoinHandle<()>)>,
    next_timer_id: u64,
    /// Keep alive in use. The broker may override the configured one
    keep_alive: Duration,
    /// Present while the session is supervised: after the first successful
    /// connection and until `disconnect`
    supervisor: Option<Box<dyn ReconnectionStrategy>>,
}

impl EventLoop {
    pub(crate) fn new(
        requests_tx: flume::WeakSender<Command>,
        requests_rx: flume::Receiver<Command>,
        connector: Arc<dyn Connector>,
    ) -> EventLoop {
        EventLoop {
            requests_rx,
            requests_tx,
            connector,
            config: None,
            state: MqttState::new(100),
            subscriptions: SubscriptionTable::new(),
            pending: HashMap::new(),
            backlog: VecDeque::new(),
            connect_notice: None,
            network: None,
            opener: None,
            reader: None,
            epoch: 0,
            timers: HashMap::new(),
            next_timer_id: 0,
            keep_alive: Duration::ZERO,
            supervisor: None,
        }
    }

    /// Processes commands one by one until every client handle is gone
    pub async fn run(mut self) {
        while let Ok(command) = self.requests_rx.recv_async().await {
            trace!("Command = {:?}", command);
            self.handle(command).await;
        }

        info!("All clients dropped. Stopping eventloop");
        self.supervisor = None;
        if self.state.connection == ConnectionState::Connected {
            self.send_disconnect(DisconnectReasonCode::NormalDisconnection)
                .await;
        }

        self.teardown().await;
        self.fail_all(|| ClientError::EventLoopGone);
        self.state.clean();
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { config, notice } => self.connect(*config, notice),
            Command::Publish { .. } | Command::Subscribe { .. } | Command::Unsubscribe { .. } => {
                self.request(command, false).await
            }
            Command::Disconnect { reason, notice } => {
                self.disconnect(reason).await;
                notice.success(());
            }
            Command::State(tx) => {
                _ = tx.send(self.state.connection);
            }
            Command::Cancel(id) => self.cancel_request(id).await,
            Command::Opened { epoch, result } if epoch == self.epoch => self.opened(result).await,
            Command::Incoming { epoch, packet } if epoch == self.epoch => self.incoming(packet).await,
            Command::NetworkDown { epoch, error } if epoch == self.epoch => {
                self.network_down(error).await
            }
            Command::Timer { timer, id } => self.timer_fired(timer, id).await,
            command => trace!("Dropping stale {:?}", command),
        }
    }

    fn connect(&mut self, config: SessionConfig, notice: NoticeTx<ConnAck>) {
        if self.supervisor.is_some() {
            // the reconnection manager owns the connection
            notice.error(ClientError::InvalidState(ConnectionState::Connecting));
            return;
        }

        if self.state.connection != ConnectionState::Disconnected {
            notice.error(ClientError::InvalidState(self.state.connection));
            return;
        }

        self.state.max_inflight = config.inflight();
        self.keep_alive = config.keep_alive();
        self.config = Some(config);
        self.connect_notice = Some(notice);
        self.start_attempt();
    }

    /// Opens a fresh transport in the background. The outcome comes back as
    /// `Command::Opened`
    fn start_attempt(&mut self) {
        let config = match &self.config {
            Some(config) => config.clone(),
            None => return,
        };

        if let Err(e) = self.state.connecting() {
            error!("Can't start a connection attempt: {}", e);
            return;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let connector = self.connector.clone();
        let requests_tx = self.requests_tx.clone();
        let (host, port) = config.broker_address();
        info!("Connecting to {}:{}", host, port);

        self.schedule(Timer::Connect, config.connect_timeout());
        self.opener = Some(tokio::spawn(async move {
            let result = connector.connect(&config).await;
            if let Some(tx) = requests_tx.upgrade() {
                _ = tx.send_async(Command::Opened { epoch, result }).await;
            }
        }));
    }

    async fn opened(&mut self, result: Result<Box<dyn N>, TransportError>) {
        self.opener = None;
        let socket = match result {
            Ok(socket) => socket,
            Err(e) => return self.connection_lost(e.into()).await,
        };

        let config = match &self.config {
            Some(config) => config,
            None => return,
        };

        let (max_incoming, max_outgoing) = config.max_packet_size();
        let connect = config.connect_packet();
        let (mut reader, network) = framed::split(socket, max_incoming, max_outgoing);
        self.network = Some(network);

        let epoch = self.epoch;
        let requests_tx = self.requests_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            loop {
                let (command, done) = match reader.read().await {
                    Ok(packet) => (Command::Incoming { epoch, packet }, false),
                    Err(error) => (Command::NetworkDown { epoch, error }, true),
                };

                let tx = match requests_tx.upgrade() {
                    Some(tx) => tx,
                    None => return,
                };

                if tx.send_async(command).await.is_err() || done {
                    return;
                }
            }
        }));

        let packet = match self.state.handle_outgoing_packet(Request::Connect(connect)) {
            Ok(packet) => packet,
            Err(e) => return self.connection_lost(e.into()).await,
        };

        if let Err(e) = self.write(packet).await {
            self.connection_lost(e.into()).await;
        }
    }

    async fn incoming(&mut self, packet: Packet) {
        let reply = match self.state.handle_incoming_packet(packet) {
            Ok(reply) => reply,
            Err(e) => {
                error!("Protocol violation by the broker: {}", e);
                self.send_disconnect(DisconnectReasonCode::ProtocolError)
                    .await;
                return self.connection_lost(e.into()).await;
            }
        };

        // messages are handed to the application before they are acked
        self.handle_events().await;

        if let Some(reply) = reply {
            if self.network.is_none() {
                return;
            }

            if let Err(e) = self.write(reply).await {
                self.connection_lost(e.into()).await;
            }
        }
    }

    async fn network_down(&mut self, error: TransportError) {
        if let TransportError::MalformedPacket(e) = &error {
            error!("Malformed packet from the broker: {}", e);
            let reason = match e {
                mqttbytes::Error::PayloadSizeLimitExceeded { .. } => {
                    DisconnectReasonCode::PacketTooLarge
                }
                _ => DisconnectReasonCode::MalformedPacket,
            };

            self.send_disconnect(reason).await;
        }

        self.connection_lost(error.into()).await;
    }

    async fn handle_events(&mut self) {
        while let Some(event) = self.state.events.pop_front() {
            match event {
                Event::Connected(connack) => self.connected(connack).await,
                Event::Rejected(connack) => {
                    let error = ConnectionError::ConnectionRefused(connack.code);
                    self.connection_lost(error).await
                }
                Event::Published(pkid, ack) => {
                    self.cancel_timer(Timer::Ack(pkid));
                    match self.pending.remove(&pkid) {
                        Some(Pending::Publish { notice, .. }) => {
                            notice.success(PublishResult::Acked(ack))
                        }
                        Some(pending) => pending.fail(ClientError::State(StateError::WrongPacket)),
                        None => debug!("Publish {} acked after its caller left", pkid),
                    }

                    self.drain_backlog().await;
                }
                Event::Subscribed(suback) => {
                    self.cancel_timer(Timer::Ack(suback.pkid));
                    self.subscribed(suback);
                    self.drain_backlog().await;
                }
                Event::Unsubscribed(unsuback) => {
                    self.cancel_timer(Timer::Ack(unsuback.pkid));
                    match self.pending.remove(&unsuback.pkid) {
                        Some(Pending::Unsubscribe { notice, .. }) => notice.success(unsuback),
                        Some(pending) => pending.fail(ClientError::State(StateError::WrongPacket)),
                        None => debug!("Unsubscribe {} acked after its caller left", unsuback.pkid),
                    }

                    self.drain_backlog().await;
                }
                Event::Message(publish) => {
                    self.subscriptions.dispatch(&publish);
                }
                Event::PingResp => self.cancel_timer(Timer::PingResp),
                Event::Disconnected(disconnect) => {
                    warn!("Broker disconnected: {:?}", disconnect.reason_code);
                    if let Some(reason) = disconnect.properties.reason_string() {
                        warn!("Reason: {}", reason);
                    }

                    let error = ConnectionError::ServerDisconnect(disconnect.reason_code);
                    self.connection_lost(error).await
                }
            }
        }
    }

    /// Drops table entries whose subscription the broker refused
    fn subscribed(&mut self, suback: SubAck) {
        let pending = self.pending.remove(&suback.pkid);
        let filters = match &pending {
            Some(Pending::Subscribe { filters, .. }) | Some(Pending::Resubscribe { filters }) => {
                filters.clone()
            }
            _ => Vec::new(),
        };

        for (filter, code) in filters.iter().zip(suback.return_codes.iter()) {
            if !code.is_success() {
                warn!("Subscription to {} refused: {:?}", filter, code);
                self.subscriptions.remove(filter);
            }
        }

        match pending {
            Some(Pending::Subscribe { notice, .. }) => notice.success(suback),
            Some(Pending::Resubscribe { filters }) => debug!("Resubscribed to {:?}", filters),
            Some(pending) => pending.fail(ClientError::State(StateError::WrongPacket)),
            None => debug!("Subscribe {} acked after its caller left", suback.pkid),
        }
    }

    async fn connected(&mut self, connack: ConnAck) {
        self.cancel_timer(Timer::Connect);
        let (keep_alive, inflight, ack_timeout, reconnect) = match &self.config {
            Some(config) => (
                config.keep_alive(),
                config.inflight(),
                config.ack_timeout(),
                config.reconnect(),
            ),
            None => return,
        };

        self.keep_alive = match connack.properties.server_keep_alive() {
            Some(keep_alive) => Duration::from_secs(keep_alive as u64),
            None => keep_alive,
        };

        self.state.max_inflight = match connack.properties.receive_maximum() {
            Some(max) => inflight.min(max.max(1)),
            None => inflight,
        };

        let stable_after = match self.keep_alive.is_zero() {
            true => ack_timeout,
            false => self.keep_alive,
        };

        self.schedule_keep_alive();

        if let Some(notice) = self.connect_notice.take() {
            info!("Connected. Session present = {}", connack.session_present);
            if let Some(options) = reconnect {
                self.supervisor = Some(Box::new(TruncatedExponentialBackoff::new(
                    stable_after,
                    options,
                )));
            }

            if let Some(supervisor) = self.supervisor.as_mut() {
                supervisor.on_connection_established();
            }

            notice.success(connack);
            return;
        }

        info!("Reconnected. Session present = {}", connack.session_present);
        if let Some(supervisor) = self.supervisor.as_mut() {
            supervisor.on_connection_established();
        }

        for packet in self.state.replay() {
            let pkid = pkid(&packet);
            debug!("Replaying {:?}, pkid = {}", packet.packet_type(), pkid);
            if let Err(e) = self.write(packet).await {
                return self.connection_lost(e.into()).await;
            }

            self.schedule(Timer::Ack(pkid), ack_timeout);
        }

        if !self.subscriptions.is_empty() {
            debug!("Resubscribing {} filters", self.subscriptions.len());
            let filters = self.subscriptions.filters();
            let paths = filters.iter().map(|f| f.path.clone()).collect();
            let subscribe = Subscribe::new(0, filters);
            match self.state.handle_outgoing_packet(Request::Subscribe(subscribe)) {
                Ok(packet) => {
                    let pending = Pending::Resubscribe { filters: paths };
                    self.transmit(packet, pending).await;
                }
                Err(e) => error!("Couldn't resubscribe: {}", e),
            }
        }

        self.drain_backlog().await;
    }

    /// Sends a client request or holds it back. `queued` requests come from
    /// the front of the backlog and don't wait behind it
    async fn request(&mut self, command: Command, queued: bool) {
        let qos0 = matches!(&command, Command::Publish { publish, .. } if publish.qos == QoS::AtMostOnce);
        if self.state.connection != ConnectionState::Connected {
            // reconnection manager brings the connection back. QoS 0 isn't
            // worth holding on to
            if self.supervisor.is_some() && !qos0 {
                self.backlog.push_back(command);
            } else {
                command.fail(ClientError::NotConnected);
            }

            return;
        }

        if !qos0 && (self.state.is_full() || (!queued && !self.backlog.is_empty())) {
            debug!("Inflight queue is full. Holding back {:?}", command);
            self.backlog.push_back(command);
            return;
        }

        match command {
            Command::Publish { id, publish, notice } => {
                let packet = match self.state.handle_outgoing_packet(Request::Publish(publish)) {
                    Ok(packet) => packet,
                    Err(e) => return notice.error(e.into()),
                };

                if qos0 {
                    match self.write(packet).await {
                        Ok(()) => notice.success(PublishResult::Sent),
                        Err(TransportError::Encoding(e)) => notice.error(ClientError::Encoding(e)),
                        Err(e) => {
                            notice.error(ClientError::NotConnected);
                            self.connection_lost(e.into()).await;
                        }
                    }

                    return;
                }

                self.transmit(packet, Pending::Publish { id, notice }).await;
            }
            Command::Subscribe {
                id,
                subscribe,
                handler,
                notice,
            } => {
                let packet = match self.state.handle_outgoing_packet(Request::Subscribe(subscribe)) {
                    Ok(packet) => packet,
                    Err(e) => return notice.error(e.into()),
                };

                // in the table before the suback, retained messages may be
                // delivered right away
                let mut filters = Vec::new();
                if let Packet::Subscribe(subscribe) = &packet {
                    for filter in subscribe.filters.iter() {
                        self.subscriptions.insert(filter, handler.clone());
                        filters.push(filter.path.clone());
                    }
                }

                let pending = Pending::Subscribe {
                    id,
                    filters,
                    notice,
                };
                self.transmit(packet, pending).await;
            }
            Command::Unsubscribe {
                id,
                unsubscribe,
                notice,
            } => {
                for filter in unsubscribe.filters.iter() {
                    self.subscriptions.remove(filter);
                }

                let request = Request::Unsubscribe(unsubscribe);
                let packet = match self.state.handle_outgoing_packet(request) {
                    Ok(packet) => packet,
                    Err(e) => return notice.error(e.into()),
                };

                self.transmit(packet, Pending::Unsubscribe { id, notice }).await;
            }
            command => command.fail(ClientError::State(StateError::WrongPacket)),
        }
    }

    /// Sends a tracked packet and arms its ack timer
    async fn transmit(&mut self, packet: Packet, pending: Pending) {
        let pkid = pkid(&packet);
        self.pending.insert(pkid, pending);

        match self.write(packet).await {
            Ok(()) => {
                let ack_timeout = self.ack_timeout();
                self.schedule(Timer::Ack(pkid), ack_timeout);
            }
            Err(TransportError::Encoding(e)) => {
                self.state.forget(pkid);
                if let Some(pending) = self.pending.remove(&pkid) {
                    if let Pending::Subscribe { filters, .. } = &pending {
                        for filter in filters {
                            self.subscriptions.remove(filter);
                        }
                    }

                    pending.fail(ClientError::Encoding(e));
                }
            }
            Err(e) => self.connection_lost(e.into()).await,
        }
    }

    async fn drain_backlog(&mut self) {
        while self.state.connection == ConnectionState::Connected && !self.state.is_full() {
            let command = match self.backlog.pop_front() {
                Some(command) => command,
                None => break,
            };

            self.request(command, true).await;
        }
    }

    async fn cancel_request(&mut self, id: u64) {
        let pkid = self
            .pending
            .iter()
            .find(|(_, pending)| pending.id() == Some(id))
            .map(|(pkid, _)| *pkid);

        if let Some(pkid) = pkid {
            debug!("Request {} cancelled. Forgetting pkid {}", id, pkid);
            self.pending.remove(&pkid);
            self.state.forget(pkid);
            self.cancel_timer(Timer::Ack(pkid));
            self.drain_backlog().await;
            return;
        }

        self.backlog.retain(|command| command.id() != Some(id));
    }

    async fn timer_fired(&mut self, timer: Timer, id: u64) {
        match self.timers.get(&timer) {
            Some((current, _)) if *current == id => {
                self.timers.remove(&timer);
            }
            _ => {
                trace!("Stale timer {:?}", timer);
                return;
            }
        }

        match timer {
            Timer::Connect => {
                warn!("Connection attempt timed out");
                self.connection_lost(ConnectionError::ConnectTimeout).await
            }
            Timer::Ack(pkid) => self.ack_timed_out(pkid).await,
            Timer::KeepAlive => self.keep_alive_due().await,
            Timer::PingResp => {
                error!("No pingresp from the broker");
                self.connection_lost(ConnectionError::PingTimeout).await
            }
            Timer::Reconnect => self.start_attempt(),
        }
    }

    async fn ack_timed_out(&mut self, pkid: u16) {
        if self.pending.get(&pkid).map_or(false, Pending::is_closed) {
            debug!("Caller of pkid {} left. Forgetting it", pkid);
            self.pending.remove(&pkid);
            self.state.forget(pkid);
            return self.drain_backlog().await;
        }

        let (max_retries, policy) = match &self.config {
            Some(config) => (config.max_retries(), config.timeout_policy()),
            None => return,
        };

        match self.state.retransmit(pkid, max_retries) {
            Retransmit::Resend(packet) => {
                warn!("No ack for pkid {}. Retransmitting", pkid);
                if let Err(e) = self.write(packet).await {
                    return self.connection_lost(e.into()).await;
                }

                let ack_timeout = self.ack_timeout();
                self.schedule(Timer::Ack(pkid), ack_timeout);
            }
            Retransmit::Expired(record) => {
                warn!(
                    "{:?} {} expired after {} retransmissions",
                    record.state, pkid, record.retries
                );

                match self.pending.remove(&pkid) {
                    Some(Pending::Publish { notice, .. }) => {
                        notice.error(ClientError::PublishTimeout(pkid))
                    }
                    Some(Pending::Subscribe { filters, notice, .. }) => {
                        for filter in filters.iter() {
                            self.subscriptions.remove(filter);
                        }

                        notice.error(ClientError::SubscribeTimeout(pkid))
                    }
                    Some(pending) => pending.fail(ClientError::TransactionTimeout(pkid)),
                    None => (),
                }

                match policy {
                    TimeoutPolicy::Drop => self.drain_backlog().await,
                    TimeoutPolicy::Reset => {
                        let error = ConnectionError::TransactionTimeout(pkid);
                        self.connection_lost(error).await
                    }
                }
            }
            Retransmit::Unknown => (),
        }
    }

    async fn keep_alive_due(&mut self) {
        let elapsed = self.state.last_outgoing.elapsed();
        if elapsed < self.keep_alive {
            let remaining = self.keep_alive - elapsed;
            return self.schedule(Timer::KeepAlive, remaining);
        }

        let packet = match self.state.handle_outgoing_packet(Request::PingReq) {
            Ok(packet) => packet,
            Err(StateError::AwaitPingResp) => {
                return self.connection_lost(ConnectionError::PingTimeout).await
            }
            Err(e) => return self.connection_lost(e.into()).await,
        };

        if let Err(e) = self.write(packet).await {
            return self.connection_lost(e.into()).await;
        }

        let grace = self
            .config
            .as_ref()
            .map_or(self.keep_alive, |config| config.ping_grace());

        self.schedule(Timer::PingResp, grace);
        self.schedule(Timer::KeepAlive, self.keep_alive);
    }

    fn schedule_keep_alive(&mut self) {
        if self.keep_alive.is_zero() {
            return;
        }

        self.schedule(Timer::KeepAlive, self.keep_alive);
    }

    async fn disconnect(&mut self, reason: DisconnectReasonCode) {
        info!("Disconnecting. Reason = {:?}", reason);
        self.supervisor = None;

        if self.state.connection == ConnectionState::Connected {
            let request = Request::Disconnect(Disconnect::new(reason));
            if let Ok(packet) = self.state.handle_outgoing_packet(request) {
                if let Err(e) = self.write(packet).await {
                    debug!("Couldn't send disconnect: {}", e);
                }
            }
        }

        self.teardown().await;
        if let Some(notice) = self.connect_notice.take() {
            notice.error(ClientError::Disconnected);
        }

        self.fail_all(|| ClientError::Disconnected);
        self.state.clean();
        self.subscriptions = SubscriptionTable::new();
    }

    /// Current connection is gone. Either the next attempt is scheduled or
    /// every waiting call fails
    async fn connection_lost(&mut self, error: ConnectionError) {
        if self.state.connection == ConnectionState::Disconnected && self.network.is_none() {
            debug!("Already disconnected: {}", error);
            return;
        }

        self.teardown().await;

        // first connection is never retried
        if let Some(notice) = self.connect_notice.take() {
            error!("Connection failed: {}", error);
            notice.error(error.into());
            self.fail_all(|| ClientError::NotConnected);
            self.state.clean();
            return;
        }

        match self.supervisor.as_mut() {
            Some(supervisor) => {
                supervisor.on_connection_failed();
                let delay = supervisor.next_delay();
                warn!("Connection lost: {}. Reconnecting in {:?}", error, delay);
                self.schedule(Timer::Reconnect, delay);
            }
            None => {
                error!("Connection lost: {}", error);
                let error = Arc::new(error);
                self.fail_all(|| ClientError::ConnectionLost(error.clone()));
                self.state.clean();
                self.subscriptions = SubscriptionTable::new();
            }
        }
    }

    /// Closes the transport, stops its tasks and every timer
    async fn teardown(&mut self) {
        self.epoch += 1;
        if let Some(opener) = self.opener.take() {
            opener.abort();
        }

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        if let Some(network) = self.network.take() {
            if time::timeout(Duration::from_secs(1), network.close())
                .await
                .is_err()
            {
                debug!("Transport didn't shut down in time");
            }
        }

        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }

        self.state.disconnected();
    }

    fn fail_all(&mut self, error: impl Fn() -> ClientError) {
        for (_, pending) in self.pending.drain() {
            pending.fail(error());
        }

        for command in self.backlog.drain(..) {
            command.fail(error());
        }
    }

    /// Best effort. The connection is going away anyway
    async fn send_disconnect(&mut self, reason: DisconnectReasonCode) {
        if let Some(network) = self.network.as_mut() {
            let packet = Packet::Disconnect(Disconnect::new(reason));
            if let Err(e) = network.send(&packet).await {
                debug!("Couldn't send disconnect: {}", e);
            }
        }
    }

    async fn write(&mut self, packet: Packet) -> Result<(), TransportError> {
        let network = self
            .network
            .as_mut()
            .ok_or(TransportError::ConnectionClosed)?;

        network.send(&packet).await?;
        self.state.last_outgoing = Instant::now();
        Ok(())
    }

    fn ack_timeout(&self) -> Duration {
        self.config
            .as_ref()
            .map_or(Duration::from_secs(30), SessionConfig::ack_timeout)
    }

    /// Arms `timer`, replacing a pending one of the same kind. When it fires
    /// `Command::Timer` is posted on the queue
    fn schedule(&mut self, timer: Timer, delay: Duration) {
        self.cancel_timer(timer);
        self.next_timer_id += 1;

        let id = self.next_timer_id;
        let requests_tx = self.requests_tx.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(tx) = requests_tx.upgrade() {
                _ = tx.send_async(Command::Timer { timer, id }).await;
            }
        });

        self.timers.insert(timer, (id, handle));
    }

    fn cancel_timer(&mut self, timer: Timer) {
        if let Some((_, handle)) = self.timers.remove(&timer) {
            handle.abort();
        }
    }
}

fn pkid(packet: &Packet) -> u16 {
    match packet {
        Packet::Publish(publish) => publish.pkid,
        Packet::Subscribe(subscribe) => subscribe.pkid,
        Packet::Unsubscribe(unsubscribe) => unsubscribe.pkid,
        Packet::PubRel(pubrel) => pubrel.pkid,
        _ => 0,
    }
}
