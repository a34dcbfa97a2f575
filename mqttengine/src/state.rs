use crate::mqttbytes::*;
use crate::Request;

use std::collections::{HashMap, HashSet, VecDeque};
use tokio::time::Instant;

/// Errors during state handling
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Operation isn't allowed while {0:?}")]
    InvalidState(ConnectionState),
    #[error("Last pingreq isn't acked")]
    AwaitPingResp,
    #[error("Received a wrong packet while waiting for another packet")]
    WrongPacket,
    #[error("Every packet identifier is in use")]
    PacketIdsExhausted,
}

/// Connection lifecycle. `Disconnected` is where every session starts and
/// ends, and a new connect can start from it again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Where an outgoing transaction is waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    /// QoS 1 publish waiting for PUBACK, QoS 2 publish waiting for PUBREC
    Sent,
    /// QoS 2 publish waiting for PUBCOMP
    PubRelSent,
    /// Subscribe waiting for SUBACK
    Subscribing,
    /// Unsubscribe waiting for UNSUBACK
    Unsubscribing,
}

/// Bookkeeping of one outstanding packet identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightRecord {
    pub pkid: u16,
    /// Request as it was first sent. Retransmissions only flip its dup flag
    pub packet: Packet,
    pub state: Transaction,
    pub retries: u16,
    pub last_sent: Instant,
    /// Orders records for replay after a reconnection
    seq: u64,
}

/// Terminal acknowledgement of a QoS 1 or QoS 2 publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishAck {
    /// QoS 1 flow finished
    PubAck(PubAck),
    /// QoS 2 flow aborted by the broker with a failure reason
    PubRec(PubRec),
    /// QoS 2 flow finished
    PubComp(PubComp),
}

/// Outcome of an ack timeout for one packet identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retransmit {
    /// Send this again. Same packet identifier, same content
    Resend(Packet),
    /// Retry budget is exhausted. The record is gone from the state
    Expired(InflightRecord),
    /// Nothing is in flight with this identifier anymore
    Unknown,
}

/// Things that happened while handling incoming packets, for the eventloop
/// to act upon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(ConnAck),
    Rejected(ConnAck),
    Published(u16, PublishAck),
    Subscribed(SubAck),
    Unsubscribed(UnsubAck),
    /// Application message to hand over to subscription handlers
    Message(Publish),
    PingResp,
    /// Broker closed the session
    Disconnected(Disconnect),
}

/// State of the mqtt connection.
///
/// Methods will modify the state of the object and return the packet that
/// has to be sent on the network. Acks from the broker advance per packet
/// identifier transactions and push an [`Event`] when something completes
#[derive(Debug)]
pub struct MqttState {
    pub connection: ConnectionState,
    /// Status of last ping
    pub await_pingresp: bool,
    /// Last incoming packet time
    pub last_incoming: Instant,
    /// Last outgoing packet time. Every packet written on the network
    /// counts, not just pings
    pub last_outgoing: Instant,
    /// Packet id of the last outgoing packet
    last_pkid: u16,
    /// Maximum number of allowed inflight
    pub max_inflight: u16,
    /// Outgoing transactions by packet identifier
    outgoing: HashMap<u16, InflightRecord>,
    /// QoS 2 publishes answered with PUBREC and waiting for PUBREL
    incoming_pub: HashSet<u16>,
    next_seq: u64,
    /// Notifications for the eventloop
    pub events: VecDeque<Event>,
}

impl MqttState {
    /// Creates new mqtt state. Same state should be used during a
    /// connection for persistent sessions while new state should
    /// instantiated for clean sessions
    pub fn new(max_inflight: u16) -> Self {
        MqttState {
            connection: ConnectionState::Disconnected,
            await_pingresp: false,
            last_incoming: Instant::now(),
            last_outgoing: Instant::now(),
            last_pkid: 0,
            max_inflight,
            outgoing: HashMap::new(),
            incoming_pub: HashSet::new(),
            next_seq: 0,
            events: VecDeque::new(),
        }
    }

    /// Drops every transaction and returns the abandoned records
    pub fn clean(&mut self) -> Vec<InflightRecord> {
        self.incoming_pub.clear();
        self.await_pingresp = false;

        let mut records: Vec<InflightRecord> = self.outgoing.drain().map(|(_, r)| r).collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    pub fn inflight(&self) -> usize {
        self.outgoing.len()
    }

    pub fn is_full(&self) -> bool {
        self.outgoing.len() >= self.max_inflight as usize
    }

    pub fn record(&self, pkid: u16) -> Option<&InflightRecord> {
        self.outgoing.get(&pkid)
    }

    /// Removes a transaction without waiting for its acks
    pub fn forget(&mut self, pkid: u16) -> Option<InflightRecord> {
        self.outgoing.remove(&pkid)
    }

    /// Disconnected -> Connecting
    pub fn connecting(&mut self) -> Result<(), StateError> {
        match self.connection {
            ConnectionState::Disconnected => {
                self.connection = ConnectionState::Connecting;
                Ok(())
            }
            state => Err(StateError::InvalidState(state)),
        }
    }

    pub fn disconnecting(&mut self) {
        self.connection = ConnectionState::Disconnecting;
    }

    /// Transport is gone. Outgoing transactions survive for a replay on the
    /// next connection
    pub fn disconnected(&mut self) {
        self.connection = ConnectionState::Disconnected;
        self.await_pingresp = false;
    }

    /// Consolidates handling of all outgoing mqtt packet logic. Returns a packet which should
    /// be put on to the network by the eventloop
    pub fn handle_outgoing_packet(&mut self, request: Request) -> Result<Packet, StateError> {
        let packet = match request {
            Request::Connect(connect) => self.outgoing_connect(connect)?,
            Request::Publish(publish) => self.outgoing_publish(publish)?,
            Request::Subscribe(subscribe) => self.outgoing_subscribe(subscribe)?,
            Request::Unsubscribe(unsubscribe) => self.outgoing_unsubscribe(unsubscribe)?,
            Request::PingReq => self.outgoing_ping()?,
            Request::Disconnect(disconnect) => self.outgoing_disconnect(disconnect),
        };

        Ok(packet)
    }

    /// Consolidates handling of all incoming mqtt packets. Returns a `Packet` which for the
    /// user to consume and `Packet` which for the eventloop to put on the network
    /// E.g For incoming QoS1 publish packet, this method returns (Publish, Puback). Publish packet will
    /// be forwarded to user and Pubck packet will be written to network
    pub fn handle_incoming_packet(&mut self, packet: Packet) -> Result<Option<Packet>, StateError> {
        self.last_incoming = Instant::now();

        let outgoing = match packet {
            Packet::ConnAck(connack) => self.handle_incoming_connack(connack)?,
            Packet::Publish(publish) => self.handle_incoming_publish(publish)?,
            Packet::PubAck(puback) => self.handle_incoming_puback(puback),
            Packet::PubRec(pubrec) => self.handle_incoming_pubrec(pubrec),
            Packet::PubRel(pubrel) => self.handle_incoming_pubrel(pubrel),
            Packet::PubComp(pubcomp) => self.handle_incoming_pubcomp(pubcomp),
            Packet::SubAck(suback) => self.handle_incoming_suback(suback),
            Packet::UnsubAck(unsuback) => self.handle_incoming_unsuback(unsuback),
            Packet::PingResp(_) => self.handle_incoming_pingresp(),
            Packet::Disconnect(disconnect) => self.handle_incoming_disconnect(disconnect),
            packet => {
                error!("Invalid incoming packet = {:?}", packet.packet_type());
                return Err(StateError::WrongPacket);
            }
        };

        Ok(outgoing)
    }

    /// Replays every unfinished transaction on a fresh connection. Publishes
    /// go out with dup set, QoS 2 flows past PUBREC resume with PUBREL
    pub fn replay(&mut self) -> Vec<Packet> {
        let now = Instant::now();
        let mut records: Vec<&mut InflightRecord> = self.outgoing.values_mut().collect();
        records.sort_by_key(|r| r.seq);

        records
            .into_iter()
            .map(|record| {
                record.retries = 0;
                record.last_sent = now;
                resend(record)
            })
            .collect()
    }

    /// Handles the ack timeout of `pkid`. Publishes and releases are sent
    /// again until `max_retries` is used up. Subscribes and unsubscribes
    /// aren't retransmitted on a live connection and expire right away
    pub fn retransmit(&mut self, pkid: u16, max_retries: u16) -> Retransmit {
        let record = match self.outgoing.get_mut(&pkid) {
            Some(record) => record,
            None => return Retransmit::Unknown,
        };

        let retry = matches!(record.state, Transaction::Sent | Transaction::PubRelSent)
            && record.retries < max_retries;

        if retry {
            record.retries += 1;
            record.last_sent = Instant::now();
            return Retransmit::Resend(resend(record));
        }

        match self.outgoing.remove(&pkid) {
            Some(record) => Retransmit::Expired(record),
            None => Retransmit::Unknown,
        }
    }

    fn handle_incoming_connack(&mut self, connack: ConnAck) -> Result<Option<Packet>, StateError> {
        if self.connection != ConnectionState::Connecting {
            error!("Unexpected connack while {:?}", self.connection);
            return Err(StateError::WrongPacket);
        }

        if connack.code == ConnectReturnCode::Success {
            self.connection = ConnectionState::Connected;
            self.events.push_back(Event::Connected(connack));
        } else {
            self.connection = ConnectionState::Disconnected;
            self.events.push_back(Event::Rejected(connack));
        }

        Ok(None)
    }

    /// Results in a publish notification in all the QoS cases. Replys with an ack
    /// in case of QoS1 and Replys rec in case of QoS while also storing the message
    fn handle_incoming_publish(&mut self, publish: Publish) -> Result<Option<Packet>, StateError> {
        if self.connection == ConnectionState::Connecting {
            error!("Publish before connack. Pkid = {:?}", publish.pkid);
            return Err(StateError::WrongPacket);
        }

        let pkid = publish.pkid;
        match publish.qos {
            QoS::AtMostOnce => {
                self.events.push_back(Event::Message(publish));
                Ok(None)
            }
            QoS::AtLeastOnce => {
                self.events.push_back(Event::Message(publish));
                Ok(Some(Packet::PubAck(PubAck::new(pkid))))
            }
            QoS::ExactlyOnce => {
                // a retransmission of a publish we already have is only acked again
                if self.incoming_pub.insert(pkid) {
                    self.events.push_back(Event::Message(publish));
                } else {
                    debug!("Duplicate QoS 2 publish. Pkid = {:?}", pkid);
                }

                Ok(Some(Packet::PubRec(PubRec::new(pkid))))
            }
        }
    }

    fn handle_incoming_puback(&mut self, puback: PubAck) -> Option<Packet> {
        let pkid = puback.pkid;
        match self.outgoing.get(&pkid) {
            Some(record) if record.state == Transaction::Sent && is_qos(record, QoS::AtLeastOnce) => {
                self.outgoing.remove(&pkid);
                self.events
                    .push_back(Event::Published(pkid, PublishAck::PubAck(puback)));
            }
            _ => warn!("Unsolicited puback packet: {:?}", pkid),
        }

        None
    }

    fn handle_incoming_pubrec(&mut self, pubrec: PubRec) -> Option<Packet> {
        let pkid = pubrec.pkid;
        let record = match self.outgoing.get_mut(&pkid) {
            Some(record) if is_qos(record, QoS::ExactlyOnce) => record,
            _ => {
                warn!("Unsolicited pubrec packet: {:?}", pkid);
                let mut pubrel = PubRel::new(pkid);
                pubrel.reason = PubCompReason::PacketIdentifierNotFound;
                return Some(Packet::PubRel(pubrel));
            }
        };

        if !pubrec.reason.is_success() {
            self.outgoing.remove(&pkid);
            self.events
                .push_back(Event::Published(pkid, PublishAck::PubRec(pubrec)));
            return None;
        }

        record.state = Transaction::PubRelSent;
        record.retries = 0;
        record.last_sent = Instant::now();
        Some(Packet::PubRel(PubRel::new(pkid)))
    }

    fn handle_incoming_pubrel(&mut self, pubrel: PubRel) -> Option<Packet> {
        let pkid = pubrel.pkid;
        if self.incoming_pub.remove(&pkid) {
            return Some(Packet::PubComp(PubComp::new(pkid)));
        }

        warn!("Unsolicited pubrel packet: {:?}", pkid);
        let mut pubcomp = PubComp::new(pkid);
        pubcomp.reason = PubCompReason::PacketIdentifierNotFound;
        Some(Packet::PubComp(pubcomp))
    }

    fn handle_incoming_pubcomp(&mut self, pubcomp: PubComp) -> Option<Packet> {
        let pkid = pubcomp.pkid;
        match self.outgoing.get(&pkid) {
            Some(record) if record.state == Transaction::PubRelSent => {
                self.outgoing.remove(&pkid);
                self.events
                    .push_back(Event::Published(pkid, PublishAck::PubComp(pubcomp)));
            }
            _ => warn!("Unsolicited pubcomp packet: {:?}", pkid),
        }

        None
    }

    fn handle_incoming_suback(&mut self, suback: SubAck) -> Option<Packet> {
        match self.outgoing.get(&suback.pkid) {
            Some(record) if record.state == Transaction::Subscribing => {
                self.outgoing.remove(&suback.pkid);
                self.events.push_back(Event::Subscribed(suback));
            }
            _ => warn!("Unsolicited suback packet: {:?}", suback.pkid),
        }

        None
    }

    fn handle_incoming_unsuback(&mut self, unsuback: UnsubAck) -> Option<Packet> {
        match self.outgoing.get(&unsuback.pkid) {
            Some(record) if record.state == Transaction::Unsubscribing => {
                self.outgoing.remove(&unsuback.pkid);
                self.events.push_back(Event::Unsubscribed(unsuback));
            }
            _ => warn!("Unsolicited unsuback packet: {:?}", unsuback.pkid),
        }

        None
    }

    fn handle_incoming_pingresp(&mut self) -> Option<Packet> {
        self.await_pingresp = false;
        self.events.push_back(Event::PingResp);
        None
    }

    fn handle_incoming_disconnect(&mut self, disconnect: Disconnect) -> Option<Packet> {
        self.connection = ConnectionState::Disconnecting;
        self.events.push_back(Event::Disconnected(disconnect));
        None
    }

    fn outgoing_connect(&mut self, connect: Connect) -> Result<Packet, StateError> {
        if self.connection != ConnectionState::Connecting {
            return Err(StateError::InvalidState(self.connection));
        }

        Ok(Packet::Connect(connect))
    }

    /// Adds next packet identifier to QoS 1 and 2 publish packets and returns
    /// it by wrapping publish in packet
    fn outgoing_publish(&mut self, mut publish: Publish) -> Result<Packet, StateError> {
        self.ensure_connected()?;

        if publish.qos == QoS::AtMostOnce {
            publish.pkid = 0;
            return Ok(Packet::Publish(publish));
        }

        publish.pkid = self.next_pkid()?;
        publish.dup = false;
        let packet = Packet::Publish(publish);
        self.track(packet.clone(), Transaction::Sent);
        Ok(packet)
    }

    fn outgoing_subscribe(&mut self, mut subscribe: Subscribe) -> Result<Packet, StateError> {
        self.ensure_connected()?;

        subscribe.pkid = self.next_pkid()?;
        let packet = Packet::Subscribe(subscribe);
        self.track(packet.clone(), Transaction::Subscribing);
        Ok(packet)
    }

    fn outgoing_unsubscribe(&mut self, mut unsubscribe: Unsubscribe) -> Result<Packet, StateError> {
        self.ensure_connected()?;

        unsubscribe.pkid = self.next_pkid()?;
        let packet = Packet::Unsubscribe(unsubscribe);
        self.track(packet.clone(), Transaction::Unsubscribing);
        Ok(packet)
    }

    fn outgoing_ping(&mut self) -> Result<Packet, StateError> {
        self.ensure_connected()?;

        // raise error if last ping didn't receive ack
        if self.await_pingresp {
            return Err(StateError::AwaitPingResp);
        }

        self.await_pingresp = true;
        Ok(Packet::PingReq(PingReq))
    }

    fn outgoing_disconnect(&mut self, disconnect: Disconnect) -> Packet {
        self.connection = ConnectionState::Disconnecting;
        Packet::Disconnect(disconnect)
    }

    fn ensure_connected(&self) -> Result<(), StateError> {
        match self.connection {
            ConnectionState::Connected => Ok(()),
            state => Err(StateError::InvalidState(state)),
        }
    }

    fn track(&mut self, packet: Packet, state: Transaction) {
        let pkid = match &packet {
            Packet::Publish(publish) => publish.pkid,
            Packet::Subscribe(subscribe) => subscribe.pkid,
            Packet::Unsubscribe(unsubscribe) => unsubscribe.pkid,
            _ => return,
        };

        self.next_seq += 1;
        let record = InflightRecord {
            pkid,
            packet,
            state,
            retries: 0,
            last_sent: Instant::now(),
            seq: self.next_seq,
        };

        self.outgoing.insert(pkid, record);
    }

    /// Next packet identifier which isn't taken by an outstanding transaction.
    /// Identifiers wrap around and skip 0
    fn next_pkid(&mut self) -> Result<u16, StateError> {
        if self.outgoing.len() >= u16::MAX as usize {
            return Err(StateError::PacketIdsExhausted);
        }

        loop {
            self.last_pkid = self.last_pkid.wrapping_add(1).max(1);
            if !self.outgoing.contains_key(&self.last_pkid) {
                return Ok(self.last_pkid);
            }
        }
    }
}

fn is_qos(record: &InflightRecord, qos: QoS) -> bool {
    matches!(&record.packet, Packet::Publish(publish) if publish.qos == qos)
}

/// Packet to put on the wire again for a record in its current state
fn resend(record: &InflightRecord) -> Packet {
    match (&record.packet, record.state) {
        (Packet::Publish(publish), Transaction::Sent) => {
            let mut publish = publish.clone();
            publish.dup = true;
            Packet::Publish(publish)
        }
        (_, Transaction::PubRelSent) => Packet::PubRel(PubRel::new(record.pkid)),
        (packet, _) => packet.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use matches::assert_matches;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn build_outgoing_publish(qos: QoS) -> Publish {
        Publish::new("hello/world", qos, vec![1, 2, 3])
    }

    fn build_incoming_publish(qos: QoS, pkid: u16) -> Publish {
        let mut publish = Publish::new("hello/world", qos, vec![1, 2, 3]);
        publish.pkid = pkid;
        publish
    }

    fn build_mqttstate() -> MqttState {
        let mut mqtt = MqttState::new(100);
        mqtt.connection = ConnectionState::Connected;
        mqtt
    }

    fn publish_pkid(packet: &Packet) -> u16 {
        match packet {
            Packet::Publish(publish) => publish.pkid,
            packet => panic!("Expected publish, got {packet:?}"),
        }
    }

    #[test]
    fn next_pkid_increments_as_expected() {
        let mut mqtt = build_mqttstate();

        for i in 1..=100 {
            let pkid = mqtt.next_pkid().unwrap();
            assert_eq!(pkid, i);
        }
    }

    #[test]
    fn next_pkid_wraps_around_and_skips_identifiers_in_use() {
        let mut mqtt = build_mqttstate();
        mqtt.last_pkid = u16::MAX - 1;

        let packet = mqtt
            .handle_outgoing_packet(Request::Publish(build_outgoing_publish(QoS::AtLeastOnce)))
            .unwrap();
        assert_eq!(publish_pkid(&packet), u16::MAX);

        // 1 is still waiting for its ack from a previous round
        mqtt.track(
            Packet::Publish(build_incoming_publish(QoS::AtLeastOnce, 1)),
            Transaction::Sent,
        );

        let packet = mqtt
            .handle_outgoing_packet(Request::Publish(build_outgoing_publish(QoS::AtLeastOnce)))
            .unwrap();
        assert_eq!(publish_pkid(&packet), 2);
    }

    #[test]
    fn outgoing_publish_should_set_pkid_and_add_publish_to_queue() {
        let mut mqtt = build_mqttstate();

        // QoS0 Publish
        let publish = build_outgoing_publish(QoS::AtMostOnce);
        let packet = mqtt.handle_outgoing_packet(Request::Publish(publish)).unwrap();
        assert_eq!(publish_pkid(&packet), 0);
        assert_eq!(mqtt.inflight(), 0);

        // QoS1 Publish
        let publish = build_outgoing_publish(QoS::AtLeastOnce);
        let packet = mqtt.handle_outgoing_packet(Request::Publish(publish.clone())).unwrap();
        assert_eq!(publish_pkid(&packet), 1);
        assert_eq!(mqtt.inflight(), 1);

        // Packet id should be incremented and publish should be saved in queue
        let packet = mqtt.handle_outgoing_packet(Request::Publish(publish)).unwrap();
        assert_eq!(publish_pkid(&packet), 2);
        assert_eq!(mqtt.inflight(), 2);

        // QoS2 Publish
        let publish = build_outgoing_publish(QoS::ExactlyOnce);
        let packet = mqtt.handle_outgoing_packet(Request::Publish(publish)).unwrap();
        assert_eq!(publish_pkid(&packet), 3);
        assert_eq!(mqtt.record(3).unwrap().state, Transaction::Sent);
    }

    #[test]
    fn requests_need_a_connection() {
        let mut mqtt = MqttState::new(10);
        let publish = build_outgoing_publish(QoS::AtLeastOnce);
        assert_eq!(
            mqtt.handle_outgoing_packet(Request::Publish(publish)),
            Err(StateError::InvalidState(ConnectionState::Disconnected))
        );

        mqtt.connecting().unwrap();
        assert_eq!(
            mqtt.connecting(),
            Err(StateError::InvalidState(ConnectionState::Connecting))
        );
        assert_eq!(
            mqtt.handle_outgoing_packet(Request::PingReq),
            Err(StateError::InvalidState(ConnectionState::Connecting))
        );
    }

    #[test]
    fn connack_moves_connecting_to_connected_or_back_to_disconnected() {
        let mut mqtt = MqttState::new(10);
        mqtt.connecting().unwrap();
        let connack = ConnAck::new(ConnectReturnCode::Success, false);
        mqtt.handle_incoming_packet(Packet::ConnAck(connack.clone()))
            .unwrap();
        assert_eq!(mqtt.connection, ConnectionState::Connected);
        assert_eq!(mqtt.events.pop_front(), Some(Event::Connected(connack)));

        let mut mqtt = MqttState::new(10);
        mqtt.connecting().unwrap();
        let connack = ConnAck::new(ConnectReturnCode::NotAuthorized, false);
        mqtt.handle_incoming_packet(Packet::ConnAck(connack.clone()))
            .unwrap();
        assert_eq!(mqtt.connection, ConnectionState::Disconnected);
        assert_eq!(mqtt.events.pop_front(), Some(Event::Rejected(connack)));

        // connack on an established connection
        let mut mqtt = build_mqttstate();
        let connack = ConnAck::new(ConnectReturnCode::Success, false);
        assert_eq!(
            mqtt.handle_incoming_packet(Packet::ConnAck(connack)),
            Err(StateError::WrongPacket)
        );
    }

    #[test]
    fn incoming_publish_should_be_added_to_queue_correctly() {
        let mut mqtt = build_mqttstate();

        let publish1 = build_incoming_publish(QoS::AtMostOnce, 0);
        let publish2 = build_incoming_publish(QoS::AtLeastOnce, 2);
        let publish3 = build_incoming_publish(QoS::ExactlyOnce, 3);

        let reply = mqtt.handle_incoming_packet(Packet::Publish(publish1)).unwrap();
        assert_eq!(reply, None);
        let reply = mqtt.handle_incoming_packet(Packet::Publish(publish2)).unwrap();
        assert_eq!(reply, Some(Packet::PubAck(PubAck::new(2))));
        let reply = mqtt.handle_incoming_packet(Packet::Publish(publish3)).unwrap();
        assert_eq!(reply, Some(Packet::PubRec(PubRec::new(3))));

        assert_eq!(mqtt.events.len(), 3);
        assert!(mqtt.incoming_pub.contains(&3));
    }

    #[test]
    fn duplicate_qos2_publish_is_delivered_once() {
        let mut mqtt = build_mqttstate();

        let publish = build_incoming_publish(QoS::ExactlyOnce, 7);
        let mut duplicate = publish.clone();
        duplicate.dup = true;

        mqtt.handle_incoming_packet(Packet::Publish(publish.clone()))
            .unwrap();
        let reply = mqtt
            .handle_incoming_packet(Packet::Publish(duplicate))
            .unwrap();

        // acked again, but not delivered again
        assert_eq!(reply, Some(Packet::PubRec(PubRec::new(7))));
        assert_eq!(mqtt.events.len(), 1);
        assert_eq!(mqtt.events.pop_front(), Some(Event::Message(publish)));

        let reply = mqtt
            .handle_incoming_packet(Packet::PubRel(PubRel::new(7)))
            .unwrap();
        assert_eq!(reply, Some(Packet::PubComp(PubComp::new(7))));
        assert!(mqtt.incoming_pub.is_empty());
    }

    #[test]
    fn unknown_pubrel_is_completed_with_not_found() {
        let mut mqtt = build_mqttstate();
        let reply = mqtt
            .handle_incoming_packet(Packet::PubRel(PubRel::new(9)))
            .unwrap();

        let mut pubcomp = PubComp::new(9);
        pubcomp.reason = PubCompReason::PacketIdentifierNotFound;
        assert_eq!(reply, Some(Packet::PubComp(pubcomp)));
    }

    #[test]
    fn incoming_puback_should_remove_correct_publish_from_queue() {
        let mut mqtt = build_mqttstate();

        let publish1 = build_outgoing_publish(QoS::AtLeastOnce);
        let publish2 = build_outgoing_publish(QoS::ExactlyOnce);

        mqtt.handle_outgoing_packet(Request::Publish(publish1)).unwrap();
        mqtt.handle_outgoing_packet(Request::Publish(publish2)).unwrap();

        mqtt.handle_incoming_packet(Packet::PubAck(PubAck::new(1)))
            .unwrap();
        assert_eq!(mqtt.inflight(), 1);
        assert_eq!(
            mqtt.events.pop_front(),
            Some(Event::Published(1, PublishAck::PubAck(PubAck::new(1))))
        );

        // puback for the qos 2 publish doesn't complete it
        mqtt.handle_incoming_packet(Packet::PubAck(PubAck::new(2)))
            .unwrap();
        assert_eq!(mqtt.inflight(), 1);
        assert!(mqtt.events.is_empty());
    }

    #[test]
    fn unsolicited_acks_are_ignored() {
        let mut mqtt = build_mqttstate();

        let reply = mqtt
            .handle_incoming_packet(Packet::PubAck(PubAck::new(101)))
            .unwrap();
        assert_eq!(reply, None);
        mqtt.handle_incoming_packet(Packet::SubAck(SubAck::new(5, vec![])))
            .unwrap();
        assert!(mqtt.events.is_empty());
    }

    #[test]
    fn qos2_outgoing_flow_walks_through_pubrel() {
        let mut mqtt = build_mqttstate();
        let publish = build_outgoing_publish(QoS::ExactlyOnce);
        mqtt.handle_outgoing_packet(Request::Publish(publish)).unwrap();

        let reply = mqtt
            .handle_incoming_packet(Packet::PubRec(PubRec::new(1)))
            .unwrap();
        assert_eq!(reply, Some(Packet::PubRel(PubRel::new(1))));
        assert_eq!(mqtt.record(1).unwrap().state, Transaction::PubRelSent);

        let reply = mqtt
            .handle_incoming_packet(Packet::PubComp(PubComp::new(1)))
            .unwrap();
        assert_eq!(reply, None);
        assert_eq!(mqtt.inflight(), 0);
        assert_eq!(
            mqtt.events.pop_front(),
            Some(Event::Published(1, PublishAck::PubComp(PubComp::new(1))))
        );
    }

    #[test]
    fn failed_pubrec_ends_qos2_flow() {
        let mut mqtt = build_mqttstate();
        let publish = build_outgoing_publish(QoS::ExactlyOnce);
        mqtt.handle_outgoing_packet(Request::Publish(publish)).unwrap();

        let mut pubrec = PubRec::new(1);
        pubrec.reason = PubAckReason::NotAuthorized;
        let reply = mqtt
            .handle_incoming_packet(Packet::PubRec(pubrec.clone()))
            .unwrap();

        assert_eq!(reply, None);
        assert_eq!(mqtt.inflight(), 0);
        assert_eq!(
            mqtt.events.pop_front(),
            Some(Event::Published(1, PublishAck::PubRec(pubrec)))
        );
    }

    #[test]
    fn retransmission_keeps_pkid_and_payload_until_budget_runs_out() {
        let mut mqtt = build_mqttstate();
        let publish = build_outgoing_publish(QoS::AtLeastOnce);
        let sent = mqtt
            .handle_outgoing_packet(Request::Publish(publish))
            .unwrap();

        let resent = match mqtt.retransmit(1, 1) {
            Retransmit::Resend(Packet::Publish(publish)) => publish,
            r => panic!("Unexpected retransmission {r:?}"),
        };

        let mut expected = match sent {
            Packet::Publish(publish) => publish,
            _ => unreachable!(),
        };
        expected.dup = true;
        assert_eq!(resent, expected);

        assert_matches!(mqtt.retransmit(1, 1), Retransmit::Expired(InflightRecord { pkid: 1, retries: 1, .. }));
        assert_eq!(mqtt.retransmit(1, 1), Retransmit::Unknown);
        assert_eq!(mqtt.inflight(), 0);
    }

    #[test]
    fn pubrel_is_retransmitted_after_pubrec() {
        let mut mqtt = build_mqttstate();
        let publish = build_outgoing_publish(QoS::ExactlyOnce);
        mqtt.handle_outgoing_packet(Request::Publish(publish)).unwrap();
        mqtt.handle_incoming_packet(Packet::PubRec(PubRec::new(1)))
            .unwrap();

        assert_eq!(
            mqtt.retransmit(1, 3),
            Retransmit::Resend(Packet::PubRel(PubRel::new(1)))
        );
    }

    #[test]
    fn subscriptions_expire_without_retransmission() {
        let mut mqtt = build_mqttstate();
        let subscribe = Subscribe::new(0, vec![Filter::new("a/+", QoS::AtLeastOnce)]);
        mqtt.handle_outgoing_packet(Request::Subscribe(subscribe))
            .unwrap();

        assert_matches!(
            mqtt.retransmit(1, 3),
            Retransmit::Expired(InflightRecord { state: Transaction::Subscribing, .. })
        );
    }

    #[test]
    fn replay_resends_everything_in_original_order() {
        let mut mqtt = build_mqttstate();
        let subscribe = Subscribe::new(0, vec![Filter::new("a/+", QoS::AtLeastOnce)]);
        mqtt.handle_outgoing_packet(Request::Publish(build_outgoing_publish(QoS::ExactlyOnce)))
            .unwrap();
        mqtt.handle_outgoing_packet(Request::Subscribe(subscribe))
            .unwrap();
        mqtt.handle_outgoing_packet(Request::Publish(build_outgoing_publish(QoS::AtLeastOnce)))
            .unwrap();
        mqtt.handle_incoming_packet(Packet::PubRec(PubRec::new(1)))
            .unwrap();

        mqtt.disconnected();
        assert_eq!(mqtt.connection, ConnectionState::Disconnected);

        let packets = mqtt.replay();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0], Packet::PubRel(PubRel::new(1)));
        assert_matches!(&packets[1], Packet::Subscribe(Subscribe { pkid: 2, .. }));
        assert_matches!(&packets[2], Packet::Publish(Publish { pkid: 3, dup: true, .. }));
    }

    #[test]
    fn outgoing_ping_handle_should_throw_errors_for_no_pingresp() {
        let mut mqtt = build_mqttstate();
        mqtt.handle_outgoing_packet(Request::PingReq).unwrap();

        // network activity other than pingresp
        let publish = build_outgoing_publish(QoS::AtLeastOnce);
        mqtt.handle_outgoing_packet(Request::Publish(publish))
            .unwrap();
        mqtt.handle_incoming_packet(Packet::PubAck(PubAck::new(1)))
            .unwrap();

        // should throw error because we didn't get pingresp for previous ping
        assert_eq!(
            mqtt.handle_outgoing_packet(Request::PingReq),
            Err(StateError::AwaitPingResp)
        );

        mqtt.handle_incoming_packet(Packet::PingResp(PingResp))
            .unwrap();
        assert!(mqtt.handle_outgoing_packet(Request::PingReq).is_ok());
    }

    #[test]
    fn broker_disconnect_moves_to_disconnecting() {
        let mut mqtt = build_mqttstate();
        let disconnect = Disconnect::new(DisconnectReasonCode::SessionTakenOver);
        mqtt.handle_incoming_packet(Packet::Disconnect(disconnect.clone()))
            .unwrap();
        assert_eq!(mqtt.connection, ConnectionState::Disconnecting);
        assert_eq!(mqtt.events.pop_front(), Some(Event::Disconnected(disconnect)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Publish(QoS),
        Subscribe,
        Ack(usize),
        Expire(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Publish(QoS::AtLeastOnce)),
            Just(Op::Publish(QoS::ExactlyOnce)),
            Just(Op::Subscribe),
            any::<usize>().prop_map(Op::Ack),
            any::<usize>().prop_map(Op::Expire),
        ]
    }

    proptest! {
        #[test]
        fn inflight_packet_identifiers_are_unique(ops in proptest::collection::vec(arb_op(), 1..400)) {
            let mut mqtt = build_mqttstate();
            mqtt.last_pkid = u16::MAX - 50;
            let mut live: Vec<u16> = Vec::new();

            for op in ops {
                match op {
                    Op::Publish(qos) => {
                        let packet = mqtt
                            .handle_outgoing_packet(Request::Publish(build_outgoing_publish(qos)))
                            .unwrap();
                        let pkid = publish_pkid(&packet);
                        prop_assert!(pkid != 0);
                        prop_assert!(!live.contains(&pkid));
                        live.push(pkid);
                    }
                    Op::Subscribe => {
                        let subscribe = Subscribe::new(0, vec![Filter::new("a/#", QoS::AtMostOnce)]);
                        let pkid = match mqtt.handle_outgoing_packet(Request::Subscribe(subscribe)).unwrap() {
                            Packet::Subscribe(subscribe) => subscribe.pkid,
                            _ => unreachable!(),
                        };
                        prop_assert!(!live.contains(&pkid));
                        live.push(pkid);
                    }
                    Op::Ack(i) if !live.is_empty() => {
                        let pkid = live.remove(i % live.len());
                        mqtt.forget(pkid);
                    }
                    Op::Expire(i) if !live.is_empty() => {
                        let pkid = live[i % live.len()];
                        if let Retransmit::Expired(_) = mqtt.retransmit(pkid, 0) {
                            live.retain(|p| *p != pkid);
                        }
                    }
                    _ => (),
                }

                prop_assert_eq!(mqtt.inflight(), live.len());
            }
        }
    }
}
