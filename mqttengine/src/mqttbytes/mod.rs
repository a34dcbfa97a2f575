//! MQTT 5 wire codec.
//!
//! Every control packet knows how to `read` itself out of a frame and
//! `write` itself into a buffer. [`Packet::read`] and [`check`] take care of
//! framing: they never consume bytes unless a full frame is available, and
//! report [`Error::InsufficientBytes`] otherwise so that the caller keeps
//! buffering.
use std::slice::Iter;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use self::{
    connack::{ConnAck, ConnectReturnCode},
    connect::{Connect, LastWill},
    disconnect::{Disconnect, DisconnectReasonCode},
    ping::{PingReq, PingResp},
    properties::{Properties, Property},
    puback::{PubAck, PubAckReason},
    pubcomp::{PubComp, PubCompReason},
    publish::Publish,
    pubrec::PubRec,
    pubrel::PubRel,
    suback::{SubAck, SubscribeReasonCode},
    subscribe::{Filter, RetainForwardRule, Subscribe},
    topic::{has_wildcards, matches, valid_filter, valid_topic},
    unsuback::{UnsubAck, UnsubAckReason},
    unsubscribe::Unsubscribe,
};

mod connack;
mod connect;
mod disconnect;
mod ping;
mod properties;
mod puback;
mod pubcomp;
mod publish;
mod pubrec;
mod pubrel;
mod suback;
mod subscribe;
mod topic;
mod unsuback;
mod unsubscribe;

/// Largest value a variable byte integer can carry in 4 bytes
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Quality of service
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[allow(clippy::enum_variant_names)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Maps a number to QoS
pub fn qos(num: u8) -> Option<QoS> {
    match num {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Error during serialization and deserialization
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Invalid return code received as response for connect = {0}")]
    InvalidConnectReturnCode(u8),
    #[error("Invalid reason = {0}")]
    InvalidReason(u8),
    #[error("Invalid protocol used")]
    InvalidProtocol,
    #[error("Invalid protocol level = {0}")]
    InvalidProtocolLevel(u8),
    #[error("Invalid packet format")]
    IncorrectPacketFormat,
    #[error("Invalid packet type = {0}")]
    InvalidPacketType(u8),
    #[error("Invalid retain forward rule = {0}")]
    InvalidRetainForwardRule(u8),
    #[error("Invalid QoS level = {0}")]
    InvalidQoS(u8),
    #[error("Invalid subscribe reason code = {0}")]
    InvalidSubscribeReasonCode(u8),
    #[error("Packet has id Zero")]
    PacketIdZero,
    #[error("QoS 0 publish can't carry packet id {0}")]
    PacketIdOnQoS0(u16),
    #[error("Empty Subscription")]
    EmptySubscription,
    #[error("Payload is too long")]
    PayloadTooLong,
    #[error("Max Payload size of {max:?} has been exceeded by packet of {pkt_size:?} bytes")]
    PayloadSizeLimitExceeded { pkt_size: usize, max: usize },
    #[error("Cannot send packet of size {pkt_size:?}, limit is {max:?}")]
    OutgoingPacketTooLarge { pkt_size: usize, max: usize },
    #[error("Payload is required")]
    PayloadRequired,
    #[error("Length prefixed field of {0} bytes doesn't fit in 2 bytes")]
    StringTooLong(usize),
    #[error("String is not valid utf-8")]
    NotUtf8,
    #[error("Promised boundary crossed, contains {0} bytes")]
    BoundaryCrossed(usize),
    #[error("Packet is malformed")]
    MalformedPacket,
    #[error("Remaining length is malformed")]
    MalformedRemainingLength,
    #[error("Invalid property type = {0}")]
    InvalidPropertyType(u8),
    /// More bytes required to frame packet. Argument
    /// implies minimum additional bytes required to
    /// proceed further
    #[error("Insufficient number of bytes to frame packet, {0} more bytes required")]
    InsufficientBytes(usize),
}

/// Encapsulates all MQTT packet types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq(PingReq),
    PingResp(PingResp),
    Disconnect(Disconnect),
}

impl Packet {
    /// Reads a stream of bytes and extracts next MQTT packet out of it
    pub fn read(stream: &mut BytesMut, max_size: usize) -> Result<Packet, Error> {
        let fixed_header = check(stream.iter(), max_size)?;

        // Test with a stream with exactly the size to check border panics
        let packet = stream.split_to(fixed_header.frame_length());
        let packet_type = fixed_header.packet_type()?;
        fixed_header.validate_flags(packet_type)?;

        if fixed_header.remaining_len == 0 {
            return match packet_type {
                PacketType::PingReq => Ok(Packet::PingReq(PingReq)),
                PacketType::PingResp => Ok(Packet::PingResp(PingResp)),
                PacketType::Disconnect => Ok(Packet::Disconnect(Disconnect::default())),
                _ => Err(Error::PayloadRequired),
            };
        }

        let packet = packet.freeze();
        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(fixed_header, packet)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(fixed_header, packet)?),
            PacketType::Publish => Packet::Publish(Publish::read(fixed_header, packet)?),
            PacketType::PubAck => Packet::PubAck(PubAck::read(fixed_header, packet)?),
            PacketType::PubRec => Packet::PubRec(PubRec::read(fixed_header, packet)?),
            PacketType::PubRel => Packet::PubRel(PubRel::read(fixed_header, packet)?),
            PacketType::PubComp => Packet::PubComp(PubComp::read(fixed_header, packet)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(fixed_header, packet)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(fixed_header, packet)?),
            PacketType::Unsubscribe => {
                Packet::Unsubscribe(Unsubscribe::read(fixed_header, packet)?)
            }
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::read(fixed_header, packet)?),
            PacketType::Disconnect => {
                Packet::Disconnect(Disconnect::read(fixed_header, packet)?)
            }
            // pings never carry a body
            PacketType::PingReq | PacketType::PingResp => return Err(Error::MalformedPacket),
        };

        Ok(packet)
    }

    /// Serializes the packet at the end of `buffer`. On error, `buffer` is
    /// left as it was before the call
    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        let start = buffer.len();
        let written = match self {
            Self::Connect(connect) => connect.write(buffer),
            Self::ConnAck(ack) => ack.write(buffer),
            Self::Publish(publish) => publish.write(buffer),
            Self::PubAck(ack) => ack.write(buffer),
            Self::PubRec(ack) => ack.write(buffer),
            Self::PubRel(ack) => ack.write(buffer),
            Self::PubComp(ack) => ack.write(buffer),
            Self::Subscribe(subscribe) => subscribe.write(buffer),
            Self::SubAck(ack) => ack.write(buffer),
            Self::Unsubscribe(unsubscribe) => unsubscribe.write(buffer),
            Self::UnsubAck(ack) => ack.write(buffer),
            Self::PingReq(_) => PingReq::write(buffer),
            Self::PingResp(_) => PingResp::write(buffer),
            Self::Disconnect(disconnect) => disconnect.write(buffer),
        };

        if written.is_err() {
            buffer.truncate(start);
        }

        written
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq(_) => PacketType::PingReq,
            Self::PingResp(_) => PacketType::PingResp,
            Self::Disconnect(_) => PacketType::Disconnect,
        }
    }
}

/// Decodes the first packet in `bytes`. Returns the packet along with the
/// number of bytes it occupied. [`Error::InsufficientBytes`] means the
/// frame isn't complete yet
pub fn decode(bytes: &[u8], max_size: usize) -> Result<(Packet, usize), Error> {
    let fixed_header = check(bytes.iter(), max_size)?;
    let frame_length = fixed_header.frame_length();
    let mut frame = BytesMut::from(&bytes[..frame_length]);
    let packet = Packet::read(&mut frame, max_size)?;
    Ok((packet, frame_length))
}

/// Encodes a packet into a fresh buffer
pub fn encode(packet: &Packet) -> Result<Bytes, Error> {
    let mut buffer = BytesMut::new();
    packet.write(&mut buffer)?;
    Ok(buffer.freeze())
}

/// MQTT packet type
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

/// Packet type from a byte
///
/// ```ignore
///          7                          3                          0
///          +--------------------------+--------------------------+
/// byte 1   | MQTT Control Packet Type | Flags for each type      |
///          +--------------------------+--------------------------+
///          |         Remaining Bytes Len  (1/2/3/4 bytes)        |
///          +-----------------------------------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// First byte of the stream. Used to identify packet types and
    /// several flags
    byte1: u8,
    /// Length of fixed header. Byte 1 + (1..4) bytes
    fixed_header_len: usize,
    /// Remaining length of the packet. Doesn't include fixed header bytes
    remaining_len: usize,
}

impl FixedHeader {
    pub fn new(byte1: u8, remaining_len_len: usize, remaining_len: usize) -> FixedHeader {
        FixedHeader {
            byte1,
            fixed_header_len: remaining_len_len + 1,
            remaining_len,
        }
    }

    pub fn packet_type(&self) -> Result<PacketType, Error> {
        let num = self.byte1 >> 4;
        match num {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(Error::InvalidPacketType(num)),
        }
    }

    /// Reserved flag bits are fixed for every packet except publish, whose
    /// flags are validated while reading it
    fn validate_flags(&self, packet_type: PacketType) -> Result<(), Error> {
        let flags = self.byte1 & 0x0F;
        let expected = match packet_type {
            PacketType::Publish => return Ok(()),
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0b0010,
            _ => 0b0000,
        };

        if flags != expected {
            return Err(Error::IncorrectPacketFormat);
        }

        Ok(())
    }

    /// Returns the size of full packet (fixed header + variable header + payload)
    pub fn frame_length(&self) -> usize {
        self.fixed_header_len + self.remaining_len
    }
}

/// Checks if the stream has enough bytes to frame a packet and returns fixed header
/// only if a packet can be framed with existing bytes in the `stream`.
/// The passed stream doesn't modify parent stream's cursor
pub fn check(stream: Iter<u8>, max_packet_size: usize) -> Result<FixedHeader, Error> {
    let stream_len = stream.len();
    let fixed_header = parse_fixed_header(stream)?;

    // Don't let rogue connections attack with huge payloads.
    // Disconnect them before reading all that data
    if fixed_header.remaining_len > max_packet_size {
        return Err(Error::PayloadSizeLimitExceeded {
            pkt_size: fixed_header.remaining_len,
            max: max_packet_size,
        });
    }

    let frame_length = fixed_header.frame_length();
    if stream_len < frame_length {
        return Err(Error::InsufficientBytes(frame_length - stream_len));
    }

    Ok(fixed_header)
}

fn parse_fixed_header(mut stream: Iter<u8>) -> Result<FixedHeader, Error> {
    // At least 2 bytes are necessary to frame a packet
    let stream_len = stream.len();
    let byte1 = match stream.next() {
        Some(byte1) if stream_len >= 2 => *byte1,
        _ => return Err(Error::InsufficientBytes(2 - stream_len)),
    };

    let (len_len, len) = length(stream)?;
    Ok(FixedHeader::new(byte1, len_len, len))
}

/// Parses a variable byte integer and returns the number of bytes that make
/// it along with its value. Used for remaining length as well as property
/// lengths and subscription identifiers
///
/// Stream 0b1xxx_xxxx 0b1yyy_yyyy 0b1zzz_zzzz 0b0www_wwww is framed as
/// 0bwww_wwww_zzz_zzzz_yyy_yyyy_xxx_xxxx
pub(crate) fn length(stream: Iter<u8>) -> Result<(usize, usize), Error> {
    let mut len: usize = 0;
    let mut len_len = 0;
    let mut done = false;
    let mut shift = 0;

    for byte in stream {
        len_len += 1;
        let byte = *byte as usize;
        len += (byte & 0x7F) << shift;

        done = (byte & 0x80) == 0;
        if done {
            break;
        }

        // continuation bit on the 4th byte
        shift += 7;
        if shift > 21 {
            return Err(Error::MalformedRemainingLength);
        }
    }

    if !done {
        return Err(Error::InsufficientBytes(1));
    }

    Ok((len_len, len))
}

/// Number of bytes the variable byte integer `len` takes on the wire
pub(crate) fn len_len(len: usize) -> usize {
    if len >= 2_097_152 {
        4
    } else if len >= 16_384 {
        3
    } else if len >= 128 {
        2
    } else {
        1
    }
}

pub(crate) fn write_remaining_length(stream: &mut BytesMut, len: usize) -> Result<usize, Error> {
    if len > MAX_REMAINING_LENGTH {
        return Err(Error::PayloadTooLong);
    }

    let mut done = false;
    let mut x = len;
    let mut count = 0;

    while !done {
        let mut byte = (x % 128) as u8;
        x /= 128;
        if x > 0 {
            byte |= 128;
        }

        stream.put_u8(byte);
        count += 1;
        done = x == 0;
    }

    Ok(count)
}

/// Reads a variable byte integer which is embedded in a frame. Running out of
/// bytes here means the frame lied about its length
pub(crate) fn read_varint(stream: &mut Bytes) -> Result<usize, Error> {
    let (len_len, len) = length(stream.iter()).map_err(|e| match e {
        Error::InsufficientBytes(_) => Error::MalformedPacket,
        e => e,
    })?;

    stream.advance(len_len);
    Ok(len)
}

/// Reads a series of bytes with a length from a byte stream
pub(crate) fn read_mqtt_bytes(stream: &mut Bytes) -> Result<Bytes, Error> {
    let len = read_u16(stream)? as usize;

    // Prevent attacks with wrong remaining length. This method is used in
    // `packet.assembly()` with (enough) bytes to frame packet. Ensures that
    // reading variable len string or bytes doesn't cross promised boundary
    // with `read_fixed_header()`
    if len > stream.len() {
        return Err(Error::BoundaryCrossed(len));
    }

    Ok(stream.split_to(len))
}

/// Reads a string from bytes stream
pub(crate) fn read_mqtt_string(stream: &mut Bytes) -> Result<String, Error> {
    let s = read_mqtt_bytes(stream)?;
    let s = String::from_utf8(s.to_vec()).map_err(|_| Error::NotUtf8)?;

    // utf-8 encoded null isn't allowed in mqtt strings
    if s.contains('\u{0}') {
        return Err(Error::NotUtf8);
    }

    Ok(s)
}

/// Serializes bytes to stream (including length)
pub(crate) fn write_mqtt_bytes(stream: &mut BytesMut, bytes: &[u8]) -> Result<(), Error> {
    if bytes.len() > u16::MAX as usize {
        return Err(Error::StringTooLong(bytes.len()));
    }

    stream.put_u16(bytes.len() as u16);
    stream.extend_from_slice(bytes);
    Ok(())
}

/// Serializes a string to stream
pub(crate) fn write_mqtt_string(stream: &mut BytesMut, string: &str) -> Result<(), Error> {
    write_mqtt_bytes(stream, string.as_bytes())
}

pub(crate) fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u16())
}

pub(crate) fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if stream.is_empty() {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u8())
}

pub(crate) fn read_u32(stream: &mut Bytes) -> Result<u32, Error> {
    if stream.len() < 4 {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u32())
}

/// Remaining length of the variable header shared by PUBACK, PUBREC, PUBREL
/// and PUBCOMP. Reason code and property length are optional on the wire
fn ack_len(reason: u8, properties: &Properties) -> usize {
    match (reason, properties.is_empty()) {
        (0, true) => 2,
        (_, true) => 3,
        (_, false) => 2 + 1 + properties.size(),
    }
}

fn read_ack(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<(u16, u8, Properties), Error> {
    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;
    if pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    if fixed_header.remaining_len == 2 {
        return Ok((pkid, 0, Properties::new()));
    }

    let reason = read_u8(&mut bytes)?;
    if fixed_header.remaining_len == 3 {
        return Ok((pkid, reason, Properties::new()));
    }

    let properties = Properties::read(&mut bytes)?;
    Ok((pkid, reason, properties))
}

fn write_ack(
    buffer: &mut BytesMut,
    byte1: u8,
    pkid: u16,
    reason: u8,
    properties: &Properties,
) -> Result<usize, Error> {
    if pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    let len = ack_len(reason, properties);
    buffer.put_u8(byte1);
    let count = write_remaining_length(buffer, len)?;
    buffer.put_u16(pkid);

    if len > 2 {
        buffer.put_u8(reason);
    }

    if len > 3 {
        properties.write(buffer)?;
    }

    Ok(1 + count + len)
}
