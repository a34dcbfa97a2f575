use super::*;
use bytes::{Bytes, BytesMut};

/// Reason code of PUBACK and PUBREC
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubAckReason {
    Success = 0x00,
    NoMatchingSubscribers = 0x10,
    UnspecifiedError = 0x80,
    ImplementationSpecificError = 0x83,
    NotAuthorized = 0x87,
    TopicNameInvalid = 0x90,
    PacketIdentifierInUse = 0x91,
    QuotaExceeded = 0x97,
    PayloadFormatInvalid = 0x99,
}

impl PubAckReason {
    /// Codes below 0x80 mean the message was accepted
    pub fn is_success(&self) -> bool {
        (*self as u8) < 0x80
    }
}

pub(crate) fn puback_reason(num: u8) -> Result<PubAckReason, Error> {
    let code = match num {
        0x00 => PubAckReason::Success,
        0x10 => PubAckReason::NoMatchingSubscribers,
        0x80 => PubAckReason::UnspecifiedError,
        0x83 => PubAckReason::ImplementationSpecificError,
        0x87 => PubAckReason::NotAuthorized,
        0x90 => PubAckReason::TopicNameInvalid,
        0x91 => PubAckReason::PacketIdentifierInUse,
        0x97 => PubAckReason::QuotaExceeded,
        0x99 => PubAckReason::PayloadFormatInvalid,
        num => return Err(Error::InvalidReason(num)),
    };

    Ok(code)
}

/// Acknowledgement to QoS1 publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    pub pkid: u16,
    pub reason: PubAckReason,
    pub properties: Properties,
}

impl PubAck {
    pub fn new(pkid: u16) -> PubAck {
        PubAck {
            pkid,
            reason: PubAckReason::Success,
            properties: Properties::new(),
        }
    }

    pub fn read(fixed_header: FixedHeader, bytes: Bytes) -> Result<PubAck, Error> {
        let (pkid, reason, properties) = read_ack(fixed_header, bytes)?;
        Ok(PubAck {
            pkid,
            reason: puback_reason(reason)?,
            properties,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        write_ack(buffer, 0x40, self.pkid, self.reason as u8, &self.properties)
    }
}
