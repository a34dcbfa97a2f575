use super::*;
use bytes::{Bytes, BytesMut};

/// Reason code of PUBREL and PUBCOMP
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubCompReason {
    Success = 0x00,
    PacketIdentifierNotFound = 0x92,
}

pub(crate) fn pubcomp_reason(num: u8) -> Result<PubCompReason, Error> {
    match num {
        0x00 => Ok(PubCompReason::Success),
        0x92 => Ok(PubCompReason::PacketIdentifierNotFound),
        num => Err(Error::InvalidReason(num)),
    }
}

/// Final acknowledgement of a QoS2 publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubComp {
    pub pkid: u16,
    pub reason: PubCompReason,
    pub properties: Properties,
}

impl PubComp {
    pub fn new(pkid: u16) -> PubComp {
        PubComp {
            pkid,
            reason: PubCompReason::Success,
            properties: Properties::new(),
        }
    }

    pub fn read(fixed_header: FixedHeader, bytes: Bytes) -> Result<PubComp, Error> {
        let (pkid, reason, properties) = read_ack(fixed_header, bytes)?;
        Ok(PubComp {
            pkid,
            reason: pubcomp_reason(reason)?,
            properties,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        write_ack(buffer, 0x70, self.pkid, self.reason as u8, &self.properties)
    }
}
