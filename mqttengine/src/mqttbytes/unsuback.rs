use super::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Per filter outcome of an unsubscribe
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubAckReason {
    Success = 0x00,
    NoSubscriptionExisted = 0x11,
    UnspecifiedError = 0x80,
    ImplementationSpecificError = 0x83,
    NotAuthorized = 0x87,
    TopicFilterInvalid = 0x8F,
    PacketIdentifierInUse = 0x91,
}

fn reason(num: u8) -> Result<UnsubAckReason, Error> {
    let code = match num {
        0x00 => UnsubAckReason::Success,
        0x11 => UnsubAckReason::NoSubscriptionExisted,
        0x80 => UnsubAckReason::UnspecifiedError,
        0x83 => UnsubAckReason::ImplementationSpecificError,
        0x87 => UnsubAckReason::NotAuthorized,
        0x8F => UnsubAckReason::TopicFilterInvalid,
        0x91 => UnsubAckReason::PacketIdentifierInUse,
        num => return Err(Error::InvalidReason(num)),
    };

    Ok(code)
}

/// Acknowledgement to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
    pub reasons: Vec<UnsubAckReason>,
    pub properties: Properties,
}

impl UnsubAck {
    pub fn new(pkid: u16, reasons: Vec<UnsubAckReason>) -> UnsubAck {
        UnsubAck {
            pkid,
            reasons,
            properties: Properties::new(),
        }
    }

    fn len(&self) -> usize {
        2 + self.properties.size() + self.reasons.len()
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<UnsubAck, Error> {
        bytes.advance(fixed_header.fixed_header_len);
        let pkid = read_u16(&mut bytes)?;
        let properties = Properties::read(&mut bytes)?;

        let mut reasons = Vec::with_capacity(bytes.len());
        while bytes.has_remaining() {
            reasons.push(reason(bytes.get_u8())?);
        }

        Ok(UnsubAck {
            pkid,
            reasons,
            properties,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        let len = self.len();
        buffer.put_u8(0xB0);
        let count = write_remaining_length(buffer, len)?;
        buffer.put_u16(self.pkid);
        self.properties.write(buffer)?;

        for reason in self.reasons.iter() {
            buffer.put_u8(*reason as u8);
        }

        Ok(1 + count + len)
    }
}
