use super::*;
use bytes::{Bytes, BytesMut};

/// Release of a QoS2 publish after PUBREC. Shares its reason codes with
/// PUBCOMP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubRel {
    pub pkid: u16,
    pub reason: PubCompReason,
    pub properties: Properties,
}

impl PubRel {
    pub fn new(pkid: u16) -> PubRel {
        PubRel {
            pkid,
            reason: PubCompReason::Success,
            properties: Properties::new(),
        }
    }

    pub fn read(fixed_header: FixedHeader, bytes: Bytes) -> Result<PubRel, Error> {
        let (pkid, reason, properties) = read_ack(fixed_header, bytes)?;
        Ok(PubRel {
            pkid,
            reason: pubcomp::pubcomp_reason(reason)?,
            properties,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        write_ack(buffer, 0x62, self.pkid, self.reason as u8, &self.properties)
    }
}
