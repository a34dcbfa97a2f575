use super::*;
use bytes::{Bytes, BytesMut};

/// First acknowledgement to a QoS2 publish. Shares its reason codes with
/// PUBACK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubRec {
    pub pkid: u16,
    pub reason: PubAckReason,
    pub properties: Properties,
}

impl PubRec {
    pub fn new(pkid: u16) -> PubRec {
        PubRec {
            pkid,
            reason: PubAckReason::Success,
            properties: Properties::new(),
        }
    }

    pub fn read(fixed_header: FixedHeader, bytes: Bytes) -> Result<PubRec, Error> {
        let (pkid, reason, properties) = read_ack(fixed_header, bytes)?;
        Ok(PubRec {
            pkid,
            reason: puback::puback_reason(reason)?,
            properties,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        write_ack(buffer, 0x50, self.pkid, self.reason as u8, &self.properties)
    }
}
