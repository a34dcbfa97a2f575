use super::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Acknowledgement to subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReasonCode>,
    pub properties: Properties,
}

impl SubAck {
    pub fn new(pkid: u16, return_codes: Vec<SubscribeReasonCode>) -> SubAck {
        SubAck {
            pkid,
            return_codes,
            properties: Properties::new(),
        }
    }

    fn len(&self) -> usize {
        2 + self.properties.size() + self.return_codes.len()
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<SubAck, Error> {
        bytes.advance(fixed_header.fixed_header_len);
        let pkid = read_u16(&mut bytes)?;
        let properties = Properties::read(&mut bytes)?;

        if !bytes.has_remaining() {
            return Err(Error::MalformedPacket);
        }

        let mut return_codes = Vec::with_capacity(bytes.len());
        while bytes.has_remaining() {
            return_codes.push(reason(bytes.get_u8())?);
        }

        Ok(SubAck {
            pkid,
            return_codes,
            properties,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        let len = self.len();
        buffer.put_u8(0x90);
        let count = write_remaining_length(buffer, len)?;
        buffer.put_u16(self.pkid);
        self.properties.write(buffer)?;

        for code in self.return_codes.iter() {
            buffer.put_u8(code.code());
        }

        Ok(1 + count + len)
    }
}

/// Per filter outcome of a subscription. Success carries the granted QoS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReasonCode {
    Success(QoS),
    Unspecified,
    ImplementationSpecific,
    NotAuthorized,
    TopicFilterInvalid,
    PkidInUse,
    QuotaExceeded,
    SharedSubscriptionsNotSupported,
    SubscriptionIdNotSupported,
    WildcardSubscriptionsNotSupported,
}

impl SubscribeReasonCode {
    pub fn is_success(&self) -> bool {
        matches!(self, SubscribeReasonCode::Success(_))
    }

    fn code(&self) -> u8 {
        match self {
            SubscribeReasonCode::Success(qos) => *qos as u8,
            SubscribeReasonCode::Unspecified => 0x80,
            SubscribeReasonCode::ImplementationSpecific => 0x83,
            SubscribeReasonCode::NotAuthorized => 0x87,
            SubscribeReasonCode::TopicFilterInvalid => 0x8F,
            SubscribeReasonCode::PkidInUse => 0x91,
            SubscribeReasonCode::QuotaExceeded => 0x97,
            SubscribeReasonCode::SharedSubscriptionsNotSupported => 0x9E,
            SubscribeReasonCode::SubscriptionIdNotSupported => 0xA1,
            SubscribeReasonCode::WildcardSubscriptionsNotSupported => 0xA2,
        }
    }
}

fn reason(code: u8) -> Result<SubscribeReasonCode, Error> {
    let v = match code {
        0x00 => SubscribeReasonCode::Success(QoS::AtMostOnce),
        0x01 => SubscribeReasonCode::Success(QoS::AtLeastOnce),
        0x02 => SubscribeReasonCode::Success(QoS::ExactlyOnce),
        0x80 => SubscribeReasonCode::Unspecified,
        0x83 => SubscribeReasonCode::ImplementationSpecific,
        0x87 => SubscribeReasonCode::NotAuthorized,
        0x8F => SubscribeReasonCode::TopicFilterInvalid,
        0x91 => SubscribeReasonCode::PkidInUse,
        0x97 => SubscribeReasonCode::QuotaExceeded,
        0x9E => SubscribeReasonCode::SharedSubscriptionsNotSupported,
        0xA1 => SubscribeReasonCode::SubscriptionIdNotSupported,
        0xA2 => SubscribeReasonCode::WildcardSubscriptionsNotSupported,
        v => return Err(Error::InvalidSubscribeReasonCode(v)),
    };

    Ok(v)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn suback_parsing_works() {
        let mut stream = BytesMut::from(
            &[
                0x90, 0x05, // packet type, remaining len
                0x00, 0x0F, // pkid
                0x00, // properties
                0x01, 0x87, // granted qos 1, not authorized
            ][..],
        );

        let packet = Packet::read(&mut stream, 100).unwrap();
        assert_eq!(
            packet,
            Packet::SubAck(SubAck::new(
                15,
                vec![
                    SubscribeReasonCode::Success(QoS::AtLeastOnce),
                    SubscribeReasonCode::NotAuthorized
                ]
            ))
        );
    }

    #[test]
    fn unknown_reason_code_is_rejected() {
        let mut stream = BytesMut::from(&[0x90, 0x04, 0x00, 0x01, 0x00, 0x03][..]);
        assert_eq!(
            Packet::read(&mut stream, 100),
            Err(Error::InvalidSubscribeReasonCode(3))
        );
    }
}
