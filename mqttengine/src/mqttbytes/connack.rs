use super::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Return code in connack
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Success = 0x00,
    UnspecifiedError = 0x80,
    MalformedPacket = 0x81,
    ProtocolError = 0x82,
    ImplementationSpecificError = 0x83,
    UnsupportedProtocolVersion = 0x84,
    ClientIdentifierNotValid = 0x85,
    BadUserNamePassword = 0x86,
    NotAuthorized = 0x87,
    ServerUnavailable = 0x88,
    ServerBusy = 0x89,
    Banned = 0x8A,
    BadAuthenticationMethod = 0x8C,
    TopicNameInvalid = 0x90,
    PacketTooLarge = 0x95,
    QuotaExceeded = 0x97,
    PayloadFormatInvalid = 0x99,
    RetainNotSupported = 0x9A,
    QoSNotSupported = 0x9B,
    UseAnotherServer = 0x9C,
    ServerMoved = 0x9D,
    ConnectionRateExceeded = 0x9F,
}

fn connect_return(num: u8) -> Result<ConnectReturnCode, Error> {
    let code = match num {
        0x00 => ConnectReturnCode::Success,
        0x80 => ConnectReturnCode::UnspecifiedError,
        0x81 => ConnectReturnCode::MalformedPacket,
        0x82 => ConnectReturnCode::ProtocolError,
        0x83 => ConnectReturnCode::ImplementationSpecificError,
        0x84 => ConnectReturnCode::UnsupportedProtocolVersion,
        0x85 => ConnectReturnCode::ClientIdentifierNotValid,
        0x86 => ConnectReturnCode::BadUserNamePassword,
        0x87 => ConnectReturnCode::NotAuthorized,
        0x88 => ConnectReturnCode::ServerUnavailable,
        0x89 => ConnectReturnCode::ServerBusy,
        0x8A => ConnectReturnCode::Banned,
        0x8C => ConnectReturnCode::BadAuthenticationMethod,
        0x90 => ConnectReturnCode::TopicNameInvalid,
        0x95 => ConnectReturnCode::PacketTooLarge,
        0x97 => ConnectReturnCode::QuotaExceeded,
        0x99 => ConnectReturnCode::PayloadFormatInvalid,
        0x9A => ConnectReturnCode::RetainNotSupported,
        0x9B => ConnectReturnCode::QoSNotSupported,
        0x9C => ConnectReturnCode::UseAnotherServer,
        0x9D => ConnectReturnCode::ServerMoved,
        0x9F => ConnectReturnCode::ConnectionRateExceeded,
        num => return Err(Error::InvalidConnectReturnCode(num)),
    };

    Ok(code)
}

/// Acknowledgement to connect packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
    pub properties: Properties,
}

impl ConnAck {
    pub fn new(code: ConnectReturnCode, session_present: bool) -> ConnAck {
        ConnAck {
            session_present,
            code,
            properties: Properties::new(),
        }
    }

    fn len(&self) -> usize {
        1 + 1 + self.properties.size()
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<ConnAck, Error> {
        bytes.advance(fixed_header.fixed_header_len);

        let flags = read_u8(&mut bytes)?;
        if flags & 0xFE != 0 {
            return Err(Error::IncorrectPacketFormat);
        }

        let code = connect_return(read_u8(&mut bytes)?)?;

        // a broker may leave out the property length when it has nothing to say
        let properties = match bytes.has_remaining() {
            true => Properties::read(&mut bytes)?,
            false => Properties::new(),
        };

        Ok(ConnAck {
            session_present: flags & 0x01 != 0,
            code,
            properties,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        let len = self.len();
        buffer.put_u8(0x20);
        let count = write_remaining_length(buffer, len)?;
        buffer.put_u8(self.session_present as u8);
        buffer.put_u8(self.code as u8);
        self.properties.write(buffer)?;

        Ok(1 + count + len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn connack_with_properties_is_parsed() {
        let mut stream = BytesMut::from(
            &[
                0x20, 0x09, // packet type, remaining len
                0x01, 0x00, // session present, success
                0x06, // properties len
                0x21, 0x00, 0x0A, // receive maximum
                0x13, 0x00, 0x3C, // server keep alive
            ][..],
        );

        let connack = Packet::read(&mut stream, 100).unwrap();
        let mut properties = Properties::new();
        properties.push(Property::ReceiveMaximum(10));
        properties.push(Property::ServerKeepAlive(60));

        assert_eq!(
            connack,
            Packet::ConnAck(ConnAck {
                session_present: true,
                code: ConnectReturnCode::Success,
                properties,
            })
        );
    }

    #[test]
    fn refusals_carry_their_reason() {
        let mut stream = BytesMut::from(&[0x20, 0x03, 0x00, 0x87, 0x00][..]);
        match Packet::read(&mut stream, 100).unwrap() {
            Packet::ConnAck(ack) => assert_eq!(ack.code, ConnectReturnCode::NotAuthorized),
            packet => panic!("Unexpected packet {packet:?}"),
        }

        let mut stream = BytesMut::from(&[0x20, 0x03, 0x00, 0x42, 0x00][..]);
        assert_eq!(
            Packet::read(&mut stream, 100),
            Err(Error::InvalidConnectReturnCode(0x42))
        );
    }
}
