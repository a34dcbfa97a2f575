use super::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 5;

/// Connection packet initiated by the client
///
/// Username and password are independent: each flag is set only when its
/// field is present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Mqtt keep alive time
    pub keep_alive: u16,
    /// Client Id
    pub client_id: String,
    /// Clean session. Asks the broker to clear previous state
    pub clean_start: bool,
    pub properties: Properties,
    /// Will that broker needs to publish when the client disconnects
    pub last_will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub fn new<S: Into<String>>(id: S) -> Connect {
        Connect {
            keep_alive: 10,
            client_id: id.into(),
            clean_start: true,
            properties: Properties::new(),
            last_will: None,
            username: None,
            password: None,
        }
    }

    fn len(&self) -> usize {
        // protocol name, level, connect flags and keep alive
        let mut len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;
        len += self.properties.size();
        len += 2 + self.client_id.len();

        if let Some(will) = &self.last_will {
            len += will.len();
        }

        if let Some(username) = &self.username {
            len += 2 + username.len();
        }

        if let Some(password) = &self.password {
            len += 2 + password.len();
        }

        len
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.clean_start {
            flags |= 0x02;
        }

        if let Some(will) = &self.last_will {
            flags |= 0x04 | (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }

        if self.password.is_some() {
            flags |= 0x40;
        }

        if self.username.is_some() {
            flags |= 0x80;
        }

        flags
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Connect, Error> {
        bytes.advance(fixed_header.fixed_header_len);

        let protocol_name = read_mqtt_string(&mut bytes)?;
        if protocol_name != PROTOCOL_NAME {
            return Err(Error::InvalidProtocol);
        }

        let protocol_level = read_u8(&mut bytes)?;
        if protocol_level != PROTOCOL_LEVEL {
            return Err(Error::InvalidProtocolLevel(protocol_level));
        }

        let flags = read_u8(&mut bytes)?;
        if flags & 0x01 != 0 {
            return Err(Error::IncorrectPacketFormat);
        }

        let keep_alive = read_u16(&mut bytes)?;
        let properties = Properties::read(&mut bytes)?;
        let client_id = read_mqtt_string(&mut bytes)?;
        let last_will = LastWill::read(flags, &mut bytes)?;

        let username = match flags & 0x80 {
            0 => None,
            _ => Some(read_mqtt_string(&mut bytes)?),
        };

        let password = match flags & 0x40 {
            0 => None,
            _ => Some(read_mqtt_bytes(&mut bytes)?),
        };

        Ok(Connect {
            keep_alive,
            client_id,
            clean_start: flags & 0x02 != 0,
            properties,
            last_will,
            username,
            password,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        let len = self.len();
        buffer.put_u8(0b0001_0000);
        let count = write_remaining_length(buffer, len)?;

        write_mqtt_string(buffer, PROTOCOL_NAME)?;
        buffer.put_u8(PROTOCOL_LEVEL);
        buffer.put_u8(self.flags());
        buffer.put_u16(self.keep_alive);
        self.properties.write(buffer)?;
        write_mqtt_string(buffer, &self.client_id)?;

        if let Some(will) = &self.last_will {
            will.write(buffer)?;
        }

        if let Some(username) = &self.username {
            write_mqtt_string(buffer, username)?;
        }

        if let Some(password) = &self.password {
            write_mqtt_bytes(buffer, password)?;
        }

        Ok(1 + count + len)
    }
}

/// LastWill that broker forwards on behalf of the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

impl LastWill {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> LastWill {
        LastWill {
            topic: topic.into(),
            message: payload.into(),
            qos,
            retain,
            properties: Properties::new(),
        }
    }

    fn len(&self) -> usize {
        self.properties.size() + 2 + self.topic.len() + 2 + self.message.len()
    }

    fn read(connect_flags: u8, bytes: &mut Bytes) -> Result<Option<LastWill>, Error> {
        if connect_flags & 0x04 == 0 {
            // will qos and retain have to be zero without a will
            if connect_flags & 0x38 != 0 {
                return Err(Error::IncorrectPacketFormat);
            }

            return Ok(None);
        }

        let properties = Properties::read(bytes)?;
        let topic = read_mqtt_string(bytes)?;
        let message = read_mqtt_bytes(bytes)?;
        let will_qos = (connect_flags & 0x18) >> 3;
        let qos = qos(will_qos).ok_or(Error::InvalidQoS(will_qos))?;

        Ok(Some(LastWill {
            topic,
            message,
            qos,
            retain: connect_flags & 0x20 != 0,
            properties,
        }))
    }

    fn write(&self, buffer: &mut BytesMut) -> Result<(), Error> {
        self.properties.write(buffer)?;
        write_mqtt_string(buffer, &self.topic)?;
        write_mqtt_bytes(buffer, &self.message)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn connect_is_serialized_with_v5_header_and_flags() {
        let mut connect = Connect::new("t1");
        connect.keep_alive = 30;
        connect.username = Some("u".to_owned());

        let mut buffer = BytesMut::new();
        connect.write(&mut buffer).unwrap();

        assert_eq!(
            &buffer[..],
            &[
                0x10, 18, // packet type, remaining len
                0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
                0x05, // protocol level
                0b1000_0010, // username and clean start
                0x00, 0x1E, // keep alive
                0x00, // properties
                0x00, 0x02, b't', b'1', // client id
                0x00, 0x01, b'u', // username
            ]
        );
    }

    #[test]
    fn password_without_username_only_sets_password_flag() {
        let mut connect = Connect::new("t1");
        connect.password = Some(Bytes::from_static(b"pw"));
        assert_eq!(connect.flags(), 0b0100_0010);

        let bytes = encode(&Packet::Connect(connect.clone())).unwrap();
        assert_eq!(decode(&bytes, 100).unwrap().0, Packet::Connect(connect));
    }

    #[test]
    fn will_flags_without_a_will_are_malformed() {
        let mut connect = Connect::new("t1");
        connect.clean_start = false;
        let mut buffer = BytesMut::new();
        connect.write(&mut buffer).unwrap();

        // will retain set, will flag unset
        buffer[9] = 0x20;
        assert_eq!(
            Packet::read(&mut buffer, 100),
            Err(Error::IncorrectPacketFormat)
        );
    }

    #[test]
    fn older_protocol_levels_are_rejected() {
        let mut buffer = BytesMut::new();
        Connect::new("t1").write(&mut buffer).unwrap();
        buffer[8] = 4;
        assert_eq!(
            Packet::read(&mut buffer, 100),
            Err(Error::InvalidProtocolLevel(4))
        );
    }
}
