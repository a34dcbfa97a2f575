use super::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Publish packet
#[derive(Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Only on the wire for QoS 1 and 2
    pub pkid: u16,
    pub properties: Properties,
    pub payload: Bytes,
}

impl Publish {
    pub fn new<S: Into<String>, P: Into<Bytes>>(topic: S, qos: QoS, payload: P) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            pkid: 0,
            properties: Properties::new(),
            payload: payload.into(),
        }
    }

    fn len(&self) -> usize {
        let mut len = 2 + self.topic.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }

        len + self.properties.size() + self.payload.len()
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Publish, Error> {
        let qos_num = (fixed_header.byte1 & 0b0110) >> 1;
        let qos = qos(qos_num).ok_or(Error::InvalidQoS(qos_num))?;
        let dup = (fixed_header.byte1 & 0b1000) != 0;
        let retain = (fixed_header.byte1 & 0b0001) != 0;

        bytes.advance(fixed_header.fixed_header_len);
        let topic = read_mqtt_string(&mut bytes)?;

        // Packet identifier exists where QoS > 0
        let pkid = match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce | QoS::ExactlyOnce => read_u16(&mut bytes)?,
        };

        if qos != QoS::AtMostOnce && pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        let properties = Properties::read(&mut bytes)?;
        let publish = Publish {
            dup,
            qos,
            retain,
            topic,
            pkid,
            properties,
            payload: bytes,
        };

        Ok(publish)
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        match self.qos {
            QoS::AtMostOnce if self.pkid != 0 => return Err(Error::PacketIdOnQoS0(self.pkid)),
            QoS::AtLeastOnce | QoS::ExactlyOnce if self.pkid == 0 => {
                return Err(Error::PacketIdZero)
            }
            _ => (),
        }

        let len = self.len();
        let byte1 = 0b0011_0000
            | (self.dup as u8) << 3
            | (self.qos as u8) << 1
            | self.retain as u8;

        buffer.put_u8(byte1);
        let count = write_remaining_length(buffer, len)?;
        write_mqtt_string(buffer, &self.topic)?;

        if self.qos != QoS::AtMostOnce {
            buffer.put_u16(self.pkid);
        }

        self.properties.write(buffer)?;
        buffer.extend_from_slice(&self.payload);

        Ok(1 + count + len)
    }
}

impl std::fmt::Debug for Publish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Topic = {}, Qos = {:?}, Retain = {}, Pkid = {:?}, Dup = {}, Payload Size = {}",
            self.topic,
            self.qos,
            self.retain,
            self.pkid,
            self.dup,
            self.payload.len()
        )
    }
}
