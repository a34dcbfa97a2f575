use super::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Unsubscribe packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub filters: Vec<String>,
    pub properties: Properties,
}

impl Unsubscribe {
    pub fn new(pkid: u16, filters: Vec<String>) -> Unsubscribe {
        Unsubscribe {
            pkid,
            filters,
            properties: Properties::new(),
        }
    }

    fn len(&self) -> usize {
        let filters: usize = self.filters.iter().map(|f| 2 + f.len()).sum();
        2 + self.properties.size() + filters
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Unsubscribe, Error> {
        bytes.advance(fixed_header.fixed_header_len);

        let pkid = read_u16(&mut bytes)?;
        if pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        let properties = Properties::read(&mut bytes)?;
        let mut filters = Vec::new();
        while bytes.has_remaining() {
            filters.push(read_mqtt_string(&mut bytes)?);
        }

        if filters.is_empty() {
            return Err(Error::EmptySubscription);
        }

        Ok(Unsubscribe {
            pkid,
            filters,
            properties,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        if self.filters.is_empty() {
            return Err(Error::EmptySubscription);
        }

        if self.pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        let len = self.len();
        buffer.put_u8(0xA2);
        let count = write_remaining_length(buffer, len)?;
        buffer.put_u16(self.pkid);
        self.properties.write(buffer)?;

        for filter in self.filters.iter() {
            write_mqtt_string(buffer, filter)?;
        }

        Ok(1 + count + len)
    }
}
