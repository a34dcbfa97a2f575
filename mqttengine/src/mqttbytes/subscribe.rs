use super::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Subscription packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<Filter>,
    pub properties: Properties,
}

impl Subscribe {
    pub fn new(pkid: u16, filters: Vec<Filter>) -> Subscribe {
        Subscribe {
            pkid,
            filters,
            properties: Properties::new(),
        }
    }

    fn len(&self) -> usize {
        let filters: usize = self.filters.iter().map(Filter::len).sum();
        2 + self.properties.size() + filters
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Subscribe, Error> {
        bytes.advance(fixed_header.fixed_header_len);

        let pkid = read_u16(&mut bytes)?;
        if pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        let properties = Properties::read(&mut bytes)?;
        let mut filters = Vec::new();
        while bytes.has_remaining() {
            filters.push(Filter::read(&mut bytes)?);
        }

        if filters.is_empty() {
            return Err(Error::EmptySubscription);
        }

        Ok(Subscribe {
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
        buffer.put_u8(0x82);
        let count = write_remaining_length(buffer, len)?;
        buffer.put_u16(self.pkid);
        self.properties.write(buffer)?;

        for filter in self.filters.iter() {
            filter.write(buffer)?;
        }

        Ok(1 + count + len)
    }
}

/// What the broker does with retained messages when the subscription is made
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetainForwardRule {
    #[default]
    OnEverySubscribe = 0,
    OnNewSubscribe = 1,
    Never = 2,
}

/// Subscription filter along with its options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub path: String,
    pub qos: QoS,
    pub nolocal: bool,
    pub preserve_retain: bool,
    pub retain_forward_rule: RetainForwardRule,
}

impl Filter {
    pub fn new<S: Into<String>>(path: S, qos: QoS) -> Filter {
        Filter {
            path: path.into(),
            qos,
            nolocal: false,
            preserve_retain: false,
            retain_forward_rule: RetainForwardRule::default(),
        }
    }

    fn len(&self) -> usize {
        // filter len + filter + options
        2 + self.path.len() + 1
    }

    fn read(bytes: &mut Bytes) -> Result<Filter, Error> {
        let path = read_mqtt_string(bytes)?;
        let options = read_u8(bytes)?;
        if options & 0b1100_0000 != 0 {
            return Err(Error::IncorrectPacketFormat);
        }

        let requested_qos = options & 0b0000_0011;
        let retain_forward_rule = match (options >> 4) & 0b0000_0011 {
            0 => RetainForwardRule::OnEverySubscribe,
            1 => RetainForwardRule::OnNewSubscribe,
            2 => RetainForwardRule::Never,
            r => return Err(Error::InvalidRetainForwardRule(r)),
        };

        Ok(Filter {
            path,
            qos: qos(requested_qos).ok_or(Error::InvalidQoS(requested_qos))?,
            nolocal: options & 0b0000_0100 != 0,
            preserve_retain: options & 0b0000_1000 != 0,
            retain_forward_rule,
        })
    }

    fn write(&self, buffer: &mut BytesMut) -> Result<(), Error> {
        let mut options = self.qos as u8;
        if self.nolocal {
            options |= 0b0000_0100;
        }

        if self.preserve_retain {
            options |= 0b0000_1000;
        }

        options |= (self.retain_forward_rule as u8) << 4;

        write_mqtt_string(buffer, &self.path)?;
        buffer.put_u8(options);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn subscribe_with_options_is_serialized() {
        let mut filter = Filter::new("a/+", QoS::AtLeastOnce);
        filter.nolocal = true;
        filter.retain_forward_rule = RetainForwardRule::OnNewSubscribe;

        let mut buffer = BytesMut::new();
        Subscribe::new(1, vec![filter]).write(&mut buffer).unwrap();
        assert_eq!(
            &buffer[..],
            &[
                0x82, 0x09, // packet type, remaining len
                0x00, 0x01, // pkid
                0x00, // properties
                0x00, 0x03, b'a', b'/', b'+', // filter
                0b0001_0101, // options
            ]
        );
    }

    #[test]
    fn subscribe_needs_a_filter() {
        let mut buffer = BytesMut::new();
        assert_eq!(
            Subscribe::new(1, vec![]).write(&mut buffer),
            Err(Error::EmptySubscription)
        );

        let mut stream = BytesMut::from(&[0x82, 0x03, 0x00, 0x01, 0x00][..]);
        assert_eq!(
            Packet::read(&mut stream, 100),
            Err(Error::EmptySubscription)
        );
    }

    #[test]
    fn qos_3_in_options_is_rejected() {
        let mut stream =
            BytesMut::from(&[0x82, 0x07, 0x00, 0x01, 0x00, 0x00, 0x01, b'a', 0x03][..]);
        assert_eq!(Packet::read(&mut stream, 100), Err(Error::InvalidQoS(3)));
    }
}
