use super::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropertyType {
    PayloadFormatIndicator = 1,
    MessageExpiryInterval = 2,
    ContentType = 3,
    ResponseTopic = 8,
    CorrelationData = 9,
    SubscriptionIdentifier = 11,
    SessionExpiryInterval = 17,
    AssignedClientIdentifier = 18,
    ServerKeepAlive = 19,
    AuthenticationMethod = 21,
    AuthenticationData = 22,
    RequestProblemInformation = 23,
    WillDelayInterval = 24,
    RequestResponseInformation = 25,
    ResponseInformation = 26,
    ServerReference = 28,
    ReasonString = 31,
    ReceiveMaximum = 33,
    TopicAliasMaximum = 34,
    TopicAlias = 35,
    MaximumQos = 36,
    RetainAvailable = 37,
    UserProperty = 38,
    MaximumPacketSize = 39,
    WildcardSubscriptionAvailable = 40,
    SubscriptionIdentifierAvailable = 41,
    SharedSubscriptionAvailable = 42,
}

fn property(num: u8) -> Result<PropertyType, Error> {
    let property = match num {
        1 => PropertyType::PayloadFormatIndicator,
        2 => PropertyType::MessageExpiryInterval,
        3 => PropertyType::ContentType,
        8 => PropertyType::ResponseTopic,
        9 => PropertyType::CorrelationData,
        11 => PropertyType::SubscriptionIdentifier,
        17 => PropertyType::SessionExpiryInterval,
        18 => PropertyType::AssignedClientIdentifier,
        19 => PropertyType::ServerKeepAlive,
        21 => PropertyType::AuthenticationMethod,
        22 => PropertyType::AuthenticationData,
        23 => PropertyType::RequestProblemInformation,
        24 => PropertyType::WillDelayInterval,
        25 => PropertyType::RequestResponseInformation,
        26 => PropertyType::ResponseInformation,
        28 => PropertyType::ServerReference,
        31 => PropertyType::ReasonString,
        33 => PropertyType::ReceiveMaximum,
        34 => PropertyType::TopicAliasMaximum,
        35 => PropertyType::TopicAlias,
        36 => PropertyType::MaximumQos,
        37 => PropertyType::RetainAvailable,
        38 => PropertyType::UserProperty,
        39 => PropertyType::MaximumPacketSize,
        40 => PropertyType::WildcardSubscriptionAvailable,
        41 => PropertyType::SubscriptionIdentifierAvailable,
        42 => PropertyType::SharedSubscriptionAvailable,
        num => return Err(Error::InvalidPropertyType(num)),
    };

    Ok(property)
}

/// A single MQTT 5 property. Which properties are meaningful depends on the
/// packet carrying them; the codec doesn't police that
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(String),
    ResponseTopic(String),
    CorrelationData(Bytes),
    SubscriptionIdentifier(usize),
    SessionExpiryInterval(u32),
    AssignedClientIdentifier(String),
    ServerKeepAlive(u16),
    AuthenticationMethod(String),
    AuthenticationData(Bytes),
    RequestProblemInformation(u8),
    WillDelayInterval(u32),
    RequestResponseInformation(u8),
    ResponseInformation(String),
    ServerReference(String),
    ReasonString(String),
    ReceiveMaximum(u16),
    TopicAliasMaximum(u16),
    TopicAlias(u16),
    MaximumQos(u8),
    RetainAvailable(u8),
    UserProperty(String, String),
    MaximumPacketSize(u32),
    WildcardSubscriptionAvailable(u8),
    SubscriptionIdentifierAvailable(u8),
    SharedSubscriptionAvailable(u8),
}

impl Property {
    fn property_type(&self) -> PropertyType {
        match self {
            Property::PayloadFormatIndicator(_) => PropertyType::PayloadFormatIndicator,
            Property::MessageExpiryInterval(_) => PropertyType::MessageExpiryInterval,
            Property::ContentType(_) => PropertyType::ContentType,
            Property::ResponseTopic(_) => PropertyType::ResponseTopic,
            Property::CorrelationData(_) => PropertyType::CorrelationData,
            Property::SubscriptionIdentifier(_) => PropertyType::SubscriptionIdentifier,
            Property::SessionExpiryInterval(_) => PropertyType::SessionExpiryInterval,
            Property::AssignedClientIdentifier(_) => PropertyType::AssignedClientIdentifier,
            Property::ServerKeepAlive(_) => PropertyType::ServerKeepAlive,
            Property::AuthenticationMethod(_) => PropertyType::AuthenticationMethod,
            Property::AuthenticationData(_) => PropertyType::AuthenticationData,
            Property::RequestProblemInformation(_) => PropertyType::RequestProblemInformation,
            Property::WillDelayInterval(_) => PropertyType::WillDelayInterval,
            Property::RequestResponseInformation(_) => PropertyType::RequestResponseInformation,
            Property::ResponseInformation(_) => PropertyType::ResponseInformation,
            Property::ServerReference(_) => PropertyType::ServerReference,
            Property::ReasonString(_) => PropertyType::ReasonString,
            Property::ReceiveMaximum(_) => PropertyType::ReceiveMaximum,
            Property::TopicAliasMaximum(_) => PropertyType::TopicAliasMaximum,
            Property::TopicAlias(_) => PropertyType::TopicAlias,
            Property::MaximumQos(_) => PropertyType::MaximumQos,
            Property::RetainAvailable(_) => PropertyType::RetainAvailable,
            Property::UserProperty(..) => PropertyType::UserProperty,
            Property::MaximumPacketSize(_) => PropertyType::MaximumPacketSize,
            Property::WildcardSubscriptionAvailable(_) => {
                PropertyType::WildcardSubscriptionAvailable
            }
            Property::SubscriptionIdentifierAvailable(_) => {
                PropertyType::SubscriptionIdentifierAvailable
            }
            Property::SharedSubscriptionAvailable(_) => PropertyType::SharedSubscriptionAvailable,
        }
    }

    /// Identifier byte plus value
    fn len(&self) -> usize {
        let value = match self {
            Property::PayloadFormatIndicator(_)
            | Property::RequestProblemInformation(_)
            | Property::RequestResponseInformation(_)
            | Property::MaximumQos(_)
            | Property::RetainAvailable(_)
            | Property::WildcardSubscriptionAvailable(_)
            | Property::SubscriptionIdentifierAvailable(_)
            | Property::SharedSubscriptionAvailable(_) => 1,
            Property::ServerKeepAlive(_)
            | Property::ReceiveMaximum(_)
            | Property::TopicAliasMaximum(_)
            | Property::TopicAlias(_) => 2,
            Property::MessageExpiryInterval(_)
            | Property::SessionExpiryInterval(_)
            | Property::WillDelayInterval(_)
            | Property::MaximumPacketSize(_) => 4,
            Property::SubscriptionIdentifier(id) => len_len(*id),
            Property::ContentType(s)
            | Property::ResponseTopic(s)
            | Property::AssignedClientIdentifier(s)
            | Property::AuthenticationMethod(s)
            | Property::ResponseInformation(s)
            | Property::ServerReference(s)
            | Property::ReasonString(s) => 2 + s.len(),
            Property::CorrelationData(b) | Property::AuthenticationData(b) => 2 + b.len(),
            Property::UserProperty(key, value) => 2 + key.len() + 2 + value.len(),
        };

        1 + value
    }

    fn read(bytes: &mut Bytes) -> Result<Property, Error> {
        let property = match property(read_u8(bytes)?)? {
            PropertyType::PayloadFormatIndicator => {
                Property::PayloadFormatIndicator(read_u8(bytes)?)
            }
            PropertyType::MessageExpiryInterval => {
                Property::MessageExpiryInterval(read_u32(bytes)?)
            }
            PropertyType::ContentType => Property::ContentType(read_mqtt_string(bytes)?),
            PropertyType::ResponseTopic => Property::ResponseTopic(read_mqtt_string(bytes)?),
            PropertyType::CorrelationData => Property::CorrelationData(read_mqtt_bytes(bytes)?),
            PropertyType::SubscriptionIdentifier => {
                Property::SubscriptionIdentifier(read_varint(bytes)?)
            }
            PropertyType::SessionExpiryInterval => {
                Property::SessionExpiryInterval(read_u32(bytes)?)
            }
            PropertyType::AssignedClientIdentifier => {
                Property::AssignedClientIdentifier(read_mqtt_string(bytes)?)
            }
            PropertyType::ServerKeepAlive => Property::ServerKeepAlive(read_u16(bytes)?),
            PropertyType::AuthenticationMethod => {
                Property::AuthenticationMethod(read_mqtt_string(bytes)?)
            }
            PropertyType::AuthenticationData => {
                Property::AuthenticationData(read_mqtt_bytes(bytes)?)
            }
            PropertyType::RequestProblemInformation => {
                Property::RequestProblemInformation(read_u8(bytes)?)
            }
            PropertyType::WillDelayInterval => Property::WillDelayInterval(read_u32(bytes)?),
            PropertyType::RequestResponseInformation => {
                Property::RequestResponseInformation(read_u8(bytes)?)
            }
            PropertyType::ResponseInformation => {
                Property::ResponseInformation(read_mqtt_string(bytes)?)
            }
            PropertyType::ServerReference => {
                Property::ServerReference(read_mqtt_string(bytes)?)
            }
            PropertyType::ReasonString => Property::ReasonString(read_mqtt_string(bytes)?),
            PropertyType::ReceiveMaximum => Property::ReceiveMaximum(read_u16(bytes)?),
            PropertyType::TopicAliasMaximum => Property::TopicAliasMaximum(read_u16(bytes)?),
            PropertyType::TopicAlias => Property::TopicAlias(read_u16(bytes)?),
            PropertyType::MaximumQos => Property::MaximumQos(read_u8(bytes)?),
            PropertyType::RetainAvailable => Property::RetainAvailable(read_u8(bytes)?),
            PropertyType::UserProperty => {
                let key = read_mqtt_string(bytes)?;
                let value = read_mqtt_string(bytes)?;
                Property::UserProperty(key, value)
            }
            PropertyType::MaximumPacketSize => Property::MaximumPacketSize(read_u32(bytes)?),
            PropertyType::WildcardSubscriptionAvailable => {
                Property::WildcardSubscriptionAvailable(read_u8(bytes)?)
            }
            PropertyType::SubscriptionIdentifierAvailable => {
                Property::SubscriptionIdentifierAvailable(read_u8(bytes)?)
            }
            PropertyType::SharedSubscriptionAvailable => {
                Property::SharedSubscriptionAvailable(read_u8(bytes)?)
            }
        };

        Ok(property)
    }

    fn write(&self, buffer: &mut BytesMut) -> Result<(), Error> {
        buffer.put_u8(self.property_type() as u8);
        match self {
            Property::PayloadFormatIndicator(v)
            | Property::RequestProblemInformation(v)
            | Property::RequestResponseInformation(v)
            | Property::MaximumQos(v)
            | Property::RetainAvailable(v)
            | Property::WildcardSubscriptionAvailable(v)
            | Property::SubscriptionIdentifierAvailable(v)
            | Property::SharedSubscriptionAvailable(v) => buffer.put_u8(*v),
            Property::ServerKeepAlive(v)
            | Property::ReceiveMaximum(v)
            | Property::TopicAliasMaximum(v)
            | Property::TopicAlias(v) => buffer.put_u16(*v),
            Property::MessageExpiryInterval(v)
            | Property::SessionExpiryInterval(v)
            | Property::WillDelayInterval(v)
            | Property::MaximumPacketSize(v) => buffer.put_u32(*v),
            Property::SubscriptionIdentifier(id) => {
                write_remaining_length(buffer, *id)?;
            }
            Property::ContentType(s)
            | Property::ResponseTopic(s)
            | Property::AssignedClientIdentifier(s)
            | Property::AuthenticationMethod(s)
            | Property::ResponseInformation(s)
            | Property::ServerReference(s)
            | Property::ReasonString(s) => write_mqtt_string(buffer, s)?,
            Property::CorrelationData(b) | Property::AuthenticationData(b) => {
                write_mqtt_bytes(buffer, b)?
            }
            Property::UserProperty(key, value) => {
                write_mqtt_string(buffer, key)?;
                write_mqtt_string(buffer, value)?;
            }
        }

        Ok(())
    }
}

/// Ordered list of properties of a packet. User properties may repeat
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(Vec<Property>);

impl Properties {
    pub fn new() -> Properties {
        Properties(Vec::new())
    }

    pub fn push(&mut self, property: Property) {
        self.0.push(property);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Property> {
        self.0.iter()
    }

    pub fn reason_string(&self) -> Option<&str> {
        self.iter().find_map(|p| match p {
            Property::ReasonString(reason) => Some(reason.as_str()),
            _ => None,
        })
    }

    pub fn server_keep_alive(&self) -> Option<u16> {
        self.iter().find_map(|p| match p {
            Property::ServerKeepAlive(keep_alive) => Some(*keep_alive),
            _ => None,
        })
    }

    pub fn receive_maximum(&self) -> Option<u16> {
        self.iter().find_map(|p| match p {
            Property::ReceiveMaximum(max) => Some(*max),
            _ => None,
        })
    }

    pub fn assigned_client_identifier(&self) -> Option<&str> {
        self.iter().find_map(|p| match p {
            Property::AssignedClientIdentifier(id) => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter_map(|p| match p {
            Property::UserProperty(key, value) => Some((key.as_str(), value.as_str())),
            _ => None,
        })
    }

    /// Length of all the properties, without the length prefix
    fn len(&self) -> usize {
        self.iter().map(Property::len).sum()
    }

    /// Length of all the properties, with the length prefix
    pub(crate) fn size(&self) -> usize {
        let len = self.len();
        len_len(len) + len
    }

    /// Reads a length prefixed property block. Properties are parsed out of
    /// the declared span only, so a property running past the block (or a
    /// block running past the packet) is an error
    pub(crate) fn read(bytes: &mut Bytes) -> Result<Properties, Error> {
        let properties_len = read_varint(bytes)?;
        if properties_len > bytes.len() {
            return Err(Error::BoundaryCrossed(properties_len));
        }

        let mut block = bytes.split_to(properties_len);
        let mut properties = Vec::new();
        while block.has_remaining() {
            properties.push(Property::read(&mut block)?);
        }

        Ok(Properties(properties))
    }

    pub(crate) fn write(&self, buffer: &mut BytesMut) -> Result<(), Error> {
        write_remaining_length(buffer, self.len())?;
        for property in self.iter() {
            property.write(buffer)?;
        }

        Ok(())
    }
}

impl From<Vec<Property>> for Properties {
    fn from(properties: Vec<Property>) -> Properties {
        Properties(properties)
    }
}

impl FromIterator<Property> for Properties {
    fn from_iter<I: IntoIterator<Item = Property>>(iter: I) -> Properties {
        Properties(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn block_with_mixed_properties_is_parsed_in_order() {
        let properties: Properties = vec![
            Property::ServerKeepAlive(10),
            Property::UserProperty("a".to_owned(), "1".to_owned()),
            Property::SubscriptionIdentifier(300),
            Property::UserProperty("a".to_owned(), "2".to_owned()),
            Property::CorrelationData(Bytes::from_static(b"\x00\x01")),
        ]
        .into();

        let mut buffer = BytesMut::new();
        properties.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), properties.size());

        let mut bytes = buffer.freeze();
        let read = Properties::read(&mut bytes).unwrap();
        assert_eq!(read, properties);
        assert_eq!(read.server_keep_alive(), Some(10));
        assert_eq!(
            read.user_properties().collect::<Vec<_>>(),
            vec![("a", "1"), ("a", "2")]
        );
    }

    #[test]
    fn declared_length_longer_than_packet_is_rejected() {
        // says 10 bytes of properties, carries 3
        let mut bytes = Bytes::from_static(&[0x0A, 0x13, 0x00, 0x0A]);
        assert_eq!(Properties::read(&mut bytes), Err(Error::BoundaryCrossed(10)));
    }

    #[test]
    fn property_running_past_declared_length_is_rejected() {
        // block of 2 bytes holding a 4 byte session expiry interval
        let mut bytes = Bytes::from_static(&[0x02, 0x11, 0x00, 0x00, 0x00, 0x10]);
        assert_eq!(Properties::read(&mut bytes), Err(Error::MalformedPacket));

        // reason string whose length crosses the block
        let mut bytes = Bytes::from_static(&[0x04, 0x1F, 0x00, 0x05, b'x', b'y', b'z']);
        assert_eq!(Properties::read(&mut bytes), Err(Error::BoundaryCrossed(5)));
    }

    #[test]
    fn unknown_property_identifier_is_rejected() {
        let mut bytes = Bytes::from_static(&[0x02, 0x04, 0x00]);
        assert_eq!(Properties::read(&mut bytes), Err(Error::InvalidPropertyType(4)));
    }
}
