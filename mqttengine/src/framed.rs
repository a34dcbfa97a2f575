use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::mqttbytes::{self, Packet};
use crate::network::{TransportError, N};

use std::io;

/// Splits a stream into the reading end, which the reader task owns, and the
/// writing end, which stays with the eventloop
pub fn split(
    socket: Box<dyn N>,
    max_incoming_size: usize,
    max_outgoing_size: usize,
) -> (FrameReader, Network) {
    let (read, write) = tokio::io::split(socket);
    let reader = FrameReader {
        socket: read,
        read: BytesMut::with_capacity(10 * 1024),
        max_incoming_size,
    };

    let network = Network {
        socket: write,
        write: BytesMut::with_capacity(10 * 1024),
        max_outgoing_size,
    };

    (reader, network)
}

/// Buffers reads until the codec can cut a whole packet out of them
pub struct FrameReader {
    socket: ReadHalf<Box<dyn N>>,
    /// Buffered reads. Partial frames stay here across reads
    read: BytesMut,
    /// Maximum packet size
    max_incoming_size: usize,
}

impl FrameReader {
    /// Next packet on the stream. Any error is terminal for the stream
    pub async fn read(&mut self) -> Result<Packet, TransportError> {
        loop {
            match Packet::read(&mut self.read, self.max_incoming_size) {
                Ok(packet) => {
                    trace!("Incoming = {:?}", packet.packet_type());
                    return Ok(packet);
                }
                Err(mqttbytes::Error::InsufficientBytes(_)) => (),
                Err(e) => return Err(TransportError::MalformedPacket(e)),
            }

            // read more bytes until a frame can be created. This function
            // suspends until a frame can be created
            let read = self.socket.read_buf(&mut self.read).await?;
            if 0 == read {
                return if self.read.is_empty() {
                    Err(TransportError::ConnectionClosed)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "connection closed in the middle of a packet",
                    )
                    .into())
                };
            }
        }
    }
}

/// Writing end of the connection
pub struct Network {
    socket: WriteHalf<Box<dyn N>>,
    /// Buffered writes
    write: BytesMut,
    /// Maximum packet size
    max_outgoing_size: usize,
}

impl Network {
    /// Encodes and sends a packet. Nothing reaches the socket when the
    /// packet can't be encoded or is larger than the outgoing limit
    pub async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.write.clear();
        let size = packet
            .write(&mut self.write)
            .map_err(TransportError::Encoding)?;

        if size > self.max_outgoing_size {
            self.write.clear();
            return Err(TransportError::Encoding(
                mqttbytes::Error::OutgoingPacketTooLarge {
                    pkt_size: size,
                    max: self.max_outgoing_size,
                },
            ));
        }

        trace!("Outgoing = {:?}, size = {}", packet.packet_type(), size);
        self.socket.write_all(&self.write[..]).await?;
        self.socket.flush().await?;
        self.write.clear();
        Ok(())
    }

    /// Shuts the writing side down. Errors don't matter at this point
    pub async fn close(mut self) {
        if let Err(e) = self.socket.shutdown().await {
            debug!("Shutdown error = {:?}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mqttbytes::*;
    use matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frames_split_across_reads_are_reassembled() {
        let (client, mut broker) = duplex(1024);
        let (mut reader, _network) = split(Box::new(client), 1024, 1024);

        let bytes = encode(&Packet::PubAck(PubAck::new(10))).unwrap();
        let publish = encode(&Packet::Publish(Publish::new("a/b", QoS::AtMostOnce, "hello"))).unwrap();

        let task = tokio::spawn(async move {
            broker.write_all(&bytes[..1]).await.unwrap();
            tokio::task::yield_now().await;
            broker.write_all(&bytes[1..]).await.unwrap();
            broker.write_all(&publish).await.unwrap();
            broker
        });

        assert_eq!(reader.read().await.unwrap(), Packet::PubAck(PubAck::new(10)));
        assert_matches!(reader.read().await.unwrap(), Packet::Publish(_));
        drop(task.await.unwrap());
        assert_matches!(reader.read().await, Err(TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn garbage_is_reported_as_malformed() {
        let (client, mut broker) = duplex(1024);
        let (mut reader, _network) = split(Box::new(client), 1024, 1024);

        broker.write_all(&[0x00, 0x00]).await.unwrap();
        assert_matches!(
            reader.read().await,
            Err(TransportError::MalformedPacket(Error::InvalidPacketType(0)))
        );
    }

    #[tokio::test]
    async fn oversized_packets_never_reach_the_wire() {
        let (client, mut broker) = duplex(1024);
        let (_reader, mut network) = split(Box::new(client), 1024, 16);

        let publish = Publish::new("a/b", QoS::AtMostOnce, vec![0; 64]);
        assert_matches!(
            network.send(&Packet::Publish(publish)).await,
            Err(TransportError::Encoding(Error::OutgoingPacketTooLarge { max: 16, .. }))
        );

        network.send(&Packet::PingReq(PingReq)).await.unwrap();
        let mut buf = [0u8; 2];
        broker.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xC0, 0x00]);
    }
}
