use async_trait::async_trait;
use bytes::BytesMut;
use mqttengine::*;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{self, Instant};

/// Broker end of an in memory connection. Reads and writes raw packets
pub struct Broker {
    stream: DuplexStream,
    read: BytesMut,
}

impl Broker {
    fn new(stream: DuplexStream) -> Broker {
        Broker {
            stream,
            read: BytesMut::with_capacity(10 * 1024),
        }
    }

    /// Reads CONNECT and accepts it
    pub async fn accept(&mut self, session_present: bool) -> Connect {
        self.accept_with(ConnAck::new(ConnectReturnCode::Success, session_present))
            .await
    }

    /// Reads CONNECT and answers it with `connack`
    pub async fn accept_with(&mut self, connack: ConnAck) -> Connect {
        match self.read_packet().await {
            Packet::Connect(connect) => {
                self.write(Packet::ConnAck(connack)).await;
                connect
            }
            packet => panic!("Expecting connect packet. Received = {:?}", packet),
        }
    }

    /// Reads next packet from the stream. Panics when the client closed it
    pub async fn read_packet(&mut self) -> Packet {
        match self.read_event().await {
            Some(packet) => packet,
            None => panic!("Client closed the connection"),
        }
    }

    /// Next packet, or `None` once the client closed the stream. Gives up
    /// after an hour of (paused) time
    pub async fn read_event(&mut self) -> Option<Packet> {
        let read = time::timeout(Duration::from_secs(3600), async {
            loop {
                match Packet::read(&mut self.read, 1024 * 1024) {
                    Ok(packet) => return Some(packet),
                    Err(Error::InsufficientBytes(_)) => (),
                    Err(e) => panic!("Client sent garbage: {:?}", e),
                }

                let n = self.stream.read_buf(&mut self.read).await.ok()?;
                if n == 0 {
                    return None;
                }
            }
        });

        read.await.expect("Timeout waiting for the client")
    }

    /// Reads a publish and fails on anything else
    pub async fn read_publish(&mut self) -> Publish {
        match self.read_packet().await {
            Packet::Publish(publish) => publish,
            packet => panic!("Expecting a publish. Received = {:?}", packet),
        }
    }

    /// Reads a subscribe and grants every filter at its requested QoS
    pub async fn ack_subscribe(&mut self) -> Subscribe {
        match self.read_packet().await {
            Packet::Subscribe(subscribe) => {
                let codes = subscribe
                    .filters
                    .iter()
                    .map(|f| SubscribeReasonCode::Success(f.qos))
                    .collect();

                self.write(Packet::SubAck(SubAck::new(subscribe.pkid, codes)))
                    .await;
                subscribe
            }
            packet => panic!("Expecting a subscribe. Received = {:?}", packet),
        }
    }

    pub async fn write(&mut self, packet: Packet) {
        let bytes = encode(&packet).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }
}

/// Hands out queued in memory streams. Attempts with nothing queued are
/// refused
#[derive(Clone, Default)]
pub struct MockConnector {
    streams: Arc<Mutex<VecDeque<DuplexStream>>>,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl MockConnector {
    /// Queues a stream for the next connection attempt and returns the
    /// broker end of it
    pub fn broker(&self) -> Broker {
        let (client, broker) = duplex(64 * 1024);
        self.streams.lock().unwrap().push_back(client);
        Broker::new(broker)
    }

    /// When each connection attempt was made
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _config: &SessionConfig) -> Result<Box<dyn N>, TransportError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let stream = self.streams.lock().unwrap().pop_front();
        match stream {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no broker").into()),
        }
    }
}
