use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::{mqttbytes, SessionConfig, Transport};

use std::io;

/// Errors of the byte pipe underneath the session
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
    #[error("TLS handshake: {0}")]
    TlsHandshake(#[from] crate::tls::Error),
    #[error("Malformed packet: {0}")]
    MalformedPacket(mqttbytes::Error),
    #[error("Packet can't be encoded: {0}")]
    Encoding(mqttbytes::Error),
    #[error("Connection closed by peer")]
    ConnectionClosed,
}

/// Any byte stream the session can run over
pub trait N: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T> N for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

/// Opens the byte stream for a connection attempt. The eventloop calls this
/// for the first connection and for every reconnection
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn N>, TransportError>;
}

/// Plain TCP, wrapped in TLS when the configuration asks for it
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn N>, TransportError> {
        let (host, port) = config.broker_address();
        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true)?;

        let network: Box<dyn N> = match config.transport() {
            Transport::Tcp => Box::new(tcp),
            #[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
            Transport::Tls(tls_config) => crate::tls::tls_connect(&host, &tls_config, tcp).await?,
        };

        debug!("Transport to {}:{} is open", host, port);
        Ok(network)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_connector_reaches_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[0xC0, 0x00]).await.unwrap();
        });

        let config = SessionConfig::new("t1", "127.0.0.1", port);
        let mut stream = TcpConnector.connect(&config).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xC0, 0x00]);
    }

    #[tokio::test]
    async fn refused_connections_are_io_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = SessionConfig::new("t1", "127.0.0.1", port);
        let e = TcpConnector.connect(&config).await.err().unwrap();
        assert!(matches!(e, TransportError::Io(_)));
    }
}
