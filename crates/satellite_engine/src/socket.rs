//! Transport sockets for the replication client.

use crate::config::ClientOptions;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream.
pub trait SocketStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SocketStream for T {}

/// A boxed socket as handed to the client.
pub type BoxedSocket = Box<dyn SocketStream>;

/// Opens transport connections to the replication server.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Opens a new connection.
    async fn connect(&self, opts: &ClientOptions) -> io::Result<BoxedSocket>;
}

/// Plain TCP connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSocketFactory;

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn connect(&self, opts: &ClientOptions) -> io::Result<BoxedSocket> {
        let stream = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_factory_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut socket = TcpSocketFactory
            .connect(&ClientOptions::new("127.0.0.1", port))
            .await
            .unwrap();
        socket.write_all(b"ping").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(TcpSocketFactory
            .connect(&ClientOptions::new("127.0.0.1", port))
            .await
            .is_err());
    }
}
