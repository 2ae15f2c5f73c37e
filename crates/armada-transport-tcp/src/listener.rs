use std::net::SocketAddr;

use armada_core::error::TransportError;
use armada_core::traits::Listener;
use tokio::net::TcpListener as TokioTcpListener;

use crate::config::TcpConfig;
use crate::transport::TcpTransport;

pub struct TcpListener {
    inner: TokioTcpListener,
    config: TcpConfig,
}

impl TcpListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::bind_with_config(addr, TcpConfig::default()).await
    }

    pub async fn bind_with_config(
        addr: SocketAddr,
        config: TcpConfig,
    ) -> Result<Self, TransportError> {
        let inner = TokioTcpListener::bind(addr).await?;
        Ok(Self { inner, config })
    }

    #[must_use]
    pub const fn config(&self) -> &TcpConfig {
        &self.config
    }
}

impl Listener for TcpListener {
    type Transport = TcpTransport;

    async fn accept(&self) -> Result<(Self::Transport, SocketAddr), TransportError> {
        let (stream, addr) = self.inner.accept().await?;

        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }

        Ok((TcpTransport::with_config(stream, self.config.clone()), addr))
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner.local_addr().map_err(TransportError::from)
    }
}

impl std::fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListener")
            .field("local_addr", &self.inner.local_addr())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use armada_core::traits::FramedTransport;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn bind_and_accept() {
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().expect("parse");
        let listener = TcpListener::bind(bind_addr).await.expect("failed to bind");
        let addr = listener.local_addr().expect("failed to get local addr");
        assert_ne!(addr.port(), 0);

        let handle =
            tokio::spawn(async move { TcpStream::connect(addr).await.expect("failed to connect") });

        let (transport, peer_addr) = listener.accept().await.expect("failed to accept");
        assert_eq!(peer_addr.ip(), std::net::IpAddr::from([127, 0, 0, 1]));

        let client_stream = handle.await.expect("client task failed");
        let client_transport = TcpTransport::new(client_stream);

        client_transport
            .send_frame(b"{}")
            .await
            .expect("failed to send");

        let received = transport.recv_frame().await.expect("failed to recv");
        assert_eq!(&received, b"{}");
    }
}
