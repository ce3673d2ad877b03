//! Injectable TCP seams used by the tunnel manager, so local/reverse
//! forwarding can be tested against loopback fakes instead of real sockets.

use crate::error::{AgentShellError, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream, the common shape of a TCP connection or an
/// SSH-channel-backed stream.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

#[async_trait]
pub trait NetworkDialer: Send + Sync + std::fmt::Debug {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Stream>>;
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<(Box<dyn Stream>, String)>;
    fn local_addr(&self) -> String;
}

#[async_trait]
pub trait NetworkListener: Send + Sync + std::fmt::Debug {
    async fn bind(&self, addr: &str) -> Result<Box<dyn Listener>>;
}

#[derive(Debug, Clone, Default)]
pub struct TokioDialer;

#[async_trait]
impl NetworkDialer for TokioDialer {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Stream>> {
        let stream = tokio::net::TcpStream::connect(addr)
            .await
            .map_err(|e| AgentShellError::ConnFailed(format!("dial {addr}: {e}")))?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokioListenerFactory;

#[async_trait]
impl NetworkListener for TokioListenerFactory {
    async fn bind(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| AgentShellError::IoError(format!("bind {addr}: {e}")))?;
        Ok(Box::new(TokioListener { inner: listener }))
    }
}

struct TokioListener {
    inner: tokio::net::TcpListener,
}

#[async_trait]
impl Listener for TokioListener {
    async fn accept(&self) -> Result<(Box<dyn Stream>, String)> {
        let (stream, peer) = self
            .inner
            .accept()
            .await
            .map_err(|e| AgentShellError::IoError(format!("accept: {e}")))?;
        Ok((Box::new(stream), peer.to_string()))
    }

    fn local_addr(&self) -> String {
        self.inner
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}
