//! The socket underneath a shard.
//!
//! [`WebSocketConnector`] is what you get by default. Swap in your own
//! [`Connector`] to route through a proxy or to drive a shard from a test.

use std::sync::Once;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{ClientError, Result};

/// One open connection that moves text frames.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Waits for the next text frame.
    ///
    /// A close frame or the stream ending comes back as
    /// [`ClientError::ConnectionClosed`]. Must be cancel-safe: dropping the
    /// future may not lose a text frame.
    async fn recv(&mut self) -> Result<String>;

    async fn close(&mut self, code: u16) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

static INSTALL_CRYPTO: Once = Once::new();

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        INSTALL_CRYPTO.call_once(|| {
            // Fails only if the application already installed a provider, which is fine.
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        let (stream, _) = connect_async(url).await?;
        log::debug!("websocket connected to {url}");
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(text.to_string()),
                Some(Ok(WsMessage::Binary(data))) => {
                    return String::from_utf8(data.to_vec())
                        .map_err(|e| ClientError::Protocol(format!("non-UTF-8 binary frame: {e}")));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame.map_or((None, String::new()), |f| {
                        (Some(u16::from(f.code)), f.reason.to_string())
                    });
                    return Err(ClientError::ConnectionClosed { code, reason });
                }
                // tungstenite answers pings on its own
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(ClientError::ConnectionClosed {
                        code: None,
                        reason: "stream ended".into(),
                    })
                }
            }
        }
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: String::new().into(),
        };
        self.stream.close(Some(frame)).await?;
        Ok(())
    }
}
