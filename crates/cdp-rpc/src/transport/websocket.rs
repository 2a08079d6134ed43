//! WebSocket transport - the real thing a browser endpoint speaks

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use super::{FrameSink, FrameSource, Transport};
use crate::config::ConnConfig;
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport {
    ws: WsStream,
}

impl WebSocketTransport {
    pub fn new(ws: WsStream) -> Self {
        Self { ws }
    }
}

/// Open a websocket to a debugging endpoint such as
/// `ws://localhost:9222/devtools/browser/<id>`.
pub async fn connect(ws_url: &str, config: &ConnConfig) -> Result<WebSocketTransport> {
    let parsed = url::Url::parse(ws_url).map_err(|e| Error::InvalidUrl {
        url: ws_url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(Error::InvalidUrl {
            url: ws_url.to_string(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = config.max_message_size;
    ws_config.max_frame_size = config.max_message_size;

    let (ws, _) = connect_async_with_config(parsed.as_str(), Some(ws_config), true).await?;
    tracing::debug!(url = %parsed, "websocket connected");
    Ok(WebSocketTransport::new(ws))
}

impl Transport for WebSocketTransport {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let (sink, stream) = self.ws.split();
        (Box::new(WsSink { sink }), Box::new(WsSource { stream }))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        // The protocol is text based; anything that is not UTF-8 goes as binary.
        let msg = match String::from_utf8(frame) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.sink.send(msg).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}

struct WsSource {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("WebSocket closed");
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}
