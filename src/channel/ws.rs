//! WebSocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, future};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;
use url::Url;

use super::{NO_STATUS_RECEIVED, Transport, WireMessage, WireSink, WireStream};
use crate::error::ChannelError;

/// Plain `ws://` / `wss://` transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &Url) -> Result<(WireSink, WireStream), ChannelError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        let (sink, stream) = ws_stream.split();

        let sink = sink
            .sink_map_err(|err| ChannelError::Send(err.to_string()))
            .with(|msg: WireMessage| future::ready(Ok::<_, ChannelError>(to_ws(msg))));
        let stream = stream.filter_map(|item| future::ready(from_ws(item)));

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn to_ws(msg: WireMessage) -> Message {
    match msg {
        WireMessage::Text(text) => Message::Text(text.into()),
        WireMessage::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

fn from_ws(
    item: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<WireMessage, ChannelError>> {
    match item {
        Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text.to_string()))),
        Ok(Message::Close(Some(frame))) => Some(Ok(WireMessage::Close {
            code: u16::from(frame.code),
            reason: frame.reason.to_string(),
        })),
        Ok(Message::Close(None)) => Some(Ok(WireMessage::Close {
            code: NO_STATUS_RECEIVED,
            reason: String::new(),
        })),
        Ok(Message::Binary(data)) => {
            debug!(len = data.len(), "ignoring binary frame");
            None
        }
        // Ping/pong are answered by tungstenite itself.
        Ok(_) => None,
        Err(err) => Some(Err(ChannelError::Receive(err.to_string()))),
    }
}
