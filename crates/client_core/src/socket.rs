use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    Closed { code: Option<u16> },
    Error(String),
}

pub struct SocketChannel {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
    pub pump: Option<JoinHandle<()>>,
}

impl SocketChannel {
    pub fn new(
        outgoing: mpsc::UnboundedSender<String>,
        incoming: mpsc::UnboundedReceiver<SocketEvent>,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            pump: None,
        }
    }
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<SocketChannel, TransportError>;
}

pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn open(&self, url: &Url) -> Result<SocketChannel, TransportError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connection(err.to_string()))?;
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(run_pump(ws_stream, outgoing_rx, incoming_tx));
        Ok(SocketChannel {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
            pump: Some(pump),
        })
    }
}

async fn run_pump<S>(
    ws_stream: WebSocketStream<S>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    incoming: mpsc::UnboundedSender<SocketEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut writer, mut reader) = ws_stream.split();
    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(text) => {
                    if let Err(err) = writer.send(Message::Text(text)).await {
                        let _ = incoming.send(SocketEvent::Error(err.to_string()));
                        break;
                    }
                }
                None => {
                    debug!("ws: outgoing side dropped, closing socket");
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = reader.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if incoming.send(SocketEvent::Text(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|frame| u16::from(frame.code));
                    let _ = incoming.send(SocketEvent::Closed { code });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = incoming.send(SocketEvent::Error(err.to_string()));
                    break;
                }
                None => {
                    let _ = incoming.send(SocketEvent::Closed { code: None });
                    break;
                }
            },
        }
    }
}
