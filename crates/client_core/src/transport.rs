//! Text-frame duplex connections. The event channel and every call room
//! reach the server through a [`WireConnector`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

use crate::error::TransportError;

/// An open connection. Dropping `outbound` closes the socket; `inbound`
/// yields `None` once the peer or the network closed it.
pub struct WireConnection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait WireConnector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<WireConnection, TransportError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl WireConnector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<WireConnection, TransportError> {
        let (ws_stream, _) =
            connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Connect {
                    url: redacted(url),
                    reason: err.to_string(),
                })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!("ws: receive failed: {err}");
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text.into())).await {
                    debug!("ws: send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
            reader.abort();
        });

        Ok(WireConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Strips the query so credentials never end up in logs or errors.
pub(crate) fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
