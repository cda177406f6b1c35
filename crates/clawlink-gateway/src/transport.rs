//! Socket transports.
//!
//! The client never touches a WebSocket directly: a [`Connector`] opens a
//! connection and hands back a pair of channels carrying [`WireMessage`]s.
//! [`WsConnector`] bridges `tokio-tungstenite`; tests plug in stubs.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{Connector as TlsConnector, MaybeTlsStream};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::tls;

/// Close code used when the peer vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Close { code: u16, reason: String },
}

/// An open connection. Dropping `outgoing` closes the socket; `incoming`
/// yields a final [`WireMessage::Close`] (or ends) when the peer goes away.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<WireMessage>,
    pub incoming: mpsc::UnboundedReceiver<WireMessage>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`. With `tls_fingerprint`, the server's leaf
    /// certificate must match it or the connection is refused.
    async fn connect(
        &self,
        url: &str,
        tls_fingerprint: Option<&str>,
    ) -> Result<Connection, GatewayError>;
}

/// WebSocket connector backed by `tokio-tungstenite` over rustls.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        tls_fingerprint: Option<&str>,
    ) -> Result<Connection, GatewayError> {
        if tls_fingerprint.is_some() && !url.starts_with("wss://") {
            return Err(GatewayError::Tls(
                "gateway tls fingerprint requires wss:// gateway url".into(),
            ));
        }
        // rustls needs a process-wide provider for unpinned wss:// connections.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let connector = tls_fingerprint
            .map(tls::pinned_client_config)
            .transpose()?
            .map(|config| TlsConnector::Rustls(Arc::new(config)));

        let (ws, _response) =
            tokio_tungstenite::connect_async_tls_with_config(url, None, false, connector)
                .await
                .map_err(|e| {
                    let message = e.to_string();
                    if message.contains("fingerprint mismatch") {
                        GatewayError::Tls(message)
                    } else {
                        GatewayError::Transport(message)
                    }
                })?;

        if let Some(expected) = tls_fingerprint {
            let peer = match ws.get_ref() {
                MaybeTlsStream::Rustls(stream) => stream.get_ref().1.peer_certificates(),
                _ => None,
            };
            tls::check_peer_fingerprint(peer, expected)?;
        }
        debug!(url, "WebSocket connected");

        let (mut sink, mut stream) = ws.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<WireMessage>();

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let result = match message {
                    WireMessage::Text(text) => sink.send(Message::Text(text.into())).await,
                    WireMessage::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        return;
                    }
                };
                if let Err(e) = result {
                    debug!(%e, "WebSocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(read_loop(stream, incoming_tx));

        Ok(Connection {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

/// Forward frames from `stream` until the peer closes or the receiving side
/// drops `incoming`. A blackholed peer never wakes `stream`, so the closed
/// receiver is the only exit in that case.
async fn read_loop<S>(mut stream: S, incoming_tx: mpsc::UnboundedSender<WireMessage>)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let close = loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = incoming_tx.closed() => {
                debug!("Connection dropped, stopping WebSocket reader");
                return;
            }
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                if incoming_tx
                    .send(WireMessage::Text(text.as_str().to_owned()))
                    .is_err()
                {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => WireMessage::Close {
                        code: u16::from(frame.code),
                        reason: frame.reason.as_str().to_owned(),
                    },
                    None => WireMessage::Close {
                        code: 1005,
                        reason: String::new(),
                    },
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(%e, "WebSocket read failed");
                break WireMessage::Close {
                    code: ABNORMAL_CLOSURE,
                    reason: e.to_string(),
                };
            }
            None => {
                break WireMessage::Close {
                    code: ABNORMAL_CLOSURE,
                    reason: String::new(),
                };
            }
        }
    };
    let _ = incoming_tx.send(close);
}
