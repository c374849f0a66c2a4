//! WebSocket connector for the live service

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};
use url::Url;

use super::protocol::{self, Dialect};
use super::{
    CLOSE_ABNORMAL, CLOSE_NO_STATUS, Connector, SessionConfig, TransportEvent, TransportLink,
};
use crate::audio::AudioFrame;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, tungstenite::Message>;
type WsSource = SplitStream<WsStream>;

enum Outbound {
    Frame(AudioFrame),
    Close,
}

/// Opens sessions over `tokio-tungstenite`
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(
        &self,
        config: &SessionConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportLink>> {
        let url = session_url(config)?;

        tracing::debug!(
            host = url.host_str().unwrap_or_default(),
            model = %config.model,
            voice = %config.voice,
            dialect = %config.dialect,
            "opening live session channel"
        );

        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| classify_connect_error(&e))?;

        let (mut sink, source) = ws.split();

        let setup = protocol::encode_setup(config.dialect, config)?;
        sink.send(tungstenite::Message::Text(setup.into()))
            .await
            .map_err(|e| Error::transport(e.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, outbound_rx, config.dialect));

        let _ = events.send(TransportEvent::Opened);
        tokio::spawn(read_loop(source, events, config.dialect));

        Ok(Arc::new(WebSocketLink {
            outbound: outbound_tx,
        }))
    }
}

/// Outbound half backed by the writer task
struct WebSocketLink {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl TransportLink for WebSocketLink {
    fn send(&self, frame: AudioFrame) {
        let _ = self.outbound.send(Outbound::Frame(frame));
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Endpoint with the credential attached as the `key` query parameter
///
/// # Errors
///
/// Returns error if the endpoint is not a valid URL
pub fn session_url(config: &SessionConfig) -> Result<Url> {
    let mut url = Url::parse(&config.endpoint)
        .map_err(|e| Error::Config(format!("invalid endpoint {}: {e}", config.endpoint)))?;

    if let Some(key) = &config.api_key {
        url.query_pairs_mut().append_pair("key", key.expose_secret());
    }

    Ok(url)
}

/// Map a handshake failure onto the session taxonomy
fn classify_connect_error(err: &tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => classify_handshake_status(response.status().as_u16()),
        other => Error::transport(other.to_string()),
    }
}

fn classify_handshake_status(status: u16) -> Error {
    if status == 401 || status == 403 {
        Error::Credential(format!("handshake rejected with HTTP {status}"))
    } else {
        Error::transport(format!("handshake failed with HTTP {status}"))
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    dialect: Dialect,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Frame(frame) => {
                let text = match protocol::encode_media(dialect, &frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(tungstenite::Message::Text(text.into())).await {
                    tracing::trace!(error = %e, "audio frame dropped");
                }
            }
            Outbound::Close => break,
        }
    }

    let close = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    if let Err(e) = sink.send(tungstenite::Message::Close(Some(close))).await {
        tracing::trace!(error = %e, "close frame not sent");
    }
    let _ = sink.close().await;
    tracing::debug!("session channel writer finished");
}

async fn read_loop(
    mut source: WsSource,
    events: mpsc::UnboundedSender<TransportEvent>,
    dialect: Dialect,
) {
    while let Some(next) = source.next().await {
        let message = match next {
            Ok(message) => message,
            Err(
                tungstenite::Error::Io(_)
                | tungstenite::Error::Protocol(_)
                | tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed,
            ) => break,
            Err(e) => {
                tracing::error!(error = %e, "session channel fault");
                let _ = events.send(TransportEvent::Error(e.to_string()));
                return;
            }
        };

        let decoded = match message {
            tungstenite::Message::Text(text) => protocol::decode_text(text.as_str()),
            tungstenite::Message::Binary(data) => protocol::decode_binary(dialect, data.to_vec()),
            tungstenite::Message::Close(frame) => {
                let (code, reason) = frame.map_or_else(
                    || (CLOSE_NO_STATUS, String::new()),
                    |f| (u16::from(f.code), f.reason.as_str().to_string()),
                );
                tracing::debug!(code, reason = %reason, "session channel closed by service");
                let _ = events.send(TransportEvent::Closed { code, reason });
                return;
            }
            _ => continue,
        };

        let inbound = match decoded {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed message");
                continue;
            }
        };

        for message in inbound {
            if events.send(TransportEvent::Message(message)).is_err() {
                // Session no longer listening
                return;
            }
        }
    }

    tracing::debug!("session channel ended without close frame");
    let _ = events.send(TransportEvent::Closed {
        code: CLOSE_ABNORMAL,
        reason: String::new(),
    });
}
