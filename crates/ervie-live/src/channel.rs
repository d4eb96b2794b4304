//! Duplex channel to the remote conversational endpoint.
//!
//! A [`DuplexConnector`] opens a [`DuplexChannel`]: an unbounded outbound sender plus an
//! ordered inbound event receiver. Socket I/O runs in its own tasks and only hands events
//! over through the inbound queue.

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{setup_message, to_wire, ClientMessage, ServerEvent, SessionSetup, WireDecoder};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Opens duplex sessions. Implement for the live WebSocket endpoint or for scripted test endpoints.
#[async_trait]
pub trait DuplexConnector: Send + Sync {
    async fn connect(&self, setup: &SessionSetup) -> VoiceResult<DuplexChannel>;
}

type Closer = Box<dyn FnOnce() + Send>;

/// Handle to one open duplex session. Closing is idempotent and also happens on drop.
pub struct DuplexChannel {
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    inbound: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    closer: Option<Closer>,
}

impl DuplexChannel {
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientMessage>,
        inbound: mpsc::UnboundedReceiver<ServerEvent>,
        closer: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound: Some(inbound),
            closer: Some(Box::new(closer)),
        }
    }

    /// An in-process channel pair. The [`RemoteEnd`] plays the endpoint.
    pub fn in_memory() -> (Self, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let channel = Self::new(out_tx, in_rx, move || flag.store(true, Ordering::SeqCst));
        let remote = RemoteEnd {
            outbound: out_rx,
            inbound: in_tx,
            closed,
        };
        (channel, remote)
    }

    /// Queue a message for the endpoint. Never blocks.
    pub fn send(&self, msg: ClientMessage) -> VoiceResult<()> {
        let tx = self.outbound.as_ref().ok_or(VoiceError::NotConnected)?;
        tx.send(msg)
            .map_err(|_| VoiceError::ChannelError("outbound channel closed".to_string()))
    }

    /// Take the inbound receiver so the session loop can poll it directly.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.inbound.take()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_none()
    }

    pub fn close(&mut self) {
        self.outbound = None;
        self.inbound = None;
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// The endpoint side of [`DuplexChannel::in_memory`].
pub struct RemoteEnd {
    /// Messages the session sent.
    pub outbound: mpsc::UnboundedReceiver<ClientMessage>,
    /// Push events to the session.
    pub inbound: mpsc::UnboundedSender<ServerEvent>,
    closed: Arc<AtomicBool>,
}

impl RemoteEnd {
    pub fn emit(&self, event: ServerEvent) -> bool {
        self.inbound.send(event).is_ok()
    }

    /// Whether the session has closed its side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connector for the live endpoint over a WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: String,
    api_key: Option<String>,
}

impl WebSocketConnector {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
        }
    }

    fn url(&self) -> VoiceResult<String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| VoiceError::ConnectionFailed("no API key configured".to_string()))?;
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}key={}", self.endpoint, sep, key))
    }
}

#[async_trait]
impl DuplexConnector for WebSocketConnector {
    async fn connect(&self, setup: &SessionSetup) -> VoiceResult<DuplexChannel> {
        let url = self.url()?;
        info!("🔌 Connecting to live endpoint ({})", setup.model);

        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| VoiceError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(setup_message(setup).to_string()))
            .await
            .map_err(|e| VoiceError::ConnectionFailed(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();

        // Writer ends when the session drops its sender, then says goodbye.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(to_wire(&msg))).await {
                    warn!("Live channel write failed: {}", e);
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            debug!("Live channel writer finished");
        });

        let reader = tokio::spawn(async move {
            let mut decoder = WireDecoder::new();
            while let Some(frame) = stream.next().await {
                let raw = match frame {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(bytes)) => bytes,
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        let _ = in_tx.send(ServerEvent::Closed { reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(ServerEvent::Error { message: e.to_string() });
                        return;
                    }
                };
                let events = match decoder.decode(&raw) {
                    Ok(events) => events,
                    Err(e) => vec![ServerEvent::Undecodable { detail: e.to_string() }],
                };
                for event in events {
                    if in_tx.send(event).is_err() {
                        return;
                    }
                }
            }
            let _ = in_tx.send(ServerEvent::Closed { reason: None });
        });

        Ok(DuplexChannel::new(out_tx, in_rx, move || reader.abort()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;

    #[tokio::test]
    async fn in_memory_pair_round_trip() {
        let (mut channel, mut remote) = DuplexChannel::in_memory();
        let mut inbound = channel.take_inbound().unwrap();

        channel
            .send(ClientMessage::TextTurn { role: Role::User, text: "hi".into(), complete: true })
            .unwrap();
        assert!(matches!(remote.outbound.recv().await, Some(ClientMessage::TextTurn { .. })));

        assert!(remote.emit(ServerEvent::Opened));
        assert_eq!(inbound.recv().await, Some(ServerEvent::Opened));
    }

    #[test]
    fn close_is_idempotent() {
        let (mut channel, remote) = DuplexChannel::in_memory();
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert!(remote.is_closed());
        assert!(matches!(
            channel.send(ClientMessage::TextTurn { role: Role::User, text: "x".into(), complete: true }),
            Err(VoiceError::NotConnected)
        ));
    }

    #[test]
    fn drop_closes() {
        let (channel, remote) = DuplexChannel::in_memory();
        drop(channel);
        assert!(remote.is_closed());
    }

    #[test]
    fn url_requires_key() {
        let c = WebSocketConnector::new("wss://example.test/live", None);
        assert!(matches!(c.url(), Err(VoiceError::ConnectionFailed(_))));
        let c = WebSocketConnector::new("wss://example.test/live", Some("k".into()));
        assert_eq!(c.url().unwrap(), "wss://example.test/live?key=k");
        let c = WebSocketConnector::new("wss://example.test/live?alt=json", Some("k".into()));
        assert_eq!(tokio_test::assert_ok!(c.url()), "wss://example.test/live?alt=json&key=k");
    }

    #[tokio::test]
    async fn connect_without_key_fails_fast() {
        let c = WebSocketConnector::new("wss://example.test/live", None);
        let setup = SessionSetup {
            model: "m".into(),
            system_instruction: String::new(),
            response_modality: crate::protocol::ResponseModality::Audio,
            voice_name: "Aoede".into(),
            input_transcription: true,
            output_transcription: true,
        };
        assert!(matches!(c.connect(&setup).await, Err(VoiceError::ConnectionFailed(_))));
    }
}
