use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::protocol::{is_setup_complete, parse_server_message, realtime_input_message, setup_message};
use super::{OutboundFrame, SessionEvent, SessionEvents, SessionHandle, SessionRequest, VoiceConnector};
use crate::config::VoiceServiceConfig;
use crate::error::{CallError, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the streaming voice service over a WebSocket
pub struct WebSocketConnector {
    config: VoiceServiceConfig,
}

impl WebSocketConnector {
    pub fn new(config: VoiceServiceConfig) -> Self {
        Self { config }
    }

    async fn handshake(&self, url: &str, request: &SessionRequest) -> Result<Socket> {
        let (mut socket, _response) = connect_async(url)
            .await
            .map_err(|e| CallError::Connection(format!("Handshake rejected: {}", e)))?;

        let setup = setup_message(&self.config.model, request)?;
        socket
            .send(Message::Text(setup))
            .await
            .map_err(|e| CallError::Connection(format!("Failed to send setup: {}", e)))?;

        loop {
            match socket.next().await {
                Some(Ok(message)) => {
                    if let Message::Close(frame) = &message {
                        return Err(CallError::Connection(format!(
                            "Service closed during setup: {}",
                            frame
                                .as_ref()
                                .map(|f| f.reason.to_string())
                                .unwrap_or_default()
                        )));
                    }
                    if let Some(text) = frame_text(message) {
                        if is_setup_complete(&text)? {
                            return Ok(socket);
                        }
                    }
                }
                Some(Err(e)) => {
                    return Err(CallError::Connection(format!("Handshake failed: {}", e)));
                }
                None => {
                    return Err(CallError::Connection(
                        "Service closed during setup".to_string(),
                    ))
                }
            }
        }
    }
}

#[async_trait]
impl VoiceConnector for WebSocketConnector {
    async fn open(&self, request: SessionRequest, events: SessionEvents) -> Result<SessionHandle> {
        let api_key = self.config.resolve_api_key().ok_or_else(|| {
            CallError::Connection(format!(
                "No API key configured (set {})",
                self.config.api_key_env
            ))
        })?;
        let url = format!("{}?key={}", self.config.endpoint, api_key);

        tracing::info!(
            "Opening voice session for {} ({})",
            request.department,
            request.language.name()
        );
        let socket = tokio::time::timeout(
            self.config.handshake_timeout(),
            self.handshake(&url, &request),
        )
        .await
        .map_err(|_| CallError::Connection("Voice service did not answer in time".to_string()))??;
        tracing::info!("Voice session established");

        let (sink, stream) = socket.split();
        let (handle, outbound) = SessionHandle::channel();
        tokio::spawn(write_loop(sink, outbound, request.input_sample_rate));
        let reader = tokio::spawn(read_loop(stream, events, request.output_sample_rate));
        Ok(handle.with_reader(reader))
    }
}

fn frame_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => String::from_utf8(bytes).ok(),
        _ => None,
    }
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    input_rate: u32,
) {
    while let Some(frame) = outbound.recv().await {
        match frame {
            OutboundFrame::Audio(samples) => {
                let text = match realtime_input_message(&samples, input_rate) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Skipping microphone block: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::debug!("Voice socket write failed: {}", e);
                    break;
                }
            }
            OutboundFrame::Close => break,
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<Socket>, events: SessionEvents, output_rate: u32) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(frame)) => {
                let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                let _ = events.send(SessionEvent::Closed { reason });
                return;
            }
            Ok(message) => {
                let Some(text) = frame_text(message) else {
                    continue;
                };
                match parse_server_message(&text, output_rate) {
                    Ok(parsed) => {
                        for event in parsed {
                            let closing = matches!(event, SessionEvent::Closed { .. });
                            if events.send(event).is_err() || closing {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = events.send(SessionEvent::Failed(e));
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = events.send(SessionEvent::Failed(CallError::Connection(e.to_string())));
                return;
            }
        }
    }
    let _ = events.send(SessionEvent::Closed { reason: None });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivr::{Department, Language};

    #[tokio::test]
    async fn test_missing_api_key_is_connection_error() {
        let connector = WebSocketConnector::new(VoiceServiceConfig {
            api_key: None,
            api_key_env: "VOICEDESK_TEST_UNSET_KEY".to_string(),
            ..VoiceServiceConfig::default()
        });
        let (events, _rx) = mpsc::unbounded_channel();
        let request = SessionRequest {
            department: Department::Billing,
            language: Language::English,
            voice: "Puck".to_string(),
            system_prompt: String::new(),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
        };
        match connector.open(request, events).await {
            Err(CallError::Connection(message)) => {
                assert!(message.contains("VOICEDESK_TEST_UNSET_KEY"))
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("session opened without a key"),
        }
    }

    #[test]
    fn test_binary_frames_are_read_as_text() {
        assert_eq!(
            frame_text(Message::Binary(b"{\"setupComplete\":{}}".to_vec())),
            Some("{\"setupComplete\":{}}".to_string())
        );
        assert_eq!(frame_text(Message::Ping(vec![])), None);
    }
}
