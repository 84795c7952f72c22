//! JSON messages exchanged with the streaming voice service

use serde::{Deserialize, Serialize};

use super::{SessionEvent, SessionRequest};
use crate::audio::codec::{decode_audio_chunk, encode_pcm16_base64, pcm_mime_type, rate_from_mime};
use crate::error::{CallError, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: GenerationConfig<'a>,
    system_instruction: Content<'a>,
    input_audio_transcription: Empty,
    output_audio_transcription: Empty,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'a str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Default, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<Blob>,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

/// First message on a new socket
pub fn setup_message(model: &str, request: &SessionRequest) -> Result<String> {
    let message = SetupMessage {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: &request.voice,
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: [TextPart {
                    text: &request.system_prompt,
                }],
            },
            input_audio_transcription: Empty::default(),
            output_audio_transcription: Empty::default(),
        },
    };
    serde_json::to_string(&message).map_err(|e| CallError::Connection(e.to_string()))
}

/// One block of microphone audio
pub fn realtime_input_message(samples: &[f32], sample_rate: u32) -> Result<String> {
    let message = RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: pcm_mime_type(sample_rate),
                data: encode_pcm16_base64(samples),
            }],
        },
    };
    serde_json::to_string(&message).map_err(|e| CallError::Codec(e.to_string()))
}

/// Whether a handshake reply acknowledges the setup
pub fn is_setup_complete(text: &str) -> Result<bool> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| CallError::Connection(format!("Malformed handshake reply: {}", e)))?;
    Ok(message.setup_complete.is_some())
}

/// Translate one server message into session events.
///
/// Within a message the interruption comes first so that audio carried
/// alongside it is scheduled after the cancellation. Audio parts that fail to
/// decode are skipped.
pub fn parse_server_message(text: &str, output_rate: u32) -> Result<Vec<SessionEvent>> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| CallError::Connection(format!("Malformed server message: {}", e)))?;
    let mut events = Vec::new();

    if let Some(content) = message.server_content {
        if content.interrupted {
            events.push(SessionEvent::Interrupted);
        }
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            if !text.trim().is_empty() {
                events.push(SessionEvent::CallerTranscript(text));
            }
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            if !text.trim().is_empty() {
                events.push(SessionEvent::AgentTranscript(text));
            }
        }
        for blob in content
            .model_turn
            .into_iter()
            .flat_map(|turn| turn.parts)
            .filter_map(|part| part.inline_data)
        {
            let Some(rate) = rate_from_mime(&blob.mime_type) else {
                tracing::debug!("Skipping inline data of type {}", blob.mime_type);
                continue;
            };
            match decode_audio_chunk(&blob.data, rate, output_rate) {
                Ok(buffer) if !buffer.is_empty() => events.push(SessionEvent::Audio(buffer)),
                Ok(_) => {}
                Err(e) => tracing::warn!("Dropping agent audio chunk: {}", e),
            }
        }
        if content.turn_complete {
            events.push(SessionEvent::TurnComplete);
        }
    }

    if let Some(go_away) = message.go_away {
        events.push(SessionEvent::Closed {
            reason: Some(match go_away.time_left {
                Some(left) => format!("Service is going away ({} left)", left),
                None => "Service is going away".to_string(),
            }),
        });
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode_pcm16_base64;
    use crate::ivr::{Department, Language};

    fn request() -> SessionRequest {
        SessionRequest {
            department: Department::Refunds,
            language: Language::English,
            voice: "Kore".to_string(),
            system_prompt: "You handle refunds.".to_string(),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
        }
    }

    #[test]
    fn test_setup_message_shape() {
        let text = setup_message("models/test", &request()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let setup = &value["setup"];
        assert_eq!(setup["model"], "models/test");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
        assert_eq!(
            setup["systemInstruction"]["parts"][0]["text"],
            "You handle refunds."
        );
        assert!(setup["inputAudioTranscription"].is_object());
    }

    #[test]
    fn test_realtime_input_carries_rate() {
        let text = realtime_input_message(&[0.0; 4], 16000).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let chunk = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AAAAAAAAAAA=");
    }

    #[test]
    fn test_parse_audio_and_transcripts() {
        let data = encode_pcm16_base64(&[0.5; 240]);
        let text = serde_json::json!({
            "serverContent": {
                "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}}]},
                "inputTranscription": {"text": "I want a refund"},
                "outputTranscription": {"text": "Sure"},
                "turnComplete": true
            }
        })
        .to_string();

        let events = parse_server_message(&text, 24000).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            SessionEvent::CallerTranscript("I want a refund".into())
        );
        assert_eq!(events[1], SessionEvent::AgentTranscript("Sure".into()));
        match &events[2] {
            SessionEvent::Audio(buffer) => {
                assert_eq!(buffer.samples.len(), 240);
                assert_eq!(buffer.sample_rate, 24000);
            }
            other => panic!("expected audio, got {:?}", other),
        }
        assert_eq!(events[3], SessionEvent::TurnComplete);
    }

    #[test]
    fn test_interruption_precedes_audio() {
        let data = encode_pcm16_base64(&[0.1; 24]);
        let text = serde_json::json!({
            "serverContent": {
                "interrupted": true,
                "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}}]}
            }
        })
        .to_string();
        let events = parse_server_message(&text, 24000).unwrap();
        assert_eq!(events[0], SessionEvent::Interrupted);
        assert!(matches!(events[1], SessionEvent::Audio(_)));
    }

    #[test]
    fn test_audio_resampled_to_output_rate() {
        let data = encode_pcm16_base64(&[0.0; 160]);
        let text = serde_json::json!({
            "serverContent": {"modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=16000", "data": data}}]}}
        })
        .to_string();
        let events = parse_server_message(&text, 24000).unwrap();
        match &events[0] {
            SessionEvent::Audio(buffer) => assert_eq!(buffer.samples.len(), 240),
            other => panic!("expected audio, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_audio_is_skipped_not_fatal() {
        let text = serde_json::json!({
            "serverContent": {"modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "***"}}]}}
        })
        .to_string();
        assert!(parse_server_message(&text, 24000).unwrap().is_empty());
    }

    #[test]
    fn test_go_away_closes_session() {
        let events = parse_server_message(r#"{"goAway":{"timeLeft":"5s"}}"#, 24000).unwrap();
        assert!(matches!(events[0], SessionEvent::Closed { reason: Some(_) }));
    }

    #[test]
    fn test_handshake_reply() {
        assert!(is_setup_complete(r#"{"setupComplete":{}}"#).unwrap());
        assert!(!is_setup_complete(r#"{"serverContent":{}}"#).unwrap());
        assert!(matches!(
            is_setup_complete("not json"),
            Err(CallError::Connection(_))
        ));
        assert!(parse_server_message("{", 24000).is_err());
    }
}
