//! Typed client for the OpenAI realtime WebSocket.
//!
//! One connection per call.  Outbound operations are serialized `ClientEvent`
//! values sent through the write half; the read half is drained by
//! `tasks::read_model` and dispatched as `ServerEvent`s to the orchestrator.

use crate::config::Settings;
use crate::error::AppError;

use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error};

pub type ModelStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type ModelSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;

#[derive(Serialize, Debug)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseConfig>,
    },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
    #[serde(rename = "conversation.item.truncate")]
    ItemTruncate {
        item_id: String,
        content_index: u32,
        audio_end_ms: u64,
    },
    #[serde(rename = "conversation.item.create")]
    ItemCreate { item: FunctionCallOutputItem },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

#[derive(Serialize, Debug)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub turn_detection: TurnDetection,
    pub input_audio_transcription: TranscriptionConfig,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: String,
}

#[derive(Serialize, Debug)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub silence_duration_ms: u32,
    pub create_response: bool,
    pub interrupt_response: bool,
}

#[derive(Serialize, Debug)]
pub struct TranscriptionConfig {
    pub model: String,
}

#[derive(Serialize, Debug)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Serialize, Debug)]
pub struct ResponseConfig {
    pub instructions: String,
}

#[derive(Serialize, Debug)]
pub struct FunctionCallOutputItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub call_id: String,
    pub output: String,
}

/// Session parameters for one `session.update`.  The greeting phase keeps the
/// model from self-triggering while the opening utterance plays; the normal
/// phase re-enables VAD-triggered responses and interruption.
pub struct SessionPhaseParams<'a> {
    pub instructions: &'a str,
    pub tool_parameters: &'a serde_json::Value,
    pub create_response: bool,
    pub interrupt_response: bool,
}

pub struct RealtimeClient {
    sink: ModelSink,
    settings: Settings,
}

impl RealtimeClient {
    /// Open the model WebSocket.  TLS handshake and protocol upgrade happen
    /// here; the session-ready deadline in the orchestrator covers this call.
    pub async fn connect(settings: &Settings) -> Result<(Self, ModelStream), AppError> {
        let uri = format!(
            "{}?model={}",
            settings.realtime_url, settings.realtime_model
        );
        let mut rq = uri
            .into_client_request()
            .map_err(|e| {
                error!(error=%e, "failed to build realtime client request");
                AppError("invalid realtime URL")
            })?;
        let headers = rq.headers_mut();
        headers.insert(
            http::header::AUTHORIZATION,
            http::header::HeaderValue::from_str(&format!("Bearer {}", settings.openai_api_key))
                .map_err(|_| AppError("invalid API key header"))?,
        );
        headers.insert(
            "OpenAI-Beta",
            http::header::HeaderValue::from_static("realtime=v1"),
        );
        let (ws_stream, _) = connect_async(rq).await.map_err(|e| {
            error!(error=%e, "failed to connect realtime websocket");
            AppError("realtime connect failed")
        })?;
        let (sink, stream) = ws_stream.split();
        Ok((
            Self {
                sink,
                settings: settings.clone(),
            },
            stream,
        ))
    }

    async fn send(&mut self, event: ClientEvent) -> Result<(), AppError> {
        let json = serde_json::to_string(&event).map_err(|e| {
            error!(error=%e, "failed to serialize realtime client event");
            AppError("realtime event serialization error")
        })?;
        self.sink
            .send(tungstenite::Message::Text(json))
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send realtime client event");
                AppError("realtime send failed")
            })
    }

    pub async fn send_session_update(
        &mut self,
        params: SessionPhaseParams<'_>,
    ) -> Result<(), AppError> {
        let session = SessionConfig {
            instructions: params.instructions.to_string(),
            voice: self.settings.voice.clone(),
            input_audio_format: "g711_ulaw".to_string(),
            output_audio_format: "g711_ulaw".to_string(),
            turn_detection: TurnDetection {
                kind: "server_vad".to_string(),
                threshold: self.settings.vad_threshold,
                silence_duration_ms: self.settings.vad_silence_ms,
                create_response: params.create_response,
                interrupt_response: params.interrupt_response,
            },
            input_audio_transcription: TranscriptionConfig {
                model: "whisper-1".to_string(),
            },
            tools: vec![ToolDefinition {
                kind: "function".to_string(),
                name: "finalize_reservation".to_string(),
                description: "全ての予約項目を聞き取り、お客様が内容を確認した後に予約を確定する。"
                    .to_string(),
                parameters: params.tool_parameters.clone(),
            }],
            tool_choice: "auto".to_string(),
        };
        self.send(ClientEvent::SessionUpdate { session }).await
    }

    /// `response.create`; with instructions for the verbatim greeting, bare
    /// otherwise (the session instructions then apply).
    pub async fn send_response_create(
        &mut self,
        instructions: Option<&str>,
    ) -> Result<(), AppError> {
        self.send(ClientEvent::ResponseCreate {
            response: instructions.map(|i| ResponseConfig {
                instructions: i.to_string(),
            }),
        })
        .await
    }

    /// Pass-through append of a base64 µ-law chunk from Twilio.
    pub async fn append_audio(&mut self, audio_b64: String) -> Result<(), AppError> {
        self.send(ClientEvent::InputAudioAppend { audio: audio_b64 })
            .await
    }

    pub async fn truncate_item(&mut self, item_id: &str, audio_end_ms: u64) -> Result<(), AppError> {
        self.send(ClientEvent::ItemTruncate {
            item_id: item_id.to_string(),
            content_index: 0,
            audio_end_ms,
        })
        .await
    }

    /// Inject a tool result and immediately ask for a spoken follow-up.
    pub async fn send_function_output(
        &mut self,
        call_id: &str,
        output_json: String,
    ) -> Result<(), AppError> {
        self.send(ClientEvent::ItemCreate {
            item: FunctionCallOutputItem {
                kind: "function_call_output".to_string(),
                call_id: call_id.to_string(),
                output: output_json,
            },
        })
        .await?;
        self.send(ClientEvent::ResponseCreate { response: None })
            .await
    }

    pub async fn cancel_response(&mut self) -> Result<(), AppError> {
        self.send(ClientEvent::ResponseCancel).await
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.sink.send(tungstenite::Message::Close(None)).await {
            debug!(error=%e, "realtime close frame not sent (socket likely gone)");
        }
    }
}

/// Server events the orchestrator dispatches on.  Everything else arrives as
/// `Unknown` and is dropped at debug level.
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: OutputItem },
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta {
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone { response: ResponsePayload },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "error")]
    ErrorEvent { error: RealtimeError },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
pub struct ResponsePayload {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
}

#[derive(Deserialize, Debug)]
pub struct OutputItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

impl OutputItem {
    pub fn is_assistant_message(&self) -> bool {
        self.kind == "message" && self.role.as_deref() == Some("assistant")
    }

    pub fn is_function_call(&self) -> bool {
        self.kind == "function_call"
    }

    /// Spoken text of an assistant message: transcript of audio parts, text
    /// parts as-is, concatenated.
    pub fn assistant_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| p.transcript.as_deref().or(p.text.as_deref()))
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Deserialize, Debug)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct RealtimeError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// How an `error` event should be treated.
#[derive(Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Cancelling a response that already finished; noise.
    Benign,
    /// Quota or rate-limit exhaustion; the call cannot continue.
    Budget,
    Other,
}

impl RealtimeError {
    pub fn classify(&self) -> ErrorClass {
        let code = self.code.as_deref().unwrap_or("");
        if code == "response_cancel_not_active" {
            return ErrorClass::Benign;
        }
        if code.contains("insufficient_quota") || code.contains("rate_limit") {
            return ErrorClass::Budget;
        }
        ErrorClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_serializes_phase_flags() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig {
                instructions: "talk".into(),
                voice: "alloy".into(),
                input_audio_format: "g711_ulaw".into(),
                output_audio_format: "g711_ulaw".into(),
                turn_detection: TurnDetection {
                    kind: "server_vad".into(),
                    threshold: 0.7,
                    silence_duration_ms: 700,
                    create_response: false,
                    interrupt_response: false,
                },
                input_audio_transcription: TranscriptionConfig {
                    model: "whisper-1".into(),
                },
                tools: vec![],
                tool_choice: "auto".into(),
            },
        };
        let v: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "session.update");
        assert_eq!(v["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(v["session"]["turn_detection"]["create_response"], false);
        assert_eq!(v["session"]["input_audio_format"], "g711_ulaw");
    }

    #[test]
    fn truncate_serializes_wire_fields() {
        let v: serde_json::Value = serde_json::to_value(&ClientEvent::ItemTruncate {
            item_id: "item_A".into(),
            content_index: 0,
            audio_end_ms: 2_150,
        })
        .unwrap();
        assert_eq!(v["type"], "conversation.item.truncate");
        assert_eq!(v["item_id"], "item_A");
        assert_eq!(v["content_index"], 0);
        assert_eq!(v["audio_end_ms"], 2_150);
    }

    #[test]
    fn bare_response_create_omits_response_field() {
        let v: serde_json::Value =
            serde_json::to_value(&ClientEvent::ResponseCreate { response: None }).unwrap();
        assert_eq!(v["type"], "response.create");
        assert!(v.get("response").is_none());
    }

    #[test]
    fn parses_audio_delta_under_both_event_names() {
        for name in ["response.audio.delta", "response.output_audio.delta"] {
            let json = format!(r#"{{"type":"{name}","item_id":"it1","delta":"AAAA"}}"#);
            match serde_json::from_str::<ServerEvent>(&json).unwrap() {
                ServerEvent::AudioDelta { delta, item_id } => {
                    assert_eq!(delta, "AAAA");
                    assert_eq!(item_id.as_deref(), Some("it1"));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn parses_response_done_with_message_and_function_call() {
        let json = r#"{
            "type": "response.done",
            "response": {
                "status": "completed",
                "output": [
                    {"id": "it1", "type": "message", "role": "assistant",
                     "content": [{"type": "audio", "transcript": "かしこまりました。"}]},
                    {"id": "it2", "type": "function_call", "name": "finalize_reservation",
                     "call_id": "call_9", "arguments": "{\"confirmed\":true}"}
                ]
            }
        }"#;
        match serde_json::from_str::<ServerEvent>(json).unwrap() {
            ServerEvent::ResponseDone { response } => {
                assert_eq!(response.output.len(), 2);
                assert!(response.output[0].is_assistant_message());
                assert_eq!(response.output[0].assistant_text(), "かしこまりました。");
                assert!(response.output[1].is_function_call());
                assert_eq!(response.output[1].call_id.as_deref(), Some("call_9"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_fall_through() {
        let ev: ServerEvent =
            serde_json::from_str(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert!(matches!(ev, ServerEvent::Unknown));
    }

    #[test]
    fn error_classification() {
        let benign = RealtimeError {
            code: Some("response_cancel_not_active".into()),
            message: None,
        };
        assert_eq!(benign.classify(), ErrorClass::Benign);
        let budget = RealtimeError {
            code: Some("insufficient_quota".into()),
            message: None,
        };
        assert_eq!(budget.classify(), ErrorClass::Budget);
        let other = RealtimeError {
            code: None,
            message: Some("boom".into()),
        };
        assert_eq!(other.classify(), ErrorClass::Other);
    }
}
