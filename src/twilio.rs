pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Connect")]
        Connect(ConnectAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub struct ConnectAction {
        #[xmlserde(ty = "untag")]
        pub connection: Connection,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum Connection {
        #[xmlserde(name = b"Stream")]
        Stream(StreamAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct StreamAction {
        #[xmlserde(name = b"url", ty = "attr")]
        pub url: String,
        #[xmlserde(name = b"Parameter", ty = "child")]
        pub parameters: Vec<ParameterAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct ParameterAction {
        #[xmlserde(name = b"name", ty = "attr")]
        pub name: String,
        #[xmlserde(name = b"value", ty = "attr")]
        pub value: String,
    }
}
pub use twiml::*;

mod ws {
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Clone, Serialize, Deserialize)]
    pub struct OutboundMarkMeta {
        pub name: String,
    }

    #[derive(Clone, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase", tag = "event")]
    pub enum TwilioOutbound {
        Mark {
            mark: OutboundMarkMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Media {
            media: OutboundMediaMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Clear {
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
    }

    impl TwilioOutbound {
        pub fn media(stream_sid: &str, payload: String) -> Self {
            TwilioOutbound::Media {
                media: OutboundMediaMeta { payload },
                stream_sid: stream_sid.to_string(),
            }
        }

        pub fn mark(stream_sid: &str, name: String) -> Self {
            TwilioOutbound::Mark {
                mark: OutboundMarkMeta { name },
                stream_sid: stream_sid.to_string(),
            }
        }

        pub fn clear(stream_sid: &str) -> Self {
            TwilioOutbound::Clear {
                stream_sid: stream_sid.to_string(),
            }
        }
    }

    #[derive(Clone, Serialize, Deserialize)]
    pub struct OutboundMediaMeta {
        pub payload: String,
    }

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "lowercase", tag = "event")]
    pub enum TwilioMessage {
        Connected {
            protocol: String,
            version: String,
        },
        Start {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            start: StartMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Media {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            media: MediaMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Stop {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Mark {
            #[serde(rename = "sequenceNumber", default)]
            sequence_number: Option<String>,
            mark: MarkMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct StartMeta {
        #[serde(rename = "streamSid")]
        pub stream_sid: String,
        #[serde(rename = "accountSid", default)]
        pub account_sid: Option<String>,
        #[serde(rename = "callSid")]
        pub call_sid: String,
        #[serde(default)]
        pub tracks: Vec<String>,
        #[serde(rename = "customParameters", default)]
        pub custom_parameters: HashMap<String, String>,
        #[serde(rename = "mediaFormat", default)]
        pub media_format: Option<MediaFormat>,
    }

    impl StartMeta {
        /// Tenant id is validated by the call-control plane before the stream
        /// is ever connected; here it is just carried through.
        pub fn tenant_id(&self) -> Option<&str> {
            self.custom_parameters.get("tenantId").map(String::as_str)
        }

        pub fn caller_number(&self) -> Option<&str> {
            self.custom_parameters
                .get("callerNumber")
                .map(String::as_str)
        }

        pub fn callee_number(&self) -> Option<&str> {
            self.custom_parameters
                .get("calleeNumber")
                .map(String::as_str)
        }
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct MediaFormat {
        pub encoding: String,
        #[serde(rename = "sampleRate")]
        pub sample_rate: u32,
        pub channels: u16,
    }

    #[derive(Serialize, Deserialize)]
    pub struct MediaMeta {
        #[serde(default)]
        pub track: Option<MediaTrack>,
        #[serde(default)]
        pub chunk: Option<String>,
        #[serde(default)]
        pub timestamp: Option<String>,
        pub payload: String,
    }

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum MediaTrack {
        Inbound,
        Outbound,
    }

    #[derive(Serialize, Deserialize)]
    pub struct MarkMeta {
        pub name: String,
    }
}
pub use ws::*;

/// Form fields of Twilio's voice webhook that the answer route needs.  The
/// rest of the payload is ignored.
mod webhook {
    use serde::Deserialize;

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct VoiceWebhookPayload {
        pub call_sid: String,
        pub from: String,
        pub to: String,
    }
}
pub use webhook::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_event_with_custom_parameters() {
        let json = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZxxxx",
            "start": {
                "streamSid": "MZxxxx",
                "accountSid": "ACxxxx",
                "callSid": "CAxxxx",
                "tracks": ["inbound"],
                "customParameters": {
                    "tenantId": "t_123",
                    "callerNumber": "+818011112222",
                    "calleeNumber": "+815033334444"
                },
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            }
        }"#;
        let msg: TwilioMessage = serde_json::from_str(json).unwrap();
        match msg {
            TwilioMessage::Start { start, .. } => {
                assert_eq!(start.call_sid, "CAxxxx");
                assert_eq!(start.tenant_id(), Some("t_123"));
                assert_eq!(start.caller_number(), Some("+818011112222"));
                assert_eq!(start.callee_number(), Some("+815033334444"));
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn parses_media_and_mark_and_stop_events() {
        let media: TwilioMessage = serde_json::from_str(
            r#"{"event":"media","sequenceNumber":"2","streamSid":"MZx",
                "media":{"track":"inbound","chunk":"1","timestamp":"20","payload":"AAAA"}}"#,
        )
        .unwrap();
        assert!(matches!(media, TwilioMessage::Media { media, .. } if media.payload == "AAAA"));

        let mark: TwilioMessage = serde_json::from_str(
            r#"{"event":"mark","streamSid":"MZx","mark":{"name":"a:item:ms:300:seq:0"}}"#,
        )
        .unwrap();
        assert!(matches!(mark, TwilioMessage::Mark { mark, .. } if mark.name.starts_with("a:")));

        let stop: TwilioMessage = serde_json::from_str(
            r#"{"event":"stop","sequenceNumber":"9","streamSid":"MZx",
                "stop":{"accountSid":"AC","callSid":"CA"}}"#,
        )
        .unwrap();
        assert!(matches!(stop, TwilioMessage::Stop { .. }));
    }

    #[test]
    fn outbound_events_serialize_with_stream_sid() {
        let media = TwilioOutbound::media("MZx", "AAAA".to_string());
        let v: serde_json::Value = serde_json::to_value(&media).unwrap();
        assert_eq!(v["event"], "media");
        assert_eq!(v["streamSid"], "MZx");
        assert_eq!(v["media"]["payload"], "AAAA");

        let clear = TwilioOutbound::clear("MZx");
        let v: serde_json::Value = serde_json::to_value(&clear).unwrap();
        assert_eq!(v["event"], "clear");

        let mark = TwilioOutbound::mark("MZx", "m1".to_string());
        let v: serde_json::Value = serde_json::to_value(&mark).unwrap();
        assert_eq!(v["mark"]["name"], "m1");
    }
}
