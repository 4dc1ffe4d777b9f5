//! Client-side wire types of the Gemini Live `BidiGenerateContent` protocol.

use oriel_core::live::{LiveConfig, ResponseModality};
use serde::Serialize;

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(BidiGenerateContentRealtimeInput),
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_compression: Option<ContextWindowCompression>,
    pub session_resumption: SessionResumptionConfig,
}

impl BidiGenerateContentSetup {
    pub fn from_config(model: &str, config: &LiveConfig) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };
        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: config.response_modalities.clone(),
                speech_config: config.voice.as_ref().map(|voice| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.clone(),
                        },
                    },
                }),
            },
            system_instruction: config.system_instruction.as_ref().map(|text| Content {
                parts: vec![Part { text: text.clone() }],
            }),
            input_audio_transcription: config.input_audio_transcription.then_some(Empty {}),
            output_audio_transcription: config.output_audio_transcription.then_some(Empty {}),
            context_window_compression: config
                .context_window_compression
                .then_some(ContextWindowCompression {
                    sliding_window: Empty {},
                }),
            session_resumption: SessionResumptionConfig {
                handle: config.session_resumption.handle.clone(),
            },
        }
    }
}

/// Serializes as `{}`.
#[derive(Serialize, Debug, Clone, Copy)]
pub struct Empty {}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Serialize, Debug)]
pub struct Part {
    pub text: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindowCompression {
    pub sliding_window: Empty,
}

#[derive(Serialize, Debug)]
pub struct SessionResumptionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Serialize, Debug, Default)]
pub struct BidiGenerateContentRealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fresh_setup_enables_resumption_and_transcription() {
        let config = LiveConfig::voice_chat(Some("Be kind.".into())).with_voice(Some("Puck".into()));
        let setup = ClientMessage::Setup(BidiGenerateContentSetup::from_config("gemini-live", &config));

        assert_eq!(
            serde_json::to_value(&setup).unwrap(),
            json!({
                "setup": {
                    "model": "models/gemini-live",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Puck" } }
                        }
                    },
                    "systemInstruction": { "parts": [{ "text": "Be kind." }] },
                    "inputAudioTranscription": {},
                    "outputAudioTranscription": {},
                    "contextWindowCompression": { "slidingWindow": {} },
                    "sessionResumption": {}
                }
            })
        );
    }

    #[test]
    fn test_resuming_setup_carries_the_handle() {
        let config = LiveConfig::voice_chat(None).with_resumption_handle(Some("h1".into()));
        let setup = BidiGenerateContentSetup::from_config("models/gemini-live", &config);
        let value = serde_json::to_value(&setup).unwrap();

        assert_eq!(value["model"], "models/gemini-live");
        assert_eq!(value["sessionResumption"], json!({ "handle": "h1" }));
        assert!(value.get("systemInstruction").is_none());
        assert!(value["generationConfig"].get("speechConfig").is_none());
    }

    #[test]
    fn test_realtime_input_omits_the_unused_half() {
        let audio = ClientMessage::RealtimeInput(BidiGenerateContentRealtimeInput {
            audio: Some(Blob {
                mime_type: "audio/pcm;rate=16000".into(),
                data: "AAAA".into(),
            }),
            ..Default::default()
        });
        assert_eq!(
            serde_json::to_value(&audio).unwrap(),
            json!({ "realtimeInput": { "audio": { "mimeType": "audio/pcm;rate=16000", "data": "AAAA" } } })
        );
    }
}
