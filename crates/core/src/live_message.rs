//! Typed view over upstream server messages.
//!
//! Only the fields the bridge acts on are modelled; the raw JSON is what gets
//! forwarded to the client.

use serde::Deserialize;

#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub session_resumption_update: Option<SessionResumptionUpdate>,
    pub go_away: Option<GoAway>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
    pub turn_complete: Option<bool>,
    pub generation_complete: Option<bool>,
    pub interrupted: Option<bool>,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumptionUpdate {
    pub new_handle: Option<String>,
    pub resumable: Option<bool>,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    /// Protobuf duration string, e.g. `"10s"`.
    pub time_left: Option<String>,
}

impl LiveServerMessage {
    pub fn parse(raw: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(raw.clone()).ok()
    }

    /// A handle the upstream says can be used to resume this session.
    pub fn resumption_handle(&self) -> Option<&str> {
        let update = self.session_resumption_update.as_ref()?;
        if update.resumable == Some(false) {
            return None;
        }
        update.new_handle.as_deref().filter(|h| !h.is_empty())
    }

    pub fn input_text(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .input_transcription
            .as_ref()
            .map(|t| t.text.as_str())
    }

    pub fn output_text(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .output_transcription
            .as_ref()
            .map(|t| t.text.as_str())
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|c| c.turn_complete)
            .unwrap_or(false)
    }

    pub fn is_generation_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|c| c.generation_complete)
            .unwrap_or(false)
    }

    /// True when the message only carries resumption or go-away notices, which
    /// reach the client through their own push types.
    pub fn is_control_only(&self) -> bool {
        (self.session_resumption_update.is_some() || self.go_away.is_some())
            && self.setup_complete.is_none()
            && self.server_content.is_none()
            && self.other.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transcriptions_and_flags_are_extracted() {
        let raw = json!({
            "serverContent": {
                "inputTranscription": { "text": "why is the sky blue" },
                "outputTranscription": { "text": "Great question" },
                "turnComplete": true
            }
        });
        let msg = LiveServerMessage::parse(&raw).unwrap();
        assert_eq!(msg.input_text(), Some("why is the sky blue"));
        assert_eq!(msg.output_text(), Some("Great question"));
        assert!(msg.is_turn_complete());
        assert!(!msg.is_generation_complete());
        assert!(!msg.is_control_only());
    }

    #[test]
    fn test_resumption_update_needs_a_resumable_handle() {
        let raw = json!({ "sessionResumptionUpdate": { "newHandle": "abc", "resumable": true } });
        let msg = LiveServerMessage::parse(&raw).unwrap();
        assert_eq!(msg.resumption_handle(), Some("abc"));
        assert!(msg.is_control_only());

        let raw = json!({ "sessionResumptionUpdate": { "newHandle": "abc", "resumable": false } });
        assert_eq!(LiveServerMessage::parse(&raw).unwrap().resumption_handle(), None);

        let raw = json!({ "sessionResumptionUpdate": { "resumable": true } });
        assert_eq!(LiveServerMessage::parse(&raw).unwrap().resumption_handle(), None);
    }

    #[test]
    fn test_go_away_carries_time_left() {
        let raw = json!({ "goAway": { "timeLeft": "10s" } });
        let msg = LiveServerMessage::parse(&raw).unwrap();
        assert_eq!(msg.go_away.as_ref().unwrap().time_left.as_deref(), Some("10s"));
        assert!(msg.is_control_only());
    }

    #[test]
    fn test_unknown_fields_keep_a_message_forwardable() {
        let raw = json!({ "goAway": { "timeLeft": "1s" }, "usageMetadata": { "totalTokenCount": 10 } });
        let msg = LiveServerMessage::parse(&raw).unwrap();
        assert!(!msg.is_control_only());
    }
}
