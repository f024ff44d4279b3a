use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

/// Inbound request body. Missing fields and `null` take their empty value;
/// only the JSON shape is checked.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChatRequest {
    #[serde(deserialize_with = "null_as_default")]
    pub model: String,
    #[serde(deserialize_with = "null_as_default")]
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Message {
    #[serde(deserialize_with = "null_as_default")]
    pub role: String,
    #[serde(deserialize_with = "null_as_default")]
    pub content: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub system_fingerprint: String,
    pub choices: Vec<Choice>,
}

impl CompletionChunk {
    /// Single-choice chunk carrying one content delta.
    pub fn text_delta(id: &str, model: &str, content: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            object: CHUNK_OBJECT.to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            system_fingerprint: String::new(),
            choices: vec![Choice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: Some(content.into()),
                },
                logprobs: None,
                finish_reason: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Choice {
    pub index: u32,
    // Non-streaming upstream replies carry `message` where chunks carry `delta`.
    #[serde(alias = "message")]
    pub delta: Delta,
    pub logprobs: Option<Value>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One decoded `data: ` line of the upstream event stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamEvent {
    #[serde(rename = "type", default)]
    pub kind: UpstreamEventKind,
    #[serde(rename = "textDelta", default)]
    pub text_delta: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamEventKind {
    TextDelta,
    Done,
    #[default]
    #[serde(other)]
    Other,
}
