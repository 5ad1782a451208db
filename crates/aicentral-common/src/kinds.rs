use serde::{Deserialize, Serialize};

/// The inferred semantic type of an inbound request, independent of which
/// provider ultimately serves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Chat,
    Completion,
    Embedding,
    ImageGeneration,
    Transcription,
    Translation,
    AssistantControl,
    Other,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Chat => "chat",
            CallKind::Completion => "completion",
            CallKind::Embedding => "embedding",
            CallKind::ImageGeneration => "image_generation",
            CallKind::Transcription => "transcription",
            CallKind::Translation => "translation",
            CallKind::AssistantControl => "assistant_control",
            CallKind::Other => "other",
        }
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the response should be buffered before being returned, or
/// streamed chunk-for-chunk as it arrives from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    Buffered,
    Streaming,
}

impl ResponseShape {
    pub fn is_streaming(&self) -> bool {
        matches!(self, ResponseShape::Streaming)
    }
}
