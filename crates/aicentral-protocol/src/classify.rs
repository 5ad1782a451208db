use aicentral_common::{CallKind, ResponseShape};
use bytes::Bytes;
use http::{HeaderMap, Method};
use serde_json::Value;

use crate::error::ClassifyError;
use crate::types::CallDetails;

/// Parses method, path, headers and a fully-buffered body into `CallDetails`.
///
/// Recognizes Azure-shaped `/openai/deployments/{deployment}/...` paths and
/// OpenAI-shaped `/v1/...` paths. An unrecognized path shape is not an
/// error: it classifies as `CallKind::Other` with the path forwarded
/// untouched, per the dispatcher's best-effort proxy behavior.
pub fn classify_request(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<CallDetails, ClassifyError> {
    let trimmed = path.trim_start_matches('/');
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();

    let body_json = parse_body_json(method, &body)?;

    let (call_kind, deployment_name, assistant_id) = match segments.as_slice() {
        ["openai", "deployments", deployment, "chat", "completions"] => {
            (CallKind::Chat, Some((*deployment).to_string()), None)
        }
        ["openai", "deployments", deployment, "completions"] => {
            (CallKind::Completion, Some((*deployment).to_string()), None)
        }
        ["openai", "deployments", deployment, "embeddings"] => {
            (CallKind::Embedding, Some((*deployment).to_string()), None)
        }
        ["openai", "deployments", deployment, "images", "generations"] => {
            (CallKind::ImageGeneration, Some((*deployment).to_string()), None)
        }
        ["openai", "deployments", deployment, "audio", "transcriptions"] => {
            (CallKind::Transcription, Some((*deployment).to_string()), None)
        }
        ["openai", "deployments", deployment, "audio", "translations"] => {
            (CallKind::Translation, Some((*deployment).to_string()), None)
        }
        ["openai", "assistants"] => (CallKind::AssistantControl, None, None),
        ["openai", "assistants", assistant_id, ..] => {
            (CallKind::AssistantControl, None, Some((*assistant_id).to_string()))
        }
        ["v1", "chat", "completions"] => (CallKind::Chat, None, None),
        ["v1", "completions"] => (CallKind::Completion, None, None),
        ["v1", "embeddings"] => (CallKind::Embedding, None, None),
        ["v1", "images", "generations"] => (CallKind::ImageGeneration, None, None),
        ["v1", "audio", "transcriptions"] => (CallKind::Transcription, None, None),
        ["v1", "audio", "translations"] => (CallKind::Translation, None, None),
        ["v1", "assistants"] => (CallKind::AssistantControl, None, None),
        ["v1", "assistants", assistant_id, ..] => {
            (CallKind::AssistantControl, None, Some((*assistant_id).to_string()))
        }
        _ => (CallKind::Other, None, None),
    };

    let incoming_model_name = body_json
        .as_ref()
        .and_then(|v| v.get("model"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let response_shape = body_json
        .as_ref()
        .and_then(|v| v.get("stream"))
        .and_then(Value::as_bool)
        .filter(|&s| s)
        .map(|_| ResponseShape::Streaming)
        .unwrap_or(ResponseShape::Buffered);

    let prompt_text = body_json
        .as_ref()
        .and_then(|v| prompt_text_for(call_kind, v));

    let preferred_endpoint_id = header_value(headers, "x-aicentral-affinity");

    Ok(CallDetails {
        call_kind,
        incoming_model_name,
        deployment_name,
        assistant_id,
        prompt_text,
        response_shape,
        remaining_path: path.to_string(),
        raw_body: body,
        consumer_id: None,
        preferred_endpoint_id,
    })
}

fn parse_body_json(method: &Method, body: &[u8]) -> Result<Option<Value>, ClassifyError> {
    if body.is_empty() || method == Method::GET {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|err| ClassifyError::InvalidJson(err.to_string()))
}

fn prompt_text_for(call_kind: CallKind, body: &Value) -> Option<String> {
    match call_kind {
        CallKind::Chat => body.get("messages").and_then(Value::as_array).map(|messages| {
            messages
                .iter()
                .filter_map(message_content)
                .collect::<Vec<_>>()
                .join("\n")
        }),
        CallKind::Completion => body.get("prompt").and_then(value_as_text),
        CallKind::Embedding => body.get("input").and_then(value_as_text),
        _ => None,
    }
}

fn message_content(message: &Value) -> Option<String> {
    let content = message.get("content")?;
    value_as_text(content)
}

/// A `string`, an array of strings, or an array of `{type, text}` content
/// parts — all three shapes appear across the chat/completions/embeddings
/// request bodies this classifier accepts.
fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let joined = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => item.get("text").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            if joined.is_empty() { None } else { Some(joined) }
        }
        _ => None,
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers() -> HeaderMap {
        HeaderMap::new()
    }

    #[test]
    fn classifies_azure_chat_completions() {
        let body = Bytes::from(r#"{"messages":[{"role":"user","content":"hi"}],"stream":true}"#);
        let details = classify_request(
            &Method::POST,
            "/openai/deployments/gpt4-prod/chat/completions",
            &headers(),
            body,
        )
        .unwrap();
        assert_eq!(details.call_kind, CallKind::Chat);
        assert_eq!(details.deployment_name.as_deref(), Some("gpt4-prod"));
        assert!(details.response_shape.is_streaming());
        assert_eq!(details.prompt_text.as_deref(), Some("hi"));
    }

    #[test]
    fn classifies_openai_chat_completions() {
        let body = Bytes::from(r#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#);
        let details =
            classify_request(&Method::POST, "/v1/chat/completions", &headers(), body).unwrap();
        assert_eq!(details.call_kind, CallKind::Chat);
        assert_eq!(details.incoming_model_name.as_deref(), Some("gpt-4"));
        assert!(!details.response_shape.is_streaming());
    }

    #[test]
    fn unknown_path_is_other_not_an_error() {
        let details =
            classify_request(&Method::GET, "/some/unknown/path", &headers(), Bytes::new())
                .unwrap();
        assert_eq!(details.call_kind, CallKind::Other);
        assert_eq!(details.remaining_path, "/some/unknown/path");
    }

    #[test]
    fn malformed_json_is_rejected() {
        let body = Bytes::from("{not json");
        let err = classify_request(&Method::POST, "/v1/chat/completions", &headers(), body)
            .unwrap_err();
        assert!(matches!(err, ClassifyError::InvalidJson(_)));
    }

    #[test]
    fn affinity_header_is_captured() {
        let mut h = headers();
        h.insert("x-aicentral-affinity", HeaderValue::from_static("azure-east"));
        let details =
            classify_request(&Method::GET, "/v1/models", &h, Bytes::new()).unwrap();
        assert_eq!(details.preferred_endpoint_id.as_deref(), Some("azure-east"));
    }
}
