use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tokio_stream::wrappers::ReceiverStream;

use aicentral_protocol::sse::{SseEvent, SseParser};

use crate::token_estimate::estimate_tokens;

/// Response-header/trailer name carrying the final streamed completion-token
/// estimate, per the external interface contract.
pub const STREAMING_TOKENS_TRAILER: &str = "x-aicentral-streaming-tokens";

type ChunkResult = Result<Bytes, std::io::Error>;

/// Wraps an upstream byte stream in a tee: bytes are forwarded to the
/// caller unmodified while an `SseParser` running alongside accumulates an
/// incremental completion-token estimate. The estimate is delivered once,
/// through the returned `oneshot::Receiver`, when the upstream stream ends
/// — callers await it on the return path to populate `UsageInformation`
/// and the streaming trailer. `permit`, if given, is held for the task's
/// whole lifetime so an endpoint's concurrency slot stays occupied for as
/// long as the stream is being drained, not just until headers arrive.
pub fn spawn_streaming_tee<S>(
    mut upstream: S,
    permit: Option<OwnedSemaphorePermit>,
) -> (ReceiverStream<ChunkResult>, oneshot::Receiver<u64>)
where
    S: Stream<Item = ChunkResult> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let _permit = permit;
        let mut parser = SseParser::new();
        let mut total: u64 = 0;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(bytes) => {
                    for event in parser.push_bytes(&bytes) {
                        total += estimate_event_tokens(&event);
                    }
                    if tx.send(Ok(bytes)).await.is_err() {
                        // caller disconnected; stop forwarding but still
                        // finish the estimate so post() hooks can reconcile.
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }

        for event in parser.finish() {
            total += estimate_event_tokens(&event);
        }
        let _ = done_tx.send(total);
    });

    (ReceiverStream::new(rx), done_rx)
}

fn estimate_event_tokens(event: &SseEvent) -> u64 {
    if event.data.trim() == "[DONE]" {
        return 0;
    }
    delta_content(&event.data)
        .map(|text| estimate_tokens(&text))
        .unwrap_or(0)
}

fn delta_content(data: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt as TokioStreamExt;

    fn chunk(s: &str) -> ChunkResult {
        Ok(Bytes::from(s.to_string()))
    }

    #[tokio::test]
    async fn forwards_bytes_and_estimates_tokens() {
        let upstream = tokio_stream::iter(vec![
            chunk("data: {\"choices\":[{\"delta\":{\"content\":\"hello world\"}}]}\n\n"),
            chunk("data: [DONE]\n\n"),
        ]);
        let (mut out, done) = spawn_streaming_tee(upstream, None);

        let mut forwarded = Vec::new();
        while let Some(chunk) = TokioStreamExt::next(&mut out).await {
            forwarded.push(chunk.unwrap());
        }
        assert_eq!(forwarded.len(), 2);

        let total = done.await.unwrap();
        assert_eq!(total, estimate_tokens("hello world"));
    }

    #[tokio::test]
    async fn sum_of_chunks_equals_final_total() {
        let words = ["one ", "two ", "three ", "four"];
        let mut chunks: Vec<ChunkResult> = words
            .iter()
            .map(|w| chunk(&format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{w}\"}}}}]}}\n\n")))
            .collect();
        chunks.push(chunk("data: [DONE]\n\n"));

        let expected: u64 = words.iter().map(|w| estimate_tokens(w)).sum();

        let upstream = tokio_stream::iter(chunks);
        let (mut out, done) = spawn_streaming_tee(upstream, None);
        while TokioStreamExt::next(&mut out).await.is_some() {}
        let total = done.await.unwrap();
        assert_eq!(total, expected);
    }
}
