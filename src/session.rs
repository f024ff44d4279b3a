//! One inbound chat request: the upstream call and translator run on a spawned
//! task, the drain side lives in the SSE response body.

use crate::error::StreamError;
use crate::protocol::{CompletionChunk, Message};
use crate::translator::{ResponseMode, StreamTranslator, Termination, TranslatorOutput};
use crate::upstream::UpstreamClient;
use axum::http::HeaderValue;
use axum::http::header::{CONNECTION, CONTENT_TYPE};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

pub const DONE_MARKER: &str = "[DONE]";

/// Starts the producer task and returns the consumer side. Dropping the
/// returned drain cancels the producer.
pub fn start(upstream: UpstreamClient, model: String, messages: Vec<Message>) -> SessionDrain {
    let cancel = CancellationToken::new();
    let chunk_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let (translator, output) = StreamTranslator::new(chunk_id, model.clone(), cancel.clone());
    metrics::counter!("chathub_relay_sessions_total").increment(1);
    tokio::spawn(async move {
        let termination = produce(upstream, translator, &model, &messages).await;
        tracing::debug!(model = %model, termination = ?termination, "session producer exited");
    });
    SessionDrain::new(output, cancel)
}

async fn produce(
    upstream: UpstreamClient,
    translator: StreamTranslator,
    model: &str,
    messages: &[Message],
) -> Termination {
    let cancel = translator.cancel_token().clone();
    let resp = match upstream.call(&cancel, model, messages).await {
        Ok(resp) => resp,
        Err(err) => return translator.fail(err).await,
    };
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let mode = ResponseMode::classify(&content_type);
    tracing::debug!(content_type = %content_type, mode = ?mode, "upstream responded");
    let body = Box::pin(resp.bytes_stream())
        .map(|chunk| chunk.map_err(std::io::Error::other));
    translator.run(mode, body).await
}

#[derive(Debug)]
pub enum Frame {
    Chunk(CompletionChunk),
    Error(String),
    Done,
}

impl Frame {
    /// `None` when a chunk cannot be serialized; the caller skips it.
    pub fn into_event(self) -> Option<Event> {
        match self {
            Frame::Chunk(chunk) => match Event::default().json_data(&chunk) {
                Ok(event) => Some(event),
                Err(err) => {
                    tracing::error!("failed to marshal chunk: {err}");
                    None
                }
            },
            Frame::Error(message) => {
                Some(Event::default().data(json!({ "error": message }).to_string()))
            }
            Frame::Done => Some(Event::default().data(DONE_MARKER)),
        }
    }
}

/// Consumer half of a session. Services both channels in one select and
/// yields exactly one terminal frame: `[DONE]` once both channels are closed
/// without a fatal error, or the first fatal error.
pub struct SessionDrain {
    chunks: Option<mpsc::Receiver<CompletionChunk>>,
    errors: Option<mpsc::Receiver<StreamError>>,
    finished: bool,
    started_at: Instant,
    _cancel: DropGuard,
}

impl SessionDrain {
    pub fn new(output: TranslatorOutput, cancel: CancellationToken) -> Self {
        Self {
            chunks: Some(output.chunks),
            errors: Some(output.errors),
            finished: false,
            started_at: Instant::now(),
            _cancel: cancel.drop_guard(),
        }
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        if self.finished {
            return None;
        }
        loop {
            if self.chunks.is_none() && self.errors.is_none() {
                return Some(self.finish(Frame::Done));
            }
            tokio::select! {
                biased;
                chunk = recv_open(&mut self.chunks) => match chunk {
                    Some(chunk) => {
                        metrics::counter!("chathub_relay_chunks_total").increment(1);
                        return Some(Frame::Chunk(chunk));
                    }
                    None => self.chunks = None,
                },
                err = recv_open(&mut self.errors) => match err {
                    Some(err) => {
                        metrics::counter!("chathub_relay_stream_errors_total", "kind" => err.kind())
                            .increment(1);
                        if !err.is_fatal() {
                            tracing::warn!("skipping upstream line: {err}");
                            continue;
                        }
                        tracing::error!("error in request: {err}");
                        return Some(self.finish(Frame::Error(err.to_string())));
                    }
                    None => self.errors = None,
                },
            }
        }
    }

    fn finish(&mut self, frame: Frame) -> Frame {
        self.finished = true;
        self.chunks = None;
        self.errors = None;
        metrics::histogram!("chathub_relay_session_duration_seconds")
            .record(self.started_at.elapsed().as_secs_f64());
        frame
    }

    pub fn into_stream(
        self,
    ) -> impl futures_util::Stream<Item = Result<Event, Infallible>> + Send + 'static {
        futures_util::stream::unfold(self, |mut drain| async move {
            loop {
                let frame = drain.next_frame().await?;
                if let Some(event) = frame.into_event() {
                    return Some((Ok(event), drain));
                }
            }
        })
    }
}

impl IntoResponse for SessionDrain {
    fn into_response(self) -> Response {
        let mut resp = Sse::new(self.into_stream()).into_response();
        resp.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        resp
    }
}

async fn recv_open<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::{Frame, SessionDrain};
    use crate::error::StreamError;
    use crate::protocol::CompletionChunk;
    use crate::translator::TranslatorOutput;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn channels() -> (
        mpsc::Sender<CompletionChunk>,
        mpsc::Sender<StreamError>,
        TranslatorOutput,
    ) {
        let (chunks_tx, chunks) = mpsc::channel(4);
        let (errors_tx, errors) = mpsc::channel(4);
        (chunks_tx, errors_tx, TranslatorOutput { chunks, errors })
    }

    fn chunk(text: &str) -> CompletionChunk {
        CompletionChunk::text_delta("chatcmpl-1", "m", text)
    }

    #[tokio::test]
    async fn closed_channels_end_with_done() {
        let (chunks_tx, errors_tx, out) = channels();
        chunks_tx.send(chunk("a")).await.unwrap();
        drop(chunks_tx);
        drop(errors_tx);

        let mut drain = SessionDrain::new(out, CancellationToken::new());
        match drain.next_frame().await {
            Some(Frame::Chunk(c)) => assert_eq!(c.choices[0].delta.content.as_deref(), Some("a")),
            other => panic!("expected chunk, got {other:?}"),
        }
        assert!(matches!(drain.next_frame().await, Some(Frame::Done)));
        assert!(drain.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn malformed_line_errors_do_not_end_the_session() {
        let (chunks_tx, errors_tx, out) = channels();
        errors_tx
            .send(StreamError::UpstreamLineMalformed("bad".to_string()))
            .await
            .unwrap();
        drop(errors_tx);
        let mut drain = SessionDrain::new(out, CancellationToken::new());

        chunks_tx.send(chunk("b")).await.unwrap();
        drop(chunks_tx);
        assert!(matches!(drain.next_frame().await, Some(Frame::Chunk(_))));
        assert!(matches!(drain.next_frame().await, Some(Frame::Done)));
    }

    #[tokio::test]
    async fn fatal_error_is_the_only_terminal_frame() {
        let (chunks_tx, errors_tx, out) = channels();
        errors_tx
            .send(StreamError::UpstreamDecodeFailed("eof".to_string()))
            .await
            .unwrap();
        drop(chunks_tx);
        drop(errors_tx);

        let mut drain = SessionDrain::new(out, CancellationToken::new());
        match drain.next_frame().await {
            Some(Frame::Error(message)) => assert!(message.contains("eof")),
            other => panic!("expected error frame, got {other:?}"),
        }
        assert!(drain.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn fatal_error_stops_draining_chunks() {
        let (chunks_tx, errors_tx, out) = channels();
        errors_tx
            .send(StreamError::UpstreamReadFailed("reset".to_string()))
            .await
            .unwrap();
        let mut drain = SessionDrain::new(out, CancellationToken::new());
        assert!(matches!(drain.next_frame().await, Some(Frame::Error(_))));
        assert!(chunks_tx.send(chunk("late")).await.is_err());
    }

    #[tokio::test]
    async fn dropping_the_drain_cancels_the_producer() {
        let (_chunks_tx, _errors_tx, out) = channels();
        let cancel = CancellationToken::new();
        let drain = SessionDrain::new(out, cancel.clone());
        assert!(!cancel.is_cancelled());
        drop(drain);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn response_body_is_sse_frames_ending_in_done() {
        let (chunks_tx, errors_tx, out) = channels();
        chunks_tx.send(chunk("hi")).await.unwrap();
        drop(chunks_tx);
        drop(errors_tx);

        let resp = SessionDrain::new(out, CancellationToken::new()).into_response();
        let headers = resp.headers().clone();
        assert_eq!(headers["content-type"], "text/event-stream");
        assert_eq!(headers["cache-control"], "no-cache");
        assert_eq!(headers["connection"], "keep-alive");

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.contains("\"content\":\"hi\""));
        assert!(text.ends_with("data: [DONE]\n\n"));
        assert_eq!(text.matches("[DONE]").count(), 1);
    }
}
