//! Upstream body → OpenAI chunk translation.
//!
//! The translator runs as the producer half of a session. It owns the sending
//! side of two channels (chunks and errors); both close when the translator is
//! dropped, whichever way it terminates.

use crate::error::StreamError;
use crate::protocol::{CompletionChunk, UpstreamEvent, UpstreamEventKind};
use bytes::Bytes;
use futures_util::Stream;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

pub const DATA_PREFIX: &[u8] = b"data: ";

/// One slot each: the producer waits for the session to drain.
const CHANNEL_CAPACITY: usize = 1;

/// Longest accepted event-stream line, newline included.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Largest accepted single-JSON reply body.
pub const MAX_JSON_BYTES: usize = 8 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    SingleJson,
    EventStream,
}

impl ResponseMode {
    /// Exact match on `application/json`; anything else (including parameters
    /// such as `; charset=utf-8`) is parsed line by line.
    pub fn classify(content_type: &str) -> Self {
        if content_type == mime::APPLICATION_JSON.essence_str() {
            ResponseMode::SingleJson
        } else {
            ResponseMode::EventStream
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Upstream sent an explicit `done` event.
    Done,
    EndOfStream,
    /// The session went away or the token was cancelled.
    Cancelled,
    Failed,
}

pub struct TranslatorOutput {
    pub chunks: mpsc::Receiver<CompletionChunk>,
    pub errors: mpsc::Receiver<StreamError>,
}

pub struct StreamTranslator {
    chunk_id: String,
    model: String,
    cancel: CancellationToken,
    chunks: mpsc::Sender<CompletionChunk>,
    errors: mpsc::Sender<StreamError>,
}

enum LineOutcome {
    Skip,
    Chunk(CompletionChunk),
    Done,
    Malformed(StreamError),
}

impl StreamTranslator {
    pub fn new(
        chunk_id: impl Into<String>,
        model: impl Into<String>,
        cancel: CancellationToken,
    ) -> (Self, TranslatorOutput) {
        let (chunks_tx, chunks_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let translator = Self {
            chunk_id: chunk_id.into(),
            model: model.into(),
            cancel,
            chunks: chunks_tx,
            errors: errors_tx,
        };
        let output = TranslatorOutput {
            chunks: chunks_rx,
            errors: errors_rx,
        };
        (translator, output)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Reports an error raised before translation started (credential or
    /// connection failure) and closes both channels.
    pub async fn fail(self, err: StreamError) -> Termination {
        if matches!(err, StreamError::Cancelled) {
            tracing::info!("session cancelled before upstream replied");
            return Termination::Cancelled;
        }
        self.send_error(err).await;
        Termination::Failed
    }

    pub async fn run<S>(self, mode: ResponseMode, body: S) -> Termination
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + Unpin,
    {
        let reader = StreamReader::new(body);
        let termination = match mode {
            ResponseMode::SingleJson => self.run_single_json(reader).await,
            ResponseMode::EventStream => self.run_event_stream(reader).await,
        };
        tracing::debug!(model = %self.model, termination = ?termination, "translator finished");
        termination
    }

    async fn run_single_json<R>(&self, reader: R) -> Termination
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut body = Vec::new();
        let mut limited = reader.take(MAX_JSON_BYTES as u64 + 1);
        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::info!("context cancelled while reading JSON response");
                return Termination::Cancelled;
            }
            read = limited.read_to_end(&mut body) => read,
        };
        if let Err(err) = read {
            tracing::error!("error reading JSON response: {err}");
            self.send_error(StreamError::UpstreamReadFailed(err.to_string()))
                .await;
            return Termination::Failed;
        }
        if body.len() > MAX_JSON_BYTES {
            tracing::error!("JSON response exceeds {MAX_JSON_BYTES} bytes");
            self.send_error(StreamError::UpstreamReadFailed(format!(
                "response body exceeds {MAX_JSON_BYTES} bytes"
            )))
            .await;
            return Termination::Failed;
        }
        // Only the first document counts; trailing bytes are ignored.
        let decoded = serde_json::Deserializer::from_slice(&body)
            .into_iter::<CompletionChunk>()
            .next()
            .unwrap_or_else(|| Err(serde::de::Error::custom("empty response body")));
        match decoded {
            Ok(chunk) => {
                if self.send_chunk(chunk).await {
                    Termination::EndOfStream
                } else {
                    Termination::Cancelled
                }
            }
            Err(err) => {
                tracing::error!("failed to decode JSON response: {err}");
                self.send_error(StreamError::UpstreamDecodeFailed(err.to_string()))
                    .await;
                Termination::Failed
            }
        }
    }

    async fn run_event_stream<R>(&self, mut reader: R) -> Termination
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        let mut line = Vec::new();
        loop {
            line.clear();
            let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64 + 1);
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!("context cancelled, stopping stream processing");
                    return Termination::Cancelled;
                }
                read = limited.read_until(b'\n', &mut line) => read,
            };
            match read {
                Ok(0) => return Termination::EndOfStream,
                Ok(_) if line.len() > MAX_LINE_BYTES => {
                    tracing::error!("upstream line exceeds {MAX_LINE_BYTES} bytes");
                    self.send_error(StreamError::UpstreamReadFailed(format!(
                        "line exceeds {MAX_LINE_BYTES} bytes"
                    )))
                    .await;
                    return Termination::Failed;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!("error reading response: {err}");
                    self.send_error(StreamError::UpstreamReadFailed(err.to_string()))
                        .await;
                    return Termination::Failed;
                }
            }

            match self.translate_line(&line) {
                LineOutcome::Skip => {}
                LineOutcome::Done => return Termination::Done,
                LineOutcome::Chunk(chunk) => {
                    if !self.send_chunk(chunk).await {
                        return Termination::Cancelled;
                    }
                }
                LineOutcome::Malformed(err) => {
                    tracing::warn!("{err}");
                    if !self.send_error(err).await {
                        return Termination::Cancelled;
                    }
                }
            }
        }
    }

    fn translate_line(&self, line: &[u8]) -> LineOutcome {
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return LineOutcome::Skip;
        };
        let event: UpstreamEvent = match serde_json::from_slice(payload.trim_ascii()) {
            Ok(event) => event,
            Err(err) => {
                return LineOutcome::Malformed(StreamError::UpstreamLineMalformed(err.to_string()));
            }
        };
        match event.kind {
            UpstreamEventKind::TextDelta => LineOutcome::Chunk(CompletionChunk::text_delta(
                &self.chunk_id,
                &self.model,
                event.text_delta.unwrap_or_default(),
            )),
            UpstreamEventKind::Done => LineOutcome::Done,
            UpstreamEventKind::Other => LineOutcome::Skip,
        }
    }

    /// Returns false once the session is gone.
    async fn send_chunk(&self, chunk: CompletionChunk) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.chunks.send(chunk) => sent.is_ok(),
        }
    }

    async fn send_error(&self, err: StreamError) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.errors.send(err) => sent.is_ok(),
        }
    }
}
