//! Message bus sources
//!
//! The pipeline reads from a `MessageSource`. Two are provided:
//! - `ChannelSource` - in-process mpsc channel, ends when every sender is dropped
//! - `JsonlSource` - one envelope per line from stdin, any async reader, or a
//!   tailed file
//!
//! Envelope format: `{"routing_key": "logs.shop-production", "payload": {...}}`.
//! A string payload is taken verbatim as the raw message bytes.

use super::reader::{TailReader, TailStart};
use super::types::RawMessage;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

impl BusError {
    /// Worth retrying after a pause; a bad envelope is not
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Io(_))
    }
}

#[async_trait]
pub trait MessageSource: Send {
    /// Next message; `Ok(None)` once the input has ended
    async fn recv(&mut self) -> Result<Option<RawMessage>, BusError>;

    /// A message that is available without waiting, if any
    fn try_recv(&mut self) -> Option<RawMessage>;

    fn describe(&self) -> String;
}

pub struct ChannelSource {
    rx: mpsc::Receiver<RawMessage>,
}

impl ChannelSource {
    pub fn new(buffer: usize) -> (mpsc::Sender<RawMessage>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<RawMessage>, BusError> {
        Ok(self.rx.recv().await)
    }

    fn try_recv(&mut self) -> Option<RawMessage> {
        self.rx.try_recv().ok()
    }

    fn describe(&self) -> String {
        "in-process channel".to_string()
    }
}

#[derive(Deserialize)]
struct Envelope {
    routing_key: String,
    payload: Value,
}

/// Decode one JSONL envelope line
pub fn decode_envelope(line: &str) -> Result<RawMessage, BusError> {
    let envelope: Envelope = serde_json::from_str(line)?;
    let payload = match envelope.payload {
        Value::String(text) => text.into_bytes(),
        other => serde_json::to_vec(&other)?,
    };
    Ok(RawMessage::new(envelope.routing_key, payload))
}

type BoxedLines = Lines<BufReader<Box<dyn AsyncRead + Unpin + Send>>>;

enum LineInput {
    Reader(BoxedLines),
    Tail(TailReader),
}

pub struct JsonlSource {
    input: LineInput,
    description: String,
}

impl JsonlSource {
    pub fn stdin() -> Self {
        Self::from_reader(tokio::io::stdin(), "stdin")
    }

    pub fn from_reader<R>(reader: R, description: &str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let boxed: Box<dyn AsyncRead + Unpin + Send> = Box::new(reader);
        Self {
            input: LineInput::Reader(BufReader::new(boxed).lines()),
            description: description.to_string(),
        }
    }

    /// Follow a file from its current end; never reports end of input
    pub fn tail(path: PathBuf) -> Self {
        let description = format!("tail {}", path.display());
        Self {
            input: LineInput::Tail(TailReader::new(path, TailStart::End)),
            description,
        }
    }

    async fn next_line(&mut self) -> Result<Option<String>, BusError> {
        match &mut self.input {
            LineInput::Reader(lines) => Ok(lines.next_line().await?),
            LineInput::Tail(tail) => Ok(Some(tail.read_line().await?)),
        }
    }
}

#[async_trait]
impl MessageSource for JsonlSource {
    async fn recv(&mut self) -> Result<Option<RawMessage>, BusError> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return decode_envelope(line).map(Some);
        }
    }

    /// Lines are only read through `recv`; nothing is buffered ahead
    fn try_recv(&mut self) -> Option<RawMessage> {
        None
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}
