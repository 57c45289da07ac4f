//! Length-prefixed JSON framing.
//!
//! Every message is `<8 ASCII digits, zero padded><that many bytes of JSON>`,
//! for example `00000015{"key":"value"}`. The format is not binary safe and
//! only carries JSON objects. A malformed header poisons the decoder: framing
//! can not be recovered once it is lost, so the channel is unusable.

use std::collections::VecDeque;
use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Size of the length header.
pub const LENGTH_SIZE: usize = 8;

/// Largest body an 8-digit header can describe.
pub const MAX_FRAME: usize = 99_999_999;

/// Encodes one message as a frame.
pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let value = serde_json::to_value(message)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject(kind(&value)));
    }

    let body = serde_json::to_vec(&value)?;
    if body.len() > MAX_FRAME {
        return Err(ProtocolError::TooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(LENGTH_SIZE + body.len());
    frame.extend_from_slice(format!("{:0width$}", body.len(), width = LENGTH_SIZE).as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "a boolean",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "a list",
        Json::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Data(usize),
    Poisoned,
}

/// Incremental decoder. Bytes may arrive in any split; complete frames come
/// out in order, each exactly once.
#[derive(Debug)]
pub struct JsonProtocolDecoder {
    state: DecodeState,
    buffer: Vec<u8>,
}

impl Default for JsonProtocolDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonProtocolDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Head,
            buffer: Vec::new(),
        }
    }

    /// Whether no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Head && self.buffer.is_empty()
    }

    /// Feeds bytes and returns every message completed by them.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Json>, ProtocolError> {
        if self.state == DecodeState::Poisoned {
            return Err(self.bad_length());
        }

        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        let mut offset = 0;

        loop {
            let available = &self.buffer[offset..];
            match self.state {
                DecodeState::Head => {
                    if available.len() < LENGTH_SIZE {
                        break;
                    }
                    let header = &available[..LENGTH_SIZE];
                    if !header.iter().all(u8::is_ascii_digit) {
                        self.buffer.drain(..offset);
                        self.state = DecodeState::Poisoned;
                        return Err(self.bad_length());
                    }
                    // Eight ASCII digits always parse.
                    let length = header
                        .iter()
                        .fold(0usize, |acc, digit| acc * 10 + usize::from(digit - b'0'));
                    offset += LENGTH_SIZE;
                    self.state = DecodeState::Data(length);
                }
                DecodeState::Data(length) => {
                    if available.len() < length {
                        break;
                    }
                    let message = serde_json::from_slice(&available[..length]);
                    offset += length;
                    self.state = DecodeState::Head;
                    match message {
                        Ok(message) => messages.push(message),
                        Err(err) => {
                            self.state = DecodeState::Poisoned;
                            return Err(err.into());
                        }
                    }
                }
                DecodeState::Poisoned => break,
            }
        }

        self.buffer.drain(..offset);
        Ok(messages)
    }

    fn bad_length(&self) -> ProtocolError {
        let header = &self.buffer[..self.buffer.len().min(LENGTH_SIZE)];
        ProtocolError::BadLength {
            header: String::from_utf8_lossy(header).into_owned(),
            buffered: self.buffer.len(),
        }
    }
}

/// A framed JSON channel over a pair of async byte streams.
pub struct JsonChannel<R, W> {
    reader: R,
    writer: W,
    decoder: JsonProtocolDecoder,
    inbox: VecDeque<Json>,
    chunk: Box<[u8]>,
}

impl<R, W> JsonChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            decoder: JsonProtocolDecoder::new(),
            inbox: VecDeque::new(),
            chunk: vec![0; 8192].into_boxed_slice(),
        }
    }

    /// Waits for the next message. `Ok(None)` means the peer closed the
    /// channel between frames.
    ///
    /// Cancel safe: bytes already read stay buffered in the decoder.
    pub async fn read_message(&mut self) -> Result<Option<Json>, ProtocolError> {
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(Some(message));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.is_idle() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel closed in the middle of a frame",
                )
                .into());
            }

            self.inbox.extend(self.decoder.decode(&self.chunk[..n])?);
        }
    }

    /// Like [`JsonChannel::read_message`], decoding into `T`.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        match self.read_message().await? {
            Some(message) => Ok(Some(serde_json::from_value(message)?)),
            None => Ok(None),
        }
    }

    pub async fn write_message<T: Serialize + ?Sized>(
        &mut self,
        message: &T,
    ) -> Result<(), ProtocolError> {
        let frame = encode(message)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
