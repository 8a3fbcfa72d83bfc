//! Wire protocol between the host backend and the NPU daemon
//!
//! Every frame is
//!
//! ```text
//! u32 LE total length | u32 LE header length | JSON header | binary body
//! ```
//!
//! where `total length` counts everything after itself. Tensor bodies are
//! little-endian f32 arrays.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::engine::model::{GraphFormat, ModelManifest};
use crate::engine::preprocess::InputSize;

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame, guards against garbage length prefixes
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorHeader {
    pub name: String,
    pub shape: Vec<usize>,
}

impl TensorHeader {
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Graph rejected (format, corrupt weights, driver refusal)
    Load,
    /// Request carried a malformed tensor
    Input,
    /// Unknown session or backend failure
    Resource,
    /// Unexpected message or version mismatch
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello { version: u32 },
    Welcome { version: u32, formats: Vec<GraphFormat> },
    /// Body: graph blob
    Load { manifest: ModelManifest },
    /// `input_sizes`: what the loaded graph runs, a subset of the manifest's
    Loaded { session: u64, input_sizes: Vec<InputSize> },
    /// Body: CHW f32 input tensor
    Infer { session: u64, width: u32, height: u32 },
    /// Body: the output tensors, concatenated in header order
    Outputs { tensors: Vec<TensorHeader> },
    Release { session: u64 },
    Released,
    Failure { kind: FailureKind, message: String },
}

impl Message {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Message::Failure {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message: Message,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            body: Vec::new(),
        }
    }

    pub fn with_body(message: Message, body: Vec<u8>) -> Self {
        Self { message, body }
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let total = 4 + header.len() + self.body.len();
        if total > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds limit", total),
            ));
        }

        let mut out = Vec::with_capacity(4 + total);
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&(header.len() as u32).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Decode the part after the total length prefix.
    fn decode_payload(mut payload: Vec<u8>) -> io::Result<Self> {
        if payload.len() < 4 {
            return Err(invalid("frame shorter than its header length"));
        }
        let header_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        if 4 + header_len > payload.len() {
            return Err(invalid("header length exceeds frame"));
        }
        let message: Message = serde_json::from_slice(&payload[4..4 + header_len])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let body = payload.split_off(4 + header_len);
        Ok(Self { message, body })
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn check_len(total: u32) -> io::Result<usize> {
    let total = total as usize;
    if total > MAX_FRAME_LEN {
        return Err(invalid("frame length exceeds limit"));
    }
    Ok(total)
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    writer.write_all(&frame.encode()?)?;
    writer.flush()
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Frame> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let total = check_len(u32::from_le_bytes(len))?;
    let mut payload = vec![0u8; total];
    reader.read_exact(&mut payload)?;
    Frame::decode_payload(payload)
}

pub async fn write_frame_async<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    writer.write_all(&frame.encode()?).await?;
    writer.flush().await
}

/// Read one frame; `Ok(None)` on a clean end of stream.
pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let total = check_len(u32::from_le_bytes(len))?;
    let mut payload = vec![0u8; total];
    reader.read_exact(&mut payload).await?;
    Frame::decode_payload(payload).map(Some)
}

pub fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn bytes_to_f32s(bytes: &[u8]) -> io::Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(invalid("tensor body is not a whole number of f32 values"));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
