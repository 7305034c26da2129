// src/protocol.rs
//
// =============================================================================
// CAMPUSGRID: WIRE PROTOCOL (v 0.1 )
// =============================================================================
//
// The nervous system between manager and workers.
//
// Framing: a 10-byte ASCII zero-padded decimal length, then exactly that
// many bytes of UTF-8 JSON. Both directions share one TCP stream. A frame
// of length zero is a keepalive, decoded as `no_job`.
//
// Messages are a tagged variant, one case per `type`. Unknown tags fail to
// deserialize, which the session layer treats as a protocol error and
// answers by dropping the connection.

use crate::core::{OutputFile, WorkerSpecs};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Fixed header width: enough decimal digits for any frame we allow.
pub const HEADER_LEN: usize = 10;

/// Hard limit on a single frame. A job result carrying a handful of 10 MiB
/// files stays well inside this; anything larger is a corrupt or hostile
/// header.
pub const MAX_FRAME_LEN: usize = 128 * 1024 * 1024;

// ============================================================================
// 1. MESSAGE SET
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// W→M, first frame of every session.
    Register {
        name: String,
        owner_token: String,
        specs: WorkerSpecs,
    },
    /// M→W, registration ack.
    Registered { worker_id: Uuid, message: String },
    /// W→M, periodic liveness assertion.
    Heartbeat { worker_id: Uuid, status: String },
    /// W→M, ask for work.
    RequestJob { worker_id: Uuid },
    /// M→W, a dispatched assignment.
    Job {
        job_id: Uuid,
        title: String,
        code: String,
        #[serde(default)]
        requirements: Option<String>,
        timeout: u64,
        credit_reward: i64,
    },
    /// M→W, the queue had nothing that fits.
    NoJob,
    /// W→M, execution outcome plus collected artifacts.
    JobResult {
        job_id: Uuid,
        worker_id: Uuid,
        success: bool,
        output: String,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        files: Vec<OutputFile>,
        execution_time: f64,
    },
    /// M→W, result ack. Workers wait for this before requesting again.
    JobReceived { job_id: Uuid },
    /// W→M, graceful goodbye.
    Disconnect,
}

// ============================================================================
// 2. ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame header")]
    BadHeader,
    #[error("frame of {0} bytes exceeds the frame limit")]
    Oversize(usize),
    #[error("invalid message payload: {0}")]
    BadPayload(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ============================================================================
// 3. PURE CODEC
// ============================================================================

/// Serialize a message into a complete frame (header + JSON body).
pub fn encode(msg: &Message) -> Result<Vec<u8>, WireError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::Oversize(body.len()));
    }
    let mut frame = format!("{:010}", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parse a frame body (the bytes after the header).
pub fn decode(body: &[u8]) -> Result<Message, WireError> {
    Ok(serde_json::from_slice(body)?)
}

/// Parse the 10-byte header into a body length.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<usize, WireError> {
    let text = std::str::from_utf8(header).map_err(|_| WireError::BadHeader)?;
    let len: usize = text.parse().map_err(|_| WireError::BadHeader)?;
    if len > MAX_FRAME_LEN {
        return Err(WireError::Oversize(len));
    }
    Ok(len)
}

// ============================================================================
// 4. FRAMED STREAM
// ============================================================================

/// Message-oriented wrapper over any byte stream (a `TcpStream` or one of
/// its split halves). Send and receive live in separate impl blocks so a
/// write half alone still gets `send`.
pub struct FramedStream<S> {
    inner: S,
}

impl<S> FramedStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    pub async fn send(&mut self, msg: &Message) -> Result<(), WireError> {
        let frame = encode(msg)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read one message. Blocks until the full declared length arrives.
    ///
    /// Returns `Ok(None)` when the peer closed cleanly at a frame boundary.
    /// A close mid-frame, a bad header, or an undecodable body is an error;
    /// callers drop the connection.
    pub async fn recv(&mut self) -> Result<Option<Message>, WireError> {
        let mut header = [0u8; HEADER_LEN];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = decode_header(&header)?;
        if len == 0 {
            // Keepalive sentinel.
            return Ok(Some(Message::NoJob));
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        Ok(Some(decode(&body)?))
    }
}
