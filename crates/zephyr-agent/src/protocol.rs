//! Wire format and message envelopes.
//!
//! Every message is one UTF-8 JSON object, preceded by a 4-byte big-endian
//! length. Requests flow host→guest; responses guest→host. While a
//! streaming `execute` is in flight the guest interleaves unsolicited
//! `output` messages before the terminal `execute_result`, which still
//! carries the full captured stdout/stderr.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// TCP port the guest agent listens on.
pub const AGENT_PORT: u16 = 5253;

/// Vsock port the guest agent listens on.
pub const AGENT_VSOCK_PORT: u32 = 5253;

/// Frames larger than this are rejected rather than buffered.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Exit code reported for a timed-out step.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    Execute {
        id: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        stream: bool,
    },
    FileWrite {
        id: String,
        path: String,
        content: String,
        #[serde(default)]
        encoding: Encoding,
        #[serde(default)]
        mode: Option<u32>,
    },
    FileRead {
        id: String,
        path: String,
        #[serde(default)]
        encoding: Encoding,
    },
    Ping {
        id: String,
    },
    Shutdown {
        id: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

impl AgentRequest {
    pub fn id(&self) -> &str {
        match self {
            AgentRequest::Execute { id, .. }
            | AgentRequest::FileWrite { id, .. }
            | AgentRequest::FileRead { id, .. }
            | AgentRequest::Ping { id }
            | AgentRequest::Shutdown { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentResponse {
    ExecuteResult {
        id: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration_ms: u64,
    },
    /// Unsolicited, only while a streaming execute is in flight.
    Output {
        id: String,
        stream: OutputStream,
        data: String,
    },
    FileWriteResult {
        id: String,
        success: bool,
    },
    FileReadResult {
        id: String,
        content: String,
        encoding: Encoding,
    },
    Pong {
        id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        uptime_secs: u64,
    },
    ShutdownResult {
        id: String,
        success: bool,
    },
    Error {
        id: String,
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    FileNotFound,
    FileReadError,
    FileWriteError,
    SpawnError,
    Timeout,
    BadRequest,
}

/// Result of a completed `execute`, as seen by callers of the client.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R, M>(reader: &mut R) -> Result<M, ProtocolError>
where
    R: AsyncRead + Unpin,
    M: serde::de::DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let request = AgentRequest::Execute {
            id: "req-1".to_string(),
            command: "echo hi".to_string(),
            args: vec![],
            cwd: None,
            env: HashMap::new(),
            timeout_secs: Some(30),
            stream: true,
        };

        let mut buf = std::io::Cursor::new(Vec::new());
        write_message(&mut buf, &request).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf.into_inner());
        let decoded: AgentRequest = read_message(&mut cursor).await.unwrap();
        assert_eq!(decoded.id(), "req-1");
        match decoded {
            AgentRequest::Execute { command, stream, .. } => {
                assert_eq!(command, "echo hi");
                assert!(stream);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_message::<_, AgentRequest>(&mut cursor)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let err = read_message::<_, AgentRequest>(&mut cursor)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::FileNotFound).unwrap();
        assert_eq!(json, r#""FILE_NOT_FOUND""#);
    }
}
