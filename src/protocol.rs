//! Controller/worker wire protocol.
//!
//! Every message is one JSON object on its own line. Two TCP connections run
//! per worker: commands flow controller → worker on the control port, and
//! stats/heartbeats flow worker → controller on control port + 1. The first
//! line a worker writes on either connection is [`WorkerMessage::Register`].

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::ProtocolError;
use crate::exceptions::ExceptionRecord;
use crate::state::RunnerState;
use crate::stats::StatsEntry;

/// Longest accepted line, newline included.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Port the stats/heartbeat stream listens on for a given control port.
pub fn stats_port(control_port: u16) -> u16 {
    control_port.wrapping_add(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    /// `generation` grows with every ramp the controller dispatches and is
    /// echoed back in heartbeats.
    Ramp {
        target_count: usize,
        hatch_rate: f64,
        #[serde(default)]
        generation: u64,
    },
    Stop,
    Quit,
    ResetStats,
}

/// Cumulative local statistics of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub stats: Vec<StatsEntry>,
    pub exceptions: Vec<ExceptionRecord>,
    pub user_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register {
        worker_id: String,
    },
    Ready {
        worker_id: String,
    },
    StatsReport {
        worker_id: String,
        snapshot: StatsSnapshot,
    },
    Heartbeat {
        worker_id: String,
        state: RunnerState,
        user_count: usize,
        /// Last ramp generation the worker applied before reading `state`.
        #[serde(default)]
        generation: u64,
    },
    Quitting {
        worker_id: String,
    },
}

impl WorkerMessage {
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerMessage::Register { worker_id }
            | WorkerMessage::Ready { worker_id }
            | WorkerMessage::StatsReport { worker_id, .. }
            | WorkerMessage::Heartbeat { worker_id, .. }
            | WorkerMessage::Quitting { worker_id } => worker_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Register { .. } => "register",
            WorkerMessage::Ready { .. } => "ready",
            WorkerMessage::StatsReport { .. } => "stats_report",
            WorkerMessage::Heartbeat { .. } => "heartbeat",
            WorkerMessage::Quitting { .. } => "quitting",
        }
    }
}

/// Reads one line-delimited JSON message.
pub async fn read_message<R, M>(reader: &mut R) -> Result<M, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    M: for<'de> Deserialize<'de>,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    let limit = (MAX_MESSAGE_BYTES + 1) as u64;
    let bytes = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut buffer)
        .await
        .map_err(|source| ProtocolError::Io {
            context: "read wire message",
            source,
        })?;
    if bytes == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    if buffer.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::MessageTooLarge {
            max_bytes: MAX_MESSAGE_BYTES,
        });
    }
    if buffer.ends_with(b"\n") {
        buffer.pop();
        if buffer.ends_with(b"\r") {
            buffer.pop();
        }
    }
    serde_json::from_slice(&buffer).map_err(ProtocolError::Decode)
}

/// Writes one message followed by a newline.
pub async fn send_message<W, M>(writer: &mut W, message: &M) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let mut payload = serde_json::to_vec(message).map_err(ProtocolError::Encode)?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .map_err(|source| ProtocolError::Io {
            context: "send wire message",
            source,
        })?;
    writer.flush().await.map_err(|source| ProtocolError::Io {
        context: "flush wire message",
        source,
    })
}
