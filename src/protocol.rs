//! Client → server framing for console WebSockets.
//!
//! Every WebSocket message from the browser is either a control frame or raw
//! terminal input:
//!
//! - `[0x01][JSON {"cols":N,"rows":N}]` resizes the terminal.
//! - anything else is written to the PTY verbatim, including a lone `0x01`.
//!
//! Server → client traffic is plain binary frames of terminal output and needs
//! no framing of its own.

use serde::{Deserialize, Serialize};

/// Leading byte marking a control frame.
pub const CONTROL_PREFIX: u8 = 0x01;

/// Window size update sent by the browser terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeMsg {
    pub cols: u16,
    pub rows: u16,
}

impl ResizeMsg {
    /// Encode as a control frame, the way a client sends it.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = vec![CONTROL_PREFIX];
        // A struct of two integers always serializes.
        frame.extend_from_slice(serde_json::to_string(self).unwrap_or_default().as_bytes());
        frame
    }
}

/// Why a control frame was dropped.
#[derive(Debug, thiserror::Error)]
pub enum ControlFrameError {
    #[error("invalid resize payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("resize dimensions must be positive (cols={cols}, rows={rows})")]
    ZeroDimension { cols: u16, rows: u16 },
}

/// A decoded client frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrame<'a> {
    /// Terminal input to write as-is.
    Input(&'a [u8]),
    /// A valid resize request.
    Resize(ResizeMsg),
    /// A control frame that failed to parse or validate. Never fatal.
    Malformed(String),
    /// Zero-length message; nothing to do.
    Empty,
}

impl<'a> ClientFrame<'a> {
    pub fn parse(data: &'a [u8]) -> Self {
        match data {
            [] => ClientFrame::Empty,
            [CONTROL_PREFIX, payload @ ..] if !payload.is_empty() => match parse_resize(payload) {
                Ok(msg) => ClientFrame::Resize(msg),
                Err(e) => ClientFrame::Malformed(e.to_string()),
            },
            _ => ClientFrame::Input(data),
        }
    }
}

fn parse_resize(payload: &[u8]) -> Result<ResizeMsg, ControlFrameError> {
    let msg: ResizeMsg = serde_json::from_slice(payload)?;
    if msg.cols == 0 || msg.rows == 0 {
        return Err(ControlFrameError::ZeroDimension {
            cols: msg.cols,
            rows: msg.rows,
        });
    }
    Ok(msg)
}
