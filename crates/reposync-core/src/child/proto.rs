//! Wire protocol for subprocess RPC: length-prefixed JSON frames.
//!
//! A request carries the wrapped object's full serialized state alongside the
//! call, and every successful reply carries the state back, so fields the
//! child updates stay visible to the parent. Mid-call the child may emit any
//! number of `Log` and `Event` frames before the terminal `Return` or
//! `Fault`.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Upper bound on a single frame; a frame past this is a protocol error, not
/// a payload.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Log severities a child may forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Parent → child: the mirrored object state plus one call.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request<C, S> {
    pub state: S,
    pub call: C,
}

/// Child → parent reply frames.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply<V, S, E> {
    /// Normal return; the parent adopts `state`.
    Return { value: V, state: S },
    /// The call failed; the parent surfaces the text.
    Fault { message: String },
    /// Log record to re-emit in the parent's logging pipeline.
    Log {
        target: String,
        level: LogLevel,
        message: String,
    },
    /// Callback hook invocation in the parent (progress, usually).
    Event { event: E },
}

/// Write one frame: 4-byte big-endian length, then the JSON body.
pub fn write_frame<T: Serialize>(writer: &mut dyn Write, value: &T) -> Result<()> {
    let body = serde_json::to_vec(value).context("serialize frame")?;
    let len = u32::try_from(body.len()).context("frame too large")?;
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("frame of {} bytes exceeds protocol limit", len);
    }
    writer.write_all(&len.to_be_bytes()).context("write frame length")?;
    writer.write_all(&body).context("write frame body")?;
    writer.flush().context("flush frame")?;
    Ok(())
}

/// Read one frame. An EOF before the length prefix maps to
/// `ErrorKind::UnexpectedEof` so callers can tell a clean shutdown from a
/// mid-frame break.
pub fn read_frame<T: DeserializeOwned>(reader: &mut dyn Read) -> std::io::Result<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds protocol limit", len),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
