use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Upper bound on a single frame payload. A dispatched buffer is never fed
/// back into the corpus without crossing this channel, so the bound also
/// caps work item size.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Manager -> worker. Every `Work` must be answered by exactly one
/// `Result`/`Crash`, or by worker process termination handled outside the
/// protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerMessage {
    Work { buf: Vec<u8> },
}

/// Worker -> manager. Never sent unsolicited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Result { coverage: u64 },
    Crash,
}

/// Writes one length-prefixed JSON frame.
pub fn write_frame<W: Write, M: Serialize>(w: &mut W, msg: &M) -> io::Result<()> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame payload of {} bytes exceeds limit", payload.len()),
        ));
    }
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()
}

/// Reads one frame with blocking reads. The worker side uses its own
/// interruptible read loop and calls [`decode`] directly.
pub fn read_frame<R: Read, M: DeserializeOwned>(r: &mut R) -> io::Result<M> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header);
    check_len(len)?;
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    decode(&payload)
}

pub fn decode<M: DeserializeOwned>(payload: &[u8]) -> io::Result<M> {
    serde_json::from_slice(payload).map_err(io::Error::from)
}

pub fn check_len(len: u32) -> io::Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    Ok(())
}
