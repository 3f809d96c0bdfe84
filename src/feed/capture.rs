//! Raw feed captures
//!
//! A capture file is a sequence of frames, each stored as a little-endian
//! `u32` byte length followed by the frame exactly as it came off the socket.

use std::io::{ErrorKind, Read, Write};

use anyhow::{bail, Context, Result};

/// Largest frame accepted when reading a capture
pub const MAX_FRAME_LEN: usize = 1 << 24;

pub fn write_frame<W: Write>(out: &mut W, frame: &[u8]) -> Result<()> {
    let len = u32::try_from(frame.len()).context("Frame too large to capture")?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(frame)?;
    Ok(())
}

/// Read the next frame. `Ok(None)` at a clean end of file.
pub fn read_frame<R: Read>(input: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match input.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read frame length"),
    }
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        bail!("Frame length {} exceeds {}", len, MAX_FRAME_LEN);
    }
    let mut frame = vec![0u8; len];
    input
        .read_exact(&mut frame)
        .with_context(|| format!("Capture ends inside a {} byte frame", len))?;
    Ok(Some(frame))
}
