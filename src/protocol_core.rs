//! Handshake framing shared by the server and the push client.
//!
//! Only the session opening is framed: the client sends START carrying the
//! session parameters and the server answers OK or ERROR. Everything after
//! OK is the token stream handled by `session` and `client`.

use crate::protocol::{frame, FRAME_VERSION, MAGIC, MAX_FRAME_SIZE};
use anyhow::{bail, Result};
use std::io::{Read, Write};

/// Magic, frame version, type and payload length.
pub const HEADER_LEN: usize = 11;

pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        bail!("frame payload too large: {} bytes (max: {})", size, MAX_FRAME_SIZE);
    }
    Ok(())
}

/// `FOFR` | version u16 LE | type u8 | payload length u32 LE
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&FRAME_VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Frame type and payload length of a received header.
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32)> {
    if &header[0..4] != MAGIC {
        bail!("not a failover handshake frame (bad magic)");
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FRAME_VERSION {
        bail!("frame version mismatch: got {}, expected {}", version, FRAME_VERSION);
    }

    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);

    Ok((frame_type, payload_len))
}

pub fn write_frame<W: Write>(w: &mut W, frame_type: u8, payload: &[u8]) -> Result<()> {
    validate_frame_size(payload.len())?;
    w.write_all(&build_frame_header(frame_type, payload.len() as u32))?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(r: &mut R) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header)?;
    let (frame_type, len) = parse_frame_header(&header)?;
    validate_frame_size(len as usize)?;
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok((frame_type, payload))
}

/// Read the server's answer to START: Ok on OK, the server's message as an error on ERROR.
pub fn read_handshake_reply<R: Read>(r: &mut R) -> Result<()> {
    let (frame_type, payload) = read_frame(r)?;
    match frame_type {
        frame::OK => Ok(()),
        frame::ERROR => bail!("server refused session: {}", String::from_utf8_lossy(&payload)),
        other => bail!("unexpected frame type {} in handshake reply", other),
    }
}
