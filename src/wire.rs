//! Primitive encodings shared by the server and the push client.
//!
//! compressed int: zigzag LEB128 of an `i32` (1-5 bytes)
//! long: 8 bytes big-endian
//! boolean: one byte, 0 or 1
//! UTF: compressed int length followed by UTF-8 bytes

use crate::error::ProtocolError;
use crate::protocol::MAX_UTF_LEN;
use anyhow::{Context, Result};
use std::io::{self, Read, Write};

fn eof_to_protocol(err: io::Error) -> anyhow::Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::UnexpectedEof("reading from peer").into()
    } else {
        err.into()
    }
}

pub struct WireReader<R> {
    inner: R,
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(eof_to_protocol)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidValue {
                what: "boolean",
                value: other as i64,
            }
            .into()),
        }
    }

    pub fn read_compressed_int(&mut self) -> Result<i32> {
        let mut raw: u32 = 0;
        for i in 0..5 {
            let byte = self.read_u8()?;
            if i == 4 && byte > 0x0f {
                return Err(ProtocolError::InvalidValue {
                    what: "compressed int",
                    value: byte as i64,
                }
                .into());
            }
            raw |= ((byte & 0x7f) as u32) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32));
            }
        }
        unreachable!("fifth byte always terminates")
    }

    pub fn read_long(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(i64::from_be_bytes(b))
    }

    pub fn read_utf(&mut self) -> Result<String> {
        let len = self.read_compressed_int()?;
        if len < 0 || len as usize > MAX_UTF_LEN {
            return Err(ProtocolError::InvalidValue {
                what: "string length",
                value: len as i64,
            }
            .into());
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf).context("string is not valid UTF-8")
    }
}

pub struct WireWriter<W> {
    inner: W,
}

impl<W: Write> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf)?;
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn write_compressed_int(&mut self, v: i32) -> Result<()> {
        let mut raw = ((v << 1) ^ (v >> 31)) as u32;
        let mut buf = [0u8; 5];
        let mut n = 0;
        loop {
            let byte = (raw & 0x7f) as u8;
            raw >>= 7;
            if raw == 0 {
                buf[n] = byte;
                n += 1;
                break;
            }
            buf[n] = byte | 0x80;
            n += 1;
        }
        self.write_all(&buf[..n])
    }

    pub fn write_long(&mut self, v: i64) -> Result<()> {
        self.write_all(&v.to_be_bytes())
    }

    pub fn write_utf(&mut self, s: &str) -> Result<()> {
        if s.len() > MAX_UTF_LEN {
            anyhow::bail!("string of {} bytes exceeds {}", s.len(), MAX_UTF_LEN);
        }
        self.write_compressed_int(s.len() as i32)?;
        self.write_all(s.as_bytes())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}
