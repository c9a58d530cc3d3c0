//! Framed reader and writer primitives.
//!
//! All integers travel little-endian; strings as an `i32` byte length
//! followed by UTF-16LE code units; blobs as an `i32` length followed by
//! raw bytes. Frames are not length-prefixed end-to-end — their extent is
//! implicit from the header kind and the typed values that follow — so
//! writers stage whole frames and push them through the shared stream
//! mutex in one piece.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use farlink_core::{Error, Result};

pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.inner.write_u8(v)?;
        Ok(())
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.inner.write_i32::<LittleEndian>(v)?;
        Ok(())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.inner.write_i64::<LittleEndian>(v)?;
        Ok(())
    }

    pub fn write_str(&mut self, s: &str) -> Result<()> {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.write_i32((units.len() * 2) as i32)?;
        for unit in units {
            self.inner.write_u16::<LittleEndian>(unit)?;
        }
        Ok(())
    }

    /// Length-prefixed blob.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_i32(bytes.len() as i32)?;
        self.inner.write_all(bytes)?;
        Ok(())
    }

    /// Raw bytes, no prefix. Used for pushing staged frames and the fixed
    /// size handshake token.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.inner.read_u8()?)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.inner.read_i32::<LittleEndian>()?)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.inner.read_i64::<LittleEndian>()?)
    }

    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 0 || len % 2 != 0 {
            return Err(Error::Protocol(format!("bad string length: {}", len)));
        }
        let mut units = vec![0u16; (len / 2) as usize];
        for unit in units.iter_mut() {
            *unit = self.inner.read_u16::<LittleEndian>()?;
        }
        String::from_utf16(&units)
            .map_err(|_| Error::Protocol("string is not valid utf-16".to_string()))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(Error::Protocol(format!("bad blob length: {}", len)));
        }
        let mut bytes = vec![0u8; len as usize];
        self.inner.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf)?;
        Ok(())
    }
}

/// Outbound half of one stream. The mutex is held for whole frames so
/// concurrent writers never interleave on the wire.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<FrameWriter<TcpStream>>>,
}

impl SharedWriter {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FrameWriter::new(stream))),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, FrameWriter<TcpStream>> {
        self.inner.lock().unwrap()
    }

    /// Weak handle for broadcast lists; dies with the owning connection.
    pub fn downgrade(&self) -> std::sync::Weak<Mutex<FrameWriter<TcpStream>>> {
        Arc::downgrade(&self.inner)
    }
}
