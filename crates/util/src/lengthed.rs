//! Length-prefixed byte frames.
//!
//! Layout of a frame stream:
//!
//! ```text
//! version (2 bytes)
//! header count (u64 LE), then each header as length (u64 LE) + bytes
//! body chunks, each as length (u64 LE) + bytes, until EOF
//! ```

use std::io::{self, Read, Write};
use thiserror::Error;

/// Largest single length-prefixed chunk accepted by readers.
pub const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// Framing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected eof")]
    UnexpectedEof,

    #[error("frame too large, {0} bytes")]
    TooLarge(u64),
}

/// Write `b` prefixed with its length.
pub fn write_lengthed<W: Write>(w: &mut W, b: &[u8]) -> Result<(), FrameError> {
    w.write_all(&(b.len() as u64).to_le_bytes())?;
    w.write_all(b)?;
    Ok(())
}

fn read_u64<R: Read>(r: &mut R) -> Result<Option<u64>, FrameError> {
    let mut buf = [0u8; 8];
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Ok(None),
            Ok(0) => return Err(FrameError::UnexpectedEof),
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(u64::from_le_bytes(buf)))
}

/// Read one length-prefixed chunk; `None` at a clean EOF.
pub fn read_lengthed<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>, FrameError> {
    let Some(len) = read_u64(r)? else {
        return Ok(None);
    };
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let mut b = vec![0u8; len as usize];
    r.read_exact(&mut b).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::UnexpectedEof,
        _ => FrameError::Io(e),
    })?;
    Ok(Some(b))
}

/// Writes a version, headers and then body chunks.
pub struct BytesFrameWriter<W> {
    w: W,
}

impl<W: Write> BytesFrameWriter<W> {
    /// Write the version and headers.
    pub fn new(mut w: W, version: [u8; 2], headers: &[&[u8]]) -> Result<Self, FrameError> {
        w.write_all(&version)?;
        w.write_all(&(headers.len() as u64).to_le_bytes())?;
        for h in headers {
            write_lengthed(&mut w, h)?;
        }
        Ok(Self { w })
    }

    /// Write a body chunk.
    pub fn write_body(&mut self, b: &[u8]) -> Result<(), FrameError> {
        write_lengthed(&mut self.w, b)
    }

    /// Flush and return the inner writer.
    pub fn into_inner(mut self) -> Result<W, FrameError> {
        self.w.flush()?;
        Ok(self.w)
    }
}

/// Reads frames written by [`BytesFrameWriter`].
pub struct BytesFrameReader<R> {
    r: R,
    version: [u8; 2],
    headers: Vec<Vec<u8>>,
}

impl<R: Read> BytesFrameReader<R> {
    /// Read the version and headers.
    pub fn new(mut r: R) -> Result<Self, FrameError> {
        let mut version = [0u8; 2];
        r.read_exact(&mut version).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => FrameError::UnexpectedEof,
            _ => FrameError::Io(e),
        })?;

        let count = read_u64(&mut r)?.ok_or(FrameError::UnexpectedEof)?;
        if count > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(count));
        }

        let mut headers = Vec::with_capacity(count.min(16) as usize);
        for _ in 0..count {
            headers.push(read_lengthed(&mut r)?.ok_or(FrameError::UnexpectedEof)?);
        }

        Ok(Self {
            r,
            version,
            headers,
        })
    }

    pub fn version(&self) -> [u8; 2] {
        self.version
    }

    pub fn headers(&self) -> &[Vec<u8>] {
        &self.headers
    }

    /// Next body chunk; `None` when the stream is exhausted.
    pub fn next_body(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        read_lengthed(&mut self.r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_stream() {
        let headers: [&[u8]; 2] = [b"kind", b""];
        let mut w = BytesFrameWriter::new(Vec::new(), [0, 1], &headers).unwrap();
        w.write_body(b"first").unwrap();
        w.write_body(b"").unwrap();
        let buf = w.into_inner().unwrap();

        let mut r = BytesFrameReader::new(buf.as_slice()).unwrap();
        assert_eq!(r.version(), [0, 1]);
        assert_eq!(r.headers(), &[b"kind".to_vec(), Vec::new()]);
        assert_eq!(r.next_body().unwrap(), Some(b"first".to_vec()));
        assert_eq!(r.next_body().unwrap(), Some(Vec::new()));
        assert_eq!(r.next_body().unwrap(), None);
    }

    #[test]
    fn test_truncated_body() {
        let mut w = BytesFrameWriter::new(Vec::new(), [0, 1], &[]).unwrap();
        w.write_body(b"0123456789").unwrap();
        let mut buf = w.into_inner().unwrap();
        buf.truncate(buf.len() - 3);

        let mut r = BytesFrameReader::new(buf.as_slice()).unwrap();
        assert!(matches!(r.next_body(), Err(FrameError::UnexpectedEof)));
    }

    #[test]
    fn test_too_large() {
        let mut buf = vec![0, 1];
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_le_bytes());

        let mut r = BytesFrameReader::new(buf.as_slice()).unwrap();
        assert!(matches!(r.next_body(), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn test_missing_headers() {
        let mut buf = vec![0, 1];
        buf.extend_from_slice(&2u64.to_le_bytes());
        write_lengthed(&mut buf, b"only one").unwrap();

        assert!(matches!(
            BytesFrameReader::new(buf.as_slice()),
            Err(FrameError::UnexpectedEof)
        ));
    }
}
