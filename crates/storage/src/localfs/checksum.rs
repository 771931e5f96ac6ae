//! SHA-256 checksumming readers and writers.

use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

/// SHA-256 hex of `b`.
pub fn sha256_hex(b: &[u8]) -> String {
    hex::encode(Sha256::digest(b))
}

/// Hashes everything written through it.
pub struct ChecksumWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Hex checksum of the bytes written so far.
    pub fn checksum(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hashes everything read through it.
pub struct ChecksumReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Hex checksum of the bytes read so far.
    pub fn checksum(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    /// Read the rest of the stream and return the checksum of all of it.
    pub fn drain(&mut self) -> io::Result<String> {
        io::copy(self, &mut io::sink())?;
        Ok(self.checksum())
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    #[test]
    fn test_writer_and_reader_agree() {
        let mut w = ChecksumWriter::new(Vec::new());
        w.write_all(b"showme").unwrap();
        let sum = w.checksum();
        let b = w.into_inner();

        assert_eq!(sum, sha256_hex(b"showme"));

        let mut r = ChecksumReader::new(&b[..]);
        let mut half = [0u8; 3];
        r.read_exact(&mut half).unwrap();
        assert_eq!(r.drain().unwrap(), sum);
    }

    #[test]
    fn test_gzip_checksum_is_of_compressed_bytes() {
        let mut w = GzEncoder::new(ChecksumWriter::new(Vec::new()), Compression::default());
        w.write_all(b"line 0\nline 1\n").unwrap();
        let cw = w.finish().unwrap();
        let sum = cw.checksum();
        let b = cw.into_inner();

        assert_eq!(sum, sha256_hex(&b));

        let mut decoded = String::new();
        GzDecoder::new(ChecksumReader::new(&b[..]))
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "line 0\nline 1\n");
    }
}
