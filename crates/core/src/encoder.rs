//! Value encoders.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;

/// Encoding failures.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode: {0}")]
    Encode(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Marshals values into bytes and back.
///
/// Block items are written either as one encoded value per file or as one
/// encoded value per line, so an encoder also names the file extensions it
/// produces.
pub trait Encoder: Clone + Send + Sync + 'static {
    /// Name of the encoding.
    fn hint(&self) -> &'static str;

    /// Encode one value.
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, EncodeError>;

    /// Decode one value.
    fn unmarshal<T: DeserializeOwned>(&self, b: &[u8]) -> Result<T, EncodeError>;

    /// File extension for a single value (`list == false`) or one value per
    /// line (`list == true`).
    fn extension(&self, list: bool) -> &'static str;

    /// Encode `value` followed by a newline.
    fn encode_line<W: Write, T: Serialize + ?Sized>(
        &self,
        w: &mut W,
        value: &T,
    ) -> Result<(), EncodeError> {
        let b = self.marshal(value)?;
        w.write_all(&b)?;
        w.write_all(b"\n")?;
        Ok(())
    }
}

/// JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn hint(&self) -> &'static str {
        "json"
    }

    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(value).map_err(|e| EncodeError::Encode(e.to_string()))
    }

    fn unmarshal<T: DeserializeOwned>(&self, b: &[u8]) -> Result<T, EncodeError> {
        serde_json::from_slice(b).map_err(|e| EncodeError::Decode(e.to_string()))
    }

    fn extension(&self, list: bool) -> &'static str {
        if list {
            ".ndjson"
        } else {
            ".json"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isaac_types::{Height, Point, Round};

    #[test]
    fn test_json_lines() {
        let enc = JsonEncoder;
        let mut buf = Vec::new();
        for r in 0..3 {
            enc.encode_line(&mut buf, &Point::new(Height(33), Round(r)))
                .unwrap();
        }

        let points: Vec<Point> = buf
            .split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .map(|l| enc.unmarshal(l).unwrap())
            .collect();
        assert_eq!(points.len(), 3);
        assert_eq!(points[2], Point::new(Height(33), Round(2)));
    }

    #[test]
    fn test_decode_error() {
        let err = JsonEncoder.unmarshal::<Point>(b"{not json").unwrap_err();
        assert!(matches!(err, EncodeError::Decode(_)));
        assert_eq!(JsonEncoder.extension(true), ".ndjson");
    }
}
