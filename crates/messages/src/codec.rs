//! Framed encoding of handover messages.
//!
//! A message is one frame: version [`HANDOVER_FRAME_VERSION`], a single
//! header holding the message kind, and one body chunk holding the JSON
//! encoded message.

use crate::HandoverMessage;
use isaac_util::{BytesFrameReader, BytesFrameWriter, FrameError};

/// Frame version of handover messages.
pub const HANDOVER_FRAME_VERSION: [u8; 2] = [0x00, 0x01];

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame: {0}")]
    Frame(#[from] FrameError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown frame version, {0:?}")]
    UnknownVersion([u8; 2]),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Encode `message` as one frame.
pub fn encode_handover(message: &HandoverMessage) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(message)?;

    let mut w = BytesFrameWriter::new(
        Vec::with_capacity(body.len() + 64),
        HANDOVER_FRAME_VERSION,
        &[message.kind().as_bytes()],
    )?;
    w.write_body(&body)?;
    Ok(w.into_inner()?)
}

/// Decode a frame written by [`encode_handover`].
pub fn decode_handover(b: &[u8]) -> Result<HandoverMessage, CodecError> {
    let mut r = BytesFrameReader::new(b)?;
    if r.version() != HANDOVER_FRAME_VERSION {
        return Err(CodecError::UnknownVersion(r.version()));
    }

    let kind = match r.headers() {
        [kind] => String::from_utf8_lossy(kind).into_owned(),
        headers => {
            return Err(CodecError::Malformed(format!(
                "expected 1 header, got {}",
                headers.len()
            )))
        }
    };

    let body = r
        .next_body()?
        .ok_or_else(|| CodecError::Malformed("empty body".into()))?;
    let message: HandoverMessage = serde_json::from_slice(&body)?;

    if message.kind() != kind {
        return Err(CodecError::Malformed(format!(
            "header kind {kind} does not match body kind {}",
            message.kind()
        )));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{new_handover_id, HandoverBody, HandoverData};
    use isaac_test_helpers::{accept_voteproof, make_nodes, stage_point};
    use isaac_types::Stage;

    #[test]
    fn test_voteproof_message() {
        let nodes = make_nodes(2);
        let vp = accept_voteproof(33, &nodes);
        let message = HandoverMessage::new(
            new_handover_id(),
            HandoverBody::Data(HandoverData::Voteproof(vp.clone())),
        );

        let b = encode_handover(&message).unwrap();
        assert_eq!(&b[..2], &HANDOVER_FRAME_VERSION);

        let decoded = decode_handover(&b).unwrap();
        assert_eq!(decoded, message);
        match decoded.body {
            HandoverBody::Data(HandoverData::Voteproof(got)) => assert_eq!(got.id(), vp.id()),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_unknown_version() {
        let message = HandoverMessage::new(
            "id",
            HandoverBody::Ready {
                point: stage_point(33, 0, Stage::Init),
            },
        );
        let mut b = encode_handover(&message).unwrap();
        b[1] = 0x09;

        assert!(matches!(
            decode_handover(&b),
            Err(CodecError::UnknownVersion([0x00, 0x09]))
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let message = HandoverMessage::new("id", HandoverBody::Cancel { err: None });
        let b = encode_handover(&message).unwrap();

        assert!(matches!(
            decode_handover(&b[..b.len() - 1]),
            Err(CodecError::Frame(FrameError::UnexpectedEof))
        ));
    }
}
