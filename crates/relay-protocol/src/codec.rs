//! Length-prefixed record codec.
//!
//! Every record is a 4-byte big-endian payload length followed by the JSON encoding
//! of an [`Observation`]. The explicit length keeps the stream in sync when a single
//! payload fails to parse: the decoder yields a [`MalformedRecord`] item for it and
//! carries on with the next frame.

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;
use tracing::debug;

use crate::error::MalformedRecord;
use crate::error::TransportError;
use crate::types::Observation;

/// Default upper bound for a single record payload.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

const HEADER_LEN: usize = 4;
const MAX_ENCODABLE_LENGTH: usize = u32::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCodec {
    max_frame_length: usize,
}

impl RecordCodec {
    pub fn new() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Sets the payload limit, capped at what the 4-byte length prefix can express.
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length.min(MAX_ENCODABLE_LENGTH);
        self
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<&Observation> for RecordCodec {
    type Error = TransportError;

    fn encode(&mut self, item: &Observation, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(item).map_err(TransportError::Encode)?;
        if payload.len() > self.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                length: payload.len(),
                max: self.max_frame_length,
            });
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Encoder<Observation> for RecordCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Observation, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Observation>::encode(self, &item, dst)
    }
}

impl Decoder for RecordCodec {
    type Item = Result<Observation, MalformedRecord>;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; HEADER_LEN];
        length_bytes.copy_from_slice(&src[..HEADER_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        // nothing after an oversized header can be trusted
        if length > self.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                length,
                max: self.max_frame_length,
            });
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length);
        let record = serde_json::from_slice(&payload).map_err(|e| MalformedRecord {
            length,
            reason: e.to_string(),
        });
        Ok(Some(record))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(record) => Ok(Some(record)),
            None => {
                if !buf.is_empty() {
                    debug!(remaining = buf.len(), "Discarding truncated record at end of stream");
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::types::Labels;
    use crate::types::MetricType;

    fn observation(name: &str, value: f64) -> Observation {
        Observation {
            metric_type: MetricType::Counter,
            name: name.to_string(),
            help: "helping".to_string(),
            keys: Labels::from([("route".to_string(), "/".to_string())]),
            value,
            action: None,
            opts: None,
        }
    }

    fn encode(observation: &Observation) -> BytesMut {
        let mut buf = BytesMut::new();
        RecordCodec::new()
            .encode(observation, &mut buf)
            .expect("should encode");
        buf
    }

    #[test]
    fn truncated_record_waits_for_more_bytes() {
        let expected = observation("requests", 5.0);
        let frame = encode(&expected);
        let mut codec = RecordCodec::new();

        let mut src = BytesMut::from(&frame[..frame.len() - 3]);
        assert!(codec.decode(&mut src).expect("should not fail").is_none());

        // only the header so far
        let mut header_only = BytesMut::from(&frame[..2]);
        assert!(codec.decode(&mut header_only).expect("should not fail").is_none());

        src.extend_from_slice(&frame[frame.len() - 3..]);
        let decoded = codec
            .decode(&mut src)
            .expect("should not fail")
            .expect("should yield a record");
        assert_eq!(decoded, Ok(expected));
        assert!(src.is_empty());
    }

    #[test]
    fn malformed_record_does_not_desynchronise_stream() {
        let good = observation("requests", 1.0);
        let mut src = BytesMut::new();
        let garbage = b"{not json";
        src.put_u32(garbage.len() as u32);
        src.extend_from_slice(garbage);
        src.extend_from_slice(&encode(&good));

        let mut codec = RecordCodec::new();
        let first = codec
            .decode(&mut src)
            .expect("should not fail")
            .expect("should yield a record");
        let err = first.expect_err("garbage should be malformed");
        assert_eq!(err.length, garbage.len());

        let second = codec
            .decode(&mut src)
            .expect("should not fail")
            .expect("should yield a record");
        assert_eq!(second, Ok(good));
    }

    #[test]
    fn valid_json_with_wrong_shape_is_malformed() {
        let payload = br#"{"name":"requests"}"#;
        let mut src = BytesMut::new();
        src.put_u32(payload.len() as u32);
        src.extend_from_slice(payload);

        let record = RecordCodec::new()
            .decode(&mut src)
            .expect("should not fail")
            .expect("should yield a record");
        assert!(record.is_err());
    }

    #[test]
    fn oversized_frame_is_unrecoverable() {
        let mut src = BytesMut::new();
        src.put_u32(64);
        src.extend_from_slice(&[b' '; 8]);

        let mut codec = RecordCodec::new().with_max_frame_length(16);
        let err = codec.decode(&mut src).expect_err("should reject frame");
        assert!(matches!(err, TransportError::FrameTooLarge { length: 64, max: 16 }));
    }

    #[test]
    fn frame_limit_fits_the_length_prefix() {
        let codec = RecordCodec::new().with_max_frame_length(usize::MAX);
        assert_eq!(codec.max_frame_length(), u32::MAX as usize);
        assert_eq!(RecordCodec::new().with_max_frame_length(64).max_frame_length(), 64);
    }

    #[test]
    fn encoding_respects_frame_limit() {
        let mut codec = RecordCodec::new().with_max_frame_length(8);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(&observation("requests", 1.0), &mut buf)
            .expect_err("payload is larger than 8 bytes");
        assert!(matches!(err, TransportError::FrameTooLarge { max: 8, .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_record_at_eof_is_dropped_quietly() {
        let frame = encode(&observation("requests", 1.0));
        let mut src = BytesMut::from(&frame[..frame.len() / 2]);

        let decoded = RecordCodec::new()
            .decode_eof(&mut src)
            .expect("truncation at eof is not an error");
        assert!(decoded.is_none());
        assert!(src.is_empty());
    }

    #[test]
    fn consecutive_records_keep_order() {
        let mut src = BytesMut::new();
        for value in [5.0, 3.0, 2.0] {
            src.extend_from_slice(&encode(&observation("requests", value)));
        }

        let mut codec = RecordCodec::new();
        let mut values = Vec::new();
        while let Some(record) = codec.decode(&mut src).expect("should not fail") {
            values.push(record.expect("valid record").value);
        }
        assert_eq!(values, vec![5.0, 3.0, 2.0]);
    }
}
