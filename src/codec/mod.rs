//! Frame encoding for the stream2 wire format.
//!
//! A frame travels as nested CBOR tags so a consumer can recover shape,
//! element type and compression without any out-of-band metadata:
//!
//! ```text
//! tag 40 [ [height, width],
//!          tag 69|70 ( bytes                                  ; compression "none"
//!                    | tag 56500 [ "bslz4", elem_size, bytes ] ; compression "bslz4"
//!                    ) ]
//! ```
//!
//! Tag 69 marks little-endian `uint16` elements and tag 70 little-endian
//! `uint32`. The compressed byte string starts with a 12-byte header: the
//! uncompressed size as a big-endian `u64` and the block size `0x00002000` as a
//! big-endian `u32`, followed by the bit-shuffled LZ4 blocks.

pub mod bitshuffle;

use std::fmt;
use std::str::FromStr;

use ciborium::Value;
use serde::{Deserialize, Serialize};

use crate::dataset::PixelType;
use crate::error::{DetectorError, DetectorResult};

/// Multi-dimensional array container.
pub const TAG_MULTI_DIM_ARRAY: u64 = 40;
/// Compressed payload container `[compression, element size, bytes]`.
pub const TAG_COMPRESSED: u64 = 56500;
/// Little-endian `uint16` typed array.
pub const TAG_UINT16_LE: u64 = 69;
/// Little-endian `uint32` typed array.
pub const TAG_UINT32_LE: u64 = 70;

/// Block size written into the bslz4 header.
pub const BSLZ4_BLOCK_SIZE: u32 = 0x0000_2000;
const BSLZ4_HEADER_LEN: usize = 12;

/// Frame compression applied before wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Bit-shuffle then LZ4, with the 12-byte bslz4 header.
    #[default]
    Bslz4,
    /// Raw little-endian pixel bytes.
    None,
}

impl Compression {
    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::Bslz4 => "bslz4",
            Compression::None => "none",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bslz4" => Ok(Compression::Bslz4),
            "none" => Ok(Compression::None),
            _ => Err(DetectorError::UnsupportedCompression(s.to_string())),
        }
    }
}

/// CBOR typed-array tag for an element type.
pub fn type_tag(pixel_type: PixelType) -> u64 {
    match pixel_type {
        PixelType::U16 => TAG_UINT16_LE,
        PixelType::U32 => TAG_UINT32_LE,
    }
}

fn pixel_type_for_tag(tag: u64) -> DetectorResult<PixelType> {
    match tag {
        TAG_UINT16_LE => Ok(PixelType::U16),
        TAG_UINT32_LE => Ok(PixelType::U32),
        other => Err(DetectorError::Decode(format!("unknown typed-array tag {other}"))),
    }
}

/// The 12-byte header a bslz4 payload starts with.
pub fn bslz4_header(uncompressed_bytes: u64) -> [u8; BSLZ4_HEADER_LEN] {
    let mut header = [0u8; BSLZ4_HEADER_LEN];
    header[..8].copy_from_slice(&uncompressed_bytes.to_be_bytes());
    header[8..].copy_from_slice(&BSLZ4_BLOCK_SIZE.to_be_bytes());
    header
}

/// Encodes one frame of little-endian pixel bytes.
///
/// `shape` is `[height, width]`. The returned value is the tag-40 container
/// that goes into an image message's `data` map.
pub fn encode_frame(
    raw: &[u8],
    shape: [usize; 2],
    pixel_type: PixelType,
    compression: Compression,
) -> DetectorResult<Value> {
    let elem_size = pixel_type.element_size();
    let expected = shape[0] * shape[1] * elem_size;
    if raw.len() != expected {
        return Err(DetectorError::Encode(format!(
            "frame has {} bytes, shape {}x{} of {pixel_type} needs {expected}",
            raw.len(),
            shape[0],
            shape[1]
        )));
    }

    let payload = match compression {
        Compression::None => Value::Bytes(raw.to_vec()),
        Compression::Bslz4 => {
            let compressed = bitshuffle::compress(raw, elem_size)?;
            let mut bytes = Vec::with_capacity(BSLZ4_HEADER_LEN + compressed.len());
            bytes.extend_from_slice(&bslz4_header(expected as u64));
            bytes.extend_from_slice(&compressed);
            Value::Tag(
                TAG_COMPRESSED,
                Box::new(Value::Array(vec![
                    Value::Text(compression.as_str().to_string()),
                    Value::Integer((elem_size as u64).into()),
                    Value::Bytes(bytes),
                ])),
            )
        }
    };

    Ok(Value::Tag(
        TAG_MULTI_DIM_ARRAY,
        Box::new(Value::Array(vec![
            Value::Array(vec![
                Value::Integer((shape[0] as u64).into()),
                Value::Integer((shape[1] as u64).into()),
            ]),
            Value::Tag(type_tag(pixel_type), Box::new(payload)),
        ])),
    ))
}

/// Like [`encode_frame`], with the compression given by name.
///
/// Any name other than `bslz4` or `none` fails before the frame is touched.
pub fn encode_frame_named(
    raw: &[u8],
    shape: [usize; 2],
    pixel_type: PixelType,
    compression: &str,
) -> DetectorResult<Value> {
    let compression = compression.parse::<Compression>()?;
    encode_frame(raw, shape, pixel_type, compression)
}

/// A frame recovered from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// `[height, width]`
    pub shape: [usize; 2],
    /// Element type from the typed-array tag.
    pub pixel_type: PixelType,
    /// Compression the payload arrived with.
    pub compression: Compression,
    /// Little-endian pixel bytes.
    pub bytes: Vec<u8>,
}

impl DecodedFrame {
    /// Pixels as `u16`; `None` for other element types.
    pub fn to_u16(&self) -> Option<Vec<u16>> {
        (self.pixel_type == PixelType::U16).then(|| {
            self.bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect()
        })
    }

    /// Pixels as `u32`; `None` for other element types.
    pub fn to_u32(&self) -> Option<Vec<u32>> {
        (self.pixel_type == PixelType::U32).then(|| {
            self.bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        })
    }
}

fn as_usize(value: &Value) -> DetectorResult<usize> {
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| DetectorError::Decode(format!("expected unsigned integer, got {value:?}")))
}

fn untag(value: &Value, expected: Option<u64>) -> DetectorResult<(u64, &Value)> {
    match value {
        Value::Tag(tag, inner) if expected.map_or(true, |e| e == *tag) => Ok((*tag, inner.as_ref())),
        other => Err(DetectorError::Decode(format!(
            "expected tag {}, got {other:?}",
            expected.map_or("any".to_string(), |e| e.to_string())
        ))),
    }
}

/// Decodes a tag-40 frame container back into pixel bytes.
pub fn decode_frame(value: &Value) -> DetectorResult<DecodedFrame> {
    let (_, inner) = untag(value, Some(TAG_MULTI_DIM_ARRAY))?;
    let items = inner
        .as_array()
        .filter(|items| items.len() == 2)
        .ok_or_else(|| DetectorError::Decode("frame container must hold [shape, data]".into()))?;

    let dims = items[0]
        .as_array()
        .filter(|dims| dims.len() == 2)
        .ok_or_else(|| DetectorError::Decode("frame shape must be [height, width]".into()))?;
    let shape = [as_usize(&dims[0])?, as_usize(&dims[1])?];

    let (tag, payload) = untag(&items[1], None)?;
    let pixel_type = pixel_type_for_tag(tag)?;
    let expected = shape[0] * shape[1] * pixel_type.element_size();

    let (compression, bytes) = match payload {
        Value::Bytes(bytes) => (Compression::None, bytes.clone()),
        Value::Tag(TAG_COMPRESSED, contents) => {
            let fields = contents
                .as_array()
                .filter(|fields| fields.len() == 3)
                .ok_or_else(|| {
                    DetectorError::Decode("compressed payload must hold [name, elem_size, bytes]".into())
                })?;
            let name = fields[0]
                .as_text()
                .ok_or_else(|| DetectorError::Decode("compression name must be text".into()))?;
            let compression = name
                .parse::<Compression>()
                .map_err(|_| DetectorError::Decode(format!("unknown compression {name}")))?;
            let elem_size = as_usize(&fields[1])?;
            if elem_size != pixel_type.element_size() {
                return Err(DetectorError::Decode(format!(
                    "element size {elem_size} does not match tag {tag}"
                )));
            }
            let data = fields[2]
                .as_bytes()
                .ok_or_else(|| DetectorError::Decode("compressed data must be bytes".into()))?;
            if data.len() < BSLZ4_HEADER_LEN {
                return Err(DetectorError::Decode("bslz4 payload shorter than its header".into()));
            }
            let mut size = [0u8; 8];
            size.copy_from_slice(&data[..8]);
            let total = u64::from_be_bytes(size) as usize;
            let mut block = [0u8; 4];
            block.copy_from_slice(&data[8..12]);
            let block = u32::from_be_bytes(block) as usize;
            let bytes = bitshuffle::decompress(&data[BSLZ4_HEADER_LEN..], elem_size, total, block)?;
            (compression, bytes)
        }
        other => {
            return Err(DetectorError::Decode(format!("unexpected frame payload {other:?}")));
        }
    };

    if bytes.len() != expected {
        return Err(DetectorError::Decode(format!(
            "frame decoded to {} bytes, shape needs {expected}",
            bytes.len()
        )));
    }

    Ok(DecodedFrame {
        shape,
        pixel_type,
        compression,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_u16(n: usize) -> Vec<u8> {
        (0..n).flat_map(|i| ((i * 37 % 4000) as u16).to_le_bytes()).collect()
    }

    #[test]
    fn compression_names_are_case_insensitive() {
        assert_eq!("BSLZ4".parse::<Compression>().unwrap(), Compression::Bslz4);
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert!(matches!(
            "lz4".parse::<Compression>(),
            Err(DetectorError::UnsupportedCompression(_))
        ));
    }

    #[test]
    fn uncompressed_frame_wraps_raw_bytes_under_type_tag() {
        let raw = ramp_u16(16 * 16);
        let value = encode_frame(&raw, [16, 16], PixelType::U16, Compression::None).unwrap();
        let (tag, inner) = untag(&value, Some(TAG_MULTI_DIM_ARRAY)).unwrap();
        assert_eq!(tag, 40);
        let items = inner.as_array().unwrap();
        let (type_tag, payload) = untag(&items[1], None).unwrap();
        assert_eq!(type_tag, TAG_UINT16_LE);
        assert_eq!(payload.as_bytes().unwrap(), &raw);
    }

    #[test]
    fn bslz4_frame_carries_header_and_element_size() {
        let raw: Vec<u8> = (0..32u32 * 8).flat_map(|v| v.to_le_bytes()).collect();
        let value = encode_frame(&raw, [8, 32], PixelType::U32, Compression::Bslz4).unwrap();
        let (_, inner) = untag(&value, Some(TAG_MULTI_DIM_ARRAY)).unwrap();
        let (type_tag, payload) = untag(&inner.as_array().unwrap()[1], None).unwrap();
        assert_eq!(type_tag, TAG_UINT32_LE);
        let (_, contents) = untag(payload, Some(TAG_COMPRESSED)).unwrap();
        let fields = contents.as_array().unwrap();
        assert_eq!(fields[0].as_text(), Some("bslz4"));
        assert_eq!(as_usize(&fields[1]).unwrap(), 4);
        let data = fields[2].as_bytes().unwrap();
        assert_eq!(&data[..8], &(raw.len() as u64).to_be_bytes());
        assert_eq!(&data[8..12], &[0x00, 0x00, 0x20, 0x00]);
    }

    #[test]
    fn decode_recovers_both_compressions() {
        let raw = ramp_u16(24 * 20);
        for compression in [Compression::Bslz4, Compression::None] {
            let value = encode_frame(&raw, [20, 24], PixelType::U16, compression).unwrap();
            let frame = decode_frame(&value).unwrap();
            assert_eq!(frame.shape, [20, 24]);
            assert_eq!(frame.compression, compression);
            assert_eq!(frame.bytes, raw);
        }
    }

    #[test]
    fn unknown_compression_name_fails_for_any_frame() {
        let raw = ramp_u16(4);
        for name in ["xyz", "lz4", ""] {
            let err = encode_frame_named(&raw, [2, 2], PixelType::U16, name).unwrap_err();
            assert!(matches!(err, DetectorError::UnsupportedCompression(_)));
        }
    }

    #[test]
    fn mismatched_shape_is_rejected() {
        let raw = ramp_u16(10);
        let err = encode_frame(&raw, [4, 4], PixelType::U16, Compression::None).unwrap_err();
        assert!(matches!(err, DetectorError::Encode(_)));
    }

    #[test]
    fn frame_value_survives_cbor_serialization() {
        let raw = ramp_u16(16 * 16);
        let value = encode_frame(&raw, [16, 16], PixelType::U16, Compression::Bslz4).unwrap();
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&value, &mut buf).unwrap();
        // tag 40 is encoded as 0xd8 0x28
        assert_eq!(&buf[..2], &[0xd8, 0x28]);
        let parsed: Value = ciborium::de::from_reader(buf.as_slice()).unwrap();
        assert_eq!(decode_frame(&parsed).unwrap().bytes, raw);
    }
}
