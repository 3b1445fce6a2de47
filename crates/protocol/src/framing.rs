//! Length-prefixed framing for envelopes on a byte stream.
//!
//! # Frame Format
//!
//! ```text
//! +--------+-------------+-------+---------------------------+
//! | "WBOX" | len (u32 BE)| flags | payload (len - 1 bytes)   |
//! +--------+-------------+-------+---------------------------+
//! ```
//!
//! `len` counts the flags byte plus the payload. Bit 0 of `flags` marks an
//! LZ4-compressed payload. Payloads above [`COMPRESSION_THRESHOLD`] are
//! compressed when that makes them smaller, which matters for listings of
//! large directories and for upload batches of text files.

use crate::error::{ProtocolError, Result};
use crate::messages::Envelope;

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"WBOX";

/// Payloads larger than this are considered for compression.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Upper bound on an encoded frame, header included.
///
/// Uploads are capped well below this by the daemon, but a single batch may
/// carry several files, so the bound is generous.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Magic (4) + length (4) + flags (1).
pub const FRAME_HEADER_SIZE: usize = 9;

const PREFIX_SIZE: usize = 8;
const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// A decoded frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Whether the payload travelled compressed.
    pub was_compressed: bool,
    /// Uncompressed payload.
    pub payload: Vec<u8>,
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compression_enabled: bool,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with compression enabled and the default size bound.
    pub fn new() -> Self {
        Self {
            compression_enabled: true,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Codec that never compresses.
    pub fn without_compression() -> Self {
        Self {
            compression_enabled: false,
            ..Self::new()
        }
    }

    /// Override the maximum accepted frame size.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max.max(FRAME_HEADER_SIZE);
        self
    }

    /// Encode a raw payload into a frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let compressed = if self.compression_enabled && payload.len() > COMPRESSION_THRESHOLD {
            let packed = lz4_flex::compress_prepend_size(payload);
            (packed.len() < payload.len()).then_some(packed)
        } else {
            None
        };

        let (flags, body) = match &compressed {
            Some(packed) => (FLAG_COMPRESSED, packed.as_slice()),
            None => (0, payload),
        };

        let total = FRAME_HEADER_SIZE + body.len();
        if total > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            });
        }

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&FRAME_MAGIC);
        out.extend_from_slice(&((body.len() + 1) as u32).to_be_bytes());
        out.push(flags);
        out.extend_from_slice(body);
        Ok(out)
    }

    /// Decode one frame from the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` holds only part of a frame, otherwise the
    /// frame and the number of bytes it occupied.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        if data[..4] != FRAME_MAGIC {
            return Err(ProtocolError::Deserialization(format!(
                "invalid frame magic: expected {:02x?}, got {:02x?}",
                FRAME_MAGIC,
                &data[..4]
            )));
        }

        let content_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if content_len == 0 {
            return Err(ProtocolError::Deserialization(
                "invalid frame: missing flags byte".to_string(),
            ));
        }

        let total = PREFIX_SIZE + content_len;
        if total > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            });
        }
        if data.len() < total {
            return Ok(None);
        }

        let flags = data[PREFIX_SIZE];
        let body = &data[FRAME_HEADER_SIZE..total];
        let was_compressed = flags & FLAG_COMPRESSED != 0;
        let payload = if was_compressed {
            self.decompress(body)?
        } else {
            body.to_vec()
        };

        Ok(Some((
            Frame {
                was_compressed,
                payload,
            },
            total,
        )))
    }

    /// Decompress a size-prepended LZ4 body.
    ///
    /// The declared size comes from the peer, so it is held to the frame
    /// limit before anything is allocated for it.
    fn decompress(&self, body: &[u8]) -> Result<Vec<u8>> {
        let Some(prefix) = body.get(..4) else {
            return Err(ProtocolError::Deserialization(
                "compressed payload is missing its size prefix".to_string(),
            ));
        };
        let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if declared > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: declared,
                max: self.max_frame_size,
            });
        }

        lz4_flex::decompress_size_prepended(body).map_err(|e| {
            ProtocolError::Deserialization(format!("failed to decompress payload: {e}"))
        })
    }

    /// Decode exactly one complete frame; partial input is an error.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        self.try_decode(data)?.ok_or_else(|| {
            ProtocolError::Deserialization(format!(
                "insufficient data for frame: have {} bytes",
                data.len()
            ))
        })
    }

    /// Serialize an envelope and wrap it in a frame.
    pub fn encode_envelope(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let bytes = envelope.to_msgpack()?;
        self.encode(&bytes)
    }

    /// Decode one envelope from the front of `data`, checking its version.
    pub fn try_decode_envelope(&self, data: &[u8]) -> Result<Option<(Envelope, usize)>> {
        let Some((frame, consumed)) = self.try_decode(data)? else {
            return Ok(None);
        };
        let envelope = Envelope::from_msgpack(&frame.payload)?;
        envelope.check_version()?;
        Ok(Some((envelope, consumed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ListDirectory, Message, Ping, SaveUploads, UploadFile};

    fn frame_bytes(flags: u8, body: &[u8]) -> Vec<u8> {
        let mut out = FRAME_MAGIC.to_vec();
        out.extend_from_slice(&((body.len() + 1) as u32).to_be_bytes());
        out.push(flags);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_header_layout() {
        let encoded = FrameCodec::new().encode(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(&encoded[0..4], b"WBOX");
        assert_eq!(u32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]), 5);
        assert_eq!(encoded[8], 0);
        assert_eq!(&encoded[9..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_empty_payload() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&[]).unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);
        let (frame, consumed) = codec.decode(&encoded).unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(consumed, FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_large_repetitive_payload_is_compressed() {
        let codec = FrameCodec::new();
        let payload = b"a.txt\n".repeat(1000);
        let encoded = codec.encode(&payload).unwrap();
        assert_eq!(encoded[8] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert!(encoded.len() < payload.len());

        let (frame, _) = codec.decode(&encoded).unwrap();
        assert!(frame.was_compressed);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_payload_at_threshold_is_not_compressed() {
        let encoded = FrameCodec::new().encode(&vec![0u8; COMPRESSION_THRESHOLD]).unwrap();
        assert_eq!(encoded[8], 0);
    }

    #[test]
    fn test_without_compression() {
        let codec = FrameCodec::without_compression();
        let encoded = codec.encode(&vec![7u8; 4096]).unwrap();
        assert_eq!(encoded[8], 0);
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 4096);
    }

    #[test]
    fn test_bad_magic() {
        let mut data = frame_bytes(0, &[1, 2, 3]);
        data[..4].copy_from_slice(b"RMSH");
        let err = FrameCodec::new().try_decode(&data).unwrap_err();
        assert!(err.to_string().contains("invalid frame magic"), "{err}");
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut data = FRAME_MAGIC.to_vec();
        data.extend_from_slice(&0u32.to_be_bytes());
        data.push(0);
        assert!(FrameCodec::new().try_decode(&data).is_err());
    }

    #[test]
    fn test_frame_size_limit() {
        let codec = FrameCodec::without_compression().with_max_frame_size(64);
        let err = codec.encode(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 73, max: 64 }));

        // Decoding rejects an oversized length before the body arrives.
        let mut header = FRAME_MAGIC.to_vec();
        header.extend_from_slice(&1000u32.to_be_bytes());
        header.push(0);
        assert!(matches!(
            codec.try_decode(&header),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_partial_input() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(b"hello").unwrap();
        for len in 0..encoded.len() {
            assert!(codec.try_decode(&encoded[..len]).unwrap().is_none(), "len={len}");
        }
        assert!(codec.decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_corrupted_compressed_body() {
        let data = frame_bytes(FLAG_COMPRESSED, &[16, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        let err = FrameCodec::new().decode(&data).unwrap_err();
        assert!(err.to_string().contains("decompress"));
    }

    #[test]
    fn test_declared_decompressed_size_is_bounded() {
        // A tiny frame claiming a 4 GiB payload.
        let data = frame_bytes(FLAG_COMPRESSED, &[0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
        let err = FrameCodec::new().decode(&data).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge { size, max } if size == u32::MAX as usize && max == MAX_FRAME_SIZE
        ));

        let codec = FrameCodec::new().with_max_frame_size(4096);
        let claims_8k = frame_bytes(FLAG_COMPRESSED, &[0x00, 0x20, 0x00, 0x00, 0x00]);
        assert!(matches!(
            codec.decode(&claims_8k),
            Err(ProtocolError::FrameTooLarge { size: 8192, max: 4096 })
        ));

        let truncated = frame_bytes(FLAG_COMPRESSED, &[0x01, 0x00]);
        assert!(FrameCodec::new().decode(&truncated).is_err());
    }

    #[test]
    fn test_back_to_back_envelopes() {
        let codec = FrameCodec::new();
        let first = Envelope::new(1, Message::Ping(Ping { timestamp: 9 }));
        let second = Envelope::new(
            2,
            Message::ListDirectory(ListDirectory {
                path: "$WORK_DIR".to_string(),
            }),
        );

        let mut buf = codec.encode_envelope(&first).unwrap();
        buf.extend(codec.encode_envelope(&second).unwrap());

        let (a, used) = codec.try_decode_envelope(&buf).unwrap().unwrap();
        let (b, rest) = codec.try_decode_envelope(&buf[used..]).unwrap().unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert_eq!(used + rest, buf.len());
    }

    #[test]
    fn test_upload_envelope_survives_compression() {
        let codec = FrameCodec::new();
        let envelope = Envelope::new(
            3,
            Message::SaveUploads(SaveUploads {
                target_dir: "docs".to_string(),
                files: vec![UploadFile {
                    filename: "notes.md".to_string(),
                    data: b"# heading\n".repeat(500),
                }],
            }),
        );
        let encoded = codec.encode_envelope(&envelope).unwrap();
        assert_eq!(encoded[8] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        let (decoded, _) = codec.try_decode_envelope(&encoded).unwrap().unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_envelope_version_checked() {
        let codec = FrameCodec::new();
        let mut envelope = Envelope::new(1, Message::Ping(Ping { timestamp: 0 }));
        envelope.version = 99;
        let encoded = codec.encode_envelope(&envelope).unwrap();
        assert!(matches!(
            codec.try_decode_envelope(&encoded),
            Err(ProtocolError::VersionMismatch { got: 99, .. })
        ));
    }
}
