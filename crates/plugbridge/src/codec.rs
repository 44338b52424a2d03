//! Framing and payload encoding
//!
//! netrpc frames are a 12-byte little-endian header followed by a
//! prost-encoded envelope. Call arguments and results inside the envelopes
//! are JSON so any serde type can cross the bridge.

use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BridgeError, BridgeResult, TransportError, TransportResult};

/// Default upper bound for a single frame payload
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Envelope codec with a size limit
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl MessageCodec {
    /// Create a codec with the default limit
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Create a codec with a custom limit
    pub fn with_max_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Get the maximum message size
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Check if a payload size is within the limit
    ///
    /// Zero is valid: an envelope whose fields are all defaults encodes to
    /// nothing.
    pub fn is_valid_size(&self, size: usize) -> bool {
        size <= self.max_message_size
    }

    /// Encode an envelope
    pub fn encode<M: Message>(&self, message: &M) -> TransportResult<Vec<u8>> {
        let encoded_len = message.encoded_len();
        if !self.is_valid_size(encoded_len) {
            return Err(TransportError::EncodingFailed(format!(
                "message size {} exceeds maximum {}",
                encoded_len, self.max_message_size
            )));
        }

        let mut buffer = Vec::with_capacity(encoded_len);
        message
            .encode(&mut buffer)
            .map_err(|e| TransportError::EncodingFailed(e.to_string()))?;
        Ok(buffer)
    }

    /// Decode an envelope
    pub fn decode<M: Message + Default>(&self, bytes: &[u8]) -> TransportResult<M> {
        if !self.is_valid_size(bytes.len()) {
            return Err(TransportError::DecodingFailed(format!(
                "message size {} exceeds maximum {}",
                bytes.len(),
                self.max_message_size
            )));
        }

        M::decode(bytes).map_err(|e| TransportError::DecodingFailed(e.to_string()))
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type identifier, see [`message_types`]
    pub message_type: u16,
    /// Payload length
    pub payload_len: u32,
    /// Sequence number; the call id for CALL and RESPONSE frames
    pub sequence: u32,
    /// Flags, see [`message_flags`]
    pub flags: u16,
}

impl MessageHeader {
    /// Header size in bytes
    pub const SIZE: usize = 12;

    /// Create a header
    pub fn new(message_type: u16, payload_len: u32, sequence: u32) -> Self {
        Self {
            message_type,
            payload_len,
            sequence,
            flags: 0,
        }
    }

    /// Encode the header to bytes
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buffer = [0u8; Self::SIZE];
        let fields = self
            .message_type
            .to_le_bytes()
            .into_iter()
            .chain(self.payload_len.to_le_bytes())
            .chain(self.sequence.to_le_bytes())
            .chain(self.flags.to_le_bytes());
        for (dst, src) in buffer.iter_mut().zip(fields) {
            *dst = src;
        }
        buffer
    }

    /// Decode a header from bytes
    pub fn decode(bytes: &[u8]) -> TransportResult<Self> {
        let Some(&[t0, t1, l0, l1, l2, l3, s0, s1, s2, s3, f0, f1]) =
            bytes.first_chunk::<{ MessageHeader::SIZE }>()
        else {
            return Err(TransportError::DecodingFailed(
                "insufficient bytes for message header".to_string(),
            ));
        };

        Ok(Self {
            message_type: u16::from_le_bytes([t0, t1]),
            payload_len: u32::from_le_bytes([l0, l1, l2, l3]),
            sequence: u32::from_le_bytes([s0, s1, s2, s3]),
            flags: u16::from_le_bytes([f0, f1]),
        })
    }

    /// Set a flag
    pub fn set_flag(&mut self, flag: u16) {
        self.flags |= flag;
    }

    /// Check if a flag is set
    pub fn has_flag(&self, flag: u16) -> bool {
        (self.flags & flag) != 0
    }
}

/// Message type identifiers
pub mod message_types {
    /// Host to plugin call, payload is a `CallRequest`
    pub const CALL: u16 = 0x0001;
    /// Plugin to host reply, payload is a `CallResponse`
    pub const RESPONSE: u16 = 0x0002;
    /// Broker announcement in either direction, payload is a `ConnInfo`
    pub const BROKER: u16 = 0x0003;
}

/// Message flags
pub mod message_flags {
    /// Response carries an error
    pub const IS_ERROR: u16 = 0x0008;
}

/// A decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: MessageHeader,
    /// Raw envelope bytes
    pub payload: Vec<u8>,
}

/// Write one frame
pub async fn write_frame<W>(
    writer: &mut W,
    mut header: MessageHeader,
    payload: &[u8],
) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    header.payload_len = u32::try_from(payload.len())
        .map_err(|e| TransportError::EncodingFailed(format!("payload length: {e}")))?;
    writer.write_all(&header.encode()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R, codec: &MessageCodec) -> TransportResult<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; MessageHeader::SIZE];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = MessageHeader::decode(&head)?;
    let len = header.payload_len as usize;
    if !codec.is_valid_size(len) {
        return Err(TransportError::DecodingFailed(format!(
            "frame of {} bytes exceeds maximum {}",
            len,
            codec.max_message_size()
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame { header, payload }))
}

/// Encode call arguments or results
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> BridgeResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(BridgeError::from)
}

/// Decode call arguments or results
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> BridgeResult<T> {
    serde_json::from_slice(bytes).map_err(BridgeError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugbridge_proto::{CallRequest, Empty};

    #[test]
    fn test_message_codec_limits() {
        let codec = MessageCodec::default();
        assert!(codec.is_valid_size(0));
        assert!(codec.is_valid_size(1024));
        assert!(!codec.is_valid_size(100 * 1024 * 1024));
    }

    #[test]
    fn test_empty_envelope_encodes() -> TransportResult<()> {
        let codec = MessageCodec::new();
        let bytes = codec.encode(&Empty {})?;
        assert!(bytes.is_empty());
        let _: Empty = codec.decode(&bytes)?;
        Ok(())
    }

    #[test]
    fn test_oversized_envelope_rejected() {
        let codec = MessageCodec::with_max_size(8);
        let request = CallRequest {
            plugin: "greeter".into(),
            method: "Greet".into(),
            payload: vec![0; 32],
        };
        assert!(matches!(
            codec.encode(&request),
            Err(TransportError::EncodingFailed(_))
        ));
    }

    #[test]
    fn test_message_header_encode_decode() -> TransportResult<()> {
        let mut header = MessageHeader::new(message_types::RESPONSE, 1024, 42);
        header.set_flag(message_flags::IS_ERROR);
        let decoded = MessageHeader::decode(&header.encode())?;

        assert_eq!(decoded, header);
        assert!(decoded.has_flag(message_flags::IS_ERROR));
        Ok(())
    }

    #[test]
    fn test_message_header_short_input() {
        assert!(MessageHeader::decode(&[0u8; 5]).is_err());
    }

    #[tokio::test]
    async fn test_frame_over_duplex() -> TransportResult<()> {
        let (mut a, mut b) = tokio::io::duplex(256);
        let codec = MessageCodec::new();

        write_frame(&mut a, MessageHeader::new(message_types::CALL, 0, 7), b"hi").await?;
        drop(a);

        let frame = read_frame(&mut b, &codec).await?;
        let frame = frame.ok_or(TransportError::Closed)?;
        assert_eq!(frame.header.sequence, 7);
        assert_eq!(frame.header.payload_len, 2);
        assert_eq!(frame.payload, b"hi");

        assert!(read_frame(&mut b, &codec).await?.is_none());
        Ok(())
    }

    #[test]
    fn test_payload_preserves_bytes() -> BridgeResult<()> {
        let bytes = encode_payload(&vec![1u8, 2, 3])?;
        let back: Vec<u8> = decode_payload(&bytes)?;
        assert_eq!(back, vec![1, 2, 3]);

        let err = decode_payload::<u32>(b"\"not a number\"");
        assert!(matches!(err, Err(BridgeError::Codec(_))));
        Ok(())
    }
}
