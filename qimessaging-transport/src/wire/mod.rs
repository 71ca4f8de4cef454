//! Wire format for message framing.
//!
//! Every message is a fixed 28-byte header followed by `size` payload bytes:
//!
//! ```text
//! [magic:4][id:4][size:4][version:2][type:1][flags:1][service:4][object:4][action:4][payload:size]
//! ```
//!
//! - **magic**: constant cookie `0x42adde42`
//! - **id**: per-process message id, replies reuse the id of the call
//! - **size**: payload length, sub-buffers included once flattened
//! - **version**: protocol version, currently 0
//! - **type** / **flags**: message type code and flag bits; read together
//!   they form the little-endian `u16` type field
//! - **service** / **object** / **action**: destination of the message
//!
//! All fields are little-endian.

use qimessaging_core::Buffer;

use crate::message::Message;

/// Header size: 4 + 4 + 4 + 2 + 1 + 1 + 4 + 4 + 4 = 28 bytes.
pub const HEADER_SIZE: usize = 28;

/// Magic cookie opening every header.
pub const MAGIC: u32 = 0x42ad_de42;

/// Protocol version written in outgoing headers.
pub const PROTOCOL_VERSION: u16 = 0;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse a header or a payload.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// The header does not start with [`MAGIC`].
    #[error("invalid magic cookie {found:#010x}")]
    InvalidMagic {
        /// Cookie that was read.
        found: u32,
    },

    /// Payload exceeds the configured maximum.
    #[error("payload of {size} bytes exceeds the maximum of {max}")]
    PayloadTooLarge {
        /// Size announced by the header.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Fixed-size message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Magic cookie, [`MAGIC`] for valid headers.
    pub magic: u32,
    /// Message id.
    pub id: u32,
    /// Payload size in bytes.
    pub size: u32,
    /// Protocol version.
    pub version: u16,
    /// Raw message type code.
    pub message_type: u8,
    /// Flag bits.
    pub flags: u8,
    /// Destination service.
    pub service: u32,
    /// Destination object.
    pub object: u32,
    /// Method, signal or event id.
    pub action: u32,
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            id: 0,
            size: 0,
            version: PROTOCOL_VERSION,
            message_type: 0,
            flags: 0,
            service: 0,
            object: 0,
            action: 0,
        }
    }
}

impl MessageHeader {
    /// Serialize header into buffer (must be at least HEADER_SIZE bytes).
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than HEADER_SIZE.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..14].copy_from_slice(&self.version.to_le_bytes());
        buf[14] = self.message_type;
        buf[15] = self.flags;
        buf[16..20].copy_from_slice(&self.service.to_le_bytes());
        buf[20..24].copy_from_slice(&self.object.to_le_bytes());
        buf[24..28].copy_from_slice(&self.action.to_le_bytes());
    }

    /// Header as a fixed-size byte array.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        self.serialize_into(&mut bytes);
        bytes
    }

    /// Deserialize header from buffer.
    ///
    /// The magic cookie is read but not checked, see [`check_magic`](Self::check_magic).
    ///
    /// # Errors
    ///
    /// Returns `InsufficientData` if buffer is smaller than HEADER_SIZE.
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }

        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Ok(Self {
            magic: u32_at(0),
            id: u32_at(4),
            size: u32_at(8),
            version: u16::from_le_bytes([buf[12], buf[13]]),
            message_type: buf[14],
            flags: buf[15],
            service: u32_at(16),
            object: u32_at(20),
            action: u32_at(24),
        })
    }

    /// The 16-bit type field as it appears on the wire.
    pub fn type_field(&self) -> u16 {
        u16::from_le_bytes([self.message_type, self.flags])
    }

    /// Fail with `InvalidMagic` unless the cookie is [`MAGIC`].
    pub fn check_magic(&self) -> Result<(), WireError> {
        if self.magic == MAGIC {
            Ok(())
        } else {
            Err(WireError::InvalidMagic { found: self.magic })
        }
    }

    /// Fail with `PayloadTooLarge` if the announced size exceeds `max`.
    ///
    /// A `max` of 0 disables the check.
    pub fn check_size(&self, max: usize) -> Result<(), WireError> {
        let size = self.size as usize;
        if max != 0 && size > max {
            return Err(WireError::PayloadTooLarge { size, max });
        }
        Ok(())
    }
}

/// Serialize a complete message, sub-buffers inlined, into one vector.
///
/// The socket writes the same bytes segment by segment; this form is used
/// where a contiguous frame is handier.
///
/// # Examples
///
/// ```
/// use qimessaging_transport::{Message, MessageAddress, MessageType, encode_message, try_decode_message};
///
/// let mut call = Message::new(MessageType::Call, MessageAddress::new(0, 2, 1, 100));
/// call.set_value(&"ping").expect("encode");
///
/// let frame = encode_message(&call).expect("frame");
/// let (decoded, consumed) = try_decode_message(&frame, 0).expect("valid").expect("complete");
/// assert_eq!(consumed, frame.len());
/// assert_eq!(decoded.value::<String>().expect("decode"), "ping");
/// ```
pub fn encode_message(message: &Message) -> Result<Vec<u8>, WireError> {
    let header = message.wire_header()?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + header.size as usize);
    frame.extend_from_slice(&header.to_bytes());
    for segment in message.buffer().segments() {
        frame.extend_from_slice(segment);
    }
    Ok(frame)
}

/// Try to decode one message from data that may be incomplete.
///
/// # Returns
///
/// - `Ok(Some((message, consumed)))` if a complete message was parsed
/// - `Ok(None)` if more data is needed (not an error condition)
/// - `Err` on a bad magic cookie or an oversized payload (`max_payload` 0 means unlimited)
pub fn try_decode_message(
    data: &[u8],
    max_payload: usize,
) -> Result<Option<(Message, usize)>, WireError> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = MessageHeader::deserialize(data)?;
    header.check_magic()?;
    header.check_size(max_payload)?;

    let expected_len = HEADER_SIZE + header.size as usize;
    if data.len() < expected_len {
        return Ok(None);
    }

    let payload = Buffer::from(&data[HEADER_SIZE..expected_len]);
    Ok(Some((Message::from_parts(header, payload), expected_len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageAddress, MessageType};

    fn sample_header() -> MessageHeader {
        MessageHeader {
            magic: MAGIC,
            id: 0x0102_0304,
            size: 16,
            version: 0,
            message_type: 2,
            flags: 0,
            service: 1,
            object: 1,
            action: 100,
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample_header().to_bytes();
        assert_eq!(&bytes[0..4], &[0x42, 0xde, 0xad, 0x42]);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..12], &16u32.to_le_bytes());
        assert_eq!(&bytes[12..14], &[0, 0]);
        assert_eq!(&bytes[14..16], &2u16.to_le_bytes());
        assert_eq!(&bytes[24..28], &100u32.to_le_bytes());
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let decoded = MessageHeader::deserialize(&header.to_bytes()).expect("deserialize");
        assert_eq!(decoded, header);
        assert_eq!(decoded.type_field(), 2);
    }

    #[test]
    fn test_flags_share_type_field() {
        let header = MessageHeader {
            flags: 0x02,
            ..sample_header()
        };
        assert_eq!(header.type_field(), 0x0202);
    }

    #[test]
    fn test_insufficient_header() {
        let result = MessageHeader::deserialize(&[0u8; 10]);
        assert!(matches!(
            result,
            Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: 10
            })
        ));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut bytes = sample_header().to_bytes();
        bytes[0] ^= 0xff;
        let result = try_decode_message(&bytes, 0);
        assert!(matches!(result, Err(WireError::InvalidMagic { .. })));
    }

    #[test]
    fn test_oversized_payload_rejected_from_header_alone() {
        let header = MessageHeader {
            size: 16_777_216,
            ..sample_header()
        };
        // Only the header is present: the size check must not wait for the payload.
        let result = try_decode_message(&header.to_bytes(), 10_000_000);
        assert!(matches!(
            result,
            Err(WireError::PayloadTooLarge {
                size: 16_777_216,
                max: 10_000_000
            })
        ));
    }

    #[test]
    fn test_try_decode_partial_and_extra_data() {
        let mut reply = Message::new(MessageType::Reply, MessageAddress::new(9, 1, 1, 101));
        reply.set_value(&vec![1u32, 2, 3]).expect("encode");
        let frame = encode_message(&reply).expect("frame");

        assert!(matches!(try_decode_message(&frame[..10], 0), Ok(None)));
        assert!(matches!(
            try_decode_message(&frame[..HEADER_SIZE + 2], 0),
            Ok(None)
        ));

        let mut extended = frame.clone();
        extended.extend_from_slice(b"next message");
        let (decoded, consumed) = try_decode_message(&extended, 0)
            .expect("decode")
            .expect("complete");
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded.id(), 9);
        assert_eq!(decoded.value::<Vec<u32>>().expect("value"), vec![1, 2, 3]);
    }

    #[test]
    fn test_sub_buffers_are_inlined_in_frame() {
        let blob = Buffer::from(vec![0xabu8; 2000]);
        let mut post = Message::new(MessageType::Post, MessageAddress::new(0, 5, 1, 120));
        post.set_value(&("head", blob.clone())).expect("encode");

        let frame = encode_message(&post).expect("frame");
        let header = MessageHeader::deserialize(&frame).expect("header");
        assert_eq!(header.size as usize, post.buffer().total_size());
        assert_eq!(frame.len(), HEADER_SIZE + post.buffer().total_size());

        let (decoded, _) = try_decode_message(&frame, 0).expect("decode").expect("complete");
        let (head, received): (String, Buffer) = decoded.value().expect("value");
        assert_eq!(head, "head");
        assert_eq!(received.as_slice(), blob.as_slice());
    }

    proptest::proptest! {
        #[test]
        fn test_prefixes_never_decode(payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256), cut in 0usize..512) {
            let mut post = Message::new(MessageType::Post, MessageAddress::new(0, 3, 1, 100));
            post.set_value(&payload).expect("encode");
            let frame = encode_message(&post).expect("frame");
            let cut = cut % frame.len();
            proptest::prop_assert!(matches!(try_decode_message(&frame[..cut], 0), Ok(None)));
            let (decoded, consumed) = try_decode_message(&frame, 0).expect("decode").expect("complete");
            proptest::prop_assert_eq!(consumed, frame.len());
            proptest::prop_assert_eq!(decoded.value::<Vec<u8>>().expect("value"), payload);
        }
    }
}
