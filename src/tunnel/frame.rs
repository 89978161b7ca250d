//! Frame encoding/decoding for the tunnel protocol
//!
//! Every frame is written as two independently sealed AEAD messages:
//!
//! ```text
//! +-------+--------------------------------------+-----+
//! | nonce | header (9B, encrypted)               | tag |
//! +-------+--------------------------------------+-----+
//! | nonce | [pad len] payload [padding] (enc.)   | tag |
//! +-------+--------------------------------------+-----+
//!
//! header:
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! |      Length (3B, big endian)     |  Type  | Flags  |      Random tag (4B)      |
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! `Length` covers everything inside the second message: the padding length
//! byte, the payload and the padding bytes.

use super::TunnelError;
use crate::crypto::{random_bytes, random_in_range, Cipher};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum payload carried by a single frame (16 KB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

/// Payloads up to this size are padded
pub const PADDING_THRESHOLD: usize = 64;

/// Lower bound (inclusive) of the random padding length
pub const MIN_PADDING: u8 = 64;

/// Upper bound (exclusive) of the random padding length
pub const MAX_PADDING: u8 = 255;

/// Largest length a peer may declare in a header
pub const MAX_DECLARED_LENGTH: usize = MAX_PAYLOAD_SIZE + 1 + MAX_PADDING as usize;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Session data
    Data,
    /// Close-handshake signal (FIN / ACK)
    Reset,
    /// Liveness probe, never surfaced to readers
    Ping,
    /// Reserved value not understood by this implementation
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => FrameType::Data,
            0x03 => FrameType::Reset,
            0x06 => FrameType::Ping,
            other => FrameType::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(value: FrameType) -> Self {
        match value {
            FrameType::Data => 0x00,
            FrameType::Reset => 0x03,
            FrameType::Ping => 0x06,
            FrameType::Unknown(other) => other,
        }
    }
}

/// Frame flag bits
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const TCP: Flags = Flags(0x01);
    pub const UDP: Flags = Flags(0x02);
    pub const ICMP: Flags = Flags(0x04);
    pub const PAD: Flags = Flags(0x08);
    /// Reserved, never set nor interpreted
    pub const NEED_ACK: Flags = Flags(0x10);
    pub const FIN: Flags = Flags(0x20);
    pub const ACK: Flags = Flags(0x40);

    /// No flags set
    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 7] = [
            (Flags::TCP, "TCP"),
            (Flags::UDP, "UDP"),
            (Flags::ICMP, "ICMP"),
            (Flags::PAD, "PAD"),
            (Flags::NEED_ACK, "NEED_ACK"),
            (Flags::FIN, "FIN"),
            (Flags::ACK, "ACK"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Flags({:#04x} {})", self.0, names.join("|"))
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the padded payload body
    pub length: usize,
    pub frame_type: FrameType,
    pub flags: Flags,
    /// Random stream tag, decorative only
    pub tag: [u8; 4],
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        let len = self.length as u32;
        buf[0] = (len >> 16) as u8;
        buf[1] = (len >> 8) as u8;
        buf[2] = len as u8;
        buf[3] = self.frame_type.into();
        buf[4] = self.flags.bits();
        buf[5..9].copy_from_slice(&self.tag);
        buf
    }

    fn parse(buf: &[u8]) -> Result<Self, TunnelError> {
        if buf.len() != FRAME_HEADER_SIZE {
            return Err(TunnelError::InvalidFrame(format!(
                "header is {} bytes, expected {}",
                buf.len(),
                FRAME_HEADER_SIZE
            )));
        }

        let length = ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | (buf[2] as usize);
        if length > MAX_DECLARED_LENGTH {
            return Err(TunnelError::PayloadSizeInvalid(length));
        }

        let mut tag = [0u8; 4];
        tag.copy_from_slice(&buf[5..9]);

        Ok(Self {
            length,
            frame_type: FrameType::from(buf[3]),
            flags: Flags::from_bits(buf[4]),
            tag,
        })
    }
}

/// Size of the sealed header on the wire
pub fn sealed_header_len(cipher: &Cipher) -> usize {
    cipher.sealed_len(FRAME_HEADER_SIZE)
}

/// Size of the sealed body on the wire for a declared `length`
pub fn sealed_body_len(cipher: &Cipher, length: usize) -> usize {
    cipher.sealed_len(length)
}

/// Authenticate and parse a sealed header
pub fn decode_header(cipher: &Cipher, sealed: &[u8]) -> Result<FrameHeader, TunnelError> {
    let plain = cipher.decrypt(sealed)?;
    FrameHeader::parse(&plain)
}

/// Authenticate a sealed body and strip its padding
pub fn decode_body(
    cipher: &Cipher,
    header: &FrameHeader,
    sealed: &[u8],
) -> Result<Frame, TunnelError> {
    let body = cipher.decrypt(sealed)?;
    if body.len() != header.length {
        return Err(TunnelError::PayloadSizeInvalid(body.len()));
    }

    let mut body = Bytes::from(body);
    let mut flags = header.flags;

    if flags.contains(Flags::PAD) {
        if body.is_empty() {
            return Err(TunnelError::PayloadSizeInvalid(0));
        }
        let padding_len = body.get_u8() as usize;
        if padding_len > body.len() {
            return Err(TunnelError::PayloadSizeInvalid(header.length));
        }
        body.truncate(body.len() - padding_len);
        flags.remove(Flags::PAD);
    }

    Ok(Frame {
        frame_type: header.frame_type,
        flags,
        payload: body,
    })
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    /// Flags as seen by the application; `PAD` is managed by the codec
    pub flags: Flags,
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame tagged with the session protocol flag
    pub fn data(protocol: Flags, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            flags: protocol,
            payload,
        }
    }

    /// Create a FIN signal frame
    pub fn fin() -> Self {
        Self::reset(Flags::FIN)
    }

    /// Create an ACK signal frame
    pub fn ack() -> Self {
        Self::reset(Flags::ACK)
    }

    /// Create a reset frame with the given flags and empty payload
    pub fn reset(flags: Flags) -> Self {
        Self {
            frame_type: FrameType::Reset,
            flags,
            payload: Bytes::new(),
        }
    }

    /// Create a ping frame
    pub fn ping() -> Self {
        Self {
            frame_type: FrameType::Ping,
            flags: Flags::empty(),
            payload: Bytes::new(),
        }
    }

    /// True for a reset frame carrying FIN
    pub fn is_fin(&self) -> bool {
        self.frame_type == FrameType::Reset && self.flags.contains(Flags::FIN)
    }

    /// True for a reset frame carrying ACK
    pub fn is_ack(&self) -> bool {
        self.frame_type == FrameType::Reset && self.flags.contains(Flags::ACK)
    }

    /// Encode and seal the frame, appending both messages to `out`
    pub fn encode_into(&self, cipher: &Cipher, out: &mut BytesMut) -> Result<(), TunnelError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        let mut flags = self.flags;
        let padding_len = if payload_len <= PADDING_THRESHOLD {
            flags.insert(Flags::PAD);
            Some(random_in_range(MIN_PADDING, MAX_PADDING)?)
        } else {
            flags.remove(Flags::PAD);
            None
        };

        let length = match padding_len {
            Some(pad) => 1 + payload_len + pad as usize,
            None => payload_len,
        };

        let mut tag = [0u8; 4];
        random_bytes(&mut tag)?;
        let header = FrameHeader {
            length,
            frame_type: self.frame_type,
            flags,
            tag,
        };

        let mut body = BytesMut::with_capacity(length);
        match padding_len {
            Some(pad) => {
                body.put_u8(pad);
                body.extend_from_slice(&self.payload);
                let start = body.len();
                body.resize(start + pad as usize, 0);
                random_bytes(&mut body[start..])?;
            }
            None => body.extend_from_slice(&self.payload),
        }

        out.reserve(cipher.sealed_len(FRAME_HEADER_SIZE) + cipher.sealed_len(length));
        cipher
            .encrypt_into(&header.encode(), out)
            .map_err(TunnelError::Encrypt)?;
        cipher
            .encrypt_into(&body, out)
            .map_err(TunnelError::Encrypt)?;

        Ok(())
    }

    /// Encode and seal the frame
    pub fn encode(&self, cipher: &Cipher) -> Result<BytesMut, TunnelError> {
        let mut out = BytesMut::new();
        self.encode_into(cipher, &mut out)?;
        Ok(out)
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns `Ok(None)` while the buffer does not yet hold a complete
    /// frame; nothing is consumed in that case.
    pub fn decode(cipher: &Cipher, buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        let header_len = sealed_header_len(cipher);
        if buf.len() < header_len {
            return Ok(None);
        }

        let header = decode_header(cipher, &buf[..header_len])?;
        let body_len = sealed_body_len(cipher, header.length);
        if buf.len() < header_len + body_len {
            return Ok(None);
        }

        let frame = decode_body(cipher, &header, &buf[header_len..header_len + body_len])?;
        buf.advance(header_len + body_len);
        Ok(Some(frame))
    }
}
