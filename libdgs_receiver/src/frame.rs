//! Digitizer-side wire codec.
//!
//! The event server delivers an undifferentiated byte stream with no outer
//! framing; record boundaries are recovered by parsing each record's own
//! header. Everything in this module is pure: the caller owns the buffer and
//! the scan position, and nothing here performs I/O.
//!
//! Digitizer record layout (words in network order, after the marker):
//!
//! ```text
//! word | 31..27   | 26..16         | 15..4            | 3..0
//! 0    | geo addr | packet length  | user packet data | channel id
//! 1    |                 discriminator timestamp[31:0]
//! 2    | hdr len  | event type | - | header type | timestamp[47:32]
//! ```

use byteorder::{ByteOrder, LittleEndian, NetworkEndian};

use super::constants::*;
use super::error::FrameError;

/// What the leading word of a record says it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordClass {
    Digitizer,
    Trigger,
    Unrecognized,
}

/// Classify a leading word. Total: every 32-bit value maps to exactly one class.
pub fn classify(word: u32) -> WordClass {
    if word == DIG_SOE {
        WordClass::Digitizer
    } else if word & TRIG_SOE_MASK == TRIG_SOE {
        WordClass::Trigger
    } else {
        WordClass::Unrecognized
    }
}

/// Decoded fields of a digitizer record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigitizerHeader {
    /// Channel id, bits 3..0 of word 0. Values 0xA and above are control
    /// markers, not data channels.
    pub channel: u8,
    /// Board id, bits 15..4 of word 0 (12-bit).
    pub board: u16,
    /// Record length in words, marker excluded, bits 26..16 of word 0.
    pub length_words: u32,
    /// 48-bit leading-edge discriminator timestamp.
    pub timestamp: u64,
    /// Bits 19..16 of word 2.
    pub header_type: u8,
    /// Bits 25..23 of word 2.
    pub event_type: u8,
}

impl DigitizerHeader {
    /// Extract the header fields from the three words following the marker.
    pub fn from_words(words: &[u32; 3]) -> Self {
        let timestamp_lower = words[1] as u64;
        let timestamp_upper = (words[2] & 0x0000_FFFF) as u64;
        Self {
            channel: (words[0] & 0x0000_000F) as u8,
            board: ((words[0] & 0x0000_FFF0) >> 4) as u16,
            length_words: (words[0] & 0x07FF_0000) >> 16,
            timestamp: (timestamp_upper << 32) | timestamp_lower,
            header_type: ((words[2] & 0x000F_0000) >> 16) as u8,
            event_type: ((words[2] & 0x0380_0000) >> 23) as u8,
        }
    }

    /// Pack the fields back into header words. Inverse of [`Self::from_words`]
    /// for every field this decoder extracts; reserved bits are left zero.
    pub fn to_words(&self) -> [u32; 3] {
        [
            (self.channel as u32 & 0xF)
                | ((self.board as u32 & BOARD_ID_MASK as u32) << 4)
                | ((self.length_words & 0x7FF) << 16),
            (self.timestamp & 0xFFFF_FFFF) as u32,
            ((self.timestamp >> 32) & 0xFFFF) as u32
                | ((self.header_type as u32 & 0xF) << 16)
                | ((self.event_type as u32 & 0x7) << 23),
        ]
    }
}

/// A control record delivered in digitizer framing. The channel-id nibble
/// carries the marker instead of a real channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRecord {
    pub board: u16,
    pub marker: u8,
    pub event_type: u8,
}

/// One data record, borrowed out of the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitizerRecord<'a> {
    pub header: DigitizerHeader,
    /// The record body: header words plus trace payload, marker excluded.
    /// Exactly `header.length_words * 4` bytes.
    pub body: &'a [u8],
    /// Bytes consumed from the buffer, marker included.
    pub consumed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record<'a> {
    Digitizer(DigitizerRecord<'a>),
    Control(ControlRecord),
}

/// Decode one digitizer-framed record starting at `offset`, which must point
/// at a `0xAAAAAAAA` marker word.
///
/// The buffer position may only advance by a length validated against the
/// remaining buffer before any field is trusted, so validation runs in a
/// fixed order: header presence, minimum length, payload fit, and the
/// delimiter of the following record. Control markers short-circuit the
/// length checks since they are a fixed 4 words.
pub fn decode_digitizer(buf: &[u8], offset: usize) -> Result<Record<'_>, FrameError> {
    let body_start = offset + SIZE_UNIT;
    let min_bytes = DIG_MIN_LENGTH_WORDS as usize * SIZE_UNIT;
    if body_start + min_bytes > buf.len() {
        return Err(FrameError::HeaderTruncated(
            offset,
            buf.len().saturating_sub(body_start),
        ));
    }

    let words = [
        NetworkEndian::read_u32(&buf[body_start..]),
        NetworkEndian::read_u32(&buf[body_start + SIZE_UNIT..]),
        NetworkEndian::read_u32(&buf[body_start + 2 * SIZE_UNIT..]),
    ];
    let header = DigitizerHeader::from_words(&words);

    if header.channel >= 0xA {
        // Control records ignore the nominal length field entirely.
        return Ok(Record::Control(ControlRecord {
            board: header.board,
            marker: header.channel,
            event_type: header.event_type,
        }));
    }

    if header.length_words < DIG_MIN_LENGTH_WORDS {
        return Err(FrameError::RecordTooShort {
            offset,
            length: header.length_words,
        });
    }

    let body_bytes = header.length_words as usize * SIZE_UNIT;
    let after = body_start + body_bytes;
    if after > buf.len() {
        return Err(FrameError::PayloadTruncated {
            offset,
            length: header.length_words,
        });
    }

    if after + SIZE_UNIT <= buf.len() {
        let next = NetworkEndian::read_u32(&buf[after..]);
        if next != DIG_SOE {
            return Err(FrameError::FramingMismatch {
                offset,
                length: header.length_words,
                found: next,
            });
        }
    } else if after < buf.len() {
        // A ragged sub-word tail cannot hold the next marker.
        return Err(FrameError::FramingMismatch {
            offset,
            length: header.length_words,
            found: 0,
        });
    }

    Ok(Record::Digitizer(DigitizerRecord {
        header,
        body: &buf[body_start..after],
        consumed: after - offset,
    }))
}

/// The fixed 16-byte prefix some downstream tools expect before each payload:
/// `{int32 type, int32 length, uint64 timestamp}` in the byte order the GEB
/// toolchain consumes (little endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GebHeader {
    pub kind: i32,
    pub length: i32,
    pub timestamp: u64,
}

impl GebHeader {
    pub fn new(kind: i32, length: i32, timestamp: u64) -> Self {
        Self {
            kind,
            length,
            timestamp,
        }
    }

    pub fn to_bytes(&self) -> [u8; GEB_HEADER_BYTES] {
        let mut bytes = [0u8; GEB_HEADER_BYTES];
        LittleEndian::write_i32(&mut bytes[0..4], self.kind);
        LittleEndian::write_i32(&mut bytes[4..8], self.length);
        LittleEndian::write_u64(&mut bytes[8..16], self.timestamp);
        bytes
    }
}
