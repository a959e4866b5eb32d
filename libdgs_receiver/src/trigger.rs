//! Trigger-side wire codec.
//!
//! Trigger modules emit a fixed 16-word record whose leading word matches
//! `0xAAAAxxxx`, where the low half already carries the trigger type. The
//! remaining words are unpacked as 16-bit sub-fields and then repacked into a
//! digitizer-shaped record so the sink layer can route trigger data through
//! the same per-file machinery as channel data.
//!
//! Two incompatible field layouts exist in deployed trigger firmware, and
//! they additionally disagree on the word transform applied before
//! unpacking. Neither is authoritative, so the mapping is a selectable
//! profile rather than a single hardcoded table; verify the chosen profile
//! against a captured record from the deployment at hand.

use byteorder::{ByteOrder, LittleEndian, NetworkEndian};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

use super::constants::*;
use super::error::TriggerError;
use super::frame::DigitizerHeader;

/// Selectable trigger decode layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerProfile {
    /// Current firmware: paired 16-bit fields in the low/high halves of the
    /// first eight words, board id carried in the header. Words are read in
    /// the byte order the legacy receiver ultimately produced after its
    /// network conversion plus in-place swap, which collapses to a
    /// little-endian read.
    RevA,
    /// Legacy firmware: one 16-bit field in the low half of each word,
    /// plain network-order words, no board id on the wire.
    RevB,
}

impl TriggerProfile {
    /// Read one header word under this profile's byte transform.
    fn word(self, raw: &[u8]) -> u32 {
        match self {
            TriggerProfile::RevA => LittleEndian::read_u32(raw),
            TriggerProfile::RevB => NetworkEndian::read_u32(raw),
        }
    }
}

/// The unpacked sub-fields of one trigger record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerFields {
    pub trigger_type: u16,
    /// Board id when the profile carries one on the wire; zero otherwise.
    pub board: u16,
    pub ts_lower: u16,
    pub ts_middle: u16,
    pub ts_upper: u16,
    pub wheel: u16,
    pub multiplicity: u16,
    pub user_register: u16,
    pub coarse_ts: u16,
    pub trigger_bits: u16,
    /// Fine-time (vernier reference) offsets for the four phases.
    pub offsets: [u16; 4],
    pub vernier_ab: u16,
    pub vernier_cd: u16,
}

impl TriggerFields {
    /// The trigger's own 48-bit timestamp, assembled from its three 16-bit
    /// parts. This is what goes into the GEB header of the reframed record,
    /// not the digitizer timestamp fields.
    pub fn timestamp(&self) -> u64 {
        ((self.ts_upper as u64) << 32) | ((self.ts_middle as u64) << 16) | self.ts_lower as u64
    }
}

fn lo(word: u32) -> u16 {
    (word & 0xFFFF) as u16
}

fn hi(word: u32) -> u16 {
    (word >> 16) as u16
}

/// Decode one trigger record starting at `offset`, which must point at a
/// `0xAAAAxxxx` marker word. Returns the fields and the bytes consumed
/// (always the full fixed record).
pub fn decode_trigger(
    buf: &[u8],
    offset: usize,
    profile: TriggerProfile,
) -> Result<(TriggerFields, usize), TriggerError> {
    let record_bytes = TRIG_RECORD_WORDS * SIZE_UNIT;
    if offset + record_bytes > buf.len() {
        return Err(TriggerError::Truncated(offset, buf.len() - offset));
    }

    // The marker word is not skipped: its low half is the trigger type,
    // read in network order regardless of profile since that is the order
    // the marker itself was matched in.
    let trigger_type = lo(NetworkEndian::read_u32(&buf[offset..]));

    let mut words = [0u32; TRIG_RECORD_WORDS];
    for (i, word) in words.iter_mut().enumerate().skip(1) {
        *word = profile.word(&buf[offset + i * SIZE_UNIT..]);
    }

    let fields = match profile {
        TriggerProfile::RevA => TriggerFields {
            trigger_type,
            board: hi(words[3]) & BOARD_ID_MASK,
            ts_lower: lo(words[1]),
            ts_middle: hi(words[1]),
            ts_upper: lo(words[2]),
            wheel: hi(words[2]),
            multiplicity: lo(words[8]),
            user_register: lo(words[3]),
            coarse_ts: lo(words[4]),
            trigger_bits: hi(words[4]),
            offsets: [lo(words[5]), hi(words[5]), lo(words[6]), hi(words[6])],
            vernier_ab: lo(words[7]),
            vernier_cd: hi(words[7]),
        },
        TriggerProfile::RevB => TriggerFields {
            trigger_type,
            board: 0,
            ts_lower: lo(words[4]),
            ts_middle: lo(words[3]),
            ts_upper: lo(words[2]),
            wheel: lo(words[1]),
            multiplicity: lo(words[5]),
            user_register: lo(words[6]),
            coarse_ts: lo(words[7]),
            trigger_bits: lo(words[8]),
            offsets: [lo(words[9]), lo(words[10]), lo(words[11]), lo(words[12])],
            vernier_ab: lo(words[13]),
            vernier_cd: lo(words[14]),
        },
    };

    Ok((fields, record_bytes))
}

/// A trigger repacked into digitizer framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReframedTrigger {
    pub header: DigitizerHeader,
    /// The full synthetic record, marker word included.
    pub words: [u32; REFRAMED_TRIG_WORDS],
}

impl ReframedTrigger {
    /// The record body as wire bytes (marker excluded), ready for a sink
    /// write. Same shape a real digitizer record body has on disk.
    pub fn body_bytes(&self) -> [u8; (REFRAMED_TRIG_WORDS - 1) * SIZE_UNIT] {
        let mut bytes = [0u8; (REFRAMED_TRIG_WORDS - 1) * SIZE_UNIT];
        for (i, word) in self.words[1..].iter().enumerate() {
            NetworkEndian::write_u32(&mut bytes[i * SIZE_UNIT..], *word);
        }
        bytes
    }
}

/// Repack trigger fields into a digitizer-shaped record.
///
/// The synthetic record is 10 words including the marker, with the channel
/// slot fixed to the trigger sink channel and header type marking it as
/// trigger-origin. Profiles that do not carry a board id fall back to the
/// fixed trigger board.
pub fn reframe(fields: &TriggerFields) -> ReframedTrigger {
    let board = if fields.board != 0 {
        fields.board & BOARD_ID_MASK
    } else {
        TRIG_SINK_BOARD
    };
    let header = DigitizerHeader {
        channel: TRIG_SINK_CHANNEL,
        board,
        length_words: (REFRAMED_TRIG_WORDS - 1) as u32,
        timestamp: fields.timestamp(),
        header_type: TRIG_HEADER_TYPE,
        event_type: 0x7,
    };
    let hdr_words = header.to_words();
    let words = [
        DIG_SOE,
        hdr_words[0],
        hdr_words[1],
        hdr_words[2],
        (fields.coarse_ts as u32) | ((fields.trigger_type as u32) << 16),
        (fields.offsets[0] as u32) | ((fields.offsets[1] as u32) << 16),
        (fields.offsets[2] as u32) | ((fields.offsets[3] as u32) << 16),
        (fields.user_register as u32) | ((fields.wheel as u32) << 16),
        (fields.vernier_ab as u32) | ((fields.vernier_cd as u32) << 16),
        (fields.multiplicity as u32) | ((fields.trigger_bits as u32) << 16),
    ];
    ReframedTrigger { header, words }
}

/// Render the decoded fields as the ASCII diagnostic block written next to
/// trigger output files when diagnostics are enabled.
pub fn render_diagnostic(fields: &TriggerFields, reframed: &ReframedTrigger) -> String {
    let mut text = String::new();
    for word in reframed.words.iter() {
        let _ = writeln!(text, "{word:08X}");
    }
    let _ = writeln!(text, "trigger_type: {:08X}", fields.trigger_type);
    let _ = writeln!(text, "board_id: {:08X}", fields.board);
    let _ = writeln!(text, "timestamp_lower: {:08X}", fields.ts_lower);
    let _ = writeln!(text, "timestamp_middle: {:08X}", fields.ts_middle);
    let _ = writeln!(text, "timestamp_upper: {:08X}", fields.ts_upper);
    let _ = writeln!(text, "wheel: {:08X}", fields.wheel);
    let _ = writeln!(text, "multiplicity: {:08X}", fields.multiplicity);
    let _ = writeln!(text, "user_register: {:08X}", fields.user_register);
    let _ = writeln!(text, "coarse_ts: {:08X}", fields.coarse_ts);
    let _ = writeln!(text, "trigger_bits: {:08X}", fields.trigger_bits);
    for (i, offset) in fields.offsets.iter().enumerate() {
        let _ = writeln!(text, "offset[{i}]: {offset:08X}");
    }
    let _ = writeln!(text, "vernier_ab: {:08X}", fields.vernier_ab);
    let _ = writeln!(text, "vernier_cd: {:08X}", fields.vernier_cd);
    text
}
