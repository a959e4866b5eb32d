//! Wire constants shared across the codec, session, and sink layers.
//!
//! Values mirror the original C receiver (`examples/original_source/`):
//! markers and masks from `dgsReceiver.h`/`dgsReceiver_Ryan.cpp`, reply kinds
//! and the request word from `psNet.h`, control markers from
//! `tcp_Receiver.cpp`, and the buffer/backoff sizes from the original build
//! parameters.

/// Bytes per 32-bit wire word.
pub const SIZE_UNIT: usize = 4;

/// Digitizer start-of-event marker (`EVENT_MARKER`/`DIG_SOE`, `0xAAAAAAAA`).
pub const DIG_SOE: u32 = 0xAAAA_AAAA;

/// Smallest digitizer record that still carries a full header, in words
/// (`DIG_MIN_HEADER_LENGTH_UINT32`).
pub const DIG_MIN_LENGTH_WORDS: u32 = 3;

/// Trigger start-of-event marker; its low half carries the trigger type
/// (`TRIG_SOE`, `0xAAAA0000`).
pub const TRIG_SOE: u32 = 0xAAAA_0000;

/// Mask selecting the trigger marker's fixed high half (`TRIG_SOE_MASK`).
pub const TRIG_SOE_MASK: u32 = 0xFFFF_0000;

/// Fixed length of a raw trigger record, in words
/// (`TRIG_MIN_HEADER_LENGTH_UINT32`).
pub const TRIG_RECORD_WORDS: usize = 16;

/// Length of the synthetic digitizer-shaped record a trigger is reframed
/// into, marker word included.
pub const REFRAMED_TRIG_WORDS: usize = 10;

/// 12-bit board id mask (`DIG_BOARD_ID_MASK`, `0xFFF`).
pub const BOARD_ID_MASK: u16 = 0xFFF;

/// A control record delivered in digitizer framing is a fixed four words
/// (marker plus three header words; "Type F data is always 4 words").
pub const CONTROL_RECORD_WORDS: usize = 4;

/// Size of the GEB header prefix (`struct gebData`: i32 + i32 + u64).
pub const GEB_HEADER_BYTES: usize = 16;

/// Size of a server reply header (`evtServerRetStruct`: four i32 fields).
pub const REPLY_HEADER_BYTES: usize = 16;

/// The single request word the client sends (`CLIENT_REQUEST_EVENTS`).
pub const CLIENT_REQUEST_EVENTS: u32 = 1;

/// Reply kind: a summary header precedes a pool of event bytes
/// (`SERVER_SUMMARY`).
pub const SERVER_SUMMARY: i32 = 4;

/// Reply kind: the server's sender is off; close the connection
/// (`SERVER_SENDER_OFF`).
pub const SERVER_SENDER_OFF: i32 = 3;

/// Reply kind: not enough data ready yet (`INSUFF_DATA`).
pub const INSUFF_DATA: i32 = 5;

/// Control marker (channel nibble) for run-done (`0xD`, "Run is done").
pub const MARKER_RUN_DONE: u8 = 0xD;

/// Control marker for an empty heartbeat record (`0xE`, "Empty").
pub const MARKER_EMPTY: u8 = 0xE;

/// Control marker for a FIFO fault record (`0xF`, "FIFO issue").
pub const MARKER_FIFO: u8 = 0xF;

/// Header type stamped on a reframed trigger record so the sink layer routes
/// it as trigger-origin data.
pub const TRIG_HEADER_TYPE: u8 = 0xE;

/// Board id used for a reframed trigger when the profile carries none on the
/// wire (the original's hardcoded fallback board).
pub const TRIG_SINK_BOARD: u16 = 99;

/// Channel slot used for reframed trigger records.
pub const TRIG_SINK_CHANNEL: u8 = 0;

/// Kernel socket buffer size requested for SO_RCVBUF/SO_SNDBUF
/// (`INBUFSIZE`, 64 KiB).
pub const SOCKET_BUF_BYTES: usize = 64 * 1024;

/// Initial polling backoff, in microseconds (original `ns = 1`).
pub const BACKOFF_START_US: u64 = 1;

/// Ceiling for the polling backoff, in microseconds (`MAXNS`).
pub const BACKOFF_MAX_US: u64 = 10_000;

/// Output file buffer size (`FILE_BUF_SIZE_KB`, 512 KiB).
pub const FILE_BUF_BYTES: usize = 512 * 1024;
