use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;

#[derive(Debug, Clone, Error)]
pub enum FrameError {
    #[error("Digitizer header truncated at byte offset {0}; only {1} bytes remain")]
    HeaderTruncated(usize, usize),
    #[error("Record length {length} words at byte offset {offset} is below the minimum of {min}", min = DIG_MIN_LENGTH_WORDS)]
    RecordTooShort { offset: usize, length: u32 },
    #[error("Record of {length} words at byte offset {offset} runs past the end of the buffer")]
    PayloadTruncated { offset: usize, length: u32 },
    #[error("Expected marker after {length} words at byte offset {offset}; found {found:#010X}")]
    FramingMismatch {
        offset: usize,
        length: u32,
        found: u32,
    },
}

#[derive(Debug, Clone, Error)]
pub enum TriggerError {
    #[error("Trigger record truncated at byte offset {0}; {1} bytes remain, {need} required", need = TRIG_RECORD_WORDS * SIZE_UNIT)]
    Truncated(usize, usize),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Server has insufficient data ready")]
    NoDataYet,
    #[error("Connection to the event server was lost")]
    Disconnected,
    #[error("Illegal reply kind {0} from the event server")]
    UnexpectedReply(i32),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Output file {0:?} already exists; refusing to overwrite detector data")]
    FileExists(PathBuf),
    #[error("Sink failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Receiver failed due to session error: {0}")]
    SessionError(#[from] SessionError),
    #[error("Receiver failed due to sink error: {0}")]
    SinkError(#[from] SinkError),
    #[error("Receiver failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Receiver failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
