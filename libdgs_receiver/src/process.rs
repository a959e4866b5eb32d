//! The receive loop: the only component holding overall control flow.
//!
//! One iteration asks the session for a raw buffer, scans it record by
//! record, and hands each record to the sink layer. The scan position only
//! ever advances by a length that was validated against the remaining buffer
//! before any field of the record was trusted; when that is impossible the
//! rest of the buffer is abandoned to the diagnostic dump, because a record
//! whose length cannot be determined poisons everything after it.
//!
//! Network and protocol faults are never fatal: the session is discarded and
//! retried under exponential backoff. File faults are always fatal: a
//! partial or ambiguous file of detector data is worse than no file.

use byteorder::{ByteOrder, NetworkEndian};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::config::Config;
use super::constants::*;
use super::error::{ReceiverError, SessionError, SinkError};
use super::frame::{self, Record, WordClass};
use super::session::{Backoff, ServerSession};
use super::sink::{SinkKey, SinkManager};
use super::stats::ThroughputStats;
use super::trigger;

/// How a buffer scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOutcome {
    /// Every byte was consumed.
    Completed,
    /// A run-done marker closed the last open sink; the run is over.
    RunDone,
    /// A framing fault or unrecognized data forced the rest of the buffer
    /// to be discarded.
    Abandoned,
    /// Single-shot mode and the chunk limit was reached.
    ChunkFull,
}

/// Run the receiver until the run completes, the `running` flag is cleared,
/// or a fatal file fault forces a stop. On every exit path all sinks are
/// closed and marked read-only before returning.
pub fn run(config: &Config, running: Arc<AtomicBool>) -> Result<(), ReceiverError> {
    let mut session = ServerSession::new(config.server_endpoint());
    let mut sinks = SinkManager::new(config)?;
    let mut stats = ThroughputStats::new(std::time::Duration::from_secs(
        config.summary_interval_secs,
    ));
    let mut backoff = Backoff::new();

    spdlog::info!(
        "Receiving from {} into {}",
        config.server_endpoint(),
        config.run_directory().to_string_lossy()
    );

    loop {
        if !running.load(Ordering::SeqCst) {
            spdlog::warn!("Interrupt received; forcing stop");
            return finish(&mut sinks, &stats, &session, Ok(()));
        }

        match session.fetch() {
            Ok(buffer) => {
                backoff.succeed();
                let outcome = match write_events(buffer, config, &mut sinks, &mut stats) {
                    Ok(outcome) => outcome,
                    Err(fault) => {
                        spdlog::error!("FILE WRITE ERROR: {fault}");
                        return finish(&mut sinks, &stats, &session, Err(fault.into()));
                    }
                };
                match outcome {
                    ScanOutcome::RunDone => {
                        spdlog::info!("All boards reported run done; stopping");
                        return finish(&mut sinks, &stats, &session, Ok(()));
                    }
                    ScanOutcome::ChunkFull => {
                        spdlog::info!("Single-shot file size limit reached; stopping");
                        return finish(&mut sinks, &stats, &session, Ok(()));
                    }
                    ScanOutcome::Completed | ScanOutcome::Abandoned => {}
                }
                if stats.due() {
                    stats.summarize(&sinks.open_keys());
                }
            }
            Err(SessionError::NoDataYet) => {
                std::thread::sleep(backoff.delay());
                if backoff.at_ceiling() && stats.due() {
                    stats.summarize(&sinks.open_keys());
                }
            }
            Err(_) => {
                // Connection problems of any flavor: back off and retry.
                std::thread::sleep(backoff.delay());
                if backoff.at_ceiling() && stats.due() {
                    if session.has_connected() {
                        stats.summarize(&sinks.open_keys());
                    } else {
                        spdlog::info!("waiting for connection...");
                        stats.touch();
                    }
                }
            }
        }
    }
}

/// Close everything, report, and pass `result` through. Shared by the
/// orderly end-of-run, interrupt, and fatal-fault exits; the sink close is
/// idempotent so overlapping stop requests are harmless.
fn finish(
    sinks: &mut SinkManager,
    stats: &ThroughputStats,
    session: &ServerSession,
    result: Result<(), ReceiverError>,
) -> Result<(), ReceiverError> {
    match sinks.shutdown() {
        Ok(()) => {}
        Err(close_fault) => {
            spdlog::error!("Fault while closing sinks: {close_fault}");
            if result.is_ok() {
                stats.final_summary(session.counters());
                return Err(close_fault.into());
            }
        }
    }
    stats.final_summary(session.counters());
    result
}

/// Scan one raw buffer, dispatching every record it holds.
fn write_events(
    buffer: &[u8],
    config: &Config,
    sinks: &mut SinkManager,
    stats: &mut ThroughputStats,
) -> Result<ScanOutcome, SinkError> {
    let mut offset = 0usize;

    while offset + SIZE_UNIT <= buffer.len() {
        let word = NetworkEndian::read_u32(&buffer[offset..]);
        match frame::classify(word) {
            WordClass::Digitizer => match frame::decode_digitizer(buffer, offset) {
                Ok(Record::Digitizer(rec)) => {
                    // A type-F header belongs on a control channel. One on
                    // an ordinary channel is a hardware fault; either way
                    // the record carries no trace data worth keeping.
                    if rec.header.header_type == 0xF {
                        if !config.filter_fifo_headers {
                            spdlog::error!(
                                "Type F header reported on channel {} of board {}",
                                rec.header.channel,
                                rec.header.board
                            );
                        }
                        offset += rec.consumed;
                        continue;
                    }

                    let key = SinkKey::for_mode(
                        config.output_mode,
                        rec.header.board,
                        rec.header.channel,
                        false,
                    );
                    let incoming = sinks.write_size(rec.body.len());
                    if sinks.should_rotate(incoming) {
                        if config.single_shot {
                            return Ok(ScanOutcome::ChunkFull);
                        }
                        sinks.rotate_all()?;
                    }
                    let written = sinks.write(key, rec.header.timestamp, rec.body, None)?;
                    stats.add_bytes(written);
                    offset += rec.consumed;
                }
                Ok(Record::Control(ctl)) => {
                    match ctl.marker {
                        MARKER_RUN_DONE => {
                            let any_open = sinks.close_board(ctl.board)?;
                            if !any_open {
                                return Ok(ScanOutcome::RunDone);
                            }
                        }
                        MARKER_EMPTY => {
                            spdlog::trace!("Heartbeat from board {}", ctl.board);
                        }
                        MARKER_FIFO => {
                            let detail = match ctl.event_type {
                                1 => " - overflow",
                                2 => " - underflow",
                                _ => "",
                            };
                            spdlog::warn!("FIFO fault on board {}{detail}", ctl.board);
                        }
                        other => {
                            spdlog::warn!(
                                "Unknown control marker {other:X} from board {}",
                                ctl.board
                            );
                        }
                    }
                    offset += CONTROL_RECORD_WORDS * SIZE_UNIT;
                }
                Err(fault) => {
                    spdlog::error!("{fault}; abandoning remainder of buffer");
                    if config.diagnostics_enabled {
                        sinks.dump_unrecognized(&buffer[offset..])?;
                    }
                    return Ok(ScanOutcome::Abandoned);
                }
            },
            WordClass::Trigger => {
                match trigger::decode_trigger(buffer, offset, config.trigger_profile) {
                    Ok((fields, consumed)) => {
                        let reframed = trigger::reframe(&fields);
                        let key = SinkKey::for_mode(
                            config.output_mode,
                            reframed.header.board,
                            reframed.header.channel,
                            true,
                        );
                        let body = reframed.body_bytes();
                        let incoming = sinks.write_size(body.len());
                        if sinks.should_rotate(incoming) {
                            if config.single_shot {
                                return Ok(ScanOutcome::ChunkFull);
                            }
                            sinks.rotate_all()?;
                        }
                        let diag_text = if config.diagnostics_enabled {
                            Some(trigger::render_diagnostic(&fields, &reframed))
                        } else {
                            None
                        };
                        let written = sinks.write(
                            key,
                            reframed.header.timestamp,
                            &body,
                            diag_text.as_deref(),
                        )?;
                        stats.add_bytes(written);
                        offset += consumed;
                    }
                    Err(fault) => {
                        spdlog::error!("{fault}; abandoning remainder of buffer");
                        if config.diagnostics_enabled {
                            sinks.dump_unrecognized(&buffer[offset..])?;
                        }
                        return Ok(ScanOutcome::Abandoned);
                    }
                }
            }
            WordClass::Unrecognized => {
                spdlog::error!(
                    "event started with {word:#010X} instead of 0xAAAAxxxx at byte offset {offset}"
                );
                if config.diagnostics_enabled {
                    sinks.dump_unrecognized(&buffer[offset..])?;
                } else {
                    spdlog::warn!("skipping remainder of data block");
                }
                return Ok(ScanOutcome::Abandoned);
            }
        }
    }

    if offset < buffer.len() {
        spdlog::warn!("data block has {} extra bytes", buffer.len() - offset);
    }
    Ok(ScanOutcome::Completed)
}
