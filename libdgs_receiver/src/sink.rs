//! Output sinks: one growing file per routing key, rotated in lockstep.
//!
//! Every open descriptor here is a scarce resource the manager alone owns.
//! Files are only usable downstream once they have been closed and marked
//! read-only, so every exit path (rotation, board close, forced stop, fatal
//! write error) funnels through the same close routine. All sinks rotate
//! together so that each chunk index covers the same wall-clock span on
//! every channel; the offline merge depends on that.

use fxhash::FxHashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use time::OffsetDateTime;

use super::config::{Config, OutputMode};
use super::constants::*;
use super::error::SinkError;
use super::frame::GebHeader;

/// Routing key for one output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SinkKey {
    pub board: u16,
    pub channel: u8,
    /// Trigger-origin records get their own files alongside the channel data.
    pub trigger: bool,
}

impl SinkKey {
    /// Collapse a record's identity to the granularity of the output mode.
    pub fn for_mode(mode: OutputMode, board: u16, channel: u8, trigger: bool) -> Self {
        match mode {
            OutputMode::PerChannel => Self {
                board,
                channel,
                trigger,
            },
            OutputMode::PerBoard => Self {
                board,
                channel: 0,
                trigger,
            },
            OutputMode::Single => Self {
                board: 0,
                channel: 0,
                trigger,
            },
        }
    }
}

#[derive(Debug)]
struct Sink {
    writer: BufWriter<File>,
    path: PathBuf,
    bytes_written: u64,
    /// ASCII twin for trigger sinks when diagnostics are on.
    diag: Option<(BufWriter<File>, PathBuf)>,
}

/// Owns the table of open output files and the chunk-rotation policy.
#[derive(Debug)]
pub struct SinkManager {
    sinks: FxHashMap<SinkKey, Sink>,
    chunk: u32,
    mode: OutputMode,
    run_dir: PathBuf,
    run_name: String,
    max_chunk_bytes: u64,
    geb_enabled: bool,
    geb_type: i32,
    diagnostics: bool,
    largest_file_bytes: u64,
    total_bytes: u64,
}

impl SinkManager {
    /// Create the manager and the run directory it writes into.
    pub fn new(config: &Config) -> Result<Self, SinkError> {
        let run_dir = config.run_directory();
        std::fs::create_dir_all(&run_dir)?;
        Ok(Self {
            sinks: FxHashMap::default(),
            chunk: 0,
            mode: config.output_mode,
            run_dir,
            run_name: config.run_name.clone(),
            max_chunk_bytes: config.max_chunk_bytes,
            geb_enabled: config.geb_header_enabled,
            geb_type: config.geb_type,
            diagnostics: config.diagnostics_enabled,
            largest_file_bytes: 0,
            total_bytes: 0,
        })
    }

    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn open_count(&self) -> usize {
        self.sinks.len()
    }

    /// Open sink keys, sorted, for the periodic summary line.
    pub fn open_keys(&self) -> Vec<SinkKey> {
        let mut keys: Vec<SinkKey> = self.sinks.keys().copied().collect();
        keys.sort();
        keys
    }

    fn file_name(&self, key: &SinkKey) -> String {
        let suffix = if key.trigger { "_trig" } else { "" };
        match self.mode {
            OutputMode::PerChannel => format!(
                "{}_{:03}_{:04}_{:01X}{}",
                self.run_name, self.chunk, key.board, key.channel, suffix
            ),
            OutputMode::PerBoard => format!(
                "{}_{:03}_{:04}{}",
                self.run_name, self.chunk, key.board, suffix
            ),
            OutputMode::Single => format!("{}_{:03}{}", self.run_name, self.chunk, suffix),
        }
    }

    /// Create the file for `key`. An already-existing file of the same name
    /// is fatal; overwriting detector data silently is never acceptable.
    fn open_sink(&mut self, key: SinkKey) -> Result<(), SinkError> {
        let path = self.run_dir.join(self.file_name(&key));
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                spdlog::error!(
                    "Output file {path:?} already exists; delete it first if you want to overwrite"
                );
                return Err(SinkError::FileExists(path));
            }
            Err(e) => return Err(SinkError::IOError(e)),
        };

        let diag = if key.trigger && self.diagnostics {
            let diag_path = self.run_dir.join(format!("{}.diag", self.file_name(&key)));
            let diag_file = match OpenOptions::new().write(true).create_new(true).open(&diag_path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(SinkError::FileExists(diag_path));
                }
                Err(e) => return Err(SinkError::IOError(e)),
            };
            Some((BufWriter::with_capacity(FILE_BUF_BYTES, diag_file), diag_path))
        } else {
            None
        };

        spdlog::info!("Opened new file {}", path.to_string_lossy());
        self.sinks.insert(
            key,
            Sink {
                writer: BufWriter::with_capacity(FILE_BUF_BYTES, file),
                path,
                bytes_written: 0,
                diag,
            },
        );
        Ok(())
    }

    /// Bytes one record write will add to its file, prefix included.
    pub fn write_size(&self, body_len: usize) -> u64 {
        let prefix = if self.geb_enabled {
            GEB_HEADER_BYTES
        } else {
            SIZE_UNIT
        };
        (body_len + prefix) as u64
    }

    /// True when the largest file plus the incoming write would overrun the
    /// chunk limit.
    pub fn should_rotate(&self, incoming_bytes: u64) -> bool {
        self.largest_file_bytes + incoming_bytes > self.max_chunk_bytes
    }

    /// Write one record body to the sink for `key`, opening it lazily. The
    /// body is prefixed with a GEB header carrying `timestamp`, or with the
    /// raw record marker when GEB output is off. Returns the bytes written.
    pub fn write(
        &mut self,
        key: SinkKey,
        timestamp: u64,
        body: &[u8],
        diag_text: Option<&str>,
    ) -> Result<u64, SinkError> {
        if !self.sinks.contains_key(&key) {
            self.open_sink(key)?;
        }
        let geb_enabled = self.geb_enabled;
        let geb_type = self.geb_type;
        let sink = self
            .sinks
            .get_mut(&key)
            .expect("sink opened on the line above");

        if geb_enabled {
            let geb = GebHeader::new(geb_type, body.len() as i32, timestamp);
            sink.writer.write_all(&geb.to_bytes())?;
            sink.bytes_written += GEB_HEADER_BYTES as u64;
        } else {
            sink.writer.write_all(&DIG_SOE.to_be_bytes())?;
            sink.bytes_written += SIZE_UNIT as u64;
        }
        sink.writer.write_all(body)?;
        sink.bytes_written += body.len() as u64;

        if let (Some((diag_writer, _)), Some(text)) = (sink.diag.as_mut(), diag_text) {
            diag_writer.write_all(text.as_bytes())?;
        }
        let bytes_in_file = sink.bytes_written;

        if bytes_in_file > self.largest_file_bytes {
            self.largest_file_bytes = bytes_in_file;
        }
        let written = self.write_size(body.len());
        self.total_bytes += written;
        Ok(written)
    }

    /// Flush, close, and mark one sink's files read-only.
    fn close_sink(mut sink: Sink) -> Result<(), SinkError> {
        sink.writer.flush()?;
        drop(sink.writer);
        set_readonly(&sink.path)?;
        spdlog::info!("{} is now readonly", sink.path.to_string_lossy());
        if let Some((mut diag_writer, diag_path)) = sink.diag {
            diag_writer.flush()?;
            drop(diag_writer);
            set_readonly(&diag_path)?;
        }
        Ok(())
    }

    /// Close every open sink at once and advance to the next chunk. Rotation
    /// is all-or-nothing so all channels share the chunk boundary.
    pub fn rotate_all(&mut self) -> Result<(), SinkError> {
        spdlog::info!(
            "file size reached {} of {} limit",
            human_bytes::human_bytes(self.largest_file_bytes as f64),
            human_bytes::human_bytes(self.max_chunk_bytes as f64),
        );
        for (_, sink) in self.sinks.drain() {
            Self::close_sink(sink)?;
        }
        self.largest_file_bytes = 0;
        self.chunk += 1;
        spdlog::info!("Starting new data chunk: #{:03}", self.chunk);
        Ok(())
    }

    /// Close every sink belonging to `board` (in single-file mode there is
    /// only the one stream, which belongs to everyone). Returns true while
    /// any sink anywhere remains open.
    pub fn close_board(&mut self, board: u16) -> Result<bool, SinkError> {
        spdlog::info!(
            "End of data packet received for board #{board} at {}",
            OffsetDateTime::now_utc()
        );
        let keys: Vec<SinkKey> = self
            .sinks
            .keys()
            .filter(|key| key.board == board || self.mode == OutputMode::Single)
            .copied()
            .collect();
        for key in keys {
            if let Some(sink) = self.sinks.remove(&key) {
                spdlog::info!("close board file {}-{:X}", key.board, key.channel);
                Self::close_sink(sink)?;
            }
        }
        Ok(!self.sinks.is_empty())
    }

    /// Append raw bytes the decoder could not classify to the dump file.
    /// Opened and closed per call; unknown data is rare and must survive a
    /// crash that follows it.
    pub fn dump_unrecognized(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        let path = self.run_dir.join(format!("{}_dump_DATA", self.run_name));
        let mut file = OpenOptions::new().append(true).create(true).open(&path)?;
        file.write_all(bytes)?;
        spdlog::info!(
            "Dumped {} of unrecognized data to {}",
            human_bytes::human_bytes(bytes.len() as f64),
            path.to_string_lossy()
        );
        Ok(())
    }

    /// Close every open sink and mark the files read-only. Safe to call any
    /// number of times; with nothing open it does nothing.
    pub fn shutdown(&mut self) -> Result<(), SinkError> {
        if self.sinks.is_empty() {
            return Ok(());
        }
        spdlog::info!("Closing all files at {}", OffsetDateTime::now_utc());
        for (key, sink) in self.sinks.drain() {
            spdlog::info!("close board file {}-{:X}", key.board, key.channel);
            Self::close_sink(sink)?;
        }
        self.largest_file_bytes = 0;
        Ok(())
    }
}

fn set_readonly(path: &PathBuf) -> Result<(), SinkError> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    std::fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.run_name = String::from("data_run_001");
        config.output_path = dir.to_path_buf();
        config.folder_per_run = false;
        config.geb_header_enabled = true;
        config.geb_type = 14;
        config
    }

    fn key(board: u16, channel: u8) -> SinkKey {
        SinkKey {
            board,
            channel,
            trigger: false,
        }
    }

    #[test]
    fn test_lazy_open_and_naming() {
        let dir = tempfile::tempdir().unwrap();
        let mut sinks = SinkManager::new(&test_config(dir.path())).unwrap();
        assert_eq!(sinks.open_count(), 0);

        sinks.write(key(0x123, 0x3), 0xABCD, &[0u8; 20], None).unwrap();
        assert_eq!(sinks.open_count(), 1);
        assert!(dir.path().join("data_run_001_000_0291_3").exists());
    }

    #[test]
    fn test_geb_prefix_then_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut sinks = SinkManager::new(&test_config(dir.path())).unwrap();
        let written = sinks
            .write(key(1, 0), 0x1234_5678_9ABC, &[0x55u8; 20], None)
            .unwrap();
        assert_eq!(written, 36);
        sinks.shutdown().unwrap();

        let bytes = std::fs::read(dir.path().join("data_run_001_000_0001_0")).unwrap();
        assert_eq!(bytes.len(), 36);
        let geb = GebHeader::new(14, 20, 0x1234_5678_9ABC);
        assert_eq!(&bytes[..16], &geb.to_bytes());
        assert_eq!(&bytes[16..], &[0x55u8; 20]);
    }

    #[test]
    fn test_raw_mode_writes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.geb_header_enabled = false;
        let mut sinks = SinkManager::new(&config).unwrap();
        let written = sinks.write(key(1, 0), 0, &[0x55u8; 20], None).unwrap();
        assert_eq!(written, 24);
        sinks.shutdown().unwrap();

        let bytes = std::fs::read(dir.path().join("data_run_001_000_0001_0")).unwrap();
        assert_eq!(&bytes[..4], &DIG_SOE.to_be_bytes());
        assert_eq!(bytes.len(), 24);
    }

    #[test]
    fn test_refuse_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data_run_001_000_0001_0"), b"precious").unwrap();
        let mut sinks = SinkManager::new(&test_config(dir.path())).unwrap();
        assert!(matches!(
            sinks.write(key(1, 0), 0, &[0u8; 4], None),
            Err(SinkError::FileExists(_))
        ));
        // The pre-existing data must be untouched.
        let bytes = std::fs::read(dir.path().join("data_run_001_000_0001_0")).unwrap();
        assert_eq!(&bytes, b"precious");
    }

    #[test]
    fn test_rotation_is_atomic() {
        // Sinks are open for boards 3 and 9; the next write would
        // overrun the chunk limit, so both rotate together.
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_chunk_bytes = 100;
        let mut sinks = SinkManager::new(&config).unwrap();

        sinks.write(key(3, 0), 0, &[0u8; 40], None).unwrap();
        sinks.write(key(9, 0), 0, &[0u8; 12], None).unwrap();
        assert!(!sinks.should_rotate(sinks.write_size(12)));
        assert!(sinks.should_rotate(sinks.write_size(40)));

        sinks.rotate_all().unwrap();
        assert_eq!(sinks.open_count(), 0);
        assert_eq!(sinks.chunk(), 1);

        // Both chunk-0 files are closed and read-only.
        for name in ["data_run_001_000_0003_0", "data_run_001_000_0009_0"] {
            let meta = std::fs::metadata(dir.path().join(name)).unwrap();
            assert!(meta.permissions().readonly());
        }

        // The next write lands in chunk 1, whichever board arrives first.
        sinks.write(key(9, 0), 0, &[0u8; 12], None).unwrap();
        assert!(dir.path().join("data_run_001_001_0009_0").exists());
    }

    #[test]
    fn test_close_board_then_empty() {
        // Board 7 has two open channel files and no other board
        // has any; a run-done for board 7 closes both, and nothing remains.
        let dir = tempfile::tempdir().unwrap();
        let mut sinks = SinkManager::new(&test_config(dir.path())).unwrap();
        sinks.write(key(7, 0), 0, &[0u8; 8], None).unwrap();
        sinks.write(key(7, 1), 0, &[0u8; 8], None).unwrap();

        let any_open = sinks.close_board(7).unwrap();
        assert!(!any_open);
        assert_eq!(sinks.open_count(), 0);
        for name in ["data_run_001_000_0007_0", "data_run_001_000_0007_1"] {
            let meta = std::fs::metadata(dir.path().join(name)).unwrap();
            assert!(meta.permissions().readonly());
        }
    }

    #[test]
    fn test_close_board_leaves_others_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut sinks = SinkManager::new(&test_config(dir.path())).unwrap();
        sinks.write(key(7, 0), 0, &[0u8; 8], None).unwrap();
        sinks.write(key(8, 0), 0, &[0u8; 8], None).unwrap();

        let any_open = sinks.close_board(7).unwrap();
        assert!(any_open);
        assert_eq!(sinks.open_keys(), vec![key(8, 0)]);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut sinks = SinkManager::new(&test_config(dir.path())).unwrap();
        sinks.write(key(1, 0), 0, &[0u8; 8], None).unwrap();
        sinks.shutdown().unwrap();
        assert_eq!(sinks.open_count(), 0);
        // Second shutdown has nothing to close and must not fail trying to
        // re-mark read-only files.
        sinks.shutdown().unwrap();
    }

    #[test]
    fn test_output_modes_route_differently() {
        let record = |mode| SinkKey::for_mode(mode, 0x123, 0x4, false);
        assert_eq!(record(OutputMode::PerChannel), key(0x123, 0x4));
        assert_eq!(record(OutputMode::PerBoard), key(0x123, 0));
        assert_eq!(record(OutputMode::Single), key(0, 0));

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.output_mode = OutputMode::PerBoard;
        let mut sinks = SinkManager::new(&config).unwrap();
        sinks
            .write(record(OutputMode::PerBoard), 0, &[0u8; 8], None)
            .unwrap();
        assert!(dir.path().join("data_run_001_000_0291").exists());

        let mut config = test_config(dir.path());
        config.output_mode = OutputMode::Single;
        let mut single = SinkManager::new(&config).unwrap();
        single
            .write(record(OutputMode::Single), 0, &[0u8; 8], None)
            .unwrap();
        assert!(dir.path().join("data_run_001_000").exists());
    }

    #[test]
    fn test_single_mode_close_board_closes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.output_mode = OutputMode::Single;
        let mut sinks = SinkManager::new(&config).unwrap();
        sinks
            .write(SinkKey::for_mode(OutputMode::Single, 5, 1, false), 0, &[0u8; 8], None)
            .unwrap();
        let any_open = sinks.close_board(5).unwrap();
        assert!(!any_open);
    }

    #[test]
    fn test_trigger_sink_with_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.diagnostics_enabled = true;
        let mut sinks = SinkManager::new(&config).unwrap();
        let trig_key = SinkKey {
            board: 99,
            channel: 0,
            trigger: true,
        };
        sinks
            .write(trig_key, 0, &[0u8; 36], Some("trigger_type: 000000C8\n"))
            .unwrap();
        sinks.shutdown().unwrap();

        assert!(dir.path().join("data_run_001_000_0099_0_trig").exists());
        let diag =
            std::fs::read_to_string(dir.path().join("data_run_001_000_0099_0_trig.diag")).unwrap();
        assert!(diag.contains("trigger_type"));
    }

    #[test]
    fn test_dump_unrecognized_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut sinks = SinkManager::new(&test_config(dir.path())).unwrap();
        sinks.dump_unrecognized(&[1, 2, 3]).unwrap();
        sinks.dump_unrecognized(&[4, 5]).unwrap();
        let bytes = std::fs::read(dir.path().join("data_run_001_dump_DATA")).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4, 5]);
    }
}
