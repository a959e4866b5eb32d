//! # dgs_receiver
//!
//! dgs_receiver is the data receiver for digital Gammasphere, written in
//! Rust. It connects to the DAQ event server over a stream socket, pulls raw
//! digitizer and trigger records with a small request/reply protocol,
//! recovers record boundaries from the undifferentiated byte stream, and
//! writes each data channel to its own size-rotated output file for the
//! offline merge.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust
//! before you will most likely need to install the Rust tool chain; see the
//! [Rust docs](https://www.rust-lang.org/tools/install) for instructions.
//!
//! To build and install the CLI receiver use
//! `cargo install --path ./dgs_receiver_cli` from the top level repository.
//! The binary lands in your cargo install location (typically
//! `~/.cargo/bin/`) and can be uninstalled with
//! `cargo uninstall dgs_receiver_cli`.
//!
//! ## Configuration
//!
//! The receiver is driven by a YAML configuration file. A template can be
//! generated with the CLI `new` subcommand. The format is as follows:
//!
//! ```yml
//! server_address: 192.168.203.211
//! server_port: 9001
//! run_name: data_run_001
//! output_path: /data
//! folder_per_run: true
//! output_mode: PerChannel
//! geb_header_enabled: true
//! geb_type: 14
//! max_chunk_bytes: 2000000000
//! single_shot: false
//! filter_fifo_headers: false
//! diagnostics_enabled: false
//! trigger_profile: RevA
//! summary_interval_secs: 5
//! ```
//!
//! - `output_mode` selects how records are grouped into files: `PerChannel`
//!   (one file per board/channel pair), `PerBoard`, or `Single`.
//! - `geb_header_enabled` prefixes every payload with the 16-byte GEB
//!   header carrying `geb_type`; when off, the raw record marker is written
//!   instead so files stay self-framing. GEBID 14 is DGS data, 15 is
//!   DGSTRIG data, 16 is DFMA data.
//! - `max_chunk_bytes` bounds the largest file in a chunk. When any file
//!   would overrun the limit, every open file is closed at once and a new
//!   chunk begins, so all channels share the same chunk boundaries. A value
//!   of 2000000000 or less keeps files readable on all operating systems.
//! - `trigger_profile` selects the trigger field layout for the deployment
//!   at hand; two incompatible firmware layouts exist. See
//!   [`trigger::TriggerProfile`].
//!
//! ## Output
//!
//! Output file names follow
//! `<run_name>_<chunk:3 digits>_<board:4 digits>_<channel:1 hex>`, with a
//! `_trig` suffix for trigger-origin records. Closed files are marked
//! read-only; only read-only files should be fed to the offline merge.
//! Unrecognized data is appended to `<run_name>_dump_DATA`, and enabling
//! diagnostics adds a `.diag` ASCII dump of decoded trigger fields next to
//! each trigger file.
//!
//! Use ctrl-c to stop the receiver. It is designed to be stopped either
//! with ctrl-c or by the run-done control record from the IOC, and it will
//! close out any open files cleanly for either scenario.
pub mod config;
pub mod constants;
pub mod error;
pub mod frame;
pub mod process;
pub mod session;
pub mod sink;
pub mod stats;
pub mod trigger;
