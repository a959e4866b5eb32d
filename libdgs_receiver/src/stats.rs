//! Throughput accounting and the periodic summary line.

use std::time::{Duration, Instant};

use super::session::SessionCounters;
use super::sink::SinkKey;

/// Tracks bytes written and renders the recurring status report.
#[derive(Debug)]
pub struct ThroughputStats {
    start: Instant,
    last_summary: Instant,
    interval: Duration,
    total_bytes: u64,
    bytes_at_last_summary: u64,
}

impl ThroughputStats {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_summary: now,
            interval,
            total_bytes: 0,
            bytes_at_last_summary: 0,
        }
    }

    pub fn add_bytes(&mut self, bytes: u64) {
        self.total_bytes += bytes;
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Whether the summary interval has elapsed since the last report.
    pub fn due(&self) -> bool {
        self.last_summary.elapsed() >= self.interval
    }

    /// Log the periodic summary: totals, current and average rate, open
    /// sinks, and runtime.
    pub fn summarize(&mut self, open_sinks: &[SinkKey]) {
        let now = Instant::now();
        let delta_secs = now.duration_since(self.last_summary).as_secs_f64();
        let delta_bytes = (self.total_bytes - self.bytes_at_last_summary) as f64;
        let run_secs = now.duration_since(self.start).as_secs_f64();

        let rate = if delta_secs > 0.0 {
            delta_bytes / delta_secs
        } else {
            0.0
        };
        let avg_rate = if run_secs > 0.0 {
            self.total_bytes as f64 / run_secs
        } else {
            0.0
        };

        let open: Vec<String> = open_sinks
            .iter()
            .map(|key| format!("{}-{:X}", key.board, key.channel))
            .collect();

        spdlog::info!(
            "{}; {}/s; AVG: {}/s; open: [{}]; {}",
            human_bytes::human_bytes(self.total_bytes as f64),
            human_bytes::human_bytes(rate),
            human_bytes::human_bytes(avg_rate),
            open.join(" "),
            runtime_string(run_secs),
        );

        self.bytes_at_last_summary = self.total_bytes;
        self.last_summary = now;
    }

    /// Mark a report as delivered without rendering one. Used to pace the
    /// "waiting for connection" message the same way as the summary.
    pub fn touch(&mut self) {
        self.last_summary = Instant::now();
    }

    /// The closing report, with the session counters folded in.
    pub fn final_summary(&self, counters: &SessionCounters) {
        let run_secs = self.start.elapsed().as_secs_f64();
        spdlog::info!("last statistics:");
        spdlog::info!(
            "{} written; {}",
            human_bytes::human_bytes(self.total_bytes as f64),
            runtime_string(run_secs),
        );
        spdlog::info!(
            "Packets received, sent, diff, seqerrs, bytesrec = {} {} {} {} {}",
            counters.packets_received,
            counters.packets_sent,
            counters.packets_received as i64 - counters.packets_sent as i64,
            counters.seq_errors,
            counters.bytes_received,
        );
    }
}

fn runtime_string(run_secs: f64) -> String {
    let hours = (run_secs / 3600.0) as u64;
    let minutes = (run_secs - hours as f64 * 3600.0) / 60.0;
    format!("runtime: {hours}h {minutes:4.2}m")
}
