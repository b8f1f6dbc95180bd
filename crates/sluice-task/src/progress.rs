//! Row/byte rates, stall detection, and process stats.

use std::time::Instant;

use bytesize::ByteSize;

use crate::task::TaskExecution;

/// Window sample for delta-based rates.
pub(crate) struct RateSample {
    pub prev_rows: u64,
    pub prev_bytes: u64,
    pub last_increment: Instant,
}

impl Default for RateSample {
    fn default() -> RateSample {
        RateSample { prev_rows: 0, prev_bytes: 0, last_increment: Instant::now() }
    }
}

/// Process stats snapshot taken as a baseline at task start.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcStats {
    pub rss_bytes: u64,
}

#[cfg(target_os = "linux")]
pub(crate) fn read_proc_stats() -> ProcStats {
    let rss_bytes = std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().nth(1)?.parse::<u64>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0);
    ProcStats { rss_bytes }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn read_proc_stats() -> ProcStats {
    ProcStats::default()
}

impl TaskExecution {
    /// Rows processed so far.
    pub fn get_count(&self) -> u64 {
        if self.start_time.is_none() {
            return 0;
        }
        self.state().counters().0
    }

    /// (in_bytes, out_bytes) processed so far.
    pub fn get_bytes(&self) -> (u64, u64) {
        let (_, in_bytes, out_bytes) = self.state().counters();
        (in_bytes, out_bytes)
    }

    pub fn get_bytes_string(&self) -> String {
        let (in_bytes, _) = self.get_bytes();
        if in_bytes == 0 {
            return String::new();
        }
        ByteSize(in_bytes).to_string()
    }

    /// Rows/sec and bytes/sec. A window of 0 measures since start;
    /// otherwise the delta from the previous sample over the window.
    /// Positive deltas bump the stall clock.
    pub fn get_rate(&self, sec_window: u64) -> (u64, u64) {
        let count = self.get_count();
        let (bytes, _) = self.get_bytes();
        let Some(start) = self.start_time else {
            return (0, 0);
        };
        match self.end_time {
            None if sec_window == 0 => {
                let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
                (
                    (count as f64 / elapsed).round() as u64,
                    (bytes as f64 / elapsed).round() as u64,
                )
            }
            None => {
                let state = self.state();
                let mut sample = state.rate.lock().expect("rate poisoned");
                let row_rate = count.saturating_sub(sample.prev_rows) / sec_window;
                let byte_rate = bytes.saturating_sub(sample.prev_bytes) / sec_window;
                if sample.prev_rows < count {
                    sample.last_increment = Instant::now();
                }
                sample.prev_rows = count;
                sample.prev_bytes = bytes;
                (row_rate, byte_rate)
            }
            Some(end) => {
                let elapsed = (end - start).as_secs_f64().max(f64::EPSILON);
                (
                    (count as f64 / elapsed).round() as u64,
                    (bytes as f64 / elapsed).round() as u64,
                )
            }
        }
    }

    /// No row progress for `window` seconds. Pre/post-SQL phases
    /// legitimately stall row counters and do not count.
    pub fn is_stalled(&self, window: f64) -> bool {
        let progress = self.progress();
        if progress.contains("pre-sql") || progress.contains("post-sql") {
            return false;
        }
        let state = self.state();
        let sample = state.rate.lock().expect("rate poisoned");
        sample.last_increment.elapsed().as_secs_f64() > window
    }
}

/// Whole-run rate string for progress lines.
pub(crate) fn rate_str(count: u64, since: Instant) -> String {
    let elapsed = since.elapsed().as_secs_f64().max(f64::EPSILON);
    format!("{}", (count as f64 / elapsed).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_str_rounds() {
        let t = Instant::now() - std::time::Duration::from_secs(2);
        assert_eq!(rate_str(10, t), "5");
    }
}
