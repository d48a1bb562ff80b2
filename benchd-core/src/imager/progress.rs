//! `PROGRESS` line decoding and throughput averaging.
//!
//! The external read/write scripts emit `PROGRESS bytes=<u64> total=<u64>
//! pct=<f64>` lines (extra keys ignored). Throughput is a linear average
//! over a window of the most recent samples.

use std::collections::VecDeque;

use serde::Serialize;

/// Samples kept for the moving throughput average.
pub const RATE_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub bytes: u64,
    pub total: u64,
    pub pct: f64,
}

/// Parse one stdout line. Returns `None` for anything that is not a
/// well-formed `PROGRESS` line.
pub fn parse_progress_line(line: &str) -> Option<ProgressSample> {
    let rest = line.strip_prefix("PROGRESS ")?;

    let mut bytes = None;
    let mut total = None;
    let mut pct = None;
    for field in rest.split_whitespace() {
        let (key, value) = field.split_once('=')?;
        match key {
            "bytes" => bytes = Some(value.parse::<u64>().ok()?),
            "total" => total = Some(value.parse::<u64>().ok()?),
            "pct" => pct = Some(value.parse::<f64>().ok()?),
            // rate=, elapsed=, and anything newer are advisory
            _ => {}
        }
    }

    Some(ProgressSample {
        bytes: bytes?,
        total: total?,
        pct: pct?,
    })
}

/// Ring of `(wall_seconds, bytes)` points over which throughput is averaged.
#[derive(Debug, Default)]
pub struct RateWindowAvg {
    points: VecDeque<(f64, u64)>,
}

impl RateWindowAvg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, wall_seconds: f64, bytes: u64) {
        if self.points.len() == RATE_WINDOW {
            self.points.pop_front();
        }
        self.points.push_back((wall_seconds, bytes));
    }

    /// Δbytes / Δseconds across the window; 0 until two samples exist.
    pub fn bytes_per_sec(&self) -> f64 {
        let (Some(first), Some(last)) = (self.points.front(), self.points.back()) else {
            return 0.0;
        };
        let dt = last.0 - first.0;
        if dt <= 0.0 {
            return 0.0;
        }
        (last.1.saturating_sub(first.1)) as f64 / dt
    }

    pub fn reset(&mut self) {
        self.points.clear();
    }
}

/// Progress as reported to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagingProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub pct: f64,
    pub bytes_per_sec: f64,
    pub mb_per_sec: f64,
}

impl ImagingProgress {
    pub fn new(sample: ProgressSample, bytes_per_sec: f64) -> Self {
        let bytes_done = sample.bytes.min(sample.total);
        Self {
            bytes_done,
            bytes_total: sample.total,
            pct: sample.pct.clamp(0.0, 100.0),
            bytes_per_sec,
            mb_per_sec: bytes_per_sec / 1_000_000.0,
        }
    }

    /// Terminal form after a clean exit: complete by definition.
    pub fn completed(total: u64, bytes_per_sec: f64) -> Self {
        Self {
            bytes_done: total,
            bytes_total: total,
            pct: 100.0,
            bytes_per_sec,
            mb_per_sec: bytes_per_sec / 1_000_000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_lines_parse() {
        let sample = parse_progress_line("PROGRESS bytes=1048576 total=4194304 pct=25.0").unwrap();
        assert_eq!(sample.bytes, 1_048_576);
        assert_eq!(sample.total, 4_194_304);
        assert_eq!(sample.pct, 25.0);
    }

    #[test]
    fn extra_keys_are_ignored() {
        let sample =
            parse_progress_line("PROGRESS bytes=10 total=100 pct=10 rate=5 elapsed=2.0 x=9")
                .unwrap();
        assert_eq!(sample.bytes, 10);
    }

    #[test]
    fn malformed_lines_reject() {
        for bad in [
            "bytes=1 total=2 pct=50",
            "PROGRESS bytes=1 total=2",
            "PROGRESS bytes=x total=2 pct=50",
            "PROGRESS bytes 1 total=2 pct=50",
            "progress bytes=1 total=2 pct=50",
            "",
        ] {
            assert!(parse_progress_line(bad).is_none(), "accepted {bad:?}");
        }
    }

    #[test]
    fn rate_is_linear_over_window() {
        let mut window = RateWindowAvg::new();
        window.push(0.0, 0);
        window.push(1.0, 1_000_000);
        window.push(2.0, 3_000_000);
        assert!((window.bytes_per_sec() - 1_500_000.0).abs() < 1e-6);
    }

    #[test]
    fn window_slides_after_capacity() {
        let mut window = RateWindowAvg::new();
        for i in 0..7u64 {
            window.push(i as f64, i * 100);
        }
        // window now spans t=2..=6, bytes 200..=600
        assert!((window.bytes_per_sec() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn single_sample_yields_zero() {
        let mut window = RateWindowAvg::new();
        window.push(1.0, 500);
        assert_eq!(window.bytes_per_sec(), 0.0);
    }
}
