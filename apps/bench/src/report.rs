//! Benchmark report assembly and export.
//!
//! Byte counts are decimal, times are milliseconds, in both formats.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use tinyinfer_memory::MemoryStats;

/// Timing of one forward pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassTiming {
    pub thread: usize,
    pub pass: usize,
    pub time_ms: f64,
    pub peak_activation_bytes: usize,
}

/// Complete benchmark result.
#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub model: String,
    pub layers: usize,
    pub mode: String,
    pub mmap: bool,
    pub simd: bool,
    pub threads: usize,
    pub passes_per_thread: usize,
    pub max_memory_bytes: usize,
    pub weight_cache_bytes: usize,
    pub peak_activation_bytes: usize,
    pub optimal_batch: usize,
    pub avg_pass_ms: f64,
    pub pass_times: Vec<PassTiming>,
    pub pool: MemoryStats,
}

impl BenchReport {
    /// Mean pass time across all threads.
    #[must_use]
    pub fn average_ms(timings: &[PassTiming]) -> f64 {
        if timings.is_empty() {
            return 0.0;
        }
        timings.iter().map(|t| t.time_ms).sum::<f64>() / timings.len() as f64
    }

    /// Render as JSON.
    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("serializing report")
    }

    /// Render as CSV: one row per pass, then a summary row.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut out = String::from("thread,pass,time_ms,peak_activation_bytes\n");
        for t in &self.pass_times {
            out.push_str(&format!(
                "{},{},{:.3},{}\n",
                t.thread, t.pass, t.time_ms, t.peak_activation_bytes
            ));
        }
        out.push_str(&format!(
            "summary,,{:.3},{}\n",
            self.avg_pass_ms, self.peak_activation_bytes
        ));
        out
    }

    /// Write to `path`, or stdout when `path` is `None`.
    pub fn write(&self, csv: bool, path: Option<&Path>) -> anyhow::Result<()> {
        let body = if csv { self.to_csv() } else { self.to_json()? };
        match path {
            Some(path) => std::fs::write(path, body)
                .with_context(|| format!("writing report to {}", path.display()))?,
            None => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(body.as_bytes()).context("writing report")?;
                stdout.write_all(b"\n").context("writing report")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinyinfer_memory::{PoolConfig, ThreadSafePool};

    fn report() -> BenchReport {
        let pass_times = vec![
            PassTiming {
                thread: 0,
                pass: 0,
                time_ms: 10.0,
                peak_activation_bytes: 2048,
            },
            PassTiming {
                thread: 0,
                pass: 1,
                time_ms: 14.0,
                peak_activation_bytes: 4096,
            },
        ];
        BenchReport {
            model: "unit".into(),
            layers: 2,
            mode: "MemoryOpt".into(),
            mmap: true,
            simd: true,
            threads: 1,
            passes_per_thread: 2,
            max_memory_bytes: 8192,
            weight_cache_bytes: 1000,
            peak_activation_bytes: 4096,
            optimal_batch: 4,
            avg_pass_ms: BenchReport::average_ms(&pass_times),
            pass_times,
            pool: ThreadSafePool::new(PoolConfig::default()).unwrap().stats(),
        }
    }

    #[test]
    fn csv_has_one_row_per_pass_plus_summary() {
        let csv = report().to_csv();
        let lines: Vec<&str> = csv.trim_end().lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "thread,pass,time_ms,peak_activation_bytes");
        assert!(lines[3].starts_with("summary,,12.000"));
    }

    #[test]
    fn json_carries_decimal_bytes_and_ms() {
        let json = report().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["peak_activation_bytes"], 4096);
        assert_eq!(value["avg_pass_ms"], 12.0);
        assert_eq!(value["pass_times"][1]["time_ms"], 14.0);
    }
}
