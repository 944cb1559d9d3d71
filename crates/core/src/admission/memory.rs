//! Memory utilization sampling.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from a memory monitor.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory statistics unavailable: {0}")]
    Unavailable(String),

    #[error("failed to parse memory statistics: {0}")]
    Parse(String),
}

/// Source of the current memory utilization.
///
/// Sampling must be synchronous and cheap; the admission controller calls it
/// while holding its lock.
pub trait MemoryMonitor: Send + Sync {
    /// Current utilization in percent (0.0 - 100.0).
    fn sample(&self) -> Result<f32, MemoryError>;
}

/// Parsed subset of `/proc/meminfo`, in kilobytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemoryReading {
    /// Used memory as a percentage of total.
    pub fn used_percent(&self) -> f32 {
        if self.total_kb == 0 {
            return 0.0;
        }
        let used = self.total_kb.saturating_sub(self.available_kb);
        (used as f64 / self.total_kb as f64 * 100.0) as f32
    }

    /// Parse the contents of `/proc/meminfo`.
    ///
    /// Kernels without `MemAvailable` fall back to free + buffers + cached.
    pub fn parse(meminfo: &str) -> Result<Self, MemoryError> {
        let mut total = None;
        let mut available = None;
        let mut free = 0;
        let mut buffers = 0;
        let mut cached = 0;

        for line in meminfo.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let value: u64 = match value.parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            match key {
                "MemTotal:" => total = Some(value),
                "MemAvailable:" => available = Some(value),
                "MemFree:" => free = value,
                "Buffers:" => buffers = value,
                "Cached:" => cached = value,
                _ => {}
            }
        }

        let total_kb = total.ok_or_else(|| MemoryError::Parse("missing MemTotal".to_string()))?;
        Ok(Self {
            total_kb,
            available_kb: available.unwrap_or(free + buffers + cached),
        })
    }
}

/// Monitor backed by the host's `/proc/meminfo`.
#[derive(Debug, Clone)]
pub struct SystemMemoryMonitor {
    path: PathBuf,
}

impl Default for SystemMemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemoryMonitor {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/proc/meminfo"),
        }
    }

    /// Read from a different meminfo-formatted file.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn reading(&self) -> Result<MemoryReading, MemoryError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| MemoryError::Unavailable(format!("{}: {}", self.path.display(), e)))?;
        MemoryReading::parse(&text)
    }
}

impl MemoryMonitor for SystemMemoryMonitor {
    fn sample(&self) -> Result<f32, MemoryError> {
        self.reading().map(|r| r.used_percent())
    }
}
