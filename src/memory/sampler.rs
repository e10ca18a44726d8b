use serde::{Deserialize, Serialize};

/// One reading of process and system memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySample {
    pub resident_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySample {
    /// Resident memory as a percentage of system memory
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.resident_bytes as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

/// Source of memory readings. Swappable so the monitor can be driven in tests.
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> Option<MemorySample>;
}

/// Reads `/proc/self/status` and `/proc/meminfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemorySampler;

impl MemorySampler for ProcMemorySampler {
    fn sample(&self) -> Option<MemorySample> {
        let resident_bytes = resident_memory()?;
        Some(MemorySample {
            resident_bytes,
            total_bytes: system_memory_with_fallback(),
        })
    }
}

#[cfg(target_os = "linux")]
fn resident_memory() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_kb_field(&status, "VmRSS:")
}

#[cfg(not(target_os = "linux"))]
fn resident_memory() -> Option<u64> {
    None
}

/// Total system memory, 8GB when it cannot be read
pub fn system_memory_with_fallback() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Some(total) = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|contents| parse_kb_field(&contents, "MemTotal:"))
        {
            return total;
        }
    }

    8 * 1024 * 1024 * 1024
}

/// Parse a `Name:   1234 kB` line into bytes
fn parse_kb_field(contents: &str, field: &str) -> Option<u64> {
    contents
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}
