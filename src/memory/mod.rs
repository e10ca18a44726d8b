pub mod monitor;
pub mod sampler;

pub use monitor::{
    MemoryMonitorConfig, MemoryMonitorStats, MemoryPressure, MemoryPressureMonitor, ReclamationHook,
};
pub use sampler::{system_memory_with_fallback, MemorySample, MemorySampler, ProcMemorySampler};
