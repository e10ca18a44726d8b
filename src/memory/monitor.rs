use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sampler::{MemorySample, MemorySampler, ProcMemorySampler};

/// Memory pressure levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    Critical,
}

impl MemoryPressure {
    pub fn from_usage_percent(usage_percent: f64) -> Self {
        if usage_percent >= 90.0 {
            MemoryPressure::Critical
        } else if usage_percent >= 80.0 {
            MemoryPressure::High
        } else if usage_percent >= 60.0 {
            MemoryPressure::Medium
        } else {
            MemoryPressure::Low
        }
    }
}

/// Something that can give memory back when the process is under pressure
#[async_trait]
pub trait ReclamationHook: Send + Sync {
    fn name(&self) -> &str;

    /// Release memory proportional to `pressure`; returns an estimate of bytes freed
    async fn reclaim(&self, pressure: MemoryPressure) -> usize;
}

/// Memory monitor configuration
#[derive(Debug, Clone)]
pub struct MemoryMonitorConfig {
    pub sample_interval: Duration,
    /// Reclaim when resident memory exceeds this share of system memory
    pub threshold_percent: f64,
    /// Minimum time between two threshold-triggered passes
    pub min_reclaim_interval: Duration,
}

impl Default for MemoryMonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            threshold_percent: 80.0,
            min_reclaim_interval: Duration::from_secs(30),
        }
    }
}

/// Memory usage statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMonitorStats {
    pub samples_taken: u64,
    pub last_sample: Option<MemorySample>,
    pub peak_resident_bytes: u64,
    pub last_pressure: Option<MemoryPressure>,
    pub pressure_events: u64,
    pub reclamation_passes: u64,
    pub bytes_freed: u64,
    pub last_reclaim: Option<DateTime<Utc>>,
}

/// Background sampler that asks registered hooks to give memory back
pub struct MemoryPressureMonitor {
    config: MemoryMonitorConfig,
    sampler: Arc<dyn MemorySampler>,
    hooks: RwLock<Vec<Arc<dyn ReclamationHook>>>,
    stats: Mutex<MemoryMonitorStats>,
    last_reclaim: Mutex<Option<Instant>>,
}

impl MemoryPressureMonitor {
    pub fn new(config: MemoryMonitorConfig) -> Self {
        Self::with_sampler(config, Arc::new(ProcMemorySampler))
    }

    pub fn with_sampler(config: MemoryMonitorConfig, sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            config,
            sampler,
            hooks: RwLock::new(Vec::new()),
            stats: Mutex::new(MemoryMonitorStats::default()),
            last_reclaim: Mutex::new(None),
        }
    }

    pub async fn register_hook(&self, hook: Arc<dyn ReclamationHook>) {
        info!(hook = hook.name(), "registered memory reclamation hook");
        self.hooks.write().await.push(hook);
    }

    /// Take one sample and reclaim if the percentage threshold is exceeded.
    ///
    /// Returns the sample, or `None` when memory could not be read.
    pub async fn sample_once(&self) -> Option<MemorySample> {
        let sample = self.sampler.sample()?;
        let usage_percent = sample.usage_percent();
        let pressure = MemoryPressure::from_usage_percent(usage_percent);

        {
            let mut stats = self.stats.lock().await;
            stats.samples_taken += 1;
            stats.last_sample = Some(sample);
            stats.peak_resident_bytes = stats.peak_resident_bytes.max(sample.resident_bytes);
            stats.last_pressure = Some(pressure);
        }

        if usage_percent > self.config.threshold_percent {
            let due = {
                let last = self.last_reclaim.lock().await;
                last.map_or(true, |at| at.elapsed() >= self.config.min_reclaim_interval)
            };

            self.stats.lock().await.pressure_events += 1;

            if due {
                warn!(
                    usage_percent = format!("{:.1}", usage_percent),
                    threshold = self.config.threshold_percent,
                    "memory threshold exceeded, reclaiming"
                );
                // A configured threshold below the Medium band still trims something
                self.reclaim_now(pressure.max(MemoryPressure::Medium)).await;
            } else {
                debug!("memory threshold exceeded, reclamation pass recently ran");
            }
        }

        Some(sample)
    }

    /// Run every hook immediately. Returns total bytes freed.
    pub async fn reclaim_now(&self, pressure: MemoryPressure) -> usize {
        let hooks: Vec<Arc<dyn ReclamationHook>> = self.hooks.read().await.clone();

        let mut freed = 0;
        for hook in &hooks {
            let hook_freed = hook.reclaim(pressure).await;
            debug!(hook = hook.name(), freed = hook_freed, "reclamation hook finished");
            freed += hook_freed;
        }

        *self.last_reclaim.lock().await = Some(Instant::now());

        let mut stats = self.stats.lock().await;
        stats.reclamation_passes += 1;
        stats.bytes_freed += freed as u64;
        stats.last_reclaim = Some(Utc::now());

        info!(?pressure, freed, hooks = hooks.len(), "memory reclamation pass complete");
        freed
    }

    /// Force a critical pass when resident memory exceeds an absolute ceiling.
    ///
    /// Returns bytes freed when a pass ran.
    pub async fn check_ceiling(&self, ceiling_bytes: u64) -> Option<usize> {
        let sample = self.sampler.sample()?;
        if sample.resident_bytes <= ceiling_bytes {
            return None;
        }

        warn!(
            resident = sample.resident_bytes,
            ceiling = ceiling_bytes,
            "resident memory above ceiling, forcing reclamation"
        );
        self.stats.lock().await.pressure_events += 1;
        Some(self.reclaim_now(MemoryPressure::Critical).await)
    }

    pub async fn stats(&self) -> MemoryMonitorStats {
        self.stats.lock().await.clone()
    }

    /// Sample on `sample_interval` until `cancel` fires
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let sample_interval = self.config.sample_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sample_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("memory monitor stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if monitor.sample_once().await.is_none() {
                            debug!("memory sample unavailable");
                        }
                    }
                }
            }
        })
    }
}
