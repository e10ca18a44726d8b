use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::{warn, Level};

use crate::cache::{namespaces, CacheConfig, NamespaceConfig};
use crate::classification::RouterConfig;
use crate::infrastructure::logging::{LogFormat, LoggingConfig};
use crate::memory::MemoryMonitorConfig;
use crate::persistence::PersistenceConfig;
use crate::processing::ProcessorConfig;

const ENV_PREFIX: &str = "MAIL_CLASSIFIER_";

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub submit_timeout_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub completion_timeout_secs: u64,
    pub progress_every: usize,
    pub chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub threshold: f64,
    pub fast_accept_confidence: f64,
    pub deep_adopt_confidence: f64,
    pub deep_timeout_ms: u64,
    pub strategic_ceiling_percent: f64,
    pub tune_step: f64,
    pub obvious_spam: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_size: usize,
    pub ttl_secs: u64,
    pub compression_threshold: usize,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    pub batch_size: usize,
    pub max_buffered: usize,
    pub flush_interval_secs: u64,
    /// SQLite URL; the in-memory sink is used when unset
    pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MemorySettings {
    pub sample_interval_secs: u64,
    pub threshold_percent: f64,
    pub min_reclaim_interval_secs: u64,
    pub ceiling_mb: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pool: PoolSettings,
    pub router: RouterSettings,
    pub cache: CacheSettings,
    pub persistence: PersistenceSettings,
    pub memory: MemorySettings,
    pub log_level: String,
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        let router = RouterConfig::default();
        let mut obvious_spam: Vec<String> = router.obvious_spam.into_iter().collect();
        obvious_spam.sort();

        Config {
            pool: PoolSettings {
                workers: num_cpus::get(),
                queue_capacity: 256,
                submit_timeout_ms: 100,
                shutdown_timeout_secs: 10,
                completion_timeout_secs: 600,
                progress_every: 10,
                chunk_size: 500,
            },
            router: RouterSettings {
                threshold: router.threshold,
                fast_accept_confidence: router.fast_accept_confidence,
                deep_adopt_confidence: router.deep_adopt_confidence,
                deep_timeout_ms: router.deep_timeout.as_millis() as u64,
                strategic_ceiling_percent: router.strategic_ceiling_percent,
                tune_step: router.tune_step,
                obvious_spam,
            },
            cache: CacheSettings {
                max_size: 10_000,
                ttl_secs: 3600,
                compression_threshold: 4 * 1024,
                cleanup_interval_secs: 300,
            },
            persistence: PersistenceSettings {
                batch_size: 100,
                max_buffered: 10_000,
                flush_interval_secs: 5,
                database_url: None,
            },
            memory: MemorySettings {
                sample_interval_secs: 5,
                threshold_percent: 80.0,
                min_reclaim_interval_secs: 30,
                ceiling_mb: None,
            },
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        // 默认配置
        let mut config = Config::default();

        // 加载配置文件
        #[cfg(not(test))]
        config.load_from_env_file();
        // 加载环境变量（覆盖配置文件）
        config.load_from_env();

        config
    }

    pub fn load_from_env_file(&mut self) {
        // 尝试从用户主目录加载
        if let Ok(home) = env::var("HOME") {
            let user_env_path = PathBuf::from(format!("{}/.mail-classifier/.env", home));
            if user_env_path.exists() {
                dotenvy::from_path(user_env_path).ok();
            }
        }

        // 尝试从当前目录加载
        dotenvy::dotenv().ok();
    }

    /// Apply `MAIL_CLASSIFIER_*` variables. Unparseable values are logged and ignored.
    pub fn load_from_env(&mut self) {
        set_parsed("WORKERS", &mut self.pool.workers);
        set_parsed("QUEUE_CAPACITY", &mut self.pool.queue_capacity);
        set_parsed("SUBMIT_TIMEOUT_MS", &mut self.pool.submit_timeout_ms);
        set_parsed("SHUTDOWN_TIMEOUT_SECS", &mut self.pool.shutdown_timeout_secs);
        set_parsed("COMPLETION_TIMEOUT_SECS", &mut self.pool.completion_timeout_secs);
        set_parsed("PROGRESS_EVERY", &mut self.pool.progress_every);
        set_parsed("CHUNK_SIZE", &mut self.pool.chunk_size);

        set_parsed("ROUTER_THRESHOLD", &mut self.router.threshold);
        set_parsed("FAST_ACCEPT_CONFIDENCE", &mut self.router.fast_accept_confidence);
        set_parsed("DEEP_ADOPT_CONFIDENCE", &mut self.router.deep_adopt_confidence);
        set_parsed("DEEP_TIMEOUT_MS", &mut self.router.deep_timeout_ms);
        set_parsed("STRATEGIC_CEILING_PERCENT", &mut self.router.strategic_ceiling_percent);
        set_parsed("TUNE_STEP", &mut self.router.tune_step);
        if let Some(list) = var("OBVIOUS_SPAM") {
            self.router.obvious_spam = list
                .split(',')
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect();
        }

        set_parsed("CACHE_MAX_SIZE", &mut self.cache.max_size);
        set_parsed("CACHE_TTL_SECS", &mut self.cache.ttl_secs);
        set_parsed("CACHE_COMPRESSION_THRESHOLD", &mut self.cache.compression_threshold);
        set_parsed("CACHE_CLEANUP_INTERVAL_SECS", &mut self.cache.cleanup_interval_secs);

        set_parsed("BATCH_SIZE", &mut self.persistence.batch_size);
        set_parsed("MAX_BUFFERED", &mut self.persistence.max_buffered);
        set_parsed("FLUSH_INTERVAL_SECS", &mut self.persistence.flush_interval_secs);
        if let Some(url) = var("DATABASE_URL") {
            self.persistence.database_url = Some(url);
        }

        set_parsed("MEMORY_SAMPLE_INTERVAL_SECS", &mut self.memory.sample_interval_secs);
        set_parsed("MEMORY_THRESHOLD_PERCENT", &mut self.memory.threshold_percent);
        set_parsed("MEMORY_MIN_RECLAIM_INTERVAL_SECS", &mut self.memory.min_reclaim_interval_secs);
        let mut ceiling_mb = self.memory.ceiling_mb.unwrap_or(0);
        set_parsed("MEMORY_CEILING_MB", &mut ceiling_mb);
        self.memory.ceiling_mb = (ceiling_mb > 0).then_some(ceiling_mb);

        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.log_format = format;
        }
    }

    pub fn update_from_args(&mut self, args: &crate::cli::args::Args) {
        // 命令行参数优先级最高
        if let Some(workers) = args.workers {
            self.pool.workers = workers;
        }
        if let Some(url) = &args.database {
            self.persistence.database_url = Some(url.clone());
        }
        if let Some(format) = &args.log_format {
            self.log_format = format.clone();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool.workers == 0 {
            anyhow::bail!("MAIL_CLASSIFIER_WORKERS must be at least 1");
        }
        if self.pool.queue_capacity == 0 {
            anyhow::bail!("MAIL_CLASSIFIER_QUEUE_CAPACITY must be at least 1");
        }
        if self.pool.chunk_size == 0 || self.pool.progress_every == 0 {
            anyhow::bail!("chunk size and progress cadence must be at least 1");
        }
        if !(0.1..=0.9).contains(&self.router.threshold) {
            anyhow::bail!(
                "Router threshold {} is out of range. MAIL_CLASSIFIER_ROUTER_THRESHOLD must be within [0.1, 0.9]",
                self.router.threshold
            );
        }
        for (name, value) in [
            ("fast accept confidence", self.router.fast_accept_confidence),
            ("deep adopt confidence", self.router.deep_adopt_confidence),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                anyhow::bail!("{} must be within (0, 1], got {}", name, value);
            }
        }
        if !(0.0..=100.0).contains(&self.router.strategic_ceiling_percent) {
            anyhow::bail!("strategic ceiling must be a percentage");
        }
        if self.persistence.batch_size == 0 {
            anyhow::bail!("MAIL_CLASSIFIER_BATCH_SIZE must be at least 1");
        }
        if self.persistence.max_buffered < self.persistence.batch_size {
            anyhow::bail!(
                "MAIL_CLASSIFIER_MAX_BUFFERED ({}) must not be below the batch size ({})",
                self.persistence.max_buffered,
                self.persistence.batch_size
            );
        }
        if !(self.memory.threshold_percent > 0.0 && self.memory.threshold_percent <= 100.0) {
            anyhow::bail!("MAIL_CLASSIFIER_MEMORY_THRESHOLD_PERCENT must be within (0, 100]");
        }
        if self.log_level.parse::<Level>().is_err() {
            anyhow::bail!("Unsupported log level: {}", self.log_level);
        }
        if LogFormat::parse(&self.log_format).is_none() {
            anyhow::bail!("Unsupported log format: {}", self.log_format);
        }
        Ok(())
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            worker_count: self.pool.workers,
            queue_capacity: self.pool.queue_capacity,
            submit_timeout: Duration::from_millis(self.pool.submit_timeout_ms),
            completion_timeout: Duration::from_secs(self.pool.completion_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.pool.shutdown_timeout_secs),
            progress_every: self.pool.progress_every,
            chunk_size: self.pool.chunk_size,
            memory_ceiling_bytes: self.memory.ceiling_mb.map(|mb| mb * 1024 * 1024),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            threshold: self.router.threshold,
            obvious_spam: self.router.obvious_spam.iter().cloned().collect::<HashSet<_>>(),
            fast_accept_confidence: self.router.fast_accept_confidence,
            deep_adopt_confidence: self.router.deep_adopt_confidence,
            deep_timeout: Duration::from_millis(self.router.deep_timeout_ms),
            strategic_ceiling_percent: self.router.strategic_ceiling_percent,
            tune_step: self.router.tune_step,
            cache_ttl: Some(Duration::from_secs(self.cache.ttl_secs)),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        let namespace = NamespaceConfig {
            max_size: self.cache.max_size,
            default_ttl: Some(Duration::from_secs(self.cache.ttl_secs)),
            compression_threshold: Some(self.cache.compression_threshold),
        };

        let mut config = CacheConfig {
            default_namespace: namespace.clone(),
            cleanup_interval: Duration::from_secs(self.cache.cleanup_interval_secs),
            ..Default::default()
        };
        config
            .namespaces
            .insert(namespaces::DEEP_VERDICTS.to_string(), namespace);
        config
    }

    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig {
            batch_size: self.persistence.batch_size,
            max_buffered: self.persistence.max_buffered,
        }
    }

    pub fn monitor_config(&self) -> MemoryMonitorConfig {
        MemoryMonitorConfig {
            sample_interval: Duration::from_secs(self.memory.sample_interval_secs.max(1)),
            threshold_percent: self.memory.threshold_percent,
            min_reclaim_interval: Duration::from_secs(self.memory.min_reclaim_interval_secs),
        }
    }

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.parse().unwrap_or(Level::INFO),
            format: LogFormat::parse(&self.log_format).unwrap_or(LogFormat::Pretty),
            ..Default::default()
        }
    }
}

fn var(name: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn set_parsed<T: FromStr>(name: &str, target: &mut T) {
    if let Some(raw) = var(name) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!(variable = %format!("{}{}", ENV_PREFIX, name), value = %raw, "ignoring unparseable value"),
        }
    }
}
