use std::io;
use std::time::Instant;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// 日志配置
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    pub output: LogOutput,
    pub include_file_location: bool,
    pub include_thread_names: bool,
    pub include_span_events: bool,
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            output: LogOutput::Stderr,
            include_file_location: false,
            include_thread_names: true,
            include_span_events: false,
            filter: None,
        }
    }
}

/// 日志格式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" => Some(LogFormat::Pretty),
            "compact" => Some(LogFormat::Compact),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// 日志输出目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
}

/// 设置日志系统
///
/// Installing a second global subscriber is reported as an error rather than a panic.
pub fn setup_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let env_filter = match &config.filter {
        Some(filter) => EnvFilter::try_new(filter)?,
        None => EnvFilter::from_default_env()
            .add_directive(format!("mail_classifier={}", config.level).parse()?),
    };

    let fmt_layer = match config.output {
        LogOutput::Stdout => create_fmt_layer(&config, io::stdout),
        LogOutput::Stderr => create_fmt_layer(&config, io::stderr),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()?;

    Ok(())
}

/// Plain WARN-level subscriber for the window before `setup_logging` runs,
/// e.g. while configuration is being read. Use with `tracing::subscriber::with_default`.
pub fn bootstrap_subscriber<W>(make_writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'writer> fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt::fmt()
        .with_writer(make_writer)
        .with_max_level(Level::WARN)
        .with_ansi(false)
        .compact()
        .finish()
}

fn create_fmt_layer<W>(config: &LoggingConfig, make_writer: W) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'writer> fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let mut layer = fmt::layer()
        .with_writer(make_writer)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(config.include_thread_names)
        .with_thread_names(config.include_thread_names);

    if config.include_file_location {
        layer = layer.with_file(true).with_line_number(true);
    }

    if config.include_span_events {
        layer = layer.with_span_events(FmtSpan::CLOSE);
    }

    match config.format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// 批处理操作跟踪
///
/// Emits a start event, progress events and a completion event that all carry
/// the same operation id so a batch can be followed through the logs.
pub struct BatchTracker {
    operation_id: String,
    operation: String,
    start_time: Instant,
}

impl BatchTracker {
    pub fn new(operation: impl Into<String>, total: usize) -> Self {
        let operation = operation.into();
        let operation_id = uuid::Uuid::new_v4().to_string();

        tracing::info!(
            operation = %operation,
            operation_id = %operation_id,
            total,
            "batch started"
        );

        Self {
            operation_id,
            operation,
            start_time: Instant::now(),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn log_progress(&self, completed: usize, total: usize) {
        let fraction = if total == 0 { 1.0 } else { completed as f64 / total as f64 };
        tracing::debug!(
            operation = %self.operation,
            operation_id = %self.operation_id,
            completed,
            total,
            progress = %format!("{:.1}%", fraction * 100.0),
            "batch progress"
        );
    }

    pub fn complete(self, succeeded: usize, failed: usize) {
        let duration = self.start_time.elapsed();

        if failed == 0 {
            tracing::info!(
                operation = %self.operation,
                operation_id = %self.operation_id,
                duration_ms = duration.as_millis() as u64,
                succeeded,
                "batch completed"
            );
        } else {
            tracing::warn!(
                operation = %self.operation,
                operation_id = %self.operation_id,
                duration_ms = duration.as_millis() as u64,
                succeeded,
                failed,
                "batch completed with failures"
            );
        }
    }
}

/// 性能监控宏
#[macro_export]
macro_rules! measure_time {
    ($operation:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration = start.elapsed();
        tracing::debug!(
            operation = $operation,
            duration_ms = duration.as_millis() as u64,
            "operation finished"
        );
        result
    }};
}
