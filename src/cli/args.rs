use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(
    name = "mail-classifier",
    version,
    about = "Drive the classification engine with a synthetic workload",
    long_about = "Generates synthetic email tasks, runs them through the tiered router on a worker pool, persists the results and prints a JSON summary of pool, tier, cache, persistence and memory statistics."
)]
pub struct Args {
    /// Number of synthetic tasks to generate
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub tasks: usize,

    /// Share of tasks the fast classifier is unsure about (0.0 - 1.0)
    #[arg(short = 'u', long = "uncertain-ratio", default_value_t = 0.05)]
    pub uncertain_ratio: f64,

    /// Share of tasks that are obvious spam (0.0 - 1.0)
    #[arg(long = "spam-ratio", default_value_t = 0.2)]
    pub spam_ratio: f64,

    /// Worker count (overrides MAIL_CLASSIFIER_WORKERS)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Simulated latency of the deep classifier in milliseconds
    #[arg(long = "deep-latency-ms", default_value_t = 20)]
    pub deep_latency_ms: u64,

    /// Consume tasks as a stream in chunks instead of one batch
    #[arg(short, long, default_value_t = false)]
    pub stream: bool,

    /// Persist to this SQLite URL instead of memory (overrides MAIL_CLASSIFIER_DATABASE_URL)
    #[arg(long, value_name = "URL")]
    pub database: Option<String>,

    /// Seed for the workload generator
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log format: pretty, compact or json
    #[arg(long = "log-format", value_name = "FORMAT")]
    pub log_format: Option<String>,
}
