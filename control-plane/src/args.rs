use clap::Parser;
use store_control_common::args::PostgresArgs;

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// DNS suffix appended to a store's id to form its host, e.g. `stores.example.com`.
    #[arg(long, env = "DNS_SUFFIX", default_value = "stores.example.com")]
    pub dns_suffix: String,

    /// Path to the templating chart installed for each store.
    #[arg(long, env = "CHART_PATH", default_value = "./charts/store")]
    pub chart_path: String,

    #[arg(long, env = "MAX_STORES_GLOBAL", default_value_t = 100)]
    pub max_stores_global: i64,

    #[arg(long, env = "MAX_STORES_PER_TENANT", default_value_t = 10)]
    pub max_stores_per_tenant: i64,

    #[arg(long, env = "MAX_STORES_PER_HOUR", default_value_t = 5)]
    pub max_stores_per_hour: i64,

    #[arg(long, env = "PROVISIONING_TIMEOUT_MS", default_value_t = 300_000)]
    pub provisioning_timeout_ms: i64,

    #[arg(long, env = "READINESS_CHECK_INTERVAL_MS", default_value_t = 5_000)]
    pub readiness_check_interval_ms: u64,

    #[arg(long, env = "MAX_READINESS_CHECKS", default_value_t = 60)]
    pub max_readiness_checks: u32,

    #[arg(long, env = "IDEMPOTENCY_WINDOW_MS", default_value_t = 300_000)]
    pub idempotency_window_ms: i64,

    #[arg(long, env = "MAINTENANCE_INTERVAL_MS", default_value_t = 300_000)]
    pub maintenance_interval_ms: u64,
}
