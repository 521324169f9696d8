use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct PostgresArgs {
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "DB_NAME", default_value = "postgres")]
    pub postgres_database: String,

    #[arg(long, env = "DB_USER", default_value = "postgres")]
    pub postgres_username: String,

    #[arg(long, env = "DB_PASSWORD")]
    pub postgres_password: Option<String>,

    #[arg(long, env = "DB_CA_CERT")]
    pub postgres_ca_cert: Option<String>,
}
