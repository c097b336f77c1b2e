use clap::Parser;
use config::{ConfigError, Environment, File};
use loyalty_core::ReconcilerConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Command-line overrides; the matching environment variables win over them
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "loyalty-engine")]
#[command(about = "Loyalty order and balance service", long_about = None)]
pub struct CliArgs {
    #[arg(short = 'a', value_name = "ADDRESS", help = "Server address (RUN_ADDRESS)")]
    pub address: Option<String>,

    #[arg(short = 'd', value_name = "URI", help = "Database URI (DATABASE_URI)")]
    pub database_uri: Option<String>,

    #[arg(
        short = 'r',
        value_name = "URL",
        help = "Accrual system address (ACCRUAL_SYSTEM_ADDRESS)"
    )]
    pub accrual_address: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub accrual: AccrualConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// `host:port` to bind
    pub address: String,
    pub workers: usize,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AccrualConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub max_retry_after_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub session_ttl_hours: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl AccrualConfig {
    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig::default()
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_batch_size(self.batch_size)
            .with_max_retry_after(Duration::from_secs(self.max_retry_after_secs))
    }
}

impl Config {
    /// Layer defaults, config file, `LOYALTY__*` variables, flags and the
    /// well-known environment overrides, in that order
    pub fn load(args: &CliArgs) -> Result<Self, ConfigError> {
        Self::load_with(args, |key| env::var(key).ok())
    }

    fn load_with<F>(args: &CliArgs, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("ENVIRONMENT").unwrap_or_else(|| "development".to_string());

        let mut builder = config::Config::builder()
            .set_default("server.address", "localhost:8080")?
            .set_default("server.workers", 4)?
            .set_default("server.shutdown_timeout_secs", 30)?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("accrual.base_url", "")?
            .set_default("accrual.timeout_secs", 10)?
            .set_default("accrual.poll_interval_secs", 60)?
            .set_default("accrual.batch_size", 100)?
            .set_default("accrual.max_retry_after_secs", 60)?
            .set_default("auth.jwt_secret", "")?
            .set_default("auth.session_ttl_hours", 24)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?;

        if let Some(config_file) = lookup("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        builder = builder.add_source(Environment::with_prefix("LOYALTY").separator("__"));

        let overrides = [
            ("server.address", "RUN_ADDRESS", &args.address),
            ("database.url", "DATABASE_URI", &args.database_uri),
            ("accrual.base_url", "ACCRUAL_SYSTEM_ADDRESS", &args.accrual_address),
        ];
        for (key, var, flag) in overrides {
            let value = lookup(var)
                .filter(|v| !v.is_empty())
                .or_else(|| flag.clone());
            if let Some(value) = value {
                builder = builder.set_override(key, value)?;
            }
        }

        if let Some(secret) = lookup("JWT_SECRET") {
            builder = builder.set_override("auth.jwt_secret", secret)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.address.is_empty() {
            return Err("Server address is required".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.accrual.base_url.is_empty() {
            return Err("Accrual system address is required".to_string());
        }

        if self.accrual.timeout_secs == 0 {
            return Err("Accrual timeout must be positive".to_string());
        }

        if self.accrual.poll_interval_secs == 0 {
            return Err("Accrual poll interval must be positive".to_string());
        }

        if self.accrual.batch_size == 0 {
            return Err("Accrual batch size must be positive".to_string());
        }

        if self.auth.jwt_secret.is_empty() {
            return Err("JWT secret is required".to_string());
        }

        if self.auth.session_ttl_hours <= 0 {
            return Err("Session TTL must be positive".to_string());
        }

        Ok(())
    }
}
