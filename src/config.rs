use anyhow::{Context, Result, ensure};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub topic: String,
    pub partitions: u32,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_upload_bytes: u64,
    pub multipart_mem_bytes: u64,
    pub upload_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub log_level: String,
    pub log_json: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Media ingestion service")]
pub struct Args {
    /// Host to bind to (overrides INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object payloads are stored (overrides INGEST_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL for object metadata and the event log (overrides INGEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Topic ingestion events are appended to (overrides INGEST_TOPIC)
    #[arg(long)]
    pub topic: Option<String>,

    /// Number of event log partitions (overrides INGEST_PARTITIONS)
    #[arg(long)]
    pub partitions: Option<u32>,

    /// Maximum messages per event log batch (overrides INGEST_BATCH_SIZE)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Batch linger in milliseconds (overrides INGEST_BATCH_TIMEOUT_MS)
    #[arg(long)]
    pub batch_timeout_ms: Option<u64>,

    /// Largest accepted upload in bytes (overrides INGEST_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Memory allowed for the non-file fields of one multipart form
    /// (overrides INGEST_MULTIPART_MEM_BYTES)
    #[arg(long)]
    pub multipart_mem_bytes: Option<u64>,

    /// Per-upload deadline in seconds (overrides INGEST_UPLOAD_TIMEOUT_SECS)
    #[arg(long)]
    pub upload_timeout_secs: Option<u64>,

    /// Time allowed to flush the event log on shutdown (overrides INGEST_SHUTDOWN_TIMEOUT_SECS)
    #[arg(long)]
    pub shutdown_timeout_secs: Option<u64>,

    /// Log level used when RUST_LOG is unset (overrides INGEST_LOG_LEVEL)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit JSON logs (overrides INGEST_LOG_JSON)
    #[arg(long)]
    pub log_json: bool,

    /// Apply the database schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args, |name| env::var(name))?, migrate))
    }

    /// CLI value, else environment value, else default.
    fn merge(
        args: Args,
        lookup: impl Fn(&str) -> Result<String, env::VarError>,
    ) -> Result<Self> {
        let text = |name: &str, default: &str| -> Result<String> {
            match lookup(name) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        let cfg = Self {
            host: args.host.map_or_else(|| text("INGEST_HOST", "0.0.0.0"), Ok)?,
            port: pick(args.port, &lookup, "INGEST_PORT", 8080)?,
            storage_dir: args
                .storage_dir
                .map_or_else(|| text("INGEST_STORAGE_DIR", "./data/objects"), Ok)?,
            database_url: args.database_url.map_or_else(
                || text("INGEST_DATABASE_URL", "sqlite://./data/meta/ingest.db"),
                Ok,
            )?,
            topic: args
                .topic
                .map_or_else(|| text("INGEST_TOPIC", "mediaflow.ingestion"), Ok)?,
            partitions: pick(args.partitions, &lookup, "INGEST_PARTITIONS", 12)?,
            batch_size: pick(args.batch_size, &lookup, "INGEST_BATCH_SIZE", 100)?,
            batch_timeout: Duration::from_millis(pick(
                args.batch_timeout_ms,
                &lookup,
                "INGEST_BATCH_TIMEOUT_MS",
                50,
            )?),
            max_upload_bytes: pick(
                args.max_upload_bytes,
                &lookup,
                "INGEST_MAX_UPLOAD_BYTES",
                10 * 1024 * 1024 * 1024,
            )?,
            multipart_mem_bytes: pick(
                args.multipart_mem_bytes,
                &lookup,
                "INGEST_MULTIPART_MEM_BYTES",
                50 * 1024 * 1024,
            )?,
            upload_timeout: Duration::from_secs(pick(
                args.upload_timeout_secs,
                &lookup,
                "INGEST_UPLOAD_TIMEOUT_SECS",
                120,
            )?),
            shutdown_timeout: Duration::from_secs(pick(
                args.shutdown_timeout_secs,
                &lookup,
                "INGEST_SHUTDOWN_TIMEOUT_SECS",
                30,
            )?),
            log_level: args
                .log_level
                .map_or_else(|| text("INGEST_LOG_LEVEL", "info"), Ok)?,
            log_json: args.log_json || pick(None, &lookup, "INGEST_LOG_JSON", false)?,
        };

        ensure!(cfg.partitions >= 1, "INGEST_PARTITIONS must be at least 1");
        ensure!(cfg.batch_size >= 1, "INGEST_BATCH_SIZE must be at least 1");
        ensure!(cfg.max_upload_bytes >= 1, "INGEST_MAX_UPLOAD_BYTES must be at least 1");
        ensure!(
            cfg.multipart_mem_bytes >= 1,
            "INGEST_MULTIPART_MEM_BYTES must be at least 1"
        );

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// CLI value if given, else the parsed environment value, else `default`.
fn pick<T>(
    cli: Option<T>,
    lookup: &impl Fn(&str) -> Result<String, env::VarError>,
    name: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match lookup(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(
        vars: &[(&str, &str)],
    ) -> impl Fn(&str) -> Result<String, env::VarError> + use<> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn defaults_apply_without_env_or_flags() {
        let cfg = AppConfig::merge(Args::default(), lookup(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert_eq!(cfg.topic, "mediaflow.ingestion");
        assert_eq!(cfg.partitions, 12);
        assert_eq!(cfg.batch_timeout, Duration::from_millis(50));
        assert_eq!(cfg.max_upload_bytes, 10 * 1024 * 1024 * 1024);
        assert_eq!(cfg.multipart_mem_bytes, 50 * 1024 * 1024);
        assert!(!cfg.log_json);
    }

    #[test]
    fn flags_override_env() {
        let args = Args {
            port: Some(9000),
            topic: Some("cli.topic".into()),
            ..Args::default()
        };
        let cfg = AppConfig::merge(
            args,
            lookup(&[
                ("INGEST_PORT", "7000"),
                ("INGEST_TOPIC", "env.topic"),
                ("INGEST_BATCH_SIZE", "5"),
                ("INGEST_LOG_JSON", "true"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.topic, "cli.topic");
        assert_eq!(cfg.batch_size, 5);
        assert!(cfg.log_json);
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = AppConfig::merge(Args::default(), lookup(&[("INGEST_PORT", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("INGEST_PORT"));
    }

    #[test]
    fn zero_partitions_rejected() {
        assert!(AppConfig::merge(Args::default(), lookup(&[("INGEST_PARTITIONS", "0")])).is_err());
    }
}
