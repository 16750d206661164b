use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub index_name: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Content-deduplicating file store")]
pub struct Args {
    /// Host to bind to (overrides DEDUP_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DEDUP_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object payloads are stored (overrides DEDUP_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DEDUP_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Name of the file catalog index (overrides DEDUP_STORE_INDEX)
    #[arg(long)]
    pub index_name: Option<String>,

    /// Apply the schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// Fill every field not given on the command line from the environment.
    fn merge(args: Args) -> Result<Self> {
        let env_host = env::var("DEDUP_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("DEDUP_STORE_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing DEDUP_STORE_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading DEDUP_STORE_PORT"),
        };
        let env_storage =
            env::var("DEDUP_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("DEDUP_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/dedup_store.db".into());
        let env_index = env::var("DEDUP_STORE_INDEX").unwrap_or_else(|_| "files_index".into());

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            index_name: args.index_name.unwrap_or(env_index),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
