//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::domain::policy::{PolicyTier, ZoomPolicy, default_tiers};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "parcelmap";
const ENV_PREFIX: &str = "PARCELMAP";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_MEMORY_MAX_ENTRIES: usize = 256;
const DEFAULT_MEMORY_MAX_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_MEMORY_ENTRY_LIMIT_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_DISK_DIRECTORY: &str = "cache/layers";
const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_PROGRESS_CHUNK_SIZE: usize = 1_000;
const DEFAULT_STAGING_DIRECTORY: &str = "cache/staging";
const DEFAULT_REMOTE_MAX_ATTEMPTS: u64 = 3;
const DEFAULT_REMOTE_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_REMOTE_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CATALOG_PATH: &str = "config/layers.toml";

/// Command-line arguments for the parcelmap binary.
#[derive(Debug, Parser)]
#[command(
    name = "parcelmap",
    version,
    about = "Zoom-aware GeoJSON server for large parcel layers"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PARCELMAP_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service.
    Serve(Box<ServeArgs>),
    /// Generate cache entries for a layer ahead of traffic.
    Warm(WarmArgs),
    /// Drop cached payloads.
    #[command(name = "clear-cache")]
    ClearCache(ClearCacheArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct StorageOverrides {
    /// Override the layer catalog file.
    #[arg(long = "catalog-path", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub catalog_path: Option<PathBuf>,

    /// Override the disk cache directory.
    #[arg(long = "cache-disk-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub cache_disk_directory: Option<PathBuf>,

    /// Override the staging directory for downloads and extracted archives.
    #[arg(long = "pipeline-staging-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub staging_directory: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub storage: StorageOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the disk cache tier.
    #[arg(
        long = "cache-disk-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_disk_enabled: Option<bool>,

    /// Override the number of payloads kept in memory.
    #[arg(long = "cache-memory-max-entries", value_name = "COUNT")]
    pub cache_memory_max_entries: Option<usize>,

    /// Override how long a request waits for generation before answering 202.
    #[arg(long = "pipeline-generation-timeout-seconds", value_name = "SECONDS")]
    pub generation_timeout_seconds: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct WarmArgs {
    #[command(flatten)]
    pub storage: StorageOverrides,

    /// Layer to generate.
    #[arg(long = "layer", value_name = "ID")]
    pub layer: i64,

    /// Zoom levels to generate; levels sharing a policy tier are generated once.
    #[arg(long = "zoom", value_name = "ZOOM", num_args = 1.., required = true)]
    pub zoom: Vec<i64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ClearCacheArgs {
    #[command(flatten)]
    pub storage: StorageOverrides,

    /// Only drop entries of this layer.
    #[arg(long = "layer", value_name = "ID")]
    pub layer: Option<i64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub pipeline: PipelineSettings,
    pub remote: RemoteSettings,
    pub catalog: CatalogSettings,
    pub policy: ZoomPolicy,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub memory_max_entries: NonZeroUsize,
    pub memory_max_bytes: usize,
    pub memory_entry_limit_bytes: usize,
    pub disk_enabled: bool,
    pub disk_directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub generation_timeout: Duration,
    pub progress_chunk_size: NonZeroUsize,
    pub staging_directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub max_attempts: NonZeroU32,
    pub initial_backoff: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Warm(args)) => raw.apply_storage_overrides(&args.storage),
        Some(Command::ClearCache(args)) => raw.apply_storage_overrides(&args.storage),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    pipeline: RawPipelineSettings,
    remote: RawRemoteSettings,
    catalog: RawCatalogSettings,
    policy: RawPolicySettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_disk_enabled {
            self.cache.disk_enabled = Some(enabled);
        }
        if let Some(entries) = overrides.cache_memory_max_entries {
            self.cache.memory_max_entries = Some(entries);
        }
        if let Some(seconds) = overrides.generation_timeout_seconds {
            self.pipeline.generation_timeout_seconds = Some(seconds);
        }

        self.apply_storage_overrides(&overrides.storage);
    }

    fn apply_storage_overrides(&mut self, overrides: &StorageOverrides) {
        if let Some(path) = overrides.catalog_path.as_ref() {
            self.catalog.path = Some(path.clone());
        }
        if let Some(dir) = overrides.cache_disk_directory.as_ref() {
            self.cache.disk_directory = Some(dir.clone());
        }
        if let Some(dir) = overrides.staging_directory.as_ref() {
            self.pipeline.staging_directory = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            pipeline,
            remote,
            catalog,
            policy,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            pipeline: build_pipeline_settings(pipeline)?,
            remote: build_remote_settings(remote)?,
            catalog: build_catalog_settings(catalog)?,
            policy: build_policy(policy)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr =
        parse_socket_addr(&host, port).map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let memory_max_entries = NonZeroUsize::new(
        cache
            .memory_max_entries
            .unwrap_or(DEFAULT_MEMORY_MAX_ENTRIES),
    )
    .ok_or_else(|| LoadError::invalid("cache.memory_max_entries", "must be greater than zero"))?;

    let memory_max_bytes = byte_size(
        cache.memory_max_bytes.unwrap_or(DEFAULT_MEMORY_MAX_BYTES),
        "cache.memory_max_bytes",
    )?;
    let memory_entry_limit_bytes = byte_size(
        cache
            .memory_entry_limit_bytes
            .unwrap_or(DEFAULT_MEMORY_ENTRY_LIMIT_BYTES),
        "cache.memory_entry_limit_bytes",
    )?;
    if memory_entry_limit_bytes > memory_max_bytes {
        return Err(LoadError::invalid(
            "cache.memory_entry_limit_bytes",
            "must not exceed cache.memory_max_bytes",
        ));
    }

    let disk_directory = non_empty_path(
        cache.disk_directory,
        DEFAULT_DISK_DIRECTORY,
        "cache.disk_directory",
    )?;

    Ok(CacheSettings {
        memory_max_entries,
        memory_max_bytes,
        memory_entry_limit_bytes,
        disk_enabled: cache.disk_enabled.unwrap_or(true),
        disk_directory,
    })
}

fn build_pipeline_settings(pipeline: RawPipelineSettings) -> Result<PipelineSettings, LoadError> {
    let timeout_secs = pipeline
        .generation_timeout_seconds
        .unwrap_or(DEFAULT_GENERATION_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "pipeline.generation_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let progress_chunk_size = NonZeroUsize::new(
        pipeline
            .progress_chunk_size
            .unwrap_or(DEFAULT_PROGRESS_CHUNK_SIZE),
    )
    .ok_or_else(|| {
        LoadError::invalid("pipeline.progress_chunk_size", "must be greater than zero")
    })?;

    let staging_directory = non_empty_path(
        pipeline.staging_directory,
        DEFAULT_STAGING_DIRECTORY,
        "pipeline.staging_directory",
    )?;

    Ok(PipelineSettings {
        generation_timeout: Duration::from_secs(timeout_secs),
        progress_chunk_size,
        staging_directory,
    })
}

fn build_remote_settings(remote: RawRemoteSettings) -> Result<RemoteSettings, LoadError> {
    let max_attempts = non_zero_u32(
        remote.max_attempts.unwrap_or(DEFAULT_REMOTE_MAX_ATTEMPTS),
        "remote.max_attempts",
    )?;

    let timeout_secs = remote
        .request_timeout_seconds
        .unwrap_or(DEFAULT_REMOTE_REQUEST_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "remote.request_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(RemoteSettings {
        max_attempts,
        initial_backoff: Duration::from_millis(
            remote
                .initial_backoff_ms
                .unwrap_or(DEFAULT_REMOTE_INITIAL_BACKOFF_MS),
        ),
        request_timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_catalog_settings(catalog: RawCatalogSettings) -> Result<CatalogSettings, LoadError> {
    Ok(CatalogSettings {
        path: non_empty_path(catalog.path, DEFAULT_CATALOG_PATH, "catalog.path")?,
    })
}

fn build_policy(policy: RawPolicySettings) -> Result<ZoomPolicy, LoadError> {
    let tiers = policy.tiers.unwrap_or_else(default_tiers);
    ZoomPolicy::new(&tiers).map_err(|err| LoadError::invalid("policy.tiers", err.to_string()))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    memory_max_entries: Option<usize>,
    memory_max_bytes: Option<u64>,
    memory_entry_limit_bytes: Option<u64>,
    disk_enabled: Option<bool>,
    disk_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPipelineSettings {
    generation_timeout_seconds: Option<u64>,
    progress_chunk_size: Option<usize>,
    staging_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRemoteSettings {
    max_attempts: Option<u64>,
    initial_backoff_ms: Option<u64>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCatalogSettings {
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicySettings {
    tiers: Option<Vec<PolicyTier>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn byte_size(value: u64, key: &'static str) -> Result<usize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    usize::try_from(value)
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))
}

fn non_empty_path(
    value: Option<PathBuf>,
    default: &str,
    key: &'static str,
) -> Result<PathBuf, LoadError> {
    let path = value.unwrap_or_else(|| PathBuf::from(default));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid(key, "path must not be empty"));
    }
    Ok(path)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
