use anyhow::{Context, Result};
use clap::Parser;
use std::{collections::BTreeSet, env, str::FromStr, time::Duration};
use uuid::Uuid;

pub const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_QUERY_LIMIT: usize = 10;
pub const MAX_QUERY_LIMIT: usize = 100;
pub const DEFAULT_ALLOWED_FORMATS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base URL embedded in access handles, e.g. `http://images.local:3000`.
    pub public_url: String,
    pub signing_secret: Vec<u8>,
    pub images: ImageConfig,
}

/// Settings injected into the coordination layer.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// Lowercase file extensions accepted on upload.
    pub allowed_formats: BTreeSet<String>,
    pub max_bytes: usize,
    pub default_query_limit: usize,
    pub max_query_limit: usize,
    pub access_handle_ttl: Duration,
    /// Upper bound for every individual blob or metadata call.
    pub store_timeout: Duration,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            allowed_formats: DEFAULT_ALLOWED_FORMATS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            max_bytes: DEFAULT_MAX_BYTES,
            default_query_limit: DEFAULT_QUERY_LIMIT,
            max_query_limit: MAX_QUERY_LIMIT,
            access_handle_ttl: Duration::from_secs(3600),
            store_timeout: Duration::from_secs(10),
        }
    }
}

impl ImageConfig {
    /// Resolve the effective result count for a query.
    ///
    /// Missing limits fall back to the default; anything above the ceiling is
    /// clamped rather than rejected.
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_query_limit)
            .clamp(1, self.max_query_limit.max(1))
    }

    pub fn is_allowed_format(&self, extension: &str) -> bool {
        self.allowed_formats
            .contains(&extension.to_ascii_lowercase())
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Image metadata and blob service")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where image blobs are stored (overrides IMAGE_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides IMAGE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL used when building access handles (overrides IMAGE_STORE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Comma-separated list of accepted extensions (overrides IMAGE_STORE_ALLOWED_FORMATS)
    #[arg(long)]
    pub allowed_formats: Option<String>,

    /// Maximum upload size in bytes (overrides IMAGE_STORE_MAX_BYTES)
    #[arg(long)]
    pub max_bytes: Option<usize>,

    /// Result count used when a list request gives none (overrides IMAGE_STORE_DEFAULT_LIMIT)
    #[arg(long)]
    pub default_limit: Option<usize>,

    /// Hard ceiling on list results (overrides IMAGE_STORE_MAX_LIMIT)
    #[arg(long)]
    pub max_limit: Option<usize>,

    /// Access handle lifetime in seconds (overrides IMAGE_STORE_HANDLE_TTL_SECS)
    #[arg(long)]
    pub handle_ttl_secs: Option<u64>,

    /// Per-call store timeout in seconds (overrides IMAGE_STORE_TIMEOUT_SECS)
    #[arg(long)]
    pub store_timeout_secs: Option<u64>,

    /// Apply the metadata schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let host = args
            .host
            .unwrap_or_else(|| env::var("IMAGE_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into()));
        let port = match args.port {
            Some(port) => port,
            None => env_parse("IMAGE_STORE_PORT")?.unwrap_or(3000),
        };
        let storage_dir = args.storage_dir.unwrap_or_else(|| {
            env::var("IMAGE_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into())
        });
        let database_url = args.database_url.unwrap_or_else(|| {
            env::var("IMAGE_STORE_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/meta/images.db".into())
        });
        let public_url = args
            .public_url
            .or_else(|| env::var("IMAGE_STORE_PUBLIC_URL").ok())
            .unwrap_or_else(|| format!("http://localhost:{}", port));

        let signing_secret = match env::var("IMAGE_STORE_SIGNING_SECRET") {
            Ok(secret) if !secret.is_empty() => secret.into_bytes(),
            _ => {
                tracing::warn!(
                    "IMAGE_STORE_SIGNING_SECRET not set; access handles will not survive a restart"
                );
                random_secret()
            }
        };

        let mut images = ImageConfig::default();
        if let Some(formats) = args
            .allowed_formats
            .or_else(|| env::var("IMAGE_STORE_ALLOWED_FORMATS").ok())
        {
            images.allowed_formats = parse_formats(&formats);
        }
        if let Some(v) = or_env(args.max_bytes, "IMAGE_STORE_MAX_BYTES")? {
            images.max_bytes = v;
        }
        if let Some(v) = or_env(args.default_limit, "IMAGE_STORE_DEFAULT_LIMIT")? {
            images.default_query_limit = v;
        }
        if let Some(v) = or_env(args.max_limit, "IMAGE_STORE_MAX_LIMIT")? {
            images.max_query_limit = v;
        }
        if let Some(v) = or_env(args.handle_ttl_secs, "IMAGE_STORE_HANDLE_TTL_SECS")? {
            images.access_handle_ttl = Duration::from_secs(v);
        }
        if let Some(v) = or_env(args.store_timeout_secs, "IMAGE_STORE_TIMEOUT_SECS")? {
            images.store_timeout = Duration::from_secs(v);
        }

        if images.allowed_formats.is_empty() {
            anyhow::bail!("at least one allowed format must be configured");
        }

        let cfg = Self {
            host,
            port,
            storage_dir,
            database_url,
            public_url,
            signing_secret,
            images,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn or_env<T>(cli: Option<T>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match cli {
        Some(v) => Ok(Some(v)),
        None => env_parse(key),
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

/// Split a comma-separated extension list, dropping blanks and leading dots.
pub fn parse_formats(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|f| !f.is_empty())
        .collect()
}

fn random_secret() -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(Uuid::new_v4().as_bytes());
    out.extend_from_slice(Uuid::new_v4().as_bytes());
    out
}
