use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::commit::CommitSettings;
use crate::image_file::MAX_IMAGE_BYTES;
use crate::reconciler::ReconcileSettings;
use crate::staged_images::{StagePolicy, DEFAULT_MAX_ITEMS};
use crate::transcoder::TranscodeOptions;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub public_base_url: String,
    pub max_rps: u32,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub sentry_dsn: Option<String>,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub s3: S3Config,
    pub stage: StagePolicy,
    pub transcode: TranscodeOptions,
    pub commit: CommitSettings,
    pub reconcile: ReconcileSettings,
    pub reconcile_every: Option<Duration>,
    pub reconcile_auto_cleanup: bool,
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name).ok_or(ConfigError::Missing(name))
    }

    fn parsed<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
        }
    }
}

impl AppConfig {
    /// Reads the process environment, after loading `.env` if there is one.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env is fine; the variables may come from the environment.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let supabase_url = vars.required("SUPABASE_URL")?.trim_end_matches('/').to_string();
        let bucket = vars
            .get("S3_BUCKET_NAME")
            .unwrap_or_else(|| "property-images".to_string());
        let public_base_url = vars.get("STORAGE_PUBLIC_BASE_URL").unwrap_or_else(|| {
            format!("{supabase_url}/storage/v1/object/public/{bucket}")
        });

        let quality: f32 = vars.parsed("IMAGE_QUALITY", 0.85)?;
        if !(0.0..=1.0).contains(&quality) {
            return Err(ConfigError::Invalid {
                name: "IMAGE_QUALITY",
                value: quality.to_string(),
                reason: "must be between 0 and 1".into(),
            });
        }

        let reconcile_every = vars
            .parsed::<u64>("RECONCILE_INTERVAL_HOURS", 0)?
            .checked_mul(3600)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            database_url: vars.required("DATABASE_URL")?,
            bind_addr: vars.parsed("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 5555)))?,
            sentry_dsn: vars.get("SENTRY_DSN"),
            supabase_anon_key: vars.required("SUPABASE_ANON_KEY")?,
            s3: S3Config {
                endpoint: vars.required("S3_ENDPOINT")?,
                region: vars
                    .get("S3_REGION")
                    .unwrap_or_else(|| "us-east-1".to_string()),
                access_key_id: vars.required("S3_ACCESS_KEY_ID")?,
                secret_access_key: vars.required("S3_SECRET_ACCESS_KEY")?,
                bucket,
                public_base_url,
                max_rps: vars.parsed("S3_MAX_RPS", 50)?,
                max_concurrency: vars.parsed("S3_MAX_CONCURRENCY", 8)?,
            },
            supabase_url,
            stage: StagePolicy {
                max_items: vars.parsed("IMAGE_MAX_ITEMS", DEFAULT_MAX_ITEMS)?,
                max_file_bytes: vars.parsed("IMAGE_MAX_BYTES", MAX_IMAGE_BYTES)?,
            },
            transcode: TranscodeOptions {
                quality,
                max_width: vars.parsed("IMAGE_MAX_WIDTH", 1920)?,
                max_height: vars.parsed("IMAGE_MAX_HEIGHT", 1080)?,
            },
            commit: CommitSettings {
                upload_concurrency: vars.parsed("UPLOAD_CONCURRENCY", 3)?,
                session_margin: chrono::Duration::seconds(
                    vars.parsed("SESSION_REFRESH_MARGIN_SECS", 60)?,
                ),
            },
            reconcile: ReconcileSettings {
                batch_size: vars.parsed("CLEANUP_BATCH_SIZE", 10)?,
                batch_pause: Duration::from_millis(vars.parsed("CLEANUP_BATCH_PAUSE_MS", 500)?),
                ..ReconcileSettings::default()
            },
            reconcile_every,
            reconcile_auto_cleanup: vars.parsed("RECONCILE_AUTO_CLEANUP", false)?,
        })
    }
}
