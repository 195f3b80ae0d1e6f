//! S3-compatible [`BlobStore`] for the Supabase Storage bucket.
//!
//! Every request goes through the shared [`S3Throttle`] and a bounded retry on
//! throttling and 5xx responses. Failures are logged to Sentry grouped by operation, so
//! a single outage does not fan out into one issue per object key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use bytes::Bytes;
use md5::{Digest, Md5};
use sentry::Level;
use tokio::time::sleep;
use tracing::debug;

use crate::blob_store::{BlobPage, BlobStore, RemoveReport, StoreError};
use crate::s3_throttle::S3Throttle;

const MAX_RETRIES: usize = 3;
const BASE_BACKOFF_MS: u64 = 120;
const CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

#[derive(Debug, Clone, PartialEq, Eq)]
enum S3OpError {
    TooManyRequests,
    NotFound,
    Forbidden,
    TooLarge,
    Unavailable(Option<u16>),
    Other(String, Option<u16>),
}

impl From<S3OpError> for StoreError {
    fn from(err: S3OpError) -> Self {
        match err {
            S3OpError::Forbidden => StoreError::Unauthorized,
            S3OpError::TooLarge => StoreError::QuotaExceeded,
            S3OpError::NotFound => StoreError::NotFound,
            S3OpError::TooManyRequests => StoreError::Transient("rate limited".into()),
            S3OpError::Unavailable(Some(status)) => {
                StoreError::Transient(format!("status {status}"))
            }
            S3OpError::Unavailable(None) => StoreError::Transient("no response".into()),
            S3OpError::Other(msg, Some(status)) => {
                StoreError::Other(format!("status {status}: {msg}"))
            }
            S3OpError::Other(msg, None) => StoreError::Other(msg),
        }
    }
}

fn parse_retry_delay<E>(err: &SdkError<E>) -> Option<Duration> {
    let headers = err.raw_response()?.headers();

    // Seconds only; HTTP-date values are ignored.
    if let Some(secs) = headers
        .get("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }

    for key in ["ratelimit-reset", "x-ratelimit-reset", "x-rate-limit-reset"] {
        if let Some(secs) = headers.get(key).and_then(|v| v.trim().parse::<f64>().ok()) {
            if secs.is_finite() && secs >= 0.0 {
                return Some(Duration::from_secs_f64(secs));
            }
        }
    }

    None
}

fn backoff(attempt: usize) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS * 2u64.saturating_pow(attempt as u32))
}

fn classify<E: std::fmt::Debug>(err: &SdkError<E>) -> S3OpError {
    let status = err.raw_response().map(|r| r.status().as_u16());
    match status {
        Some(401 | 403) => S3OpError::Forbidden,
        Some(404) => S3OpError::NotFound,
        Some(413) => S3OpError::TooLarge,
        Some(429) => S3OpError::TooManyRequests,
        Some(500..=599) => S3OpError::Unavailable(status),
        None if matches!(err, SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)) => {
            S3OpError::Unavailable(None)
        }
        _ => S3OpError::Other(format!("{err:?}"), status),
    }
}

fn log_s3_error(op: &str, bucket: &str, key: Option<&str>, err: &S3OpError) {
    let location = key
        .map(|k| format!("{bucket}/{k}"))
        .unwrap_or_else(|| bucket.to_string());

    sentry::add_breadcrumb(sentry::Breadcrumb {
        category: Some("s3_ops".into()),
        message: Some(format!("s3_ops {op} failed for {location}: {err:?}")),
        level: Level::Warning,
        ..Default::default()
    });

    // Keys are left out so Sentry groups by operation.
    let grouped = match err {
        S3OpError::TooManyRequests => format!("s3_ops {op} TooManyRequests"),
        S3OpError::NotFound => format!("s3_ops {op} NotFound"),
        S3OpError::Forbidden => format!("s3_ops {op} Forbidden"),
        S3OpError::TooLarge => format!("s3_ops {op} TooLarge"),
        S3OpError::Unavailable(_) => format!("s3_ops {op} Unavailable"),
        S3OpError::Other(_, Some(status)) => format!("s3_ops {op} status {status}"),
        S3OpError::Other(_, None) => format!("s3_ops {op} Other"),
    };

    match err {
        S3OpError::Forbidden | S3OpError::NotFound | S3OpError::Other(..) => {
            sentry::capture_message(&grouped, Level::Error);
        }
        S3OpError::TooManyRequests | S3OpError::Unavailable(_) => {
            sentry::capture_message(&grouped, Level::Warning);
        }
        S3OpError::TooLarge => {}
    }
}

pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_base_url: String,
    throttle: Arc<S3Throttle>,
}

impl S3BlobStore {
    /// `public_base_url` is the prefix public object URLs start with, e.g.
    /// `https://<project>.supabase.co/storage/v1/object/public/<bucket>`.
    pub fn new(
        client: aws_sdk_s3::Client,
        bucket: impl Into<String>,
        public_base_url: &str,
        throttle: Arc<S3Throttle>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            throttle,
        }
    }

    async fn call_with_retry<T, E, F, Fut>(&self, make_call: F) -> Result<T, S3OpError>
    where
        E: std::fmt::Debug,
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, SdkError<E>>>,
    {
        let mut attempt = 0;
        loop {
            let _slot = self
                .throttle
                .acquire()
                .await
                .map_err(|e| S3OpError::Other(e.to_string(), None))?;

            let err = match make_call().await {
                Ok(res) => return Ok(res),
                Err(err) => err,
            };

            let classified = classify(&err);
            let retryable = matches!(
                classified,
                S3OpError::TooManyRequests | S3OpError::Unavailable(_)
            );
            if !retryable || attempt >= MAX_RETRIES {
                return Err(classified);
            }

            attempt += 1;
            let delay = match parse_retry_delay(&err) {
                Some(h) if h > backoff(attempt) => h,
                _ => backoff(attempt),
            };
            debug!(attempt, ?delay, error = ?classified, "Retrying storage request");
            drop(_slot);
            sleep(delay).await;
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn public_url(&self, name: &str) -> String {
        format!("{}/{}", self.public_base_url, name)
    }

    async fn upload(&self, name: &str, content_type: &str, body: Bytes) -> Result<(), StoreError> {
        let content_md5 = BASE64_STANDARD.encode(Md5::digest(&body));
        let content_length = i64::try_from(body.len())
            .map_err(|_| StoreError::QuotaExceeded)?;

        let res = self
            .call_with_retry(|| {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(name)
                    .content_length(content_length)
                    .content_type(content_type)
                    .content_md5(content_md5.clone())
                    .cache_control(CACHE_CONTROL)
                    .body(ByteStream::from(body.clone()))
                    .send()
            })
            .await;

        res.map(|_| ()).map_err(|err| {
            log_s3_error("put_object", &self.bucket, Some(name), &err);
            err.into()
        })
    }

    async fn list_page(&self, continuation: Option<String>) -> Result<BlobPage, StoreError> {
        let res = self
            .call_with_retry(|| {
                self.client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .set_continuation_token(continuation.clone())
                    .send()
            })
            .await;

        let output = res.map_err(|err| {
            log_s3_error("list_objects_v2", &self.bucket, None, &err);
            StoreError::from(err)
        })?;

        let names = output
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_string))
            .collect();
        let next = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(BlobPage { names, next })
    }

    async fn remove(&self, names: &[String]) -> Result<RemoveReport, StoreError> {
        if names.is_empty() {
            return Ok(RemoveReport::default());
        }

        let objects = names
            .iter()
            .map(|name| ObjectIdentifier::builder().key(name).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(false)
            .build()
            .map_err(|e| StoreError::Other(e.to_string()))?;

        let res = self
            .call_with_retry(|| {
                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete.clone())
                    .send()
            })
            .await;

        let output = res.map_err(|err| {
            log_s3_error("delete_objects", &self.bucket, None, &err);
            StoreError::from(err)
        })?;

        let failed: Vec<(String, String)> = output
            .errors()
            .iter()
            .map(|e| {
                (
                    e.key().unwrap_or_default().to_string(),
                    format!(
                        "{}: {}",
                        e.code().unwrap_or("Unknown"),
                        e.message().unwrap_or("no message")
                    ),
                )
            })
            .collect();
        let deleted = output
            .deleted()
            .iter()
            .filter_map(|d| d.key().map(str::to_string))
            .collect();

        Ok(RemoveReport { deleted, failed })
    }
}
