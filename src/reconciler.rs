//! Orphan detection and cleanup for the image bucket.
//!
//! `analyze` lists every blob and every reference held by a property row and diffs the
//! two. `cleanup` deletes the difference in small throttled batches once the analysis
//! passes two sanity checks:
//! - no references at all while the bucket is non-empty means name extraction is broken,
//!   so nothing is deleted, not even in a dry run.
//! - more than 90% of the bucket flagged as orphans needs a human to look first. Dry runs
//!   still report.
//!
//! Blobs uploaded by a commit that has not written its record yet look like orphans. The
//! periodic task only reports unless auto cleanup is switched on.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::blob_names::BlobNameResolver;
use crate::blob_store::{is_placeholder, BlobStore, StoreError};
use crate::commit::InFlight;
use crate::property_repository::{PropertyStore, RepoError};

const ORPHAN_REFUSAL_RATIO: f64 = 0.9;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("listing the bucket failed: {0}")]
    Store(#[from] StoreError),
    #[error("reading image references failed: {0}")]
    Repo(#[from] RepoError),
    #[error(
        "refusing cleanup: no image references found but {stored} files are stored; \
         name extraction is probably broken"
    )]
    NoReferences { stored: usize },
    #[error(
        "refusing cleanup: {orphans} of {stored} files look orphaned; review manually \
         or run a dry run first"
    )]
    TooManyOrphans { orphans: usize, stored: usize },
    #[error("a storage reconciliation is already running")]
    AlreadyRunning,
}

impl ReconcileError {
    /// Safety refusal, as opposed to an I/O failure.
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::NoReferences { .. } | Self::TooManyOrphans { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub reference_page_size: i64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause: Duration::from_millis(500),
            reference_page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageAnalysis {
    pub stored: BTreeSet<String>,
    pub referenced: BTreeSet<String>,
    pub orphans: BTreeSet<String>,
    /// References no name could be extracted from.
    pub unresolved_references: usize,
}

impl StorageAnalysis {
    pub fn new(stored: BTreeSet<String>, referenced: BTreeSet<String>) -> Self {
        let orphans = stored.difference(&referenced).cloned().collect();
        Self {
            stored,
            referenced,
            orphans,
            unresolved_references: 0,
        }
    }

    pub fn health(&self) -> StorageHealth {
        let orphaned_images = self.orphans.len();
        StorageHealth {
            total_files: self.stored.len(),
            referenced_images: self.stored.intersection(&self.referenced).count(),
            orphaned_images,
            broken_references: self.referenced.difference(&self.stored).count(),
            health: HealthGrade::from_orphans(orphaned_images),
        }
    }

    fn check_safety(&self, dry_run: bool) -> Result<(), ReconcileError> {
        if self.referenced.is_empty() && !self.stored.is_empty() {
            return Err(ReconcileError::NoReferences {
                stored: self.stored.len(),
            });
        }
        let ratio = if self.stored.is_empty() {
            0.0
        } else {
            self.orphans.len() as f64 / self.stored.len() as f64
        };
        if !dry_run && ratio > ORPHAN_REFUSAL_RATIO {
            return Err(ReconcileError::TooManyOrphans {
                orphans: self.orphans.len(),
                stored: self.stored.len(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthGrade {
    Excellent,
    Good,
    Fair,
    NeedsAttention,
}

impl HealthGrade {
    pub fn from_orphans(orphans: usize) -> Self {
        match orphans {
            0 => Self::Excellent,
            1..=4 => Self::Good,
            5..=19 => Self::Fair,
            _ => Self::NeedsAttention,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageHealth {
    pub total_files: usize,
    pub referenced_images: usize,
    pub orphaned_images: usize,
    pub broken_references: usize,
    pub health: HealthGrade,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    /// Deleted blobs, or the ones that would be deleted in a dry run.
    pub deleted_count: usize,
    pub errors: Vec<String>,
}

pub struct ReferenceReconciler {
    store: Arc<dyn BlobStore>,
    records: Arc<dyn PropertyStore>,
    names: BlobNameResolver,
    settings: ReconcileSettings,
    in_flight: AtomicBool,
}

impl ReferenceReconciler {
    pub fn new(
        store: Arc<dyn BlobStore>,
        records: Arc<dyn PropertyStore>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            names: BlobNameResolver::new(store.clone()),
            store,
            records,
            settings,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn names(&self) -> &BlobNameResolver {
        &self.names
    }

    /// Read-only diff of the bucket against every stored reference.
    pub async fn analyze(&self) -> Result<StorageAnalysis, ReconcileError> {
        let _guard = self.acquire()?;
        self.scan().await
    }

    /// Deletes `analysis.orphans`, or only counts them when `dry_run` is set.
    pub async fn cleanup(
        &self,
        analysis: &StorageAnalysis,
        dry_run: bool,
    ) -> Result<CleanupReport, ReconcileError> {
        let _guard = self.acquire()?;
        self.delete_orphans(analysis, dry_run).await
    }

    /// Fresh analysis followed by cleanup, under a single in-flight guard.
    pub async fn run(&self, dry_run: bool) -> Result<CleanupReport, ReconcileError> {
        let _guard = self.acquire()?;
        let analysis = self.scan().await?;
        self.delete_orphans(&analysis, dry_run).await
    }

    pub async fn health(&self) -> Result<StorageHealth, ReconcileError> {
        Ok(self.analyze().await?.health())
    }

    fn acquire(&self) -> Result<InFlight<'_>, ReconcileError> {
        InFlight::acquire(&self.in_flight).ok_or_else(|| {
            info!("Storage reconciliation already running, ignoring request");
            ReconcileError::AlreadyRunning
        })
    }

    async fn scan(&self) -> Result<StorageAnalysis, ReconcileError> {
        let stored = self.stored_names().await?;
        let (referenced, unresolved) = self.referenced_names().await?;

        let mut analysis = StorageAnalysis::new(stored, referenced);
        analysis.unresolved_references = unresolved;

        sentry::add_breadcrumb(sentry::Breadcrumb {
            category: Some("storage_reconcile".into()),
            message: Some(format!(
                "Scan complete. {} stored, {} referenced, {} orphans, {} unresolved references",
                analysis.stored.len(),
                analysis.referenced.len(),
                analysis.orphans.len(),
                unresolved
            )),
            level: sentry::Level::Info,
            ..Default::default()
        });
        info!(
            stored = analysis.stored.len(),
            referenced = analysis.referenced.len(),
            orphans = analysis.orphans.len(),
            unresolved,
            "Storage analysis complete"
        );
        Ok(analysis)
    }

    async fn stored_names(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut names = BTreeSet::new();
        let mut continuation = None;
        loop {
            let page = self.store.list_page(continuation.take()).await?;
            names.extend(page.names.into_iter().filter(|n| !is_placeholder(n)));
            match page.next {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        Ok(names)
    }

    async fn referenced_names(&self) -> Result<(BTreeSet<String>, usize), RepoError> {
        let page_size = self.settings.reference_page_size.max(1);
        let mut names = BTreeSet::new();
        let mut unresolved = 0;
        let mut offset = 0;
        loop {
            let page = self.records.image_references(offset, page_size).await?;
            let rows = page.len() as i64;
            for references in &page {
                let extracted = self.names.extract_all(references);
                unresolved += extracted.unresolved.len();
                names.extend(extracted.names);
            }
            if rows < page_size {
                break;
            }
            offset += rows;
        }
        Ok((names, unresolved))
    }

    async fn delete_orphans(
        &self,
        analysis: &StorageAnalysis,
        dry_run: bool,
    ) -> Result<CleanupReport, ReconcileError> {
        if let Err(err) = analysis.check_safety(dry_run) {
            warn!(error = %err, dry_run, "Cleanup refused");
            sentry::capture_message(&format!("Storage cleanup refused: {err}"), sentry::Level::Warning);
            return Err(err);
        }

        let orphans: Vec<String> = analysis.orphans.iter().cloned().collect();
        if dry_run {
            sentry::add_breadcrumb(sentry::Breadcrumb {
                category: Some("storage_reconcile".into()),
                message: Some(format!("[DRY RUN] Would delete {} orphaned images", orphans.len())),
                level: sentry::Level::Info,
                ..Default::default()
            });
            info!(orphans = orphans.len(), "[DRY RUN] Would delete orphaned images");
            return Ok(CleanupReport {
                dry_run: true,
                deleted_count: orphans.len(),
                errors: Vec::new(),
            });
        }

        let mut report = CleanupReport::default();
        let batches: Vec<&[String]> = orphans.chunks(self.settings.batch_size.max(1)).collect();
        for (i, batch) in batches.iter().enumerate() {
            if i > 0 && !self.settings.batch_pause.is_zero() {
                tokio::time::sleep(self.settings.batch_pause).await;
            }

            match self.store.remove(batch).await {
                Ok(outcome) => {
                    report.deleted_count += outcome.deleted.len();
                    for (name, reason) in outcome.failed {
                        report.errors.push(format!("{name}: {reason}"));
                    }
                }
                Err(err) => {
                    error!(batch = i, size = batch.len(), error = %err, "Orphan batch delete failed");
                    report
                        .errors
                        .push(format!("batch {} ({} files): {err}", i + 1, batch.len()));
                }
            }
        }

        sentry::add_breadcrumb(sentry::Breadcrumb {
            category: Some("storage_reconcile".into()),
            message: Some(format!(
                "Orphan cleanup finished. Deleted {}, {} errors",
                report.deleted_count,
                report.errors.len()
            )),
            level: sentry::Level::Info,
            ..Default::default()
        });
        if !report.errors.is_empty() {
            sentry::capture_message(
                &format!(
                    "Storage cleanup: {} of {} deletions failed",
                    report.errors.len(),
                    orphans.len()
                ),
                sentry::Level::Warning,
            );
        }
        info!(deleted = report.deleted_count, errors = report.errors.len(), "Orphan cleanup finished");
        Ok(report)
    }
}

/// Reports storage health every `every`; with `auto_cleanup` also deletes orphans.
pub fn spawn_periodic(
    reconciler: Arc<ReferenceReconciler>,
    every: Duration,
    auto_cleanup: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately; skip it so startup is not slowed down.
        interval.tick().await;

        loop {
            interval.tick().await;

            let outcome = if auto_cleanup {
                reconciler.run(false).await.map(|report| {
                    info!(deleted = report.deleted_count, "Scheduled orphan cleanup done");
                })
            } else {
                reconciler.health().await.map(|health| {
                    info!(
                        total = health.total_files,
                        orphans = health.orphaned_images,
                        broken = health.broken_references,
                        grade = ?health.health,
                        "Scheduled storage health check"
                    );
                })
            };

            match outcome {
                Ok(()) | Err(ReconcileError::AlreadyRunning) => {}
                Err(err) if err.is_refusal() => warn!(error = %err, "Scheduled cleanup refused"),
                Err(err) => {
                    sentry::capture_message(
                        &format!("Scheduled storage reconciliation failed: {err}"),
                        sentry::Level::Error,
                    );
                }
            }
        }
    })
}
