//! The editable image list behind the create/edit property form.
//!
//! Nothing here talks to the network. Items are either images that already live in the
//! blob store ([`StagedImage::Remote`]) or files picked in this form session and not yet
//! uploaded ([`StagedImage::Local`]). The list is handed to the commit coordinator on
//! submit; until then it can be freely reordered and pruned.

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::image_file::{anonymize_filename, ImageFile, MAX_IMAGE_BYTES};
use crate::transcoder::ImageTranscoder;

pub const DEFAULT_MAX_ITEMS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StagedId(Uuid);

impl StagedId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for StagedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Hands out displayable handles for files that have no public URL yet.
pub trait PreviewAllocator: Send + Sync {
    fn allocate(&self, file: &ImageFile) -> String;
    fn release(&self, handle: &str);
}

/// Inline `data:` URLs. Nothing to free, so release is a no-op.
#[derive(Debug, Default)]
pub struct DataUrlPreviews;

impl PreviewAllocator for DataUrlPreviews {
    fn allocate(&self, file: &ImageFile) -> String {
        let mime = file.sniffed_mime().unwrap_or("application/octet-stream");
        format!("data:{mime};base64,{}", BASE64_STANDARD.encode(&file.bytes))
    }

    fn release(&self, _handle: &str) {}
}

/// A preview for a local item. Released exactly once, when the handle is dropped.
pub struct PreviewHandle {
    handle: String,
    allocator: Arc<dyn PreviewAllocator>,
}

impl PreviewHandle {
    pub fn as_str(&self) -> &str {
        &self.handle
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.allocator.release(&self.handle);
    }
}

impl fmt::Debug for PreviewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: String = self.handle.chars().take(32).collect();
        f.debug_tuple("PreviewHandle").field(&shown).finish()
    }
}

#[derive(Debug)]
pub enum StagedImage {
    /// Already stored; `url` is the persisted public reference.
    Remote { id: StagedId, url: String },
    /// Picked in this session, waiting for the commit to upload it.
    Local {
        id: StagedId,
        file: ImageFile,
        preview: PreviewHandle,
    },
}

impl StagedImage {
    pub fn id(&self) -> StagedId {
        match self {
            Self::Remote { id, .. } | Self::Local { id, .. } => *id,
        }
    }

    pub fn preview(&self) -> &str {
        match self {
            Self::Remote { url, .. } => url,
            Self::Local { preview, .. } => preview.as_str(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedFile {
    pub file_name: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct AddOutcome {
    pub added: Vec<StagedId>,
    pub rejected: Vec<RejectedFile>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("image limit exceeded: {current} staged + {incoming} new > {max}")]
    LimitExceeded {
        max: usize,
        current: usize,
        incoming: usize,
    },
    #[error("no staged image with id {0}")]
    UnknownItem(StagedId),
    #[error("position {index} is out of range for {len} images")]
    OutOfRange { index: usize, len: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct StagePolicy {
    pub max_items: usize,
    pub max_file_bytes: usize,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            max_file_bytes: MAX_IMAGE_BYTES,
        }
    }
}

pub struct StagedImageSet {
    items: Vec<StagedImage>,
    policy: StagePolicy,
    transcoder: ImageTranscoder,
    previews: Arc<dyn PreviewAllocator>,
    revision: watch::Sender<u64>,
}

impl StagedImageSet {
    pub fn new(
        policy: StagePolicy,
        transcoder: ImageTranscoder,
        previews: Arc<dyn PreviewAllocator>,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            items: Vec::new(),
            policy,
            transcoder,
            previews,
            revision,
        }
    }

    /// Seeds the set with a record's persisted references, in display order.
    pub fn with_existing<I, S>(
        policy: StagePolicy,
        transcoder: ImageTranscoder,
        previews: Arc<dyn PreviewAllocator>,
        urls: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new(policy, transcoder, previews);
        set.items.extend(urls.into_iter().map(|url| StagedImage::Remote {
            id: StagedId::generate(),
            url: url.into(),
        }));
        set
    }

    /// Receives the set's revision number after every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn items(&self) -> &[StagedImage] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pending_uploads(&self) -> usize {
        self.items.iter().filter(|item| item.is_local()).count()
    }

    /// Validates, transcodes and appends `files` in input order.
    ///
    /// Invalid files are reported one by one and skipped. If the valid ones would push
    /// the set past its limit, the whole batch is refused and nothing is added.
    pub fn add(&mut self, files: Vec<ImageFile>) -> Result<AddOutcome, StageError> {
        let mut outcome = AddOutcome::default();
        let mut accepted = Vec::with_capacity(files.len());

        for file in files {
            match self.check(&file) {
                Ok(()) => accepted.push(file),
                Err(reason) => {
                    debug!(
                        file = %anonymize_filename(&file.file_name),
                        %reason,
                        "Rejected staged image"
                    );
                    outcome.rejected.push(RejectedFile {
                        file_name: file.file_name,
                        reason,
                    });
                }
            }
        }

        if accepted.is_empty() {
            return Ok(outcome);
        }

        if self.items.len() + accepted.len() > self.policy.max_items {
            return Err(StageError::LimitExceeded {
                max: self.policy.max_items,
                current: self.items.len(),
                incoming: accepted.len(),
            });
        }

        for original in accepted {
            let file = match self.transcoder.transcode(&original) {
                Ok(converted) => converted,
                Err(err) => {
                    warn!(
                        file = %anonymize_filename(&original.file_name),
                        error = %err,
                        "Transcoding failed, staging the original file"
                    );
                    original
                }
            };
            let preview = PreviewHandle {
                handle: self.previews.allocate(&file),
                allocator: Arc::clone(&self.previews),
            };
            let id = StagedId::generate();
            self.items.push(StagedImage::Local { id, file, preview });
            outcome.added.push(id);
        }

        self.bump();
        Ok(outcome)
    }

    /// Appends an already-stored reference.
    pub fn add_remote(&mut self, url: impl Into<String>) -> Result<StagedId, StageError> {
        if self.items.len() >= self.policy.max_items {
            return Err(StageError::LimitExceeded {
                max: self.policy.max_items,
                current: self.items.len(),
                incoming: 1,
            });
        }
        let id = StagedId::generate();
        self.items.push(StagedImage::Remote {
            id,
            url: url.into(),
        });
        self.bump();
        Ok(id)
    }

    /// Excises one item in place. A local item's preview is released here.
    pub fn remove(&mut self, id: StagedId) -> Result<StagedImage, StageError> {
        let index = self
            .position(id)
            .ok_or(StageError::UnknownItem(id))?;
        let removed = self.items.remove(index);
        self.bump();
        Ok(removed)
    }

    /// Moves the item `id` so that it ends up at `to`.
    pub fn move_to(&mut self, id: StagedId, to: usize) -> Result<(), StageError> {
        let from = self
            .position(id)
            .ok_or(StageError::UnknownItem(id))?;
        if to >= self.items.len() {
            return Err(StageError::OutOfRange {
                index: to,
                len: self.items.len(),
            });
        }
        let item = self.items.remove(from);
        self.items.insert(to, item);
        self.bump();
        Ok(())
    }

    fn position(&self, id: StagedId) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    fn check(&self, file: &ImageFile) -> Result<(), String> {
        if !file.declares_image() {
            return Err(format!("unsupported file type '{}'", file.content_type));
        }
        if file.len() > self.policy.max_file_bytes {
            return Err(format!(
                "file is {} bytes, the limit is {} bytes",
                file.len(),
                self.policy.max_file_bytes
            ));
        }
        if file.is_empty() {
            return Err("file is empty".to_string());
        }
        Ok(())
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

impl fmt::Debug for StagedImageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedImageSet")
            .field("items", &self.items)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{jpeg_bytes, png_bytes, CountingPreviews};
    use crate::transcoder::TranscodeOptions;

    fn staged_set(previews: &Arc<CountingPreviews>) -> StagedImageSet {
        StagedImageSet::new(
            StagePolicy::default(),
            ImageTranscoder::new(TranscodeOptions {
                max_width: 800,
                ..TranscodeOptions::default()
            }),
            previews.clone(),
        )
    }

    fn small_png(name: &str) -> ImageFile {
        ImageFile::new(name, "image/png", png_bytes(8, 8))
    }

    fn names(set: &StagedImageSet) -> Vec<String> {
        set.items()
            .iter()
            .map(|item| match item {
                StagedImage::Remote { url, .. } => url.clone(),
                StagedImage::Local { file, .. } => file.file_name.clone(),
            })
            .collect()
    }

    #[test]
    fn add_transcodes_and_keeps_input_order() {
        let previews = Arc::new(CountingPreviews::default());
        let mut set = staged_set(&previews);

        let outcome = set
            .add(vec![
                ImageFile::new("A.png", "image/png", png_bytes(1600, 1200)),
                ImageFile::new("B.jpg", "image/jpeg", jpeg_bytes(600, 400)),
            ])
            .unwrap();

        assert_eq!(outcome.added.len(), 2);
        assert!(outcome.rejected.is_empty());
        assert_eq!(names(&set), vec!["A.webp", "B.webp"]);

        let dims: Vec<(u32, u32)> = set
            .items()
            .iter()
            .map(|item| match item {
                StagedImage::Local { file, .. } => {
                    let img = image::load_from_memory(&file.bytes).unwrap();
                    (img.width(), img.height())
                }
                StagedImage::Remote { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(dims, vec![(800, 600), (600, 400)]);
        assert_eq!(previews.allocated(), 2);
    }

    #[test]
    fn invalid_files_are_reported_individually() {
        let previews = Arc::new(CountingPreviews::default());
        let mut set = StagedImageSet::new(
            StagePolicy {
                max_items: 10,
                max_file_bytes: 1024,
            },
            ImageTranscoder::default(),
            previews.clone(),
        );

        let outcome = set
            .add(vec![
                ImageFile::new("notes.txt", "text/plain", b"hi".to_vec()),
                small_png("ok.png"),
                ImageFile::new("huge.png", "image/png", vec![0u8; 2048]),
            ])
            .unwrap();

        assert_eq!(outcome.added.len(), 1);
        let rejected: Vec<&str> = outcome
            .rejected
            .iter()
            .map(|r| r.file_name.as_str())
            .collect();
        assert_eq!(rejected, vec!["notes.txt", "huge.png"]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn exceeding_the_limit_rejects_the_whole_batch() {
        let previews = Arc::new(CountingPreviews::default());
        let mut set = StagedImageSet::with_existing(
            StagePolicy {
                max_items: 3,
                max_file_bytes: MAX_IMAGE_BYTES,
            },
            ImageTranscoder::default(),
            previews.clone(),
            ["u1", "u2"],
        );

        let err = set
            .add(vec![small_png("a.png"), small_png("b.png")])
            .unwrap_err();
        assert_eq!(
            err,
            StageError::LimitExceeded {
                max: 3,
                current: 2,
                incoming: 2
            }
        );
        assert_eq!(names(&set), vec!["u1", "u2"]);
        assert_eq!(previews.allocated(), 0);

        set.add(vec![small_png("a.png")]).unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.add_remote("u3").is_err());
    }

    #[test]
    fn remove_excises_in_place_and_releases_preview() {
        let previews = Arc::new(CountingPreviews::default());
        let mut set = StagedImageSet::with_existing(
            StagePolicy::default(),
            ImageTranscoder::default(),
            previews.clone(),
            ["u1"],
        );
        let added = set
            .add(vec![small_png("a.png"), small_png("b.png")])
            .unwrap()
            .added;
        set.add_remote("u2").unwrap();

        set.remove(added[0]).unwrap();
        assert_eq!(names(&set), vec!["u1", "b.webp", "u2"]);
        assert_eq!(previews.released(), 1);

        let remote_id = set.items()[0].id();
        set.remove(remote_id).unwrap();
        assert_eq!(names(&set), vec!["b.webp", "u2"]);
        assert_eq!(previews.released(), 1);

        assert!(matches!(
            set.remove(remote_id),
            Err(StageError::UnknownItem(_))
        ));
    }

    #[test]
    fn teardown_releases_every_local_preview_once() {
        let previews = Arc::new(CountingPreviews::default());
        {
            let mut set = staged_set(&previews);
            set.add(vec![small_png("a.png"), small_png("b.png"), small_png("c.png")])
                .unwrap();
            set.add_remote("u1").unwrap();
            let first = set.items()[0].id();
            set.remove(first).unwrap();
            assert_eq!(previews.released(), 1);
        }
        assert_eq!(previews.allocated(), 3);
        assert_eq!(previews.released(), 3);
        assert!(previews.no_double_release());
    }

    #[test]
    fn move_to_reorders_without_touching_others() {
        let previews = Arc::new(CountingPreviews::default());
        let mut set = StagedImageSet::with_existing(
            StagePolicy::default(),
            ImageTranscoder::default(),
            previews,
            ["u1", "u2", "u3", "u4"],
        );
        let last = set.items()[3].id();
        set.move_to(last, 0).unwrap();
        assert_eq!(names(&set), vec!["u4", "u1", "u2", "u3"]);
        assert!(matches!(
            set.move_to(last, 9),
            Err(StageError::OutOfRange { index: 9, len: 4 })
        ));
    }

    #[test]
    fn changes_are_broadcast() {
        let previews = Arc::new(CountingPreviews::default());
        let mut set = staged_set(&previews);
        let rx = set.subscribe();
        assert_eq!(*rx.borrow(), 0);

        let id = set.add_remote("u1").unwrap();
        set.add(vec![small_png("a.png")]).unwrap();
        set.remove(id).unwrap();
        assert_eq!(*rx.borrow(), 3);

        // A batch that only contains rejects is not a change.
        set.add(vec![ImageFile::new("x.txt", "text/plain", b"x".to_vec())])
            .unwrap();
        assert_eq!(*rx.borrow(), 3);
    }

    #[test]
    fn order_follows_operations_across_a_sequence() {
        let previews = Arc::new(CountingPreviews::default());
        let mut set = staged_set(&previews);
        let mut expected: Vec<String> = Vec::new();

        for round in 0..4 {
            let name = format!("r{round}.png");
            set.add(vec![small_png(&name)]).unwrap();
            expected.push(format!("r{round}.webp"));
            let url = format!("u{round}");
            set.add_remote(url.clone()).unwrap();
            expected.push(url);

            if round % 2 == 1 {
                let victim = set.items()[1].id();
                set.remove(victim).unwrap();
                expected.remove(1);
            }
        }
        assert_eq!(names(&set), expected);
    }
}
