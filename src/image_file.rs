use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Hard cap on a single image, both before transcoding and at upload time.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024; // 5 MiB

pub const WEBP_MIME: &str = "image/webp";

const MIME_TO_EXTENSION: [(&str, &str); 8] = [
    ("image/webp", "webp"),
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/avif", "avif"),
    ("image/bmp", "bmp"),
    ("image/tiff", "tiff"),
    ("image/heic", "heic"),
];

static UNSAFE_NAME_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9_-]+").unwrap());
static REPEATED_DASHES: Lazy<Regex> = Lazy::new(|| Regex::new(r"-{2,}").unwrap());

const MAX_STEM_CHARS: usize = 48;

/// An image held in memory: what the admin form sends, and what the transcoder emits.
///
/// `content_type` is the declared type. Use [`ImageFile::sniffed_mime`] when the
/// actual encoding matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl ImageFile {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Declared MIME type says "image/...".
    pub fn declares_image(&self) -> bool {
        self.content_type
            .trim()
            .to_ascii_lowercase()
            .starts_with("image/")
    }

    /// MIME type detected from the magic bytes, if it is an image we recognise.
    pub fn sniffed_mime(&self) -> Option<&'static str> {
        if looks_like_webp(&self.bytes) {
            return Some(WEBP_MIME);
        }
        infer::get(&self.bytes)
            .filter(|kind| matches!(kind.matcher_type(), infer::MatcherType::Image))
            .map(|kind| kind.mime_type())
    }

    pub fn is_webp(&self) -> bool {
        looks_like_webp(&self.bytes)
    }

    /// Stem of the original file name, without directories or extension.
    pub fn stem(&self) -> &str {
        let base = self
            .file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.file_name.as_str());
        match base.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => base,
        }
    }
}

// WebP format: "RIFF" [4 bytes size] "WEBP" ...
fn looks_like_webp(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP"
}

pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let mime = mime.trim().to_ascii_lowercase();
    MIME_TO_EXTENSION
        .iter()
        .find(|(m, _)| *m == mime)
        .map(|(_, ext)| *ext)
}

/// Lowercase, ASCII-only version of a file stem that is safe inside an object key.
pub fn sanitize_stem(stem: &str) -> String {
    let lowered = stem.trim().to_lowercase();
    let replaced = UNSAFE_NAME_CHARS.replace_all(&lowered, "-");
    let collapsed = REPEATED_DASHES.replace_all(&replaced, "-");
    let trimmed: String = collapsed
        .trim_matches(|c| c == '-' || c == '_')
        .chars()
        .take(MAX_STEM_CHARS)
        .collect();
    let trimmed = trimmed.trim_end_matches(|c| c == '-' || c == '_');

    if trimmed.is_empty() {
        "image".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Hash a file name for Sentry so user-provided names never leave the process.
pub fn anonymize_filename(filename: &str) -> String {
    let extension = filename.rsplit('.').next().unwrap_or("");

    let mut hasher = DefaultHasher::new();
    filename.hash(&mut hasher);
    let hash = hasher.finish();

    if extension.is_empty() || extension == filename {
        format!("file_{hash:x}")
    } else {
        format!("file_{hash:x}.{extension}")
    }
}
