//! Mapping persisted image references back to blob names.
//!
//! References are whatever public URL the store handed out when the image was uploaded.
//! The public prefix depends on the deployment, so it is discovered from the store itself
//! the first time it is needed and kept for the lifetime of the resolver.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::blob_store::BlobStore;

/// Name whose public URL is requested to learn the prefix. Never uploaded.
pub const URL_PROBE_NAME: &str = "__url_probe__.webp";

pub struct BlobNameResolver {
    store: Arc<dyn BlobStore>,
    base_url: OnceCell<String>,
}

impl BlobNameResolver {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            base_url: OnceCell::new(),
        }
    }

    /// Public URL prefix, ending in `/`.
    pub fn base_url(&self) -> &str {
        self.base_url.get_or_init(|| {
            let probe = self.store.public_url(URL_PROBE_NAME);
            let base = match probe.strip_suffix(URL_PROBE_NAME) {
                Some(base) => base.to_string(),
                None => {
                    warn!(%probe, "Public URL does not end with the probe name");
                    probe
                        .rfind('/')
                        .map(|i| probe[..=i].to_string())
                        .unwrap_or_default()
                }
            };
            debug!(%base, "Discovered storage base URL");
            base
        })
    }

    /// Blob name inside `reference`, or `None` when nothing plausible is found.
    ///
    /// Tried in order, first hit wins: the discovered base URL, a `/{bucket}/` path
    /// segment, a bare name, the last path segment if it has a file extension.
    pub fn extract(&self, reference: &str) -> Option<String> {
        let reference = strip_query(reference.trim());
        if reference.is_empty() {
            return None;
        }

        let base = self.base_url();
        if !base.is_empty() {
            if let Some(rest) = reference.strip_prefix(base) {
                return non_empty(rest);
            }
        }

        let token = format!("/{}/", self.store.bucket());
        if let Some(at) = reference.find(&token) {
            return non_empty(&reference[at + token.len()..]);
        }

        if !reference.contains("://") && !reference.contains('/') {
            return Some(reference.to_string());
        }

        let last = reference.rsplit('/').next()?;
        match last.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(last.to_string()),
            _ => None,
        }
    }

    /// Extracts every reference, logging the ones that yield no name.
    pub fn extract_all<'a, I>(&self, references: I) -> Extraction
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut out = Extraction::default();
        for reference in references {
            match self.extract(reference) {
                Some(name) => out.names.push(name),
                None => {
                    warn!(%reference, "Could not extract a blob name from image reference");
                    out.unresolved.push(reference.clone());
                }
            }
        }
        out
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub names: Vec<String>,
    pub unresolved: Vec<String>,
}

fn strip_query(reference: &str) -> &str {
    match reference.find(['?', '#']) {
        Some(at) => &reference[..at],
        None => reference,
    }
}

fn non_empty(name: &str) -> Option<String> {
    let name = name.trim_start_matches('/');
    (!name.is_empty()).then(|| name.to_string())
}
