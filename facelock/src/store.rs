use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::error::{Error, LockResult};
use crate::extractor::EmbeddingExtractor;
use crate::gallery::{Gallery, GalleryEntry};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// One source image of the corpus, identified by its file name (the
/// provenance key).
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub key: String,
    pub identity: String,
    pub display_name: String,
    pub path: PathBuf,
}

/// Extract `(identity, display_name)` from a corpus file name of the form
/// `<identity>_<Name_With_Underscores>_<pose>_<n>.<ext>`. The middle
/// segments joined with spaces are the display name.
fn parse_source_name(file_name: &str) -> Option<(String, String)> {
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 4 {
        return None;
    }
    let identity = parts[0].to_owned();
    let display_name = parts[1..parts.len() - 2].join(" ");
    Some((identity, display_name))
}

/// Keeps the in-memory gallery consistent with the cache file and the
/// source corpus. Rebuilds produce a fresh `Gallery` value; nothing here
/// mutates a gallery that a session may be matching against.
pub struct GalleryStore {
    cache_path: PathBuf,
    corpus_dir: PathBuf,
}

impl GalleryStore {
    pub fn new(cache_path: PathBuf, corpus_dir: PathBuf) -> Self {
        Self {
            cache_path,
            corpus_dir,
        }
    }

    /// List the corpus, skipping unparseable file names with a warning.
    fn scan(&self) -> Result<Vec<SourceImage>> {
        let mut sources = Vec::new();
        let entries = match std::fs::read_dir(&self.corpus_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sources),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.corpus_dir.display()))
            }
        };
        let mut names: Vec<(String, PathBuf)> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let path = entry.path();
                let ext = path.extension()?.to_str()?.to_ascii_lowercase();
                if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                    return None;
                }
                Some((entry.file_name().to_string_lossy().into_owned(), path))
            })
            .collect();
        names.sort();
        for (key, path) in names {
            let Some((identity, display_name)) = parse_source_name(&key) else {
                warn!("skipping corpus file with unparseable name: {key}");
                continue;
            };
            sources.push(SourceImage {
                key,
                identity,
                display_name,
                path,
            });
        }
        Ok(sources)
    }

    /// The set of source keys a rebuild would incorporate. Two equal
    /// provenance values mean a rebuild would produce the same entry set.
    pub fn provenance(&self) -> Result<BTreeSet<String>> {
        Ok(self.scan()?.into_iter().map(|s| s.key).collect())
    }

    /// Load the persisted gallery if it is intact and its provenance still
    /// matches the corpus; otherwise run a full rebuild.
    pub fn load_or_rebuild(&self, extractor: &dyn EmbeddingExtractor) -> LockResult<Gallery> {
        match Gallery::load(&self.cache_path) {
            Ok(Some(gallery)) => {
                let current = self.provenance()?;
                if gallery.provenance() == &current {
                    info!(
                        "loaded {} entries from cache {}",
                        gallery.len(),
                        self.cache_path.display()
                    );
                    return Ok(gallery);
                }
                info!("corpus changed since last rebuild, rebuilding gallery");
            }
            Ok(None) => {
                info!("no gallery cache at {}", self.cache_path.display());
            }
            Err(Error::StoreCorrupt(reason)) => {
                // Legacy or damaged caches are dropped, not migrated. Lossy:
                // entries are re-derived from the source images.
                warn!("gallery cache unusable ({reason}), deleting and rebuilding");
                if let Err(e) = std::fs::remove_file(&self.cache_path) {
                    warn!("could not delete stale cache: {e}");
                }
            }
            Err(e) => return Err(e),
        }
        self.rebuild(extractor)
    }

    /// Full rebuild pass over the corpus. Images with no detectable face
    /// are skipped (expected); zero surviving entries is
    /// `NoGalleryAvailable` since recognition cannot start on an empty
    /// gallery.
    pub fn rebuild(&self, extractor: &dyn EmbeddingExtractor) -> LockResult<Gallery> {
        let sources = self.scan()?;
        let provenance: BTreeSet<String> = sources.iter().map(|s| s.key.clone()).collect();
        let mut gallery = Gallery::new(provenance);
        for source in sources {
            let img = match image::open(&source.path) {
                Ok(img) => img,
                Err(e) => {
                    warn!("could not read {}: {e}", source.path.display());
                    continue;
                }
            };
            match extractor.extract(&img) {
                Ok(Some(embedding)) => {
                    gallery.push(GalleryEntry::new(
                        source.identity.clone(),
                        source.display_name.clone(),
                        embedding,
                    ))?;
                    debug!("added {} ({}) from {}", source.identity, source.display_name, source.key);
                }
                Ok(None) => {
                    debug!("no face in {}, skipped", source.key);
                }
                Err(e) => {
                    warn!("extraction failed for {}: {e}", source.key);
                }
            }
        }
        if gallery.is_empty() {
            return Err(Error::NoGalleryAvailable);
        }
        gallery.persist(&self.cache_path)?;
        Ok(gallery)
    }
}
