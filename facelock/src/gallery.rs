use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_json::json;

use crate::error::{Error, LockResult};

/// Current cache schema. Bump whenever the on-disk layout changes;
/// older payloads are rebuilt, never migrated.
const SCHEMA_VERSION: u64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f64>);

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Euclidean distance to another embedding.
    pub fn distance(&self, other: &Self) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0.0, |p, (x, y)| (x - y).powi(2) + p)
            .sqrt()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    identity: String,
    display_name: String,
    embedding: Embedding,
}

impl GalleryEntry {
    pub fn new(identity: String, display_name: String, embedding: Embedding) -> Self {
        Self {
            identity,
            display_name,
            embedding,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }
}

/// Ordered set of known faces plus the provenance of the source images
/// it was built from. Rebuilds replace the whole value; entries are
/// never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    provenance: BTreeSet<String>,
}

impl Gallery {
    pub fn new(provenance: BTreeSet<String>) -> Self {
        Self {
            entries: Vec::new(),
            provenance,
        }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn provenance(&self) -> &BTreeSet<String> {
        &self.provenance
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// All embeddings in one gallery must have the same length.
    pub fn push(&mut self, entry: GalleryEntry) -> Result<()> {
        if let Some(first) = self.entries.first() {
            if first.embedding.len() != entry.embedding.len() {
                return Err(anyhow!(
                    "embedding length mismatch: gallery has {}, entry {} has {}",
                    first.embedding.len(),
                    entry.identity,
                    entry.embedding.len()
                ));
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Parse the persisted gallery cache. `Ok(None)` means no cache file;
    /// any malformed payload (including the legacy 4-list array format)
    /// is `StoreCorrupt` and the caller is expected to rebuild.
    pub fn load(path: &Path) -> LockResult<Option<Self>> {
        let f = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::StoreCorrupt(format!(
                    "failed to open {}: {e}",
                    path.display()
                )))
            }
        };
        let rdr = BufReader::new(f);
        let doc: serde_json::Value = serde_json::from_reader(rdr)
            .map_err(|e| Error::StoreCorrupt(format!("invalid json: {e}")))?;
        let gallery =
            Self::from_json(&doc).map_err(|e| Error::StoreCorrupt(format!("{e:#}")))?;
        Ok(Some(gallery))
    }

    fn from_json(doc: &serde_json::Value) -> Result<Self> {
        if doc.is_array() {
            // the old pickle-shaped cache: [embeddings, ids, names, files]
            return Err(anyhow!("legacy array-format cache"));
        }
        let schema = doc["schema"]
            .as_u64()
            .ok_or_else(|| anyhow!("missing schema tag"))?;
        if schema != SCHEMA_VERSION {
            return Err(anyhow!("unsupported schema version {schema}"));
        }
        let provenance = doc["provenance"]
            .as_array()
            .ok_or_else(|| anyhow!("missing 'provenance'"))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| anyhow!("non-string provenance key {v}"))
            })
            .collect::<Result<BTreeSet<_>>>()?;
        let identities = str_list(doc, "identities")?;
        let names = str_list(doc, "names")?;
        let embeddings = doc["embeddings"]
            .as_array()
            .ok_or_else(|| anyhow!("missing 'embeddings'"))?;
        if identities.len() != names.len() || identities.len() != embeddings.len() {
            return Err(anyhow!(
                "parallel list length mismatch: {} ids, {} names, {} embeddings",
                identities.len(),
                names.len(),
                embeddings.len()
            ));
        }
        let mut gallery = Gallery::new(provenance);
        for ((identity, name), emb) in identities.into_iter().zip(names).zip(embeddings) {
            let values = emb
                .as_array()
                .ok_or_else(|| anyhow!("embedding is not an array"))?
                .iter()
                .map(|f| f.as_f64().ok_or_else(|| anyhow!("invalid f64 {f}")))
                .collect::<Result<Vec<f64>>>()?;
            gallery.push(GalleryEntry::new(identity, name, Embedding::new(values)))?;
        }
        Ok(gallery)
    }

    /// Persist with write-temp-then-rename so a crash mid-write never
    /// leaves a truncated cache behind.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| anyhow!("cache path {} has no parent dir", path.display()))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating cache dir {}", dir.display()))?;
        let tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("temp file in {}", dir.display()))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, &self.as_json())?;
            writer.flush()?;
        }
        tmp.persist(path)
            .with_context(|| format!("renaming cache into {}", path.display()))?;
        log::info!("written {} entries to {}", self.entries.len(), path.display());
        Ok(())
    }

    fn as_json(&self) -> serde_json::Value {
        json!({
            "schema": SCHEMA_VERSION,
            "provenance": self.provenance.iter().collect::<Vec<_>>(),
            "identities": self.entries.iter().map(|e| &e.identity).collect::<Vec<_>>(),
            "names": self.entries.iter().map(|e| &e.display_name).collect::<Vec<_>>(),
            "embeddings": self.entries.iter().map(|e| &e.embedding.0).collect::<Vec<_>>(),
        })
    }
}

fn str_list(doc: &serde_json::Value, key: &str) -> Result<Vec<String>> {
    doc[key]
        .as_array()
        .ok_or_else(|| anyhow!("missing '{key}'"))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| anyhow!("non-string value in '{key}': {v}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Gallery {
        let mut g = Gallery::new(BTreeSet::from(["a.jpg".to_string(), "b.jpg".to_string()]));
        g.push(GalleryEntry::new(
            "u1".into(),
            "Alice".into(),
            Embedding::new(vec![0.0, 0.0]),
        ))
        .unwrap();
        g.push(GalleryEntry::new(
            "u2".into(),
            "Bob".into(),
            Embedding::new(vec![10.0, 10.0]),
        ))
        .unwrap();
        g
    }

    #[test]
    fn distance_is_euclidean() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.distance(&b) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut g = sample();
        let res = g.push(GalleryEntry::new(
            "u3".into(),
            "Carol".into(),
            Embedding::new(vec![1.0, 2.0, 3.0]),
        ));
        assert!(res.is_err());
    }

    #[test]
    fn round_trip_preserves_order_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        let g = sample();
        g.persist(&path).unwrap();
        let loaded = Gallery::load(&path).unwrap().unwrap();
        assert_eq!(loaded, g);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let res = Gallery::load(&dir.path().join("nope.json")).unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn legacy_array_cache_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        // 4-list tuple from the old cache format
        std::fs::write(
            &path,
            r#"[[[0.1, 0.2]], ["u1"], ["Alice"], ["faces/u1/a.jpg"]]"#,
        )
        .unwrap();
        assert!(matches!(
            Gallery::load(&path),
            Err(Error::StoreCorrupt(_))
        ));
    }

    #[test]
    fn unknown_schema_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(
            &path,
            r#"{"schema": 9, "provenance": [], "identities": [], "names": [], "embeddings": []}"#,
        )
        .unwrap();
        assert!(matches!(
            Gallery::load(&path),
            Err(Error::StoreCorrupt(_))
        ));
    }

    #[test]
    fn mismatched_lists_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(
            &path,
            r#"{"schema": 2, "provenance": [], "identities": ["u1"], "names": [], "embeddings": [[0.0]]}"#,
        )
        .unwrap();
        assert!(matches!(
            Gallery::load(&path),
            Err(Error::StoreCorrupt(_))
        ));
    }

    #[test]
    fn garbage_is_corrupt_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(&path, "not json at all {{{").unwrap();
        assert!(matches!(
            Gallery::load(&path),
            Err(Error::StoreCorrupt(_))
        ));
    }
}
