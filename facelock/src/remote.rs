use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use reqwest::blocking::Client;

/// Mirror of the hosted face corpus. The backend publishes a
/// `manifest.json` (array of file names) next to the images; sync pulls
/// only the files missing locally. Credentials and bucket wiring live with
/// whatever serves `base_url` - this side speaks plain HTTP with bounded
/// timeouts.
pub struct RemoteCorpus {
    base_url: String,
    client: Client,
}

/// Validate and extract the manifest file list. Entries must be bare file
/// names - no path separators, nothing that escapes the corpus dir.
fn parse_manifest(doc: &serde_json::Value) -> Result<Vec<String>> {
    doc.as_array()
        .ok_or_else(|| anyhow!("manifest is not an array"))?
        .iter()
        .map(|v| {
            let name = v
                .as_str()
                .ok_or_else(|| anyhow!("non-string manifest entry {v}"))?;
            if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
                return Err(anyhow!("unsafe manifest entry {name:?}"));
            }
            Ok(name.to_owned())
        })
        .collect()
}

impl RemoteCorpus {
    pub fn new(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building corpus http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    fn fetch_manifest(&self) -> Result<Vec<String>> {
        let url = format!("{}/manifest.json", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("fetching {url}"))?;
        let doc: serde_json::Value = serde_json::from_reader(resp).context("parsing manifest")?;
        parse_manifest(&doc)
    }

    /// Download files the local corpus is missing. Per-file failures are
    /// logged and skipped; recognition proceeds on whatever is present.
    /// Returns the number of files downloaded.
    pub fn sync(&self, dir: &Path) -> Result<usize> {
        let manifest = self.fetch_manifest()?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating corpus dir {}", dir.display()))?;
        let mut downloaded = 0;
        for name in manifest {
            let local = dir.join(&name);
            if local.exists() {
                debug!("already have {name}");
                continue;
            }
            let url = format!("{}/{}", self.base_url, name);
            let mut resp = match self.client.get(&url).send().and_then(|r| r.error_for_status()) {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("could not download {name}: {e}");
                    continue;
                }
            };
            let tmp = match tempfile::NamedTempFile::new_in(dir) {
                Ok(tmp) => tmp,
                Err(e) => {
                    warn!("could not stage {name}: {e}");
                    continue;
                }
            };
            if let Err(e) = std::io::copy(&mut resp, &mut tmp.as_file()) {
                warn!("download of {name} interrupted: {e}");
                continue;
            }
            if let Err(e) = tmp.persist(&local) {
                warn!("could not place {name}: {e}");
                continue;
            }
            info!("downloaded {name}");
            downloaded += 1;
        }
        Ok(downloaded)
    }
}
