//! Local filesystem blob fetcher.
//!
//! Resolves a resource URL to a local path and, for text modalities, the
//! decoded text. Only `file://` URLs and plain paths are supported; remote
//! fetching belongs to the host application.

use std::path::{Path, PathBuf};

use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::types::Modality;

/// Filesystem-backed resource fetcher rooted at a resources directory.
#[derive(Debug, Clone)]
pub struct LocalFs {
    resources_dir: PathBuf,
}

impl LocalFs {
    pub fn new(resources_dir: impl Into<PathBuf>) -> Self {
        Self {
            resources_dir: resources_dir.into(),
        }
    }

    /// Resolve `url` to a local path; read its text for text modalities.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ingest`] for unsupported URL schemes or missing
    /// files, and IO errors when a text modality cannot be decoded.
    pub async fn fetch(&self, url: &str, modality: &Modality) -> Result<(PathBuf, Option<String>)> {
        let path = self.resolve(url)?;
        if !path.exists() {
            return Err(Error::Ingest(format!(
                "resource not found: {}",
                path.display()
            )));
        }

        let text = if Self::wants_text(modality) {
            Some(tokio::fs::read_to_string(&path).await?)
        } else {
            None
        };
        debug!(path = %path.display(), modality = %modality, has_text = text.is_some(), "fetched resource");
        Ok((path, text))
    }

    fn wants_text(modality: &Modality) -> bool {
        matches!(
            modality,
            Modality::Conversation | Modality::Document | Modality::Text
        )
    }

    fn resolve(&self, raw: &str) -> Result<PathBuf> {
        if let Ok(parsed) = Url::parse(raw) {
            return match parsed.scheme() {
                "file" => parsed
                    .to_file_path()
                    .map_err(|()| Error::Ingest(format!("invalid file URL: {raw}"))),
                scheme => Err(Error::Ingest(format!(
                    "unsupported URL scheme '{scheme}' (only file:// and local paths)"
                ))),
            };
        }

        let path = Path::new(raw);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.resources_dir.join(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn fetch_reads_text_for_text_modalities() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.txt");
        std::fs::File::create(&file)
            .unwrap()
            .write_all(b"hello")
            .unwrap();

        let fs = LocalFs::new(dir.path());
        let (path, text) = fs
            .fetch(file.to_str().unwrap(), &Modality::Document)
            .await
            .unwrap();
        assert_eq!(path, file);
        assert_eq!(text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn fetch_skips_text_for_media_modalities() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("photo.jpg");
        std::fs::File::create(&file).unwrap();

        let fs = LocalFs::new(dir.path());
        let (_, text) = fs
            .fetch(file.to_str().unwrap(), &Modality::Image)
            .await
            .unwrap();
        assert!(text.is_none());
    }

    #[tokio::test]
    async fn fetch_resolves_relative_paths_under_resources_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::File::create(&file)
            .unwrap()
            .write_all(b"n")
            .unwrap();

        let fs = LocalFs::new(dir.path());
        let (path, _) = fs.fetch("notes.txt", &Modality::Text).await.unwrap();
        assert_eq!(path, file);
    }

    #[tokio::test]
    async fn fetch_rejects_remote_schemes() {
        let fs = LocalFs::new("/tmp");
        let err = fs
            .fetch("https://example.com/a.txt", &Modality::Document)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ingest(_)));
    }

    #[tokio::test]
    async fn fetch_rejects_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path());
        assert!(fs.fetch("absent.txt", &Modality::Text).await.is_err());
    }
}
