use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use image::DynamicImage;
use tessera_core::encode_jpeg;
use tracing::info;

const PREFIX: &str = "generated_image_";
const EXTENSION: &str = ".jpg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub filename: String,
    pub path: PathBuf,
}

/// Flat directory of generated JPEGs. Names embed a fixed-width millisecond
/// timestamp, so sorting names sorts by creation time.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn save(&self, image: &DynamicImage) -> Result<StoredImage> {
        let bytes = encode_jpeg(image).context("failed to encode JPEG")?;
        let stamp = format!("{:013}", Utc::now().timestamp_millis());
        for attempt in 0u32.. {
            let filename = match attempt {
                0 => format!("{PREFIX}{stamp}{EXTENSION}"),
                n => format!("{PREFIX}{stamp}_{n}{EXTENSION}"),
            };
            let path = self.dir.join(&filename);
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to create {}", path.display()))
                }
            };
            file.write_all(&bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "saved image");
            return Ok(StoredImage { filename, path });
        }
        unreachable!("u32 attempts exhausted")
    }

    /// Path of `filename` inside the store, if it names an existing generated file.
    pub async fn resolve(&self, filename: &str) -> Option<PathBuf> {
        if filename.is_empty()
            || filename.contains(['/', '\\'])
            || filename.contains("..")
        {
            return None;
        }
        let path = self.dir.join(filename);
        let metadata = tokio::fs::metadata(&path).await.ok()?;
        metadata.is_file().then_some(path)
    }

    /// Most recently generated image, by file name.
    pub async fn latest(&self) -> Result<Option<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to list {}", self.dir.display()))?;
        let mut latest: Option<String> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(PREFIX)
                && name.ends_with(EXTENSION)
                && latest.as_ref().map_or(true, |current| name > *current)
            {
                latest = Some(name);
            }
        }
        Ok(latest.map(|name| self.dir.join(name)))
    }
}
