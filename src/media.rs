//! Image uploads to object storage.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use futures::future::join_all;
use rand::{distributions::Alphanumeric, Rng};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::types::DATA_URL_PREFIX;
use crate::backend::{ObjectStorage, UploadOptions};
use crate::error::{Result, SyncError};

/// Storage folder an image belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFolder {
  /// Primary listing image
  Principal,
  Gallery,
}

impl MediaFolder {
  pub fn as_str(&self) -> &'static str {
    match self {
      MediaFolder::Principal => "principal",
      MediaFolder::Gallery => "galeria",
    }
  }
}

/// A decoded `data:<mime>;base64,<payload>` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
  pub mime: String,
  pub bytes: Vec<u8>,
}

impl DataUrl {
  pub fn parse(value: &str) -> Result<Self> {
    let rest = value
      .strip_prefix(DATA_URL_PREFIX)
      .ok_or_else(|| SyncError::Validation("not a data URL".into()))?;
    let (header, payload) = rest
      .split_once(',')
      .ok_or_else(|| SyncError::Decode("data URL without a payload".into()))?;
    let mime = header
      .strip_suffix(";base64")
      .ok_or_else(|| SyncError::Decode("only base64 data URLs are supported".into()))?;

    let mime = if mime.is_empty() { "application/octet-stream" } else { mime };
    let bytes = STANDARD.decode(payload.trim())?;
    Ok(Self {
      mime: mime.to_ascii_lowercase(),
      bytes,
    })
  }

  /// File extension for the MIME type.
  pub fn extension(&self) -> &str {
    match self.mime.as_str() {
      "image/jpeg" | "image/jpg" => "jpg",
      "image/svg+xml" => "svg",
      "application/octet-stream" => "bin",
      other => other
        .split_once('/')
        .map(|(_, sub)| sub)
        .filter(|sub| !sub.is_empty() && sub.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("bin"),
    }
  }
}

/// `{folder}/{entity_id}-{millis}-{suffix}.{ext}`; unique per call.
pub fn storage_path(folder: MediaFolder, entity_id: i64, ext: &str) -> String {
  let suffix: String = rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(8)
    .map(|c| char::from(c).to_ascii_lowercase())
    .collect();
  format!(
    "{}/{}-{}-{}.{}",
    folder.as_str(),
    entity_id,
    Utc::now().timestamp_millis(),
    suffix,
    ext
  )
}

/// Uploads images to one bucket and hands back their public URLs.
#[derive(Clone)]
pub struct MediaUploader {
  storage: Arc<dyn ObjectStorage>,
  bucket: String,
  cache_control: String,
}

impl MediaUploader {
  pub fn new(storage: Arc<dyn ObjectStorage>, bucket: &str, cache_control: &str) -> Self {
    Self {
      storage,
      bucket: bucket.to_string(),
      cache_control: cache_control.to_string(),
    }
  }

  /// Decode an inline image, upload it and return its public URL.
  pub async fn upload_data_url(
    &self,
    folder: MediaFolder,
    entity_id: i64,
    data_url: &str,
  ) -> Result<String> {
    let decoded = DataUrl::parse(data_url)?;
    let path = storage_path(folder, entity_id, decoded.extension());
    let options = UploadOptions {
      cache_control: self.cache_control.clone(),
      upsert: false,
      content_type: Some(decoded.mime.clone()),
    };

    let stored = self
      .storage
      .upload(&self.bucket, &path, decoded.bytes, &options)
      .await?;
    debug!(path = %stored, "Uploaded image");
    Ok(self.storage.public_url(&self.bucket, &stored))
  }

  /// Upload several inline images concurrently. Failed files are logged
  /// and left out; the rest keep their input order.
  pub async fn upload_batch(
    &self,
    folder: MediaFolder,
    entity_id: i64,
    data_urls: &[String],
  ) -> Vec<String> {
    let uploads = data_urls
      .iter()
      .map(|url| self.upload_data_url(folder, entity_id, url));

    join_all(uploads)
      .await
      .into_iter()
      .enumerate()
      .filter_map(|(index, result)| match result {
        Ok(url) => Some(url),
        Err(e) => {
          warn!(index, entity_id, error = %e, "Dropping failed upload");
          None
        }
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::memory::MemoryBackend;

  const PNG: &str = "data:image/png;base64,iVBORw0KGgo=";

  #[test]
  fn test_parse_data_url() {
    let parsed = DataUrl::parse(PNG).unwrap();
    assert_eq!(parsed.mime, "image/png");
    assert_eq!(parsed.extension(), "png");
    assert_eq!(&parsed.bytes[1..4], b"PNG");

    let jpeg = DataUrl::parse("data:image/jpeg;base64,/9j/").unwrap();
    assert_eq!(jpeg.extension(), "jpg");
  }

  #[test]
  fn test_parse_rejects_other_shapes() {
    assert!(matches!(
      DataUrl::parse("https://cdn.test/a.png"),
      Err(SyncError::Validation(_))
    ));
    assert!(matches!(
      DataUrl::parse("data:text/plain,hello"),
      Err(SyncError::Decode(_))
    ));
    assert!(matches!(
      DataUrl::parse("data:image/png;base64,@@@"),
      Err(SyncError::Decode(_))
    ));
  }

  #[test]
  fn test_storage_path_shape() {
    let path = storage_path(MediaFolder::Gallery, 12, "webp");
    let (folder, file) = path.split_once('/').unwrap();
    assert_eq!(folder, "galeria");
    assert!(file.starts_with("12-"));
    assert!(file.ends_with(".webp"));

    let parts: Vec<&str> = file.trim_end_matches(".webp").split('-').collect();
    assert_eq!(parts.len(), 3);
    assert!(parts[1].parse::<i64>().is_ok());
    assert_eq!(parts[2].len(), 8);

    assert_ne!(path, storage_path(MediaFolder::Gallery, 12, "webp"));
  }

  #[tokio::test]
  async fn test_upload_returns_public_url() {
    let backend = Arc::new(MemoryBackend::new());
    let uploader = MediaUploader::new(backend.clone(), "propiedades", "3600");

    let url = uploader
      .upload_data_url(MediaFolder::Principal, 1, PNG)
      .await
      .unwrap();
    assert!(url.starts_with("https://storage.test/propiedades/principal/1-"));
    assert!(url.ends_with(".png"));

    let paths = backend.object_paths();
    assert_eq!(paths.len(), 1);
    let path = paths[0].trim_start_matches("propiedades/");
    assert!(backend.object("propiedades", path).is_some());
  }

  #[tokio::test]
  async fn test_batch_drops_failures() {
    let backend = Arc::new(MemoryBackend::new());
    let uploader = MediaUploader::new(backend.clone(), "propiedades", "3600");

    let urls = uploader
      .upload_batch(
        MediaFolder::Gallery,
        3,
        &[PNG.to_string(), "data:broken".to_string(), PNG.to_string()],
      )
      .await;
    assert_eq!(urls.len(), 2);
    assert_eq!(backend.uploads.load(std::sync::atomic::Ordering::SeqCst), 2);
  }
}
