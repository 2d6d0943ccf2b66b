//! Move inline `data:` images out of listing rows into object storage.

use serde_json::json;
use tracing::{info, warn};

use crate::backend::types::{ImageRef, Property};
use crate::error::Result;
use crate::media::{MediaFolder, MediaUploader};
use crate::properties::PropertyApi;

/// Outcome of one migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
  /// Rows rewritten to point at uploaded files
  pub migrated: usize,
  /// Rows with no inline images
  pub skipped: usize,
  /// Rows left untouched because an upload or the row update failed
  pub failed: usize,
  /// Ids that carry inline images (all candidates on a dry run)
  pub candidates: Vec<i64>,
  pub dry_run: bool,
}

pub struct ImageMigrator {
  api: PropertyApi,
  uploader: MediaUploader,
}

impl ImageMigrator {
  pub fn new(api: PropertyApi, uploader: MediaUploader) -> Self {
    Self { api, uploader }
  }

  /// Migrate every listing. With `dry_run` nothing is uploaded or written.
  ///
  /// Rows are all-or-nothing: if any of a row's uploads fails, the row keeps
  /// its inline data and is counted as failed so a later run retries it.
  pub async fn run(&self, dry_run: bool) -> Result<MigrationReport> {
    let properties = self.api.fetch_all().await?;
    let mut report = MigrationReport {
      dry_run,
      ..Default::default()
    };

    for property in properties {
      if !property.has_inline_media() {
        report.skipped += 1;
        continue;
      }
      report.candidates.push(property.id);
      if dry_run {
        continue;
      }

      match self.migrate_one(&property).await {
        Ok(()) => report.migrated += 1,
        Err(e) => {
          warn!(id = property.id, error = %e, "Image migration failed");
          report.failed += 1;
        }
      }
    }

    info!(
      migrated = report.migrated,
      skipped = report.skipped,
      failed = report.failed,
      dry_run,
      "Image migration finished"
    );
    Ok(report)
  }

  async fn migrate_one(&self, property: &Property) -> Result<()> {
    let image = match ImageRef::classify(&property.image) {
      ImageRef::Inline(data) => {
        self
          .uploader
          .upload_data_url(MediaFolder::Principal, property.id, data)
          .await?
      }
      ImageRef::Url(url) => url.to_string(),
    };

    let mut gallery = Vec::with_capacity(property.gallery.len());
    for item in &property.gallery {
      let url = match ImageRef::classify(item) {
        ImageRef::Inline(data) => {
          self
            .uploader
            .upload_data_url(MediaFolder::Gallery, property.id, data)
            .await?
        }
        ImageRef::Url(url) => url.to_string(),
      };
      gallery.push(url);
    }

    self
      .api
      .patch(property.id, json!({ "imagen": image, "galeria": gallery }))
      .await?;
    info!(id = property.id, "Migrated inline images");
    Ok(())
  }
}
