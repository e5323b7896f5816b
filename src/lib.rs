use anyhow::{anyhow, Error};
use chrono::{DateTime, Utc};
use std::path::PathBuf;

pub mod cache;
pub mod db;
pub mod deleter;
pub mod fetcher;
pub mod pipeline;
pub mod processor;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod uploader;

/// A work-table row describing one image awaiting caching.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingImage {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "image_cache_status", rename_all = "lowercase")]
pub enum Status {
    Pending,
    Caching,
}

/// Structured form of the composite identity a record packs into its
/// `name` column as `store-storeId-type-itemId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageKey {
    pub store: String,
    pub store_id: String,
    pub kind: String,
    pub item_id: String,
}

impl ImageKey {
    /// Parse a packed name. The item id absorbs every segment after the
    /// third, so ids that themselves contain hyphens survive the trip.
    pub fn parse(name: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = name.split('-').collect();
        if parts.len() < 4 {
            return Err(anyhow!("malformed image name: {:?}", name));
        }

        Ok(ImageKey {
            store: parts[0].to_string(),
            store_id: parts[1].to_string(),
            kind: parts[2].to_string(),
            item_id: parts[3..].join("-"),
        })
    }

    /// The packed wire/database form.
    pub fn identifier(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.store, self.store_id, self.kind, self.item_id
        )
    }

    /// Canonical object-store path for this image.
    pub fn object_path(&self) -> String {
        format!(
            "/{}/{}/{}/{}",
            self.store, self.store_id, self.kind, self.item_id
        )
    }
}

/// Resized image bytes staged on disk, in flight between the upload and
/// delete stages. The staged file is owned by the pipeline until the
/// upload succeeds.
#[derive(Debug, Clone)]
pub struct StagedArtifact {
    pub local_path: PathBuf,
    pub destination_path: String,
    pub content_type: String,
    pub record_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_key_absorbs_trailing_segments_into_item_id() {
        let key = ImageKey::parse("shop-42-logo-123-abc").unwrap();
        assert_eq!(key.store, "shop");
        assert_eq!(key.store_id, "42");
        assert_eq!(key.kind, "logo");
        assert_eq!(key.item_id, "123-abc");
    }

    #[test]
    fn image_key_round_trips() {
        let key = ImageKey::parse("shop-42-logo-123-abc").unwrap();
        assert_eq!(key.identifier(), "shop-42-logo-123-abc");
        assert_eq!(key.object_path(), "/shop/42/logo/123-abc");
    }

    #[test]
    fn image_key_rejects_short_names() {
        assert!(ImageKey::parse("shop-42-logo").is_err());
        assert!(ImageKey::parse("").is_err());
    }
}
